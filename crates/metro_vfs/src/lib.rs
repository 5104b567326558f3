//! This library mounts and extracts the archives used by the *Metro* games.
//!
//! # Archive Formats
//!
//! Game content is split between a registry, holding the table of contents, and one or more
//! package blobs stored next to it that hold the file payloads.
//!
//! | Extension      | Games                                   | Module    | Codec            |
//! |----------------|-----------------------------------------|-----------|------------------|
//! | `.vfi`         | *Metro 2033*                            | [`vfi`]   | legacy (QuickLZ) |
//! | `.upk*`        | *Metro 2033*, single file               | [`vfi`]   | legacy (QuickLZ) |
//! | `.vfx`, `.vfx*`| *Last Light*                            | [`vfx`]   | legacy (QuickLZ) |
//! | `.vfx`, `.vfx*`| *Redux*, *Arktika.1*, *Exodus*          | [`vfx`]   | LZ4              |
//!
//! All integers are little endian. Names are stored XOR'd with a per record mask and paths use
//! `\` as their separator; every lookup in this crate also accepts `/`.
//!
//! ## Registry versions
//!
//! | Version | Titles                                   | Notes                                      |
//! |---------|------------------------------------------|--------------------------------------------|
//! | 1       | *Last Light*, *Redux*                    | *Last Light* builds are told apart by GUID |
//! | 2       | *Arktika.1*                              |                                            |
//! | 3       | *Exodus*                                 | adds a content version string              |
//!
//! A game installation is a base registry (`content.vfx`) and a stack of patches. Two views
//! are offered over it:
//!
//! - [`FileSystem`] merges any number of archives into one tree; a file present in several
//!   archives is read from the one mounted last.
//! - [`LayeredFileSystem`] keeps a table per registry and resolves paths the way the games do,
//!   following patch folders that replace folders of earlier layers.
//!
//! ## Payloads
//!
//! A payload whose compressed and uncompressed sizes are equal is stored as is. Otherwise it is
//! decoded with the codec of its registry, see [`compression`]. Extraction never panics on bad
//! data: the infallible entry points log the problem and hand out an empty [`ByteStream`].

pub mod compression;
pub mod container;
pub mod error;
pub mod fs;
pub mod overlay;
pub mod stream;
pub mod types;
pub mod unpack;
pub mod vfi;
pub mod vfx;

pub use compression::Codec;
pub use container::{Container, ContainerKind};
pub use fs::{FileSystem, Handle};
pub use overlay::{LayeredFileSystem, RecordRef};
pub use stream::ByteStream;
pub use types::{FileLocation, Guid, Title};
pub use unpack::{unpack, unpack_file_system, UnpackOptions, UnpackSummary};
pub use vfi::{UpkArchive, VfiArchive, VfiWriter, VfiWriterOptions};
pub use vfx::{VfxArchive, VfxWriter, VfxWriterOptions};
