//! VFX registries
//!
//! A registry (`content.vfx`, `patch.vfx0`, ...) holds the table of contents of a set of package
//! blobs stored next to it. Everything is little endian.
//!
//! | Part       | Layout                                                                      |
//! |------------|-----------------------------------------------------------------------------|
//! | header     | `version: u32`, `compression: u32`, content version (v3 only), GUID, `u32` package, file and duplicate counts |
//! | packages   | z-string name, then `levels: u32` + level z-strings (not on *Last Light*), `size: u32` |
//! | records    | `flags: u16`, file or folder payload, masked name                            |
//! | duplicates | `flags: u16`, file payload, `base: u32`                                     |
//!
//! A folder payload is `children: u16, first: u32`: its children are the records
//! `first..first + children`. A file payload is `package: u16, offset: u32, uncompressed: u32,
//! compressed: u32`. Record 0 is always the root folder and has an empty name.

mod read;
mod write;

use binrw::{binrw, BinRead, BinWrite, NullString};
use std::fmt;

use crate::types::{FileLocation, Guid};

pub use read::VfxArchive;
pub use write::{VfxWriter, VfxWriterOptions};

/// Progress of a registry parse, reported when it fails
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ParseStage {
    Start,
    HeaderParsed,
    PackagesRead,
    FilesRead,
    DuplicatesLinked,
    Ready,
}

impl fmt::Display for ParseStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ParseStage::Start => "start",
            ParseStage::HeaderParsed => "header",
            ParseStage::PackagesRead => "package list",
            ParseStage::FilesRead => "file table",
            ParseStage::DuplicatesLinked => "duplicate table",
            ParseStage::Ready => "end",
        })
    }
}

/// Record flag word
///
/// *Last Light* stores it shifted left by one bit; the readers undo the shift.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub struct RecordFlags(pub u16);

impl RecordFlags {
    pub const NEW: u16 = 0x4;
    pub const FOLDER: u16 = 0x8;

    pub fn file() -> Self {
        Self(0)
    }

    pub fn folder() -> Self {
        Self(Self::FOLDER)
    }

    pub fn is_folder(&self) -> bool {
        self.0 & Self::FOLDER != 0
    }

    /// Set on patch folders that do not override anything in earlier layers
    pub fn is_new(&self) -> bool {
        self.0 & Self::NEW != 0
    }

    pub fn with_new(self, new: bool) -> Self {
        match new {
            true => Self(self.0 | Self::NEW),
            false => Self(self.0 & !Self::NEW),
        }
    }
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, PartialEq)]
pub struct VfxHeader {
    pub version: u32,
    pub compression: u32,
    #[br(if(version >= 3))]
    pub content_version: Option<NullString>,
    pub guid: Guid,
    pub packages: u32,
    pub files: u32,
    pub duplicates: u32,
}

#[derive(BinRead, BinWrite, Debug, Default, Copy, Clone, PartialEq)]
#[brw(little)]
pub struct FilePayload {
    pub package: u16,
    pub offset: u32,
    pub uncompressed: u32,
    pub compressed: u32,
}

#[derive(BinRead, BinWrite, Debug, Default, Copy, Clone, PartialEq)]
#[brw(little)]
pub struct FolderPayload {
    pub children: u16,
    pub first: u32,
}

/// What a record describes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordKind {
    File {
        location: FileLocation,
        /// Head of the duplicate chain, an index into [`VfxArchive::duplicates`]
        duplicates: Option<usize>,
    },
    Folder {
        first: usize,
        count: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VfxRecord {
    pub name: String,
    pub flags: RecordFlags,
    pub kind: RecordKind,
}

impl VfxRecord {
    pub fn is_folder(&self) -> bool {
        matches!(self.kind, RecordKind::Folder { .. })
    }

    pub fn location(&self) -> Option<&FileLocation> {
        match &self.kind {
            RecordKind::File { location, .. } => Some(location),
            RecordKind::Folder { .. } => None,
        }
    }

    /// Range of child records, empty for files
    pub fn children(&self) -> std::ops::Range<usize> {
        match self.kind {
            RecordKind::Folder { first, count } => first..first + count,
            RecordKind::File { .. } => 0..0,
        }
    }
}

/// Secondary location of a file already present in the table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VfxDuplicate {
    /// Name of the base record, or the stored name for registries that keep one
    pub name: String,
    pub location: FileLocation,
    /// Record this is a duplicate of, unknown for registries that store named duplicates
    pub base: Option<usize>,
    /// Next duplicate in the chain
    pub next: Option<usize>,
}
