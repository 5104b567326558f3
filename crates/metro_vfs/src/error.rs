//! Error types that can be emitted from this library

use miette::Diagnostic;
use thiserror::Error;

use crate::vfx::ParseStage;

/// Error type for library
#[derive(Error, Diagnostic, Debug)]
pub enum Error {
    /// Transparent wrapper for [`std::io::Error`]
    #[error(transparent)]
    IOError(#[from] std::io::Error),

    /// Transparent wrapper for [`binrw::Error`]
    #[error(transparent)]
    BinRWError(#[from] binrw::Error),

    /// the archive layout is not one this library understands
    #[error("invalid archive: {0}")]
    Format(#[from] FormatError),

    /// a registry stopped parsing part way through
    #[error("registry parsing failed after reaching {stage}")]
    Parse {
        /// Last stage that completed before the failure
        stage: ParseStage,
        /// What went wrong
        #[source]
        source: Box<Error>,
    },

    /// a package holds fewer bytes than a record declares
    #[error("expected {expected} bytes but only {actual} are available")]
    Truncated {
        /// Bytes the record needs
        expected: u64,
        /// Bytes that could be read
        actual: u64,
    },

    /// a payload decoded to a different size than the record declares
    #[error("decompressed {actual} bytes but the record declares {expected}")]
    DecompressionMismatch {
        /// Declared uncompressed size
        expected: u64,
        /// Size that was produced
        actual: u64,
    },

    /// a compressed payload is malformed
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// unable to find requested file
    #[error("unable to find requested file")]
    FileNotFound(#[from] FileNotFoundError),

    /// {0}
    #[error("{0}")]
    CustomError(String),
}

/// Structural problems found while reading or writing a registry
#[derive(Error, Diagnostic, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    /// registry version {0} is not supported
    #[error("registry version {0} is not supported")]
    UnsupportedVersion(u32),

    /// compression type {0} is not supported
    #[error("compression type {0} is not supported")]
    UnsupportedCompression(u32),

    /// the first record of a registry must be a folder
    #[error("the first record of a registry must be a folder")]
    RootNotFolder,

    /// folder {folder} lists children outside of the file table
    #[error("folder {folder} lists children {first}..{end} but the table holds {total} records")]
    ChildrenOutOfRange {
        /// Index of the folder record
        folder: usize,
        /// First child index
        first: usize,
        /// One past the last child index
        end: usize,
        /// Number of records in the table
        total: usize,
    },

    /// duplicate {duplicate} points at record {base} which is not a file
    #[error("duplicate {duplicate} points at record {base} which is not a file")]
    InvalidDuplicateBase {
        /// Index of the duplicate record
        duplicate: usize,
        /// Referenced base record
        base: usize,
    },

    /// duplicate {0} is stored as a folder
    #[error("duplicate {0} is stored as a folder")]
    DuplicateIsFolder(usize),

    /// file {file} refers to package {package} which does not exist
    #[error("file {file} refers to package {package} which does not exist")]
    PackageOutOfRange {
        /// Index of the file record
        file: usize,
        /// Referenced package
        package: usize,
    },

    /// a name of {0} bytes does not fit the record header
    #[error("a name of {0} bytes does not fit the record header")]
    NameTooLong(usize),

    /// a name length of zero is not valid
    #[error("a name length of zero is not valid")]
    EmptyName,

    /// the archive does not contain any files
    #[error("the archive does not contain any files")]
    NoFiles,

    /// {0} does not fit in 32 bits
    #[error("{0} does not fit in 32 bits")]
    Overflow(&'static str),

    /// a patch was loaded before any base registry
    #[error("a patch can only be loaded on top of a base registry")]
    MissingBase,

    /// no more than {0} layers can be stacked
    #[error("no more than {0} layers can be stacked")]
    TooManyLayers(usize),
}

/// Problems found while decoding compressed payloads
#[derive(Error, Diagnostic, Debug)]
pub enum CodecError {
    /// packet header is truncated
    #[error("packet header is truncated")]
    TruncatedHeader,

    /// packet declares more bytes than remain in the input
    #[error("packet declares {declared} bytes but only {available} remain")]
    TruncatedPacket {
        /// Size stored in the packet header
        declared: usize,
        /// Bytes left in the input
        available: usize,
    },

    /// packet uses a compression level that can not be decoded
    #[error("unsupported compression level {0}")]
    UnsupportedLevel(u8),

    /// a match points before the start of the output
    #[error("a match points before the start of the output")]
    InvalidOffset,

    /// the compressed body ended before the output was complete
    #[error("the compressed body ended before the output was complete")]
    UnexpectedEnd,

    /// decoding would produce more bytes than the record declares
    #[error("decoding would produce more bytes than the record declares")]
    Overrun,

    /// a stream block header is malformed
    #[error("stream block at offset {0} is malformed")]
    Framing(usize),

    /// Transparent wrapper for [`lz4_flex::block::DecompressError`]
    #[error(transparent)]
    Lz4(#[from] lz4_flex::block::DecompressError),
}

/// Error type to provide further information when a file has not been found
#[derive(Error, Diagnostic, Debug)]
#[error("unable to find requested file")]
pub enum FileNotFoundError {
    /// at index {0}
    #[error("at index {0}")]
    Index(usize),

    /// by name {0}
    #[error("by name {0}")]
    Name(String),

    /// in archive {0}
    #[error("in archive {0}")]
    Archive(usize),
}

/// Generic result type with crate's Error as its error variant
pub type Result<T> = core::result::Result<T, Error>;
