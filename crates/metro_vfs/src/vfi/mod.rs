//! Legacy *Metro 2033* containers
//!
//! Both formats are a sequence of chunks, each one a little endian `id: u32`, `size: u32` and
//! `size` bytes of body.
//!
//! A VFI registry starts with the header chunk (`0xFFFFFFFF`: `version: u32` and a GUID); every
//! other chunk describes one package blob stored next to the registry and is itself made of
//! sub-chunks:
//!
//! | Sub-chunk | Body                                                                           |
//! |-----------|--------------------------------------------------------------------------------|
//! | 0         | package name (z-string), `size: u32`                                           |
//! | 1         | records: `header: u32`, `offset: u32`, `uncompressed: u32`, `compressed: u32`, `length: u32`, masked path |
//!
//! A UPK archive holds its payloads itself:
//!
//! | Chunk | Body                                                                               |
//! |-------|------------------------------------------------------------------------------------|
//! | 0     | payloads, offsets are from the start of the file                                   |
//! | 1     | records: `crc32: u32`, `offset: u32`, `uncompressed: u32`, `compressed: u32`, `length: u32`, masked path |
//! | 2     | four zero bytes                                                                    |
//! | 3     | 16 byte tag                                                                        |
//!
//! Paths are full `\` separated paths starting with `content`. The low byte of the record
//! header (or crc) is the mask the path bytes are XOR'd with. Neither format stores folders:
//! [`FlatTree`] rebuilds them from the paths.

mod read;
mod upk;
mod write;

use byteorder::{LittleEndian, ReadBytesExt};
use tracing::trace;

use crate::{
    error::{Error, FormatError, Result},
    stream::ByteStream,
    types::{read_masked, FileLocation},
};

pub use read::VfiArchive;
pub use upk::UpkArchive;
pub use write::{VfiWriter, VfiWriterOptions};

pub(crate) const HEADER_CHUNK: u32 = u32::MAX;
pub(crate) const PACKAGE_HEADER_CHUNK: u32 = 0;
pub(crate) const PACKAGE_FILES_CHUNK: u32 = 1;

pub(crate) const UPK_BLOB_CHUNK: u32 = 0;
pub(crate) const UPK_TOC_CHUNK: u32 = 1;
pub(crate) const UPK_INFO_CHUNK: u32 = 2;
pub(crate) const UPK_TAG_CHUNK: u32 = 3;

/// Name of the synthesized root folder
pub const ROOT_NAME: &str = "content";

/// What a [`FlatEntry`] describes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlatKind {
    File {
        /// Full path as stored in the archive
        path: String,
        location: FileLocation,
    },
    Folder {
        children: Vec<usize>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatEntry {
    pub name: String,
    pub kind: FlatKind,
}

impl FlatEntry {
    pub fn is_folder(&self) -> bool {
        matches!(self.kind, FlatKind::Folder { .. })
    }

    pub fn location(&self) -> Option<&FileLocation> {
        match &self.kind {
            FlatKind::File { location, .. } => Some(location),
            FlatKind::Folder { .. } => None,
        }
    }

    pub fn children(&self) -> &[usize] {
        match &self.kind {
            FlatKind::Folder { children } => children,
            FlatKind::File { .. } => &[],
        }
    }
}

/// Folder hierarchy rebuilt from a list of full paths
///
/// Files keep their table order at indices `0..n`, the root folder is at `n` and the folders
/// follow in the order they were first needed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlatTree {
    entries: Vec<FlatEntry>,
    root: usize,
}

impl FlatTree {
    pub fn build(files: Vec<(String, FileLocation)>) -> Self {
        let root = files.len();
        let mut entries: Vec<FlatEntry> = files
            .into_iter()
            .map(|(path, location)| FlatEntry {
                name: leaf_name(&path).to_string(),
                kind: FlatKind::File { path, location },
            })
            .collect();
        entries.push(FlatEntry {
            name: ROOT_NAME.to_string(),
            kind: FlatKind::Folder {
                children: Vec::new(),
            },
        });

        let mut tree = Self { entries, root };
        for index in 0..root {
            let path = match &tree.entries[index].kind {
                FlatKind::File { path, .. } => path.clone(),
                FlatKind::Folder { .. } => continue,
            };

            // the first segment is the root itself
            let mut parent = root;
            let mut segments: Vec<&str> = path.split('\\').collect();
            segments.pop();
            for folder in segments.iter().skip(1) {
                parent = tree.get_or_add_folder(folder, parent);
            }
            tree.push_child(parent, index);
        }

        trace!(entries = tree.entries.len(), "built folder tree");
        tree
    }

    fn get_or_add_folder(&mut self, name: &str, parent: usize) -> usize {
        let existing = self.entries[parent]
            .children()
            .iter()
            .copied()
            .find(|&child| self.entries[child].is_folder() && self.entries[child].name == name);
        if let Some(folder) = existing {
            return folder;
        }

        self.entries.push(FlatEntry {
            name: name.to_string(),
            kind: FlatKind::Folder {
                children: Vec::new(),
            },
        });
        let folder = self.entries.len() - 1;
        self.push_child(parent, folder);
        folder
    }

    fn push_child(&mut self, parent: usize, child: usize) {
        if let FlatKind::Folder { children } = &mut self.entries[parent].kind {
            children.push(child);
        }
    }

    pub fn root(&self) -> usize {
        self.root
    }

    pub fn entries(&self) -> &[FlatEntry] {
        &self.entries
    }

    pub fn entry(&self, index: usize) -> Option<&FlatEntry> {
        self.entries.get(index)
    }

    /// Number of files; they come first in the table
    pub fn file_count(&self) -> usize {
        self.root
    }

    /// Look an entry up by its path below the root, `\` or `/` separated
    pub fn find(&self, path: &str) -> Option<usize> {
        path.split(['\\', '/'])
            .filter(|segment| !segment.is_empty())
            .try_fold(self.root, |folder, segment| {
                self.entries[folder]
                    .children()
                    .iter()
                    .copied()
                    .find(|&child| self.entries[child].name == segment)
            })
    }
}

/// Name of the last segment of a `\` separated path, the whole path when it has no separator
pub(crate) fn leaf_name(path: &str) -> &str {
    path.rsplit_once('\\').map(|(_, leaf)| leaf).unwrap_or(path)
}

/// Split `stream` into its `(id, body)` chunks
pub(crate) fn read_chunks(stream: &mut ByteStream) -> Result<Vec<(u32, ByteStream)>> {
    let mut chunks = Vec::new();
    while !stream.ended() {
        let id = stream.read_u32::<LittleEndian>()?;
        let size = stream.read_u32::<LittleEndian>()? as usize;
        if size > stream.remaining() {
            return Err(Error::Truncated {
                expected: size as u64,
                actual: stream.remaining() as u64,
            });
        }

        trace!(id, size, "chunk");
        chunks.push((id, stream.substream(size)));
        stream.skip(size);
    }
    Ok(chunks)
}

/// One record of a VFI package or UPK table of contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PathRecord {
    pub header: u32,
    pub offset: u32,
    pub uncompressed: u32,
    pub compressed: u32,
    pub path: String,
}

/// Read every record of a file table chunk
pub(crate) fn read_path_records(chunk: &mut ByteStream) -> Result<Vec<PathRecord>> {
    let mut records = Vec::new();
    while !chunk.ended() {
        let header = chunk.read_u32::<LittleEndian>()?;
        let offset = chunk.read_u32::<LittleEndian>()?;
        let uncompressed = chunk.read_u32::<LittleEndian>()?;
        let compressed = chunk.read_u32::<LittleEndian>()?;
        let length = chunk.read_u32::<LittleEndian>()? as usize;
        if length == 0 {
            return Err(FormatError::EmptyName.into());
        }

        let path = read_masked(chunk, length - 1, header as u8)?;
        let _terminator = chunk.read_u8()?;
        trace!(%path, offset, uncompressed, compressed, "record");

        records.push(PathRecord {
            header,
            offset,
            uncompressed,
            compressed,
            path,
        });
    }
    Ok(records)
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::{leaf_name, read_chunks, read_path_records, FlatKind, FlatTree};
    use crate::{
        error::{Error, Result},
        stream::ByteStream,
        types::FileLocation,
    };

    fn at(offset: u32) -> FileLocation {
        FileLocation {
            offset,
            ..Default::default()
        }
    }

    #[test]
    fn build_tree() {
        let tree = FlatTree::build(vec![
            ("content\\a.txt".to_string(), at(0)),
            ("content\\textures\\x\\b.dds".to_string(), at(1)),
            ("content\\textures\\c.dds".to_string(), at(2)),
            ("loose.bin".to_string(), at(3)),
        ]);

        assert_eq!(tree.root(), 4);
        assert_eq!(tree.file_count(), 4);

        let root = &tree.entries()[4];
        assert_eq!(root.name, "content");
        // a.txt, textures (added while placing b.dds), loose.bin
        assert_eq!(root.children(), [0, 5, 3]);

        let textures = &tree.entries()[5];
        assert_eq!(textures.name, "textures");
        assert_eq!(textures.children(), [6, 2]);
        assert_eq!(tree.entries()[6].name, "x");
        assert_eq!(tree.entries()[6].children(), [1]);

        assert_eq!(tree.find("textures\\x\\b.dds"), Some(1));
        assert_eq!(tree.find("textures/c.dds"), Some(2));
        assert_eq!(tree.find("loose.bin"), Some(3));
        assert_eq!(tree.find("textures\\b.dds"), None);
        assert!(matches!(&tree.entries()[1].kind, FlatKind::File { path, .. } if path == "content\\textures\\x\\b.dds"));
    }

    #[test]
    fn leaf_names() {
        assert_eq!(leaf_name("content\\a\\b.txt"), "b.txt");
        assert_eq!(leaf_name("b.txt"), "b.txt");
        assert_eq!(leaf_name("content\\"), "");
    }

    #[test]
    fn chunks() -> Result<()> {
        #[rustfmt::skip]
        let mut stream = ByteStream::new(vec![
            0xFF, 0xFF, 0xFF, 0xFF, 0x02, 0x00, 0x00, 0x00, 0xAA, 0xBB,
            0x07, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ]);

        let chunks = read_chunks(&mut stream)?;
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].0, u32::MAX);
        assert_eq!(chunks[0].1.as_slice(), [0xAA, 0xBB]);
        assert_eq!(chunks[1].0, 7);
        assert!(chunks[1].1.is_empty());

        let mut truncated = ByteStream::new(vec![0x01, 0x00, 0x00, 0x00, 0x09, 0x00, 0x00, 0x00, 0x00]);
        assert!(matches!(
            read_chunks(&mut truncated),
            Err(Error::Truncated { expected: 9, actual: 1 })
        ));
        Ok(())
    }

    #[test]
    fn masked_path_records() -> Result<()> {
        #[rustfmt::skip]
        let mut chunk = ByteStream::new(vec![
            0x21, 0x43, 0x65, 0x87,             // header, mask 0x21
            0x10, 0x00, 0x00, 0x00,             // offset
            0x03, 0x00, 0x00, 0x00,             // uncompressed
            0x03, 0x00, 0x00, 0x00,             // compressed
            0x04, 0x00, 0x00, 0x00,             // length including terminator
            0x40, 0x7D, 0x43,                   // "a\b" ^ 0x21
            0x00,
        ]);

        let records = read_path_records(&mut chunk)?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].path, "a\\b");
        assert_eq!(records[0].header, 0x8765_4321);
        assert_eq!(records[0].offset, 0x10);
        Ok(())
    }
}
