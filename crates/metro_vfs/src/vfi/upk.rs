use byteorder::{LittleEndian, ReadBytesExt};
use std::{
    io::Read,
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument, warn};

use super::{
    read_chunks, read_path_records, FlatTree, UPK_BLOB_CHUNK, UPK_INFO_CHUNK, UPK_TAG_CHUNK,
    UPK_TOC_CHUNK,
};
use crate::{
    compression::Codec,
    error::{FormatError, Result},
    stream::ByteStream,
    types::{read_payload, FileLocation, Package, CHECKSUM},
};

/// A single file legacy archive holding both its table and its payloads
#[derive(Debug, Clone)]
pub struct UpkArchive {
    path: PathBuf,
    package: Package,
    checksums: Vec<u32>,
    tag: Option<[u8; 16]>,
    tree: FlatTree,
}

impl UpkArchive {
    #[instrument(skip_all, fields(path = %path.as_ref().display()), err)]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut archive = Self::parse(std::fs::read(path)?)?;
        archive.path = path.canonicalize()?;
        archive.package.name = archive
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(archive)
    }

    pub fn parse(data: Vec<u8>) -> Result<Self> {
        let mut stream = ByteStream::new(data);
        let mut size = 0;
        let mut checksums = Vec::new();
        let mut files = Vec::new();
        let mut tag = None;

        for (id, mut chunk) in read_chunks(&mut stream)? {
            match id {
                UPK_BLOB_CHUNK => size = chunk.len() as u32,
                UPK_TOC_CHUNK => {
                    for record in read_path_records(&mut chunk)? {
                        checksums.push(record.header);
                        files.push((
                            record.path,
                            FileLocation {
                                package: 0,
                                offset: record.offset,
                                uncompressed: record.uncompressed,
                                compressed: record.compressed,
                            },
                        ));
                    }
                }
                UPK_INFO_CHUNK => {
                    let info = chunk.read_u32::<LittleEndian>()?;
                    debug!(info, "upk info");
                }
                UPK_TAG_CHUNK => {
                    let mut value = [0u8; 16];
                    chunk.read_exact(&mut value)?;
                    tag = Some(value);
                }
                other => debug!(id = other, "skipping unknown upk chunk"),
            }
        }

        if files.is_empty() {
            return Err(FormatError::NoFiles.into());
        }

        info!(files = files.len(), size, "upk ready");
        Ok(Self {
            path: PathBuf::new(),
            package: Package {
                name: String::new(),
                levels: Vec::new(),
                size,
            },
            checksums,
            tag,
            tree: FlatTree::build(files),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dir(&self) -> &Path {
        self.path.parent().unwrap_or(Path::new(""))
    }

    /// The archive itself, seen as the package its payloads live in
    pub fn package(&self) -> &Package {
        &self.package
    }

    pub fn tag(&self) -> Option<&[u8; 16]> {
        self.tag.as_ref()
    }

    pub fn tree(&self) -> &FlatTree {
        &self.tree
    }

    /// Checksum stored for the file at `index`
    pub fn checksum(&self, index: usize) -> Option<u32> {
        self.checksums.get(index).copied()
    }

    pub fn extract(&self, location: &FileLocation) -> Result<Vec<u8>> {
        read_payload(self.dir(), &self.package, location, Codec::Legacy)
    }

    /// Extract the file at `index` and compare it against its stored checksum
    pub fn verify(&self, index: usize) -> Result<bool> {
        let (Some(expected), Some(location)) = (
            self.checksum(index),
            self.tree.entry(index).and_then(|e| e.location()),
        ) else {
            return Ok(false);
        };

        let actual = CHECKSUM.checksum(&self.extract(location)?);
        if actual != expected {
            warn!(index, expected, actual, "checksum mismatch");
        }
        Ok(actual == expected)
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::{assert_eq, assert_str_eq};
    use tempfile::tempdir;

    use super::UpkArchive;
    use crate::{error::Result, types::CHECKSUM};

    fn upk(payload: &[u8], path: &str) -> Vec<u8> {
        let crc = CHECKSUM.checksum(payload);
        let mask = crc as u8;

        let mut out = Vec::new();
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(payload);

        let mut toc = Vec::new();
        toc.extend_from_slice(&crc.to_le_bytes());
        toc.extend_from_slice(&8u32.to_le_bytes());
        toc.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        toc.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        toc.extend_from_slice(&(path.len() as u32 + 1).to_le_bytes());
        toc.extend(path.bytes().chain([0]).map(|b| b ^ mask));
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&(toc.len() as u32).to_le_bytes());
        out.extend_from_slice(&toc);

        #[rustfmt::skip]
        let trailer = [
            0x02, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x03, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00,
            0x29, 0x2C, 0x55, 0xF8, 0xAC, 0xA8, 0x96, 0x41,
            0xA9, 0xA4, 0xB1, 0xB4, 0x7D, 0xB0, 0x65, 0x4F,
        ];
        out.extend_from_slice(&trailer);
        out
    }

    #[test]
    fn read_and_verify() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("content.upk9");
        std::fs::write(&path, upk(b"hello upk", "content\\scripts\\a.txt"))?;

        let archive = UpkArchive::open(&path)?;
        assert_str_eq!(archive.package().name, "content.upk9");
        assert_eq!(archive.package().size, 9);
        assert_eq!(archive.tag().map(|t| t[0]), Some(0x29));

        let index = archive.tree().find("scripts\\a.txt");
        assert_eq!(index, Some(0));

        let location = archive.tree().entries()[0].location().copied().unwrap_or_default();
        assert_eq!(archive.extract(&location)?, b"hello upk");
        assert!(archive.verify(0)?);
        Ok(())
    }

    #[test]
    fn corrupted_payload_fails_verification() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("content.upk0");
        let mut data = upk(b"payload", "content\\p.bin");
        data[8] ^= 0xFF;
        std::fs::write(&path, data)?;

        let archive = UpkArchive::open(&path)?;
        assert!(!archive.verify(0)?);
        assert!(!archive.verify(7)?);
        Ok(())
    }
}
