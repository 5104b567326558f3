use binrw::BinReaderExt;
use byteorder::{LittleEndian, ReadBytesExt};
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

use super::{
    read_chunks, read_path_records, FlatTree, HEADER_CHUNK, PACKAGE_FILES_CHUNK,
    PACKAGE_HEADER_CHUNK,
};
use crate::{
    compression::Codec,
    error::{FileNotFoundError, FormatError, Result},
    stream::ByteStream,
    types::{read_payload, FileLocation, Guid, Package},
};

/// A parsed VFI registry
///
/// Payloads always use the legacy codec.
#[derive(Debug, Clone)]
pub struct VfiArchive {
    path: PathBuf,
    version: u32,
    guid: Guid,
    packages: Vec<Package>,
    tree: FlatTree,
}

impl VfiArchive {
    #[instrument(skip_all, fields(path = %path.as_ref().display()), err)]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut archive = Self::parse(std::fs::read(path)?)?;
        archive.path = path.canonicalize()?;
        Ok(archive)
    }

    pub fn parse(data: Vec<u8>) -> Result<Self> {
        let mut stream = ByteStream::new(data);
        let mut version = 0;
        let mut guid = Guid::default();
        let mut packages = Vec::new();
        let mut files = Vec::new();

        for (id, mut chunk) in read_chunks(&mut stream)? {
            match id {
                HEADER_CHUNK => {
                    version = chunk.read_u32::<LittleEndian>()?;
                    guid = chunk.read_le()?;
                    info!(version, %guid, "reading vfi");
                }
                _ => read_package(&mut chunk, &mut packages, &mut files)?,
            }
        }

        if files.is_empty() {
            return Err(FormatError::NoFiles.into());
        }
        for (index, (_, location)) in files.iter().enumerate() {
            if location.package >= packages.len() {
                return Err(FormatError::PackageOutOfRange {
                    file: index,
                    package: location.package,
                }
                .into());
            }
        }

        info!(packages = packages.len(), files = files.len(), "vfi ready");
        Ok(Self {
            path: PathBuf::new(),
            version,
            guid,
            packages,
            tree: FlatTree::build(files),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dir(&self) -> &Path {
        self.path.parent().unwrap_or(Path::new(""))
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn guid(&self) -> &Guid {
        &self.guid
    }

    pub fn packages(&self) -> &[Package] {
        &self.packages
    }

    pub fn tree(&self) -> &FlatTree {
        &self.tree
    }

    pub fn extract(&self, location: &FileLocation) -> Result<Vec<u8>> {
        let package = self
            .packages
            .get(location.package)
            .ok_or(FileNotFoundError::Index(location.package))?;
        read_payload(self.dir(), package, location, Codec::Legacy)
    }
}

/// Read one package chunk; its files refer to the package by the index it is given here
fn read_package(
    chunk: &mut ByteStream,
    packages: &mut Vec<Package>,
    files: &mut Vec<(String, FileLocation)>,
) -> Result<()> {
    let index = packages.len();

    for (id, mut sub) in read_chunks(chunk)? {
        match id {
            PACKAGE_HEADER_CHUNK => {
                let name = sub.read_string_z();
                let size = sub.read_u32::<LittleEndian>()?;
                debug!(%name, size, "package");
                packages.push(Package {
                    name,
                    levels: Vec::new(),
                    size,
                });
            }
            PACKAGE_FILES_CHUNK => {
                files.extend(read_path_records(&mut sub)?.into_iter().map(|record| {
                    let location = FileLocation {
                        package: index,
                        offset: record.offset,
                        uncompressed: record.uncompressed,
                        compressed: record.compressed,
                    };
                    (record.path, location)
                }));
            }
            other => debug!(id = other, "skipping unknown package chunk"),
        }
    }

    Ok(())
}
