use binrw::{BinRead, BinReaderExt};
use std::{
    fs::File,
    io::{BufReader, Read, Seek},
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument, trace};

use super::{
    FilePayload, FolderPayload, ParseStage, RecordFlags, RecordKind, VfxDuplicate, VfxHeader,
    VfxRecord,
};
use crate::{
    compression::{Codec, CompressionType},
    error::{Error, FileNotFoundError, FormatError, Result},
    types::{read_payload, read_record_name, read_string_z, FileLocation, Guid, Layout, Package, Title},
};

/// A parsed VFX registry
///
/// Payloads are not loaded: [`VfxArchive::extract`] reads them from the package blobs next to
/// the registry on demand.
#[derive(Debug, Clone)]
pub struct VfxArchive {
    path: PathBuf,
    version: u32,
    guid: Guid,
    content_version: Option<String>,
    layout: Layout,
    packages: Vec<Package>,
    records: Vec<VfxRecord>,
    duplicates: Vec<VfxDuplicate>,
}

impl VfxArchive {
    /// Parse the registry at `path`
    #[instrument(skip_all, fields(path = %path.as_ref().display()), err)]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut reader = BufReader::new(File::open(path)?);
        let mut archive = Self::parse(&mut reader)?;
        archive.path = path.canonicalize()?;
        Ok(archive)
    }

    /// Parse a registry from `reader`
    ///
    /// Packages are looked up relative to the working directory until the archive is given a
    /// path by [`VfxArchive::open`].
    pub fn parse<R: Read + Seek>(reader: &mut R) -> Result<Self> {
        let mut stage = ParseStage::Start;
        let result = Self::read_stages(reader, &mut stage);
        result.map_err(|source| Error::Parse {
            stage,
            source: Box::new(source),
        })
    }

    fn read_stages<R: Read + Seek>(reader: &mut R, stage: &mut ParseStage) -> Result<Self> {
        let header = VfxHeader::read(reader)?;
        if !(1..=3).contains(&header.version) {
            return Err(FormatError::UnsupportedVersion(header.version).into());
        }
        CompressionType::try_from(header.compression)?;

        let layout = Layout::new(header.version, &header.guid);
        let content_version = header
            .content_version
            .as_ref()
            .map(|v| String::from_utf8_lossy(&v.0).into_owned());
        info!(
            version = header.version,
            guid = %header.guid,
            title = %Title::classify(header.version, &header.guid),
            packages = header.packages,
            files = header.files,
            duplicates = header.duplicates,
            "reading registry"
        );
        *stage = ParseStage::HeaderParsed;

        let packages = (0..header.packages)
            .map(|_| read_package(reader, &layout))
            .collect::<Result<Vec<_>>>()?;
        *stage = ParseStage::PackagesRead;

        // counts come from the header and are only trusted as far as the input goes
        let mut records = Vec::new();
        for index in 0..header.files as usize {
            let (flags, kind) = read_record(reader, &layout)?;
            let name = read_record_name(reader)?;
            trace!(index, %name, ?flags, "record");
            records.push(VfxRecord { name, flags, kind });
        }
        validate_records(&records, packages.len())?;
        *stage = ParseStage::FilesRead;

        let mut duplicates = Vec::new();
        for index in 0..header.duplicates as usize {
            let (flags, kind) = read_record(reader, &layout)?;
            let RecordKind::File { location, .. } = kind else {
                return Err(FormatError::DuplicateIsFolder(index).into());
            };
            if location.package >= packages.len() {
                return Err(FormatError::PackageOutOfRange {
                    file: index,
                    package: location.package,
                }
                .into());
            }

            if layout.named_duplicates {
                let name = read_record_name(reader)?;
                trace!(index, %name, ?flags, "named duplicate");
                duplicates.push(VfxDuplicate {
                    name,
                    location,
                    base: None,
                    next: None,
                });
                continue;
            }

            let base: u32 = reader.read_le()?;
            let base = base as usize;
            let invalid = FormatError::InvalidDuplicateBase {
                duplicate: index,
                base,
            };
            let record = records.get_mut(base).ok_or(invalid.clone())?;
            let RecordKind::File {
                duplicates: head, ..
            } = &mut record.kind
            else {
                return Err(invalid.into());
            };

            duplicates.push(VfxDuplicate {
                name: record.name.clone(),
                location,
                base: Some(base),
                next: head.replace(index),
            });
        }
        *stage = ParseStage::DuplicatesLinked;

        let archive = Self {
            path: PathBuf::new(),
            version: header.version,
            guid: header.guid,
            content_version,
            layout,
            packages,
            records,
            duplicates,
        };
        *stage = ParseStage::Ready;
        debug!(
            files = archive.file_count(),
            folders = archive.records.len() - archive.file_count(),
            "registry ready"
        );
        Ok(archive)
    }

    /// Absolute path of the registry, empty when parsed from a reader
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory the packages are read from
    pub fn dir(&self) -> &Path {
        self.path.parent().unwrap_or(Path::new(""))
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn guid(&self) -> &Guid {
        &self.guid
    }

    pub fn content_version(&self) -> Option<&str> {
        self.content_version.as_deref()
    }

    pub fn title(&self) -> Title {
        Title::classify(self.version, &self.guid)
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn codec(&self) -> Codec {
        self.layout.codec
    }

    pub fn packages(&self) -> &[Package] {
        &self.packages
    }

    pub fn records(&self) -> &[VfxRecord] {
        &self.records
    }

    pub fn record(&self, index: usize) -> Option<&VfxRecord> {
        self.records.get(index)
    }

    pub fn duplicates(&self) -> &[VfxDuplicate] {
        &self.duplicates
    }

    /// Number of file records, duplicates excluded
    pub fn file_count(&self) -> usize {
        self.records.iter().filter(|r| !r.is_folder()).count()
    }

    /// Children of the record at `index` along with their indices
    pub fn children(&self, index: usize) -> impl Iterator<Item = (usize, &VfxRecord)> {
        let range = self
            .records
            .get(index)
            .map(|r| r.children())
            .unwrap_or(0..0);
        range.filter_map(|i| self.records.get(i).map(|r| (i, r)))
    }

    /// Look a record up by its `\` or `/` separated path from the root
    pub fn find(&self, path: &str) -> Option<usize> {
        path.split(['\\', '/'])
            .filter(|segment| !segment.is_empty())
            .try_fold(0, |folder, segment| {
                self.children(folder)
                    .find(|(_, r)| r.name == segment)
                    .map(|(i, _)| i)
            })
    }

    /// Duplicate chain of the record at `index`, newest first
    pub fn duplicate_chain(&self, index: usize) -> impl Iterator<Item = &VfxDuplicate> {
        let head = match self.records.get(index).map(|r| &r.kind) {
            Some(RecordKind::File { duplicates, .. }) => *duplicates,
            _ => None,
        };
        std::iter::successors(head.and_then(|i| self.duplicates.get(i)), |d| {
            d.next.and_then(|i| self.duplicates.get(i))
        })
    }

    /// Read and decode the payload at `location`
    pub fn extract(&self, location: &FileLocation) -> Result<Vec<u8>> {
        let package = self
            .packages
            .get(location.package)
            .ok_or(FileNotFoundError::Index(location.package))?;
        read_payload(self.dir(), package, location, self.codec())
    }
}

fn read_package<R: Read + Seek>(reader: &mut R, layout: &Layout) -> Result<Package> {
    let name = read_string_z(reader)?;
    let levels = match layout.package_levels {
        true => {
            let count: u32 = reader.read_le()?;
            (0..count)
                .map(|_| read_string_z(reader))
                .collect::<Result<Vec<_>>>()?
        }
        false => Vec::new(),
    };
    let size: u32 = reader.read_le()?;

    debug!(%name, size, levels = levels.len(), "package");
    Ok(Package { name, levels, size })
}

/// Read the flag word and payload of a record
fn read_record<R: Read + Seek>(reader: &mut R, layout: &Layout) -> Result<(RecordFlags, RecordKind)> {
    let raw: u16 = reader.read_le()?;
    let flags = RecordFlags(if layout.shifted_flags { raw >> 1 } else { raw });

    let kind = if flags.is_folder() {
        let payload = FolderPayload::read(reader)?;
        RecordKind::Folder {
            first: payload.first as usize,
            count: payload.children as usize,
        }
    } else {
        let payload = FilePayload::read(reader)?;
        RecordKind::File {
            location: FileLocation {
                package: payload.package as usize,
                offset: payload.offset,
                uncompressed: payload.uncompressed,
                compressed: payload.compressed,
            },
            duplicates: None,
        }
    };

    Ok((flags, kind))
}

fn validate_records(records: &[VfxRecord], packages: usize) -> Result<()> {
    if !records.first().is_some_and(VfxRecord::is_folder) {
        return Err(FormatError::RootNotFolder.into());
    }

    for (index, record) in records.iter().enumerate() {
        match &record.kind {
            RecordKind::Folder { first, count } if first + count > records.len() => {
                return Err(FormatError::ChildrenOutOfRange {
                    folder: index,
                    first: *first,
                    end: first + count,
                    total: records.len(),
                }
                .into());
            }
            RecordKind::File { location, .. } if location.package >= packages => {
                return Err(FormatError::PackageOutOfRange {
                    file: index,
                    package: location.package,
                }
                .into());
            }
            _ => {}
        }
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use std::io::Cursor;

    use pretty_assertions::{assert_eq, assert_str_eq};
    use tracing_test::traced_test;

    use super::VfxArchive;
    use crate::{
        compression::Codec,
        error::{Error, FormatError, Result},
        types::{FileLocation, Guid},
        vfx::{ParseStage, RecordFlags, RecordKind},
    };

    #[rustfmt::skip]
    fn exodus_registry() -> Vec<u8> {
        vec![
            0x03, 0x00, 0x00, 0x00,             // version
            0x01, 0x00, 0x00, 0x00,             // compression
            b'1', b'.', b'0', 0x00,             // content version
            0x12, 0x5B, 0xE2, 0x9F, 0x76, 0xF2, 0xF4, 0x40,
            0xB8, 0xEA, 0x0F, 0xE1, 0xA4, 0xC6, 0x9E, 0x7A,
            0x01, 0x00, 0x00, 0x00,             // packages
            0x03, 0x00, 0x00, 0x00,             // files
            0x01, 0x00, 0x00, 0x00,             // duplicates

            b'c', b'.', b'u', b'p', b'0', 0x00, // package name
            0x01, 0x00, 0x00, 0x00,             // one level
            b'l', b'1', 0x00,
            0x40, 0x00, 0x00, 0x00,             // size

            // root folder: 2 children from 1
            0x08, 0x00, 0x02, 0x00, 0x01, 0x00, 0x00, 0x00,
            0x01, 0x00, 0x00,
            // a.txt
            0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00,
            0x0A, 0x00, 0x00, 0x00,
            0x0A, 0x00, 0x00, 0x00,
            0x06, 0x11, 0x70, 0x3F, 0x65, 0x69, 0x65, 0x00,
            // dir: empty folder
            0x08, 0x00, 0x00, 0x00, 0x03, 0x00, 0x00, 0x00,
            0x04, 0x00, b'd', b'i', b'r', 0x00,

            // duplicate of a.txt
            0x00, 0x00, 0x00, 0x00,
            0x20, 0x00, 0x00, 0x00,
            0x0A, 0x00, 0x00, 0x00,
            0x0A, 0x00, 0x00, 0x00,
            0x01, 0x00, 0x00, 0x00,

            0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00,
        ]
    }

    #[traced_test]
    #[test]
    fn read_exodus_registry() -> Result<()> {
        let archive = VfxArchive::parse(&mut Cursor::new(exodus_registry()))?;

        assert_eq!(archive.version(), 3);
        assert_eq!(*archive.guid(), Guid::EXODUS);
        assert_eq!(archive.content_version(), Some("1.0"));
        assert_eq!(archive.codec(), Codec::Lz4);

        assert_eq!(archive.packages().len(), 1);
        assert_str_eq!(archive.packages()[0].name, "c.up0");
        assert_eq!(archive.packages()[0].levels, ["l1"]);
        assert_eq!(archive.packages()[0].size, 0x40);

        let names: Vec<_> = archive.records().iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["", "a.txt", "dir"]);
        assert_eq!(archive.file_count(), 1);
        assert_eq!(archive.find("a.txt"), Some(1));
        assert_eq!(archive.find("dir"), Some(2));
        assert_eq!(archive.find("dir/a.txt"), None);

        let chain: Vec<_> = archive.duplicate_chain(1).collect();
        assert_eq!(chain.len(), 1);
        assert_str_eq!(chain[0].name, "a.txt");
        assert_eq!(
            chain[0].location,
            FileLocation {
                package: 0,
                offset: 0x20,
                uncompressed: 10,
                compressed: 10,
            }
        );
        Ok(())
    }

    #[test]
    fn last_light_flags_are_shifted() -> Result<()> {
        #[rustfmt::skip]
        let data = vec![
            0x01, 0x00, 0x00, 0x00,
            0x01, 0x00, 0x00, 0x00,
            0x4A, 0x7F, 0x72, 0xE4, 0x6A, 0xF5, 0x98, 0x49,
            0x84, 0x2E, 0xFC, 0xD2, 0x75, 0x22, 0xEB, 0x3D,
            0x01, 0x00, 0x00, 0x00,
            0x02, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00,

            b'p', 0x00,
            0x10, 0x00, 0x00, 0x00,             // size, no levels

            0x10, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00,
            0x01, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00,
            0x04, 0x00, 0x00, 0x00,
            0x04, 0x00, 0x00, 0x00,
            0x02, 0x00, b'x', 0x00,
        ];

        let archive = VfxArchive::parse(&mut Cursor::new(data))?;
        assert_eq!(archive.codec(), Codec::Legacy);
        assert!(archive.packages()[0].levels.is_empty());
        assert_eq!(archive.records()[0].flags, RecordFlags::folder());
        assert_eq!(archive.records()[0].kind, RecordKind::Folder { first: 1, count: 1 });
        assert_eq!(archive.find("x"), Some(1));
        Ok(())
    }

    #[test]
    fn unsupported_version() {
        let mut data = exodus_registry();
        data[0] = 4;

        let Err(Error::Parse { stage, source }) = VfxArchive::parse(&mut Cursor::new(data)) else {
            panic!("version 4 must be rejected");
        };
        assert_eq!(stage, ParseStage::Start);
        assert!(matches!(
            *source,
            Error::Format(FormatError::UnsupportedVersion(4))
        ));
    }

    #[test]
    fn unsupported_compression() {
        let mut data = exodus_registry();
        data[4] = 2;

        assert!(matches!(
            VfxArchive::parse(&mut Cursor::new(data)),
            Err(Error::Parse { stage: ParseStage::Start, source })
                if matches!(*source, Error::Format(FormatError::UnsupportedCompression(2)))
        ));
    }

    #[test]
    fn truncated_file_table() {
        let mut data = exodus_registry();
        data.truncate(70);

        assert!(matches!(
            VfxArchive::parse(&mut Cursor::new(data)),
            Err(Error::Parse { stage: ParseStage::PackagesRead, .. })
        ));
    }

    #[test]
    fn huge_file_count_is_an_error() {
        let mut data = exodus_registry();
        data.truncate(40);
        data[28..32].copy_from_slice(&0u32.to_le_bytes());
        data[32..36].copy_from_slice(&u32::MAX.to_le_bytes());
        data[36..40].copy_from_slice(&u32::MAX.to_le_bytes());

        assert!(matches!(
            VfxArchive::parse(&mut Cursor::new(data)),
            Err(Error::Parse { stage: ParseStage::PackagesRead, .. })
        ));
    }

    #[test]
    fn children_out_of_range() {
        let mut data = exodus_registry();
        // root claims three children
        data[59] = 3;

        assert!(matches!(
            VfxArchive::parse(&mut Cursor::new(data)),
            Err(Error::Parse { stage: ParseStage::PackagesRead, source })
                if matches!(*source, Error::Format(FormatError::ChildrenOutOfRange { folder: 0, .. }))
        ));
    }

    #[test]
    fn duplicate_of_folder() {
        let mut data = exodus_registry();
        let base = data.len() - 12;
        data[base] = 2;

        assert!(matches!(
            VfxArchive::parse(&mut Cursor::new(data)),
            Err(Error::Parse { stage: ParseStage::FilesRead, source })
                if matches!(*source, Error::Format(FormatError::InvalidDuplicateBase { duplicate: 0, base: 2 }))
        ));
    }
}
