//! Types for writing VFI registries and their packages

use binrw::BinWrite;
use bon::Builder;
use byteorder::{LittleEndian, WriteBytesExt};
use std::{
    fs::File,
    io::{BufWriter, Cursor, Seek, Write},
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument};

use super::{HEADER_CHUNK, PACKAGE_FILES_CHUNK, PACKAGE_HEADER_CHUNK};
use crate::{
    compression::Codec,
    error::{FileNotFoundError, FormatError, Result},
    types::{masked, Guid, CHECKSUM},
};

/// Options for how the registry should be written
#[derive(Debug, Clone, Builder)]
pub struct VfiWriterOptions {
    #[builder(default = 1)]
    pub version: u32,

    #[builder(default)]
    pub guid: Guid,

    /// File name of the registry
    #[builder(default = String::from("content.vfi"), into)]
    pub registry_name: String,

    /// Compress payloads with the legacy codec, otherwise store them
    #[builder(default = true)]
    pub compress: bool,
}

impl Default for VfiWriterOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Clone)]
struct PendingFile {
    path: String,
    offset: u32,
    uncompressed: u32,
    compressed: u32,
}

#[derive(Debug, Clone)]
struct PendingPackage {
    name: String,
    data: Vec<u8>,
    files: Vec<PendingFile>,
}

/// VFI registry generator
///
/// Paths are stored as given and should start with `content\`. The mask of every record is the
/// low byte of the checksum of its path, so the output only depends on the input.
#[derive(Debug, Clone)]
pub struct VfiWriter {
    options: VfiWriterOptions,
    packages: Vec<PendingPackage>,
}

impl VfiWriter {
    pub fn new(options: VfiWriterOptions) -> Self {
        Self {
            options,
            packages: Vec::new(),
        }
    }

    /// Start a new package blob, returning its index
    pub fn add_package(&mut self, name: impl Into<String>) -> usize {
        self.packages.push(PendingPackage {
            name: name.into(),
            data: Vec::new(),
            files: Vec::new(),
        });
        self.packages.len() - 1
    }

    #[instrument(skip(self, data), fields(size = data.len()), err)]
    pub fn add_file(&mut self, package: usize, path: &str, data: &[u8]) -> Result<()> {
        if path.is_empty() {
            return Err(FormatError::EmptyName.into());
        }
        let compress = self.options.compress;
        let package = self
            .packages
            .get_mut(package)
            .ok_or(FileNotFoundError::Archive(package))?;

        let offset =
            u32::try_from(package.data.len()).map_err(|_| FormatError::Overflow("package offset"))?;
        let uncompressed =
            u32::try_from(data.len()).map_err(|_| FormatError::Overflow("file size"))?;

        let packed = compress
            .then(|| Codec::Legacy.compress(data))
            .filter(|packed| packed.len() < data.len());
        let stored = packed.as_deref().unwrap_or(data);
        package.data.extend_from_slice(stored);

        debug!(offset, uncompressed, compressed = stored.len(), "payload");
        package.files.push(PendingFile {
            path: path.to_string(),
            offset,
            uncompressed,
            compressed: stored.len() as u32,
        });
        Ok(())
    }

    /// Write the registry into `inner`
    pub fn write_registry<W: Write + Seek>(&self, mut inner: W) -> Result<W> {
        let mut header = Cursor::new(Vec::new());
        header.write_u32::<LittleEndian>(self.options.version)?;
        self.options.guid.write(&mut header)?;
        write_chunk(&mut inner, HEADER_CHUNK, header.get_ref())?;

        for (id, package) in self.packages.iter().enumerate() {
            let mut body = Vec::new();

            let mut package_header = Vec::new();
            package_header.extend(package.name.bytes().chain([0]));
            package_header.write_u32::<LittleEndian>(package_size(package)?)?;
            write_chunk(&mut body, PACKAGE_HEADER_CHUNK, &package_header)?;

            let mut files = Vec::new();
            for file in &package.files {
                let header = CHECKSUM.checksum(file.path.as_bytes());
                files.write_u32::<LittleEndian>(header)?;
                files.write_u32::<LittleEndian>(file.offset)?;
                files.write_u32::<LittleEndian>(file.uncompressed)?;
                files.write_u32::<LittleEndian>(file.compressed)?;
                files.write_u32::<LittleEndian>(file.path.len() as u32 + 1)?;
                files.extend(masked(&file.path, header as u8));
                files.push(0);
            }
            write_chunk(&mut body, PACKAGE_FILES_CHUNK, &files)?;

            write_chunk(&mut inner, id as u32, &body)?;
        }

        Ok(inner)
    }

    /// Write the registry and every package into `dir`, returning the registry path
    #[instrument(skip(self, dir), fields(dir = %dir.as_ref().display()), err)]
    pub fn finish(self, dir: impl AsRef<Path>) -> Result<PathBuf> {
        let dir = dir.as_ref();
        for package in &self.packages {
            std::fs::write(dir.join(&package.name), &package.data)?;
        }

        let registry = dir.join(&self.options.registry_name);
        self.write_registry(BufWriter::new(File::create(&registry)?))?
            .flush()?;

        info!(
            packages = self.packages.len(),
            files = self.packages.iter().map(|p| p.files.len()).sum::<usize>(),
            "wrote vfi"
        );
        Ok(registry)
    }
}

fn package_size(package: &PendingPackage) -> Result<u32> {
    u32::try_from(package.data.len()).map_err(|_| FormatError::Overflow("package size").into())
}

fn write_chunk<W: Write>(inner: &mut W, id: u32, body: &[u8]) -> Result<()> {
    let size = u32::try_from(body.len()).map_err(|_| FormatError::Overflow("chunk size"))?;
    inner.write_u32::<LittleEndian>(id)?;
    inner.write_u32::<LittleEndian>(size)?;
    inner.write_all(body)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use pretty_assertions::{assert_eq, assert_str_eq};
    use tempfile::tempdir;
    use tracing_test::traced_test;

    use super::{VfiWriter, VfiWriterOptions};
    use crate::{
        error::Result,
        types::Guid,
        vfi::{FlatKind, VfiArchive},
    };

    #[test]
    fn write_header_chunk() -> Result<()> {
        let writer = VfiWriter::new(
            VfiWriterOptions::builder()
                .version(7)
                .guid(Guid::new(1, 2, 3, 4, [5, 6, 7, 8, 9, 10]))
                .build(),
        );

        #[rustfmt::skip]
        let expected = vec![
            0xFF, 0xFF, 0xFF, 0xFF, 0x14, 0x00, 0x00, 0x00,
            0x07, 0x00, 0x00, 0x00,
            0x01, 0x00, 0x00, 0x00, 0x02, 0x00, 0x03, 0x00,
            0x04, 0x00, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A,
        ];

        let registry = writer.write_registry(std::io::Cursor::new(Vec::new()))?;
        assert_eq!(registry.into_inner(), expected);
        Ok(())
    }

    #[traced_test]
    #[test]
    fn written_registry_reads_back() -> Result<()> {
        let dir = tempdir()?;
        let text = "the quick brown fox jumps over the lazy dog ".repeat(40);

        let mut writer = VfiWriter::new(VfiWriterOptions::default());
        let first = writer.add_package("content.vfi0");
        let second = writer.add_package("content.vfi1");
        writer.add_file(first, "content\\scripts\\a.txt", text.as_bytes())?;
        writer.add_file(second, "content\\scripts\\b.txt", b"tiny")?;
        writer.add_file(second, "content\\c.bin", &[])?;
        let path = writer.finish(dir.path())?;

        let archive = VfiArchive::open(path)?;
        assert_eq!(archive.packages().len(), 2);
        assert_str_eq!(archive.packages()[1].name, "content.vfi1");

        let tree = archive.tree();
        assert_eq!(tree.file_count(), 3);

        let a = tree.find("scripts\\a.txt").and_then(|i| tree.entry(i));
        let location = a.and_then(|e| e.location()).copied().unwrap_or_default();
        assert!(!location.is_stored());
        assert_eq!(archive.extract(&location)?, text.as_bytes());

        let b = tree.find("scripts\\b.txt").and_then(|i| tree.entry(i));
        assert!(matches!(
            b.map(|e| &e.kind),
            Some(FlatKind::File { location, .. }) if location.package == 1 && location.is_stored()
        ));

        let c = tree.find("c.bin").and_then(|i| tree.entry(i));
        let location = c.and_then(|e| e.location()).copied().unwrap_or_default();
        assert_eq!(location.uncompressed, 0);
        assert!(archive.extract(&location)?.is_empty());
        Ok(())
    }
}
