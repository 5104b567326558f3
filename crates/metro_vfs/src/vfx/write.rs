//! Types for writing VFX registries and their package blob

use binrw::{BinWrite, BinWriterExt, NullString};
use bon::Builder;
use std::{
    collections::VecDeque,
    fs::File,
    io::{BufWriter, Seek, Write},
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument};

use super::{FilePayload, FolderPayload, RecordFlags, VfxHeader};
use crate::{
    compression::CompressionType,
    error::{Error, FileNotFoundError, FormatError, Result},
    types::{write_record_name, write_string_z, FileLocation, Guid, Layout},
};

/// Options for how the registry should be written
#[derive(Debug, Clone, Builder)]
pub struct VfxWriterOptions {
    /// Registry version, 1 to 3
    #[builder(default = 3)]
    pub version: u32,

    /// Registry identifier; it also selects the codec and the layout variants
    #[builder(default = Guid::EXODUS)]
    pub guid: Guid,

    /// Written for version 3 registries only
    #[builder(default = String::from("1.0"), into)]
    pub content_version: String,

    /// File name of the registry
    #[builder(default = String::from("content.vfx"), into)]
    pub registry_name: String,

    /// File name of the package blob, derived from the registry name when unset
    #[builder(into)]
    pub package_name: Option<String>,

    /// Level tags stored with the package
    #[builder(default)]
    pub levels: Vec<String>,

    /// Seed of the name mask generator
    #[builder(default = 0x4D45_5452)]
    pub seed: u32,

    /// Write a patch registry: folders that are not flagged new are named by their full path
    #[builder(default)]
    pub patch: bool,
}

impl Default for VfxWriterOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Clone)]
enum Node {
    Folder {
        name: String,
        new: bool,
        children: Vec<usize>,
    },
    File {
        name: String,
        location: FileLocation,
    },
}

impl Node {
    fn name(&self) -> &str {
        match self {
            Node::Folder { name, .. } | Node::File { name, .. } => name,
        }
    }
}

/// Deterministic source of name masks in `15..250`
#[derive(Debug, Clone)]
struct MaskGenerator(u32);

impl MaskGenerator {
    fn next_mask(&mut self) -> u8 {
        self.0 = self.0.wrapping_mul(1_103_515_245).wrapping_add(12_345);
        ((self.0 >> 16) % 235 + 15) as u8
    }
}

/// VFX registry generator
///
/// Files are compressed as they are added and appended to a single package blob. Folders are
/// created implicitly for every path; [`VfxWriter::add_folder`] creates them explicitly and
/// decides whether a patch folder is flagged new.
///
/// ```
/// # fn doit() -> metro_vfs::error::Result<()>
/// # {
/// use metro_vfs::{VfxArchive, VfxWriter, VfxWriterOptions};
///
/// let dir = std::env::temp_dir().join("metro_vfs_doc_vfx");
/// std::fs::create_dir_all(&dir)?;
///
/// let mut vfx = VfxWriter::new(VfxWriterOptions::builder().build());
/// vfx.add_file("scripts\\hello.txt", b"Hello, World!", true)?;
/// let path = vfx.finish(&dir)?;
///
/// let archive = VfxArchive::open(path)?;
/// assert!(archive.find("scripts\\hello.txt").is_some());
/// # Ok(())
/// # }
/// # doit().unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct VfxWriter {
    options: VfxWriterOptions,
    layout: Layout,
    nodes: Vec<Node>,
    /// Folders written outside of the root's subtree, see [`VfxWriter::add_override`]
    overrides: Vec<usize>,
    duplicates: Vec<(usize, FileLocation)>,
    package: Vec<u8>,
}

impl VfxWriter {
    pub fn new(options: VfxWriterOptions) -> Self {
        let layout = Layout::new(options.version, &options.guid);
        Self {
            options,
            layout,
            nodes: vec![Node::Folder {
                name: String::new(),
                new: false,
                children: Vec::new(),
            }],
            overrides: Vec::new(),
            duplicates: Vec::new(),
            package: Vec::new(),
        }
    }

    /// Add a patch folder replacing the folder at `path` of the earlier layers without
    /// redefining its parents
    ///
    /// The record is not a child of any folder; files added below `path` land in it.
    #[instrument(skip(self), err)]
    pub fn add_override(&mut self, path: &str) -> Result<()> {
        let name = segments(path).collect::<Vec<_>>().join("\\");
        if name.is_empty() {
            return Err(FormatError::EmptyName.into());
        }
        if self.overrides.iter().any(|&node| self.nodes[node].name() == name) {
            return Ok(());
        }

        self.nodes.push(Node::Folder {
            name,
            new: false,
            children: Vec::new(),
        });
        self.overrides.push(self.nodes.len() - 1);
        Ok(())
    }

    /// Create the folder at `path` and its parents
    ///
    /// `new` flags the last folder as new in this patch; its parents keep their flag.
    #[instrument(skip(self), err)]
    pub fn add_folder(&mut self, path: &str, new: bool) -> Result<()> {
        let folder = self.folder(path)?;
        if let Node::Folder { new: flag, .. } = &mut self.nodes[folder] {
            *flag = new;
        }
        Ok(())
    }

    /// Add a file holding `data`, compressed with the registry codec when `compress` is set
    ///
    /// A payload that does not shrink is stored as is.
    #[instrument(skip(self, data), fields(size = data.len()), err)]
    pub fn add_file(&mut self, path: &str, data: &[u8], compress: bool) -> Result<()> {
        let (parent, name) = split_leaf(path);
        if name.is_empty() {
            return Err(FormatError::EmptyName.into());
        }
        let parent = self.folder(parent)?;
        let existing = self.child(parent, name);
        if existing.is_some_and(|index| matches!(self.nodes[index], Node::Folder { .. })) {
            return Err(Error::CustomError(format!("{path} is a folder")));
        }

        let location = self.append_payload(data, compress)?;
        let node = Node::File {
            name: name.to_string(),
            location,
        };
        match existing {
            Some(index) => self.nodes[index] = node,
            None => {
                self.nodes.push(node);
                let index = self.nodes.len() - 1;
                self.push_child(parent, index);
            }
        }
        Ok(())
    }

    /// Add a second location for the file already added at `path`
    #[instrument(skip(self, data), fields(size = data.len()), err)]
    pub fn add_duplicate(&mut self, path: &str, data: &[u8], compress: bool) -> Result<()> {
        let base = self
            .find(path)
            .filter(|&index| matches!(self.nodes[index], Node::File { .. }))
            .ok_or_else(|| FileNotFoundError::Name(path.to_string()))?;
        let location = self.append_payload(data, compress)?;
        self.duplicates.push((base, location));
        Ok(())
    }

    fn package_name(&self) -> String {
        self.options.package_name.clone().unwrap_or_else(|| {
            let stem = Path::new(&self.options.registry_name)
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default();
            format!("{stem}.upk0")
        })
    }

    /// Write the registry and the package blob into `dir`, returning the registry path
    #[instrument(skip(self, dir), fields(dir = %dir.as_ref().display()), err)]
    pub fn finish(self, dir: impl AsRef<Path>) -> Result<PathBuf> {
        let dir = dir.as_ref();
        let registry = dir.join(&self.options.registry_name);

        let mut package = BufWriter::new(File::create(dir.join(self.package_name()))?);
        let inner = BufWriter::new(File::create(&registry)?);
        self.finish_into(inner, &mut package)?.flush()?;
        package.flush()?;

        Ok(registry)
    }

    /// Write the registry into `inner` and the package blob into `package`
    pub fn finish_into<W: Write + Seek, P: Write>(self, mut inner: W, package: &mut P) -> Result<W> {
        let package_size =
            u32::try_from(self.package.len()).map_err(|_| FormatError::Overflow("package size"))?;
        package.write_all(&self.package)?;

        let order = self.breadth_first();
        let mut index_of = vec![0usize; self.nodes.len()];
        for (index, (node, _)) in order.iter().enumerate() {
            index_of[*node] = index;
        }

        let header = VfxHeader {
            version: self.options.version,
            compression: CompressionType::Lz4.into(),
            content_version: self
                .layout
                .content_version
                .then(|| NullString::from(self.options.content_version.as_str())),
            guid: self.options.guid,
            packages: 1,
            files: order.len() as u32,
            duplicates: self.duplicates.len() as u32,
        };
        header.write(&mut inner)?;

        write_string_z(&mut inner, &self.package_name())?;
        if self.layout.package_levels {
            inner.write_le(&(self.options.levels.len() as u32))?;
            for level in &self.options.levels {
                write_string_z(&mut inner, level)?;
            }
        }
        inner.write_le(&package_size)?;

        let mut masks = MaskGenerator(self.options.seed);
        for (node, path) in &order {
            match &self.nodes[*node] {
                Node::Folder { name, new, children } => {
                    let first = children.first().map(|&c| index_of[c]).unwrap_or(order.len());
                    let flags = RecordFlags::folder().with_new(*new);
                    self.write_flags(&mut inner, flags)?;
                    FolderPayload {
                        children: u16::try_from(children.len())
                            .map_err(|_| FormatError::Overflow("folder children"))?,
                        first: first as u32,
                    }
                    .write(&mut inner)?;
                    let name = match self.options.patch && !new && *node != 0 {
                        true => path,
                        false => name,
                    };
                    write_record_name(&mut inner, name, masks.next_mask())?;
                }
                Node::File { name, location } => {
                    self.write_flags(&mut inner, RecordFlags::file())?;
                    file_payload(location).write(&mut inner)?;
                    write_record_name(&mut inner, name, masks.next_mask())?;
                }
            }
        }

        for (base, location) in &self.duplicates {
            self.write_flags(&mut inner, RecordFlags::file())?;
            file_payload(location).write(&mut inner)?;
            if self.layout.named_duplicates {
                write_record_name(&mut inner, self.nodes[*base].name(), masks.next_mask())?;
            } else {
                inner.write_le(&(index_of[*base] as u32))?;
            }
        }

        inner.write_le(&0u32)?;
        inner.write_le(&0u32)?;

        info!(
            records = order.len(),
            duplicates = self.duplicates.len(),
            package_size,
            "wrote registry"
        );
        Ok(inner)
    }

    fn write_flags<W: Write + Seek>(&self, inner: &mut W, flags: RecordFlags) -> Result<()> {
        let raw = match self.layout.shifted_flags {
            true => flags.0 << 1,
            false => flags.0,
        };
        inner.write_le(&raw)?;
        Ok(())
    }

    /// Node indices in the order their records are written, keeping siblings contiguous, along
    /// with their full paths
    ///
    /// The root's subtree comes first, then the subtree of every override folder.
    fn breadth_first(&self) -> Vec<(usize, String)> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let roots = std::iter::once((0, String::new())).chain(
            self.overrides
                .iter()
                .map(|&node| (node, self.nodes[node].name().to_string())),
        );

        for root in roots {
            let mut queue = VecDeque::from([root]);
            while let Some((node, path)) = queue.pop_front() {
                if let Node::Folder { children, .. } = &self.nodes[node] {
                    queue.extend(children.iter().map(|&child| {
                        let name = self.nodes[child].name();
                        match path.is_empty() {
                            true => (child, name.to_string()),
                            false => (child, format!("{path}\\{name}")),
                        }
                    }));
                }
                order.push((node, path));
            }
        }
        order
    }

    fn append_payload(&mut self, data: &[u8], compress: bool) -> Result<FileLocation> {
        let offset =
            u32::try_from(self.package.len()).map_err(|_| FormatError::Overflow("package offset"))?;
        let uncompressed =
            u32::try_from(data.len()).map_err(|_| FormatError::Overflow("file size"))?;

        let packed = compress
            .then(|| self.layout.codec.compress(data))
            .filter(|packed| packed.len() < data.len());
        let stored = packed.as_deref().unwrap_or(data);
        self.package.extend_from_slice(stored);

        debug!(offset, uncompressed, compressed = stored.len(), "payload");
        Ok(FileLocation {
            package: 0,
            offset,
            uncompressed,
            compressed: stored.len() as u32,
        })
    }

    fn child(&self, folder: usize, name: &str) -> Option<usize> {
        match &self.nodes[folder] {
            Node::Folder { children, .. } => children
                .iter()
                .copied()
                .find(|&c| self.nodes[c].name() == name),
            Node::File { .. } => None,
        }
    }

    fn push_child(&mut self, folder: usize, child: usize) {
        if let Node::Folder { children, .. } = &mut self.nodes[folder] {
            children.push(child);
        }
    }

    /// Folder a lookup of `path` starts from, the deepest override it lies in or the root, and
    /// the segments left to walk
    fn start<'p>(&self, path: &'p str) -> (usize, Vec<&'p str>) {
        let parts: Vec<&str> = segments(path).collect();
        self.overrides
            .iter()
            .filter_map(|&node| {
                let len = segments(self.nodes[node].name()).count();
                let prefix = parts.get(..len)?;
                segments(self.nodes[node].name())
                    .eq(prefix.iter().copied())
                    .then_some((len, node))
            })
            .max_by_key(|&(len, _)| len)
            .map(|(len, node)| (node, parts[len..].to_vec()))
            .unwrap_or((0, parts))
    }

    fn find(&self, path: &str) -> Option<usize> {
        let (start, rest) = self.start(path);
        rest.into_iter()
            .try_fold(start, |folder, segment| self.child(folder, segment))
    }

    /// Find or create the folder at `path`
    ///
    /// Folders created inside a folder flagged new are flagged new too.
    fn folder(&mut self, path: &str) -> Result<usize> {
        let (mut folder, rest) = self.start(path);
        for segment in rest {
            folder = match self.child(folder, segment) {
                Some(index) if matches!(self.nodes[index], Node::Folder { .. }) => index,
                Some(_) => return Err(FileNotFoundError::Name(path.to_string()).into()),
                None => {
                    let new = matches!(self.nodes[folder], Node::Folder { new: true, .. });
                    self.nodes.push(Node::Folder {
                        name: segment.to_string(),
                        new,
                        children: Vec::new(),
                    });
                    let index = self.nodes.len() - 1;
                    self.push_child(folder, index);
                    index
                }
            };
        }
        Ok(folder)
    }
}

fn file_payload(location: &FileLocation) -> FilePayload {
    FilePayload {
        package: location.package as u16,
        offset: location.offset,
        uncompressed: location.uncompressed,
        compressed: location.compressed,
    }
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split(['\\', '/']).filter(|segment| !segment.is_empty())
}

/// Split a path into its folder part and its leaf name
fn split_leaf(path: &str) -> (&str, &str) {
    let path = path.trim_end_matches(['\\', '/']);
    match path.rfind(['\\', '/']) {
        Some(at) => (&path[..at], &path[at + 1..]),
        None => ("", path),
    }
}

#[cfg(test)]
mod test {
    use std::io::Cursor;

    use pretty_assertions::{assert_eq, assert_str_eq};
    use tracing_test::traced_test;

    use super::{VfxWriter, VfxWriterOptions};
    use crate::{
        error::Result,
        types::Guid,
        vfx::{RecordFlags, RecordKind, VfxArchive},
    };

    #[traced_test]
    #[test]
    fn write_single_file_registry() -> Result<()> {
        #[rustfmt::skip]
        let expected = vec![
            0x02, 0x00, 0x00, 0x00,             // version
            0x01, 0x00, 0x00, 0x00,             // compression
            0xD3, 0xF5, 0xB0, 0xA4, 0x5C, 0x87, 0x1C, 0x48,
            0x9C, 0x1B, 0x2D, 0xB9, 0xC7, 0xC4, 0x0B, 0xD5,
            0x01, 0x00, 0x00, 0x00,             // packages
            0x02, 0x00, 0x00, 0x00,             // files
            0x00, 0x00, 0x00, 0x00,             // duplicates
            b'a', b'.', b'u', b'p', b'k', b'0', 0x00,
            0x00, 0x00, 0x00, 0x00,             // no levels
            0x02, 0x00, 0x00, 0x00,             // package size
            0x08, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00,
            0x01, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00,
            0x02, 0x00, 0x00, 0x00,
            0x02, 0x00, 0x00, 0x00,
        ];

        let writer = {
            let mut writer = VfxWriter::new(
                VfxWriterOptions::builder()
                    .version(2)
                    .guid(Guid::ARKTIKA1_1)
                    .registry_name("a.vfx")
                    .build(),
            );
            writer.add_file("x", b"hi", true)?;
            writer
        };

        let mut package = Vec::new();
        let registry = writer.finish_into(Cursor::new(Vec::new()), &mut package)?.into_inner();

        assert_eq!(package, b"hi");
        assert_eq!(registry[..expected.len()], expected[..]);
        // name header, masked byte, terminator, then the closing zeros
        assert_eq!(registry.len(), expected.len() + 4 + 8);
        assert_eq!(registry[expected.len()], 0x02);
        assert_eq!(registry[expected.len() + 1] ^ registry[expected.len() + 2], b'x');
        assert_eq!(registry[registry.len() - 8..], [0u8; 8]);

        Ok(())
    }

    #[traced_test]
    #[test]
    fn written_registry_reads_back() -> Result<()> {
        let mut writer = VfxWriter::new(VfxWriterOptions::default());
        writer.add_folder("empty", true)?;
        writer.add_file("a.txt", &[b'a'; 10], true)?;
        writer.add_file("dir\\b.txt", &[b'b'; 20], false)?;
        writer.add_file("dir/sub/c.bin", &(0..=255).collect::<Vec<u8>>(), true)?;
        writer.add_duplicate("a.txt", b"0123456789", false)?;

        let mut package = Vec::new();
        let registry = writer.finish_into(Cursor::new(Vec::new()), &mut package)?;
        let archive = VfxArchive::parse(&mut Cursor::new(registry.into_inner()))?;

        assert_eq!(archive.content_version(), Some("1.0"));
        assert_eq!(archive.file_count(), 3);

        let empty = archive.find("empty").map(|i| &archive.records()[i]);
        assert!(empty.is_some_and(|r| r.flags.is_new() && r.is_folder()));

        let dir = archive.find("dir").map(|i| &archive.records()[i]);
        assert!(dir.is_some_and(|r| !r.flags.is_new()));

        let b = archive.find("dir\\b.txt").and_then(|i| archive.records()[i].location().copied());
        assert!(b.is_some_and(|l| l.is_stored() && l.uncompressed == 20));

        let c = archive.find("dir\\sub\\c.bin");
        assert!(c.is_some());

        let a = archive.find("a.txt").unwrap_or_default();
        let chain: Vec<_> = archive.duplicate_chain(a).collect();
        assert_eq!(chain.len(), 1);
        assert_str_eq!(chain[0].name, "a.txt");
        assert_eq!(chain[0].base, Some(a));

        let dup = chain[0].location;
        assert_eq!(
            &package[dup.offset as usize..(dup.offset + dup.compressed) as usize],
            b"0123456789"
        );
        Ok(())
    }

    #[test]
    fn last_light_layout_round_trip() -> Result<()> {
        let mut writer = VfxWriter::new(
            VfxWriterOptions::builder()
                .version(1)
                .guid(Guid::LAST_LIGHT_XBOX360_OCT18_2012)
                .build(),
        );
        writer.add_file("levels\\l00\\level.bin", &[7u8; 600], true)?;
        writer.add_duplicate("levels\\l00\\level.bin", &[7u8; 600], false)?;

        let registry = writer.finish_into(Cursor::new(Vec::new()), &mut Vec::new())?;
        let data = registry.into_inner();
        // root flags are stored shifted
        assert_eq!(data[53..55], [0x10, 0x00]);

        let archive = VfxArchive::parse(&mut Cursor::new(data))?;
        assert!(archive.packages()[0].levels.is_empty());
        assert_eq!(archive.records()[0].flags, RecordFlags::folder());
        assert!(matches!(archive.records()[0].kind, RecordKind::Folder { count: 1, .. }));

        let level = archive.find("levels/l00/level.bin");
        assert!(level.is_some());
        assert_eq!(archive.duplicate_chain(level.unwrap_or_default()).count(), 0);
        assert_str_eq!(archive.duplicates()[0].name, "level.bin");
        assert_eq!(archive.duplicates()[0].base, None);
        Ok(())
    }

    #[test]
    fn patch_folders_are_named_by_path() -> Result<()> {
        let mut writer = VfxWriter::new(
            VfxWriterOptions::builder()
                .patch(true)
                .registry_name("patch.vfx0")
                .build(),
        );
        writer.add_file("dir\\sub\\a.txt", b"a", false)?;
        writer.add_folder("fresh", true)?;
        writer.add_file("fresh\\inner\\b.txt", b"b", false)?;
        writer.add_override("far\\away")?;
        writer.add_file("far/away/c.txt", b"c", false)?;

        let registry = writer.finish_into(Cursor::new(Vec::new()), &mut Vec::new())?;
        let archive = VfxArchive::parse(&mut Cursor::new(registry.into_inner()))?;

        let names: Vec<_> = archive.records().iter().map(|r| r.name.as_str()).collect();
        assert_eq!(
            names,
            ["", "dir", "fresh", "dir\\sub", "inner", "a.txt", "b.txt", "far\\away", "c.txt"]
        );

        let new: Vec<_> = archive.records().iter().map(|r| r.flags.is_new()).collect();
        assert_eq!(new, [false, false, true, false, true, false, false, false, false]);
        assert!(matches!(archive.records()[7].kind, RecordKind::Folder { first: 8, count: 1 }));
        assert_eq!(archive.children(0).count(), 2);
        Ok(())
    }

    #[test]
    fn duplicate_needs_existing_file() -> Result<()> {
        let mut writer = VfxWriter::new(VfxWriterOptions::default());
        writer.add_folder("dir", false)?;
        assert!(writer.add_duplicate("dir", b"x", false).is_err());
        assert!(writer.add_duplicate("missing.txt", b"x", false).is_err());
        Ok(())
    }
}
