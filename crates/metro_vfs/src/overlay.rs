//! Layered view over a base registry and the patches stacked on top of it
//!
//! Unlike [`FileSystem`](crate::FileSystem), layers are not merged: every registry keeps its
//! own record table and a patch folder that replaces an older one is reached through a link
//! stored on the older folder. Lookups follow the links first and fall back on the folder's
//! own children, one level at a time.

use indexmap::IndexMap;
use std::{
    collections::HashSet,
    fmt,
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument, trace, warn};

use crate::{
    error::{Error, FileNotFoundError, FormatError, Result},
    stream::ByteStream,
    types::{read_payload, FileLocation, Package, Title},
    vfx::{RecordFlags, RecordKind, VfxArchive},
};

/// Layers a [`LayeredFileSystem`] can stack, the base included
pub const MAX_LAYERS: usize = 16;

/// Name of the base registry in a game folder
pub const BASE_REGISTRY: &str = "content.vfx";

/// Patches of *Metro Exodus*, in load order
pub const EXODUS_PATCHES: [&str; 7] = [
    "patch.vfx0",
    "patch_00.vfx",
    "patch_01_shared.vfx",
    "patch_01.vfx",
    "patch_02.vfx",
    "patch_03.vfx",
    "patch_04.vfx",
];

/// Patches other titles are looked for under: `patch.vfx0` to `patch.vfx14`
const NUMBERED_PATCHES: usize = MAX_LAYERS - 1;

/// A record of one layer
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordRef {
    pub layer: usize,
    pub record: usize,
}

impl RecordRef {
    pub const ROOT: RecordRef = RecordRef {
        layer: 0,
        record: 0,
    };
}

impl fmt::Display for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.layer, self.record)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayRecord {
    pub name: String,
    pub flags: RecordFlags,
    /// Package indices of file locations refer to [`LayeredFileSystem::packages`]
    pub kind: RecordKind,
    /// Newer version of this folder in a later layer
    pub link: Option<RecordRef>,
    /// Folder of an earlier layer this patch folder replaces
    pub overrides: Option<RecordRef>,
}

impl OverlayRecord {
    pub fn is_folder(&self) -> bool {
        matches!(self.kind, RecordKind::Folder { .. })
    }

    pub fn location(&self) -> Option<&FileLocation> {
        match &self.kind {
            RecordKind::File { location, .. } => Some(location),
            RecordKind::Folder { .. } => None,
        }
    }

    /// Link to follow during lookups; folders still flagged new never redirect
    fn redirect(&self) -> Option<RecordRef> {
        self.link.filter(|_| !self.flags.is_new())
    }
}

/// One registry of the stack
#[derive(Debug, Clone)]
pub struct Layer {
    archive: VfxArchive,
    records: Vec<OverlayRecord>,
    duplicates: Vec<(FileLocation, Option<usize>)>,
    package_offset: usize,
}

impl Layer {
    pub fn archive(&self) -> &VfxArchive {
        &self.archive
    }

    pub fn path(&self) -> &Path {
        self.archive.path()
    }

    pub fn records(&self) -> &[OverlayRecord] {
        &self.records
    }

    /// Index of this layer's first package in [`LayeredFileSystem::packages`]
    pub fn package_offset(&self) -> usize {
        self.package_offset
    }

    fn children(&self, index: usize) -> impl Iterator<Item = (usize, &OverlayRecord)> {
        let range = match self.records.get(index).map(|r| &r.kind) {
            Some(RecordKind::Folder { first, count }) => *first..first + count,
            _ => 0..0,
        };
        range.filter_map(|i| self.records.get(i).map(|r| (i, r)))
    }
}

/// A package blob along with the layer whose registry lists it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayPackage {
    pub layer: usize,
    pub package: Package,
}

/// Every record of a folder's effective view that carries one name, newest first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayEntry {
    pub name: String,
    pub records: Vec<RecordRef>,
}

impl OverlayEntry {
    /// The record a lookup of this name resolves to
    pub fn head(&self) -> RecordRef {
        self.records.first().copied().unwrap_or(RecordRef::ROOT)
    }
}

/// A base registry and its patches
///
/// ```
/// # fn doit() -> metro_vfs::error::Result<()>
/// # {
/// use metro_vfs::{LayeredFileSystem, VfxWriter, VfxWriterOptions};
///
/// let dir = std::env::temp_dir().join("metro_vfs_doc_overlay");
/// std::fs::create_dir_all(&dir)?;
///
/// let mut base = VfxWriter::new(VfxWriterOptions::default());
/// base.add_file("scripts\\a.lua", b"base", false)?;
/// base.finish(&dir)?;
///
/// let options = VfxWriterOptions::builder().registry_name("patch.vfx0").patch(true).build();
/// let mut patch = VfxWriter::new(options);
/// patch.add_file("scripts\\a.lua", b"patched", false)?;
/// patch.finish(&dir)?;
///
/// let fs = LayeredFileSystem::open_game_folder(&dir)?;
/// assert_eq!(fs.open_path("scripts\\a.lua").as_slice(), b"patched");
/// # Ok(())
/// # }
/// # doit().unwrap();
/// ```
#[derive(Debug, Clone, Default)]
pub struct LayeredFileSystem {
    layers: Vec<Layer>,
    packages: Vec<OverlayPackage>,
}

impl LayeredFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `content.vfx` from `dir` and every patch of its title found next to it
    ///
    /// Patches that are missing are skipped, patches that fail to load are logged and skipped.
    #[instrument(skip_all, fields(dir = %dir.as_ref().display()), err)]
    pub fn open_game_folder(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut fs = Self::new();
        fs.load_base(dir.join(BASE_REGISTRY))?;

        for path in fs.patch_paths(dir) {
            if !path.is_file() {
                debug!(path = %path.display(), "not present");
                continue;
            }
            if let Err(err) = fs.load_patch(&path) {
                warn!(path = %path.display(), %err, "skipping patch");
            }
        }
        Ok(fs)
    }

    /// Where the patches of the loaded base registry live inside `dir`, in load order
    pub fn patch_paths(&self, dir: &Path) -> Vec<PathBuf> {
        match self.layers.first().map(|l| l.archive.version()) {
            Some(3) => EXODUS_PATCHES.iter().map(|name| dir.join(name)).collect(),
            _ => (0..NUMBERED_PATCHES)
                .map(|index| dir.join(format!("patch.vfx{index}")))
                .collect(),
        }
    }

    /// Load the registry every patch builds on
    #[instrument(skip_all, fields(path = %path.as_ref().display()), err)]
    pub fn load_base(&mut self, path: impl AsRef<Path>) -> Result<()> {
        if !self.layers.is_empty() {
            return Err(Error::CustomError("a base registry is already loaded".into()));
        }
        self.push_layer(VfxArchive::open(path)?);
        Ok(())
    }

    /// Stack a patch registry on the loaded layers, returning its layer index
    #[instrument(skip_all, fields(path = %path.as_ref().display()), err)]
    pub fn load_patch(&mut self, path: impl AsRef<Path>) -> Result<usize> {
        if self.layers.is_empty() {
            return Err(FormatError::MissingBase.into());
        }
        if self.layers.len() >= MAX_LAYERS {
            return Err(FormatError::TooManyLayers(MAX_LAYERS).into());
        }

        let layer = self.push_layer(VfxArchive::open(path)?);
        self.link_overrides(layer);
        Ok(layer)
    }

    fn push_layer(&mut self, archive: VfxArchive) -> usize {
        let layer = self.layers.len();
        let package_offset = self.packages.len();
        let offset = |location: &FileLocation| FileLocation {
            package: location.package + package_offset,
            ..*location
        };

        let records = archive
            .records()
            .iter()
            .map(|record| OverlayRecord {
                name: record.name.clone(),
                flags: record.flags,
                kind: match &record.kind {
                    RecordKind::File {
                        location,
                        duplicates,
                    } => RecordKind::File {
                        location: offset(location),
                        duplicates: *duplicates,
                    },
                    folder => folder.clone(),
                },
                link: None,
                overrides: None,
            })
            .collect();
        let duplicates = archive
            .duplicates()
            .iter()
            .map(|d| (offset(&d.location), d.next))
            .collect();

        self.packages
            .extend(archive.packages().iter().map(|package| OverlayPackage {
                layer,
                package: package.clone(),
            }));

        info!(
            layer,
            version = archive.version(),
            title = %archive.title(),
            records = archive.records().len(),
            packages = archive.packages().len(),
            "loaded layer"
        );
        self.layers.push(Layer {
            archive,
            records,
            duplicates,
            package_offset,
        });
        layer
    }

    /// Attach every folder of `layer` that is not flagged new to the folder it replaces
    ///
    /// Targets are resolved by the full path the patch stores as the folder name, against the
    /// earlier layers only. The patch folder takes the name of its target.
    fn link_overrides(&mut self, layer: usize) {
        for index in 0..self.layers[layer].records.len() {
            let record = &self.layers[layer].records[index];
            if !record.is_folder() || record.flags.is_new() {
                continue;
            }
            let path = record.name.clone();

            let Some(target) = self.find_below(&path, layer) else {
                warn!(layer, %path, "patch folder replaces nothing, skipping it");
                continue;
            };
            let tail = self.find_tail_below(target, layer);
            let Some(original) = self.record_mut(tail).filter(|r| r.is_folder() && r.link.is_none())
            else {
                warn!(layer, %path, target = %tail, "patch folder has no folder to replace, skipping it");
                continue;
            };

            let patch = RecordRef {
                layer,
                record: index,
            };
            original.link = Some(patch);
            original.flags = original.flags.with_new(false);
            let name = original.name.clone();
            trace!(%path, from = %tail, to = %patch, "linked");

            let record = &mut self.layers[layer].records[index];
            record.name = name;
            record.overrides = Some(tail);
        }
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn layer(&self, index: usize) -> Option<&Layer> {
        self.layers.get(index)
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// Title of the base registry
    pub fn title(&self) -> Title {
        self.layers
            .first()
            .map(|l| l.archive.title())
            .unwrap_or(Title::Unknown)
    }

    /// Packages of every layer, in load order
    pub fn packages(&self) -> &[OverlayPackage] {
        &self.packages
    }

    /// Package the payload of a file record lives in
    pub fn package(&self, file: RecordRef) -> Option<&OverlayPackage> {
        let location = self.record(file)?.location()?;
        self.packages.get(location.package)
    }

    /// Root folder of the base registry, `None` until it is loaded
    pub fn root(&self) -> Option<RecordRef> {
        self.record(RecordRef::ROOT).map(|_| RecordRef::ROOT)
    }

    pub fn record(&self, record: RecordRef) -> Option<&OverlayRecord> {
        self.layers.get(record.layer)?.records.get(record.record)
    }

    fn record_mut(&mut self, record: RecordRef) -> Option<&mut OverlayRecord> {
        self.layers.get_mut(record.layer)?.records.get_mut(record.record)
    }

    /// Resolve a `\` or `/` separated path from the root
    pub fn find(&self, path: &str) -> Option<RecordRef> {
        self.find_below(path, self.layers.len())
    }

    fn find_below(&self, path: &str, limit: usize) -> Option<RecordRef> {
        let segments: Vec<&str> = path
            .split(['\\', '/'])
            .filter(|segment| !segment.is_empty())
            .collect();
        let root = self.root()?;
        match segments.is_empty() {
            true => Some(root),
            false => self.find_in(root, &segments, limit),
        }
    }

    fn find_in(&self, folder: RecordRef, segments: &[&str], limit: usize) -> Option<RecordRef> {
        let record = self.record(folder).filter(|r| r.is_folder())?;

        let redirect = record.redirect().filter(|link| link.layer < limit);
        if let Some(found) = redirect.and_then(|link| self.find_in(link, segments, limit)) {
            return Some(found);
        }

        let (name, rest) = segments.split_first()?;
        let (child, _) = self.layers[folder.layer]
            .children(folder.record)
            .find(|(_, r)| r.name == *name)?;
        let child = RecordRef {
            layer: folder.layer,
            record: child,
        };
        match rest.is_empty() {
            true => Some(child),
            false => self.find_in(child, rest, limit),
        }
    }

    /// Most recent version of a folder
    pub fn find_tail(&self, folder: RecordRef) -> RecordRef {
        self.find_tail_below(folder, self.layers.len())
    }

    fn find_tail_below(&self, folder: RecordRef, limit: usize) -> RecordRef {
        self.chain(folder, limit).last().copied().unwrap_or(folder)
    }

    /// `folder` followed by its newer versions
    ///
    /// Links always point at a later layer, which bounds the chain.
    fn chain(&self, folder: RecordRef, limit: usize) -> Vec<RecordRef> {
        let mut chain = vec![folder];
        let mut current = folder;
        while let Some(next) = self
            .record(current)
            .and_then(OverlayRecord::redirect)
            .filter(|next| next.layer > current.layer && next.layer < limit)
        {
            chain.push(next);
            current = next;
        }
        chain
    }

    /// Effective children of a folder: its own and those of all its newer versions, grouped by
    /// name in the order lookups see them
    pub fn children(&self, folder: RecordRef) -> Vec<OverlayEntry> {
        self.list(&[folder])
    }

    /// Effective children of a folder entry returned by [`LayeredFileSystem::children`]
    pub fn entry_children(&self, entry: &OverlayEntry) -> Vec<OverlayEntry> {
        self.list(&entry.records)
    }

    fn list(&self, folders: &[RecordRef]) -> Vec<OverlayEntry> {
        let mut expanded: Vec<RecordRef> = Vec::new();
        for &folder in folders {
            for version in self.chain(folder, self.layers.len()).into_iter().rev() {
                if !expanded.contains(&version) {
                    expanded.push(version);
                }
            }
        }

        let mut groups: IndexMap<&str, Vec<RecordRef>> = IndexMap::new();
        for folder in expanded {
            let Some(layer) = self.layers.get(folder.layer) else {
                continue;
            };
            for (index, child) in layer.children(folder.record) {
                groups.entry(child.name.as_str()).or_default().push(RecordRef {
                    layer: folder.layer,
                    record: index,
                });
            }
        }

        groups
            .into_iter()
            .map(|(name, records)| OverlayEntry {
                name: name.to_string(),
                records,
            })
            .collect()
    }

    pub fn is_folder(&self, record: RecordRef) -> bool {
        self.record(record).is_some_and(OverlayRecord::is_folder)
    }

    /// Number of files in the effective view of `folder`
    pub fn count_files(&self, folder: RecordRef, recursive: bool) -> usize {
        let mut seen = HashSet::new();
        let mut pending = vec![vec![folder]];
        let mut count = 0;

        while let Some(folders) = pending.pop() {
            for entry in self.list(&folders) {
                let head = entry.head();
                if !self.is_folder(head) {
                    count += 1;
                } else if recursive && seen.insert(head) {
                    pending.push(
                        entry
                            .records
                            .into_iter()
                            .filter(|&r| self.is_folder(r))
                            .collect(),
                    );
                }
            }
        }
        count
    }

    /// Locations of the duplicates a file record's own layer stores for it, newest first
    pub fn duplicates(&self, file: RecordRef) -> Vec<FileLocation> {
        let (Some(layer), Some(record)) = (self.layers.get(file.layer), self.record(file)) else {
            return Vec::new();
        };
        let head = match record.kind {
            RecordKind::File { duplicates, .. } => duplicates,
            RecordKind::Folder { .. } => None,
        };
        std::iter::successors(head.and_then(|i| layer.duplicates.get(i)), |(_, next)| {
            next.and_then(|i| layer.duplicates.get(i))
        })
        .map(|(location, _)| *location)
        .collect()
    }

    /// Read and decode the payload at `location`, a location of any layer
    pub fn extract(&self, location: &FileLocation) -> Result<Vec<u8>> {
        let package = self
            .packages
            .get(location.package)
            .ok_or(FileNotFoundError::Index(location.package))?;
        let layer = self
            .layers
            .get(package.layer)
            .ok_or(FileNotFoundError::Archive(package.layer))?;
        read_payload(layer.archive.dir(), &package.package, location, layer.archive.codec())
    }

    pub fn try_open(&self, file: RecordRef) -> Result<ByteStream> {
        let record = self.record(file).ok_or(FileNotFoundError::Index(file.record))?;
        let location = record
            .location()
            .ok_or_else(|| FileNotFoundError::Name(record.name.clone()))?;
        Ok(ByteStream::new(self.extract(location)?).with_name(record.name.as_str()))
    }

    /// Decode a file record, or return an empty stream when that fails
    pub fn open(&self, file: RecordRef) -> ByteStream {
        self.try_open(file).unwrap_or_else(|err| {
            warn!(record = %file, %err, "extraction failed");
            ByteStream::empty()
        })
    }

    pub fn open_path(&self, path: &str) -> ByteStream {
        match self.find(path) {
            Some(found) => self.open(found),
            None => {
                debug!(path, "no such file");
                ByteStream::empty()
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::path::Path;

    use pretty_assertions::{assert_eq, assert_str_eq};
    use tempfile::tempdir;
    use tracing_test::traced_test;

    use super::{LayeredFileSystem, RecordRef};
    use crate::{
        error::{Error, FormatError, Result},
        types::Guid,
        vfx::{VfxWriter, VfxWriterOptions},
    };

    fn patch(name: &str) -> VfxWriter {
        VfxWriter::new(
            VfxWriterOptions::builder()
                .registry_name(name)
                .patch(true)
                .build(),
        )
    }

    fn base(dir: &Path) -> Result<()> {
        let mut base = VfxWriter::new(VfxWriterOptions::default());
        base.add_file("a.txt", &[b'a'; 10], false)?;
        base.add_file("dir\\b.txt", &[b'b'; 20], false)?;
        base.add_file("F\\G\\old.bin", b"old", false)?;
        base.finish(dir)?;
        Ok(())
    }

    #[traced_test]
    #[test]
    fn patched_folder_keeps_inherited_files() -> Result<()> {
        let dir = tempdir()?;
        base(dir.path())?;
        let mut writer = patch("patch.vfx0");
        writer.add_file("dir\\c.txt", &[b'c'; 5], false)?;
        writer.finish(dir.path())?;

        let fs = LayeredFileSystem::open_game_folder(dir.path())?;
        assert_eq!(fs.layer_count(), 2);
        assert_eq!(fs.packages().len(), 2);

        let b = fs.find("dir\\b.txt");
        assert_eq!(b.map(|r| r.layer), Some(0));
        assert_eq!(fs.open_path("dir\\b.txt").len(), 20);

        let c = fs.find("dir\\c.txt").unwrap_or(RecordRef::ROOT);
        assert_eq!(c.layer, 1);
        assert_str_eq!(fs.package(c).map(|p| p.package.name.as_str()).unwrap_or_default(), "patch.upk0");
        assert_eq!(fs.open(c).as_slice(), [b'c'; 5]);

        assert_eq!(fs.count_files(RecordRef::ROOT, true), 4);
        assert_eq!(fs.count_files(RecordRef::ROOT, false), 1);

        let names: Vec<_> = fs.children(RecordRef::ROOT).into_iter().map(|e| e.name).collect();
        assert_eq!(names, ["dir", "a.txt", "F"]);
        Ok(())
    }

    #[test]
    fn deep_override_without_parents() -> Result<()> {
        let dir = tempdir()?;
        base(dir.path())?;
        let mut writer = patch("patch.vfx0");
        writer.add_override("F\\G")?;
        writer.add_file("F\\G\\newfile", b"new", false)?;
        writer.finish(dir.path())?;

        let fs = LayeredFileSystem::open_game_folder(dir.path())?;
        let found = fs.find("F\\G\\newfile");
        assert_eq!(found.map(|r| r.layer), Some(1));
        assert_eq!(fs.open_path("F/G/newfile").as_slice(), b"new");
        assert_eq!(fs.open_path("F\\G\\old.bin").as_slice(), b"old");

        let g = fs.find("F\\G").unwrap_or(RecordRef::ROOT);
        assert_eq!(g.layer, 0);
        let tail = fs.find_tail(g);
        assert_eq!(tail.layer, 1);
        assert_str_eq!(fs.record(tail).map(|r| r.name.as_str()).unwrap_or_default(), "G");
        assert_eq!(fs.record(tail).and_then(|r| r.overrides), Some(g));
        Ok(())
    }

    #[test]
    fn later_patches_win() -> Result<()> {
        let dir = tempdir()?;
        base(dir.path())?;

        let mut first = patch("patch.vfx0");
        first.add_file("dir\\b.txt", b"first", false)?;
        first.add_folder("fresh", true)?;
        first.add_file("fresh\\x.txt", b"x", false)?;
        first.finish(dir.path())?;

        let mut second = patch("patch_00.vfx");
        second.add_file("dir\\b.txt", b"second", false)?;
        second.add_file("fresh\\y.txt", b"y", false)?;
        second.finish(dir.path())?;

        let fs = LayeredFileSystem::open_game_folder(dir.path())?;
        assert_eq!(fs.layer_count(), 3);
        assert_eq!(fs.open_path("dir\\b.txt").as_slice(), b"second");
        assert_eq!(fs.open_path("fresh\\x.txt").as_slice(), b"x");
        assert_eq!(fs.open_path("fresh\\y.txt").as_slice(), b"y");

        let fresh = fs.find("fresh").unwrap_or(RecordRef::ROOT);
        let introduced = RecordRef {
            layer: 1,
            record: fresh.record,
        };
        assert_eq!(fresh.layer, 2);
        assert!(fs.record(introduced).is_some_and(|r| r.name == "fresh"));

        let chain: Vec<_> = [RecordRef::ROOT]
            .into_iter()
            .map(|root| fs.find_tail(root).layer)
            .collect();
        assert_eq!(chain, [2]);
        assert_eq!(fs.count_files(RecordRef::ROOT, true), 5);
        Ok(())
    }

    #[traced_test]
    #[test]
    fn unresolved_folder_is_skipped() -> Result<()> {
        let dir = tempdir()?;
        base(dir.path())?;
        let mut writer = patch("patch.vfx0");
        writer.add_file("nowhere\\z.txt", b"z", false)?;
        writer.finish(dir.path())?;

        let fs = LayeredFileSystem::open_game_folder(dir.path())?;
        assert!(logs_contain("patch folder replaces nothing"));
        assert_eq!(fs.open_path("nowhere\\z.txt").as_slice(), b"z");
        assert_eq!(fs.open_path("a.txt").len(), 10);
        Ok(())
    }

    #[test]
    fn numbered_patches_for_older_titles() -> Result<()> {
        let dir = tempdir()?;
        let options = |registry: &str, package: &str| {
            VfxWriterOptions::builder()
                .version(2)
                .guid(Guid::ARKTIKA1_1)
                .registry_name(registry)
                .package_name(package)
                .patch(registry != "content.vfx")
                .build()
        };

        let mut base = VfxWriter::new(options("content.vfx", "content.upk0"));
        base.add_file("s\\a.bin", b"base", false)?;
        base.finish(dir.path())?;

        let mut patch = VfxWriter::new(options("patch.vfx3", "patch3.upk0"));
        patch.add_file("s\\a.bin", b"three", false)?;
        patch.finish(dir.path())?;

        let fs = LayeredFileSystem::open_game_folder(dir.path())?;
        assert_eq!(fs.layer_count(), 2);
        assert_eq!(fs.patch_paths(dir.path()).len(), 15);
        assert_eq!(fs.open_path("s\\a.bin").as_slice(), b"three");
        Ok(())
    }

    #[test]
    fn patch_needs_base() -> Result<()> {
        let dir = tempdir()?;
        let mut writer = patch("patch.vfx0");
        writer.add_file("a", b"a", false)?;
        let path = writer.finish(dir.path())?;

        let mut fs = LayeredFileSystem::new();
        assert!(matches!(
            fs.load_patch(&path),
            Err(Error::Format(FormatError::MissingBase))
        ));
        assert_eq!(fs.find("a"), None);
        assert!(!fs.open_path("a").is_good());
        Ok(())
    }
}
