//! Unified filesystem over any number of mounted archives
//!
//! Every archive is merged into a single tree as it is mounted: folders with the same name are
//! merged, and a file that already exists gains a duplicate instead of a second entry. The
//! first entry registered for a path stays the one lookups return, while extraction reads the
//! most recently mounted copy through the duplicate chain.

use indexmap::IndexMap;
use std::{
    fmt,
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument, warn};

use crate::{
    container::Container,
    error::{FileNotFoundError, Result},
    stream::ByteStream,
    types::{FileLocation, CHECKSUM},
};

/// Archives a game folder is made of, in mount order, when it holds `content.vfx`
pub const VFX_GAME_ARCHIVES: [&str; 8] = [
    "content.vfx",
    "patch.vfx0",
    "patch_00.vfx",
    "patch_01_shared.vfx",
    "patch_01.vfx",
    "patch_02.vfx",
    "patch_03.vfx",
    "patch_04.vfx",
];

/// Archives of a *Metro 2033* game folder
pub const VFI_GAME_ARCHIVES: [&str; 1] = ["content.vfi"];

/// Stable identifier of an entry in a [`FileSystem`]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(usize);

impl Handle {
    pub const ROOT: Handle = Handle(0);

    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct DuplicateId(usize);

/// Where the bytes of a file come from
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Source {
    /// Index of the archive, in mount order
    pub archive: usize,
    pub location: FileLocation,
}

#[derive(Debug, Clone)]
struct FileSlot {
    source: Source,
    duplicates: Option<DuplicateId>,
}

#[derive(Debug, Clone)]
struct Entry {
    name: String,
    hash: u32,
    parent: Option<Handle>,
    first_child: Option<Handle>,
    last_child: Option<Handle>,
    next_sibling: Option<Handle>,
    file: Option<FileSlot>,
}

#[derive(Debug, Clone)]
struct Duplicate {
    source: Source,
    next: Option<DuplicateId>,
}

#[derive(Debug, Clone)]
struct Tree {
    entries: Vec<Entry>,
    duplicates: Vec<Duplicate>,
}

impl Default for Tree {
    fn default() -> Self {
        Self {
            entries: vec![Entry {
                name: String::new(),
                hash: CHECKSUM.checksum(b""),
                parent: None,
                first_child: None,
                last_child: None,
                next_sibling: None,
                file: None,
            }],
            duplicates: Vec::new(),
        }
    }
}

impl Tree {
    fn entry(&self, handle: Handle) -> Option<&Entry> {
        self.entries.get(handle.0)
    }

    fn find_child(&self, parent: Handle, name: &str) -> Option<Handle> {
        let hash = CHECKSUM.checksum(name.as_bytes());
        let mut child = self.entry(parent)?.first_child;
        while let Some(handle) = child {
            let entry = &self.entries[handle.0];
            if entry.hash == hash && entry.name == name {
                return Some(handle);
            }
            child = entry.next_sibling;
        }
        None
    }

    fn add_entry(&mut self, parent: Handle, name: &str, file: Option<FileSlot>) -> Handle {
        let handle = Handle(self.entries.len());
        self.entries.push(Entry {
            name: name.to_string(),
            hash: CHECKSUM.checksum(name.as_bytes()),
            parent: Some(parent),
            first_child: None,
            last_child: None,
            next_sibling: None,
            file,
        });

        let previous = self.entries[parent.0].last_child.replace(handle);
        match previous {
            Some(previous) => self.entries[previous.0].next_sibling = Some(handle),
            None => self.entries[parent.0].first_child = Some(handle),
        }
        handle
    }

    fn full_path(&self, handle: Handle) -> String {
        let mut names = Vec::new();
        let mut current = self.entry(handle);
        while let Some(entry) = current {
            if entry.parent.is_none() {
                break;
            }
            names.push(entry.name.as_str());
            current = entry.parent.and_then(|parent| self.entry(parent));
        }
        names.reverse();
        names.join("\\")
    }

    fn merge(&mut self, container: &Container, archive: usize) {
        let mut visited = vec![false; container.len()];
        let root = container.root();
        match container.name(root).is_empty() {
            true => self.merge_children(Handle::ROOT, container, archive, root, &mut visited),
            false => self.merge_folder(Handle::ROOT, container, archive, root, &mut visited),
        }

        // patch folders that hang off no parent
        let mut parented = vec![false; container.len()];
        for folder in (0..container.len()).filter(|&f| container.is_folder(f)) {
            for child in container.children(folder) {
                if let Some(flag) = parented.get_mut(child) {
                    *flag = true;
                }
            }
        }
        let orphans = (0..container.len()).filter(|&f| f != root && !parented[f] && container.is_folder(f));
        for folder in orphans {
            self.merge_folder(Handle::ROOT, container, archive, folder, &mut visited);
        }
    }

    fn merge_folder(
        &mut self,
        parent: Handle,
        container: &Container,
        archive: usize,
        folder: usize,
        visited: &mut [bool],
    ) {
        let name = container.name(folder);
        // a name holding a separator is a path from the root
        let mut target = match name.contains('\\') {
            true => Handle::ROOT,
            false => parent,
        };
        for segment in name.split('\\').filter(|s| !s.is_empty()) {
            target = match self.find_child(target, segment) {
                Some(existing) if self.entries[existing.0].file.is_none() => existing,
                Some(existing) => {
                    warn!(path = %self.full_path(existing), "a file is in the way of a folder, skipping it");
                    return;
                }
                None => self.add_entry(target, segment, None),
            };
        }
        self.merge_children(target, container, archive, folder, visited);
    }

    fn merge_children(
        &mut self,
        target: Handle,
        container: &Container,
        archive: usize,
        folder: usize,
        visited: &mut [bool],
    ) {
        match visited.get_mut(folder) {
            Some(seen) if !*seen => *seen = true,
            _ => {
                warn!(folder, "folder is listed more than once, skipping it");
                return;
            }
        }

        for child in container.children(folder) {
            if container.is_folder(child) {
                self.merge_folder(target, container, archive, child, visited);
            } else if let Some(location) = container.location(child) {
                self.add_file(target, container.name(child), Source { archive, location });
            }
        }
    }

    fn add_file(&mut self, parent: Handle, name: &str, source: Source) {
        let Some(existing) = self.find_child(parent, name) else {
            self.add_entry(
                parent,
                name,
                Some(FileSlot {
                    source,
                    duplicates: None,
                }),
            );
            return;
        };

        match &mut self.entries[existing.0].file {
            Some(slot) => {
                let id = DuplicateId(self.duplicates.len());
                self.duplicates.push(Duplicate {
                    source,
                    next: slot.duplicates.replace(id),
                });
            }
            None => warn!(name, "a folder is in the way of a file, skipping it"),
        }
    }
}

/// Iterator over the children of a folder, see [`FileSystem::children`]
#[derive(Debug, Clone)]
pub struct Children<'a> {
    tree: &'a Tree,
    next: Option<Handle>,
}

impl Iterator for Children<'_> {
    type Item = Handle;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = self.tree.entry(current).and_then(|e| e.next_sibling);
        Some(current)
    }
}

/// Iterator over the duplicate chain of a file, newest first, see [`FileSystem::duplicates`]
#[derive(Debug, Clone)]
pub struct Duplicates<'a> {
    tree: &'a Tree,
    next: Option<DuplicateId>,
}

impl Iterator for Duplicates<'_> {
    type Item = Source;

    fn next(&mut self) -> Option<Self::Item> {
        let duplicate = self.tree.duplicates.get(self.next?.0)?;
        self.next = duplicate.next;
        Some(duplicate.source)
    }
}

/// Merged view over a set of archives
///
/// ```
/// # fn doit() -> metro_vfs::error::Result<()>
/// # {
/// use metro_vfs::{FileSystem, VfxWriter, VfxWriterOptions};
///
/// let dir = std::env::temp_dir().join("metro_vfs_doc_fs");
/// std::fs::create_dir_all(&dir)?;
/// let mut vfx = VfxWriter::new(VfxWriterOptions::default());
/// vfx.add_file("config\\game.cfg", b"fov 90", true)?;
/// vfx.finish(&dir)?;
///
/// let mut fs = FileSystem::new();
/// fs.mount_game_folder(&dir)?;
/// let stream = fs.open_file_from_path("config/game.cfg");
/// assert_eq!(stream.as_slice(), b"fov 90");
/// # Ok(())
/// # }
/// # doit().unwrap();
/// ```
#[derive(Debug, Clone, Default)]
pub struct FileSystem {
    archives: IndexMap<PathBuf, Container>,
    tree: Tree,
}

impl FileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mount every archive in order, returning how many were merged
    ///
    /// An archive that fails to open is logged and skipped; the ones merged before it stay.
    pub fn mount<P: AsRef<Path>>(&mut self, paths: impl IntoIterator<Item = P>) -> usize {
        let mut merged = 0;
        for path in paths {
            let path = path.as_ref();
            match self.mount_archive(path) {
                Ok(_) => merged += 1,
                Err(err) => warn!(path = %path.display(), %err, "skipping archive"),
            }
        }
        merged
    }

    /// Open one archive and merge it, returning its index
    ///
    /// Mounting the same file twice leaves the tree untouched and returns the first index.
    #[instrument(skip_all, fields(path = %path.as_ref().display()), err)]
    pub fn mount_archive(&mut self, path: impl AsRef<Path>) -> Result<usize> {
        let absolute = path.as_ref().canonicalize()?;
        if let Some(index) = self.archives.get_index_of(&absolute) {
            warn!("archive is already mounted, ignoring it");
            return Ok(index);
        }

        let container = Container::open(&absolute)?;
        let index = self.archives.len();
        let before = self.tree.entries.len();
        self.tree.merge(&container, index);
        info!(
            index,
            files = container.file_count(),
            new_entries = self.tree.entries.len() - before,
            "mounted archive"
        );

        self.archives.insert(absolute, container);
        Ok(index)
    }

    /// Mount the archives of a game installation
    ///
    /// Uses [`VFX_GAME_ARCHIVES`] when the folder holds `content.vfx`, [`VFI_GAME_ARCHIVES`]
    /// otherwise. Archives missing from the folder are skipped.
    #[instrument(skip_all, fields(dir = %dir.as_ref().display()), err)]
    pub fn mount_game_folder(&mut self, dir: impl AsRef<Path>) -> Result<usize> {
        let dir = dir.as_ref();
        let names: &[&str] = if dir.join(VFX_GAME_ARCHIVES[0]).is_file() {
            &VFX_GAME_ARCHIVES
        } else if dir.join(VFI_GAME_ARCHIVES[0]).is_file() {
            &VFI_GAME_ARCHIVES
        } else {
            return Err(FileNotFoundError::Name(dir.join(VFX_GAME_ARCHIVES[0]).display().to_string()).into());
        };

        let paths = names.iter().map(|name| dir.join(name)).filter(|path| {
            let present = path.is_file();
            if !present {
                debug!(path = %path.display(), "not present");
            }
            present
        });
        Ok(self.mount(paths))
    }

    pub fn archives(&self) -> impl Iterator<Item = &Container> {
        self.archives.values()
    }

    pub fn archive(&self, index: usize) -> Option<&Container> {
        self.archives.get_index(index).map(|(_, container)| container)
    }

    pub fn archive_count(&self) -> usize {
        self.archives.len()
    }

    pub fn root(&self) -> Handle {
        Handle::ROOT
    }

    /// Number of entries, the root included
    pub fn len(&self) -> usize {
        self.tree.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.entries.len() <= 1
    }

    /// Name of an entry, empty for the root and unknown handles
    pub fn name(&self, handle: Handle) -> &str {
        self.tree
            .entry(handle)
            .map(|e| e.name.as_str())
            .unwrap_or_default()
    }

    pub fn parent(&self, handle: Handle) -> Option<Handle> {
        self.tree.entry(handle).and_then(|e| e.parent)
    }

    pub fn is_folder(&self, handle: Handle) -> bool {
        self.tree.entry(handle).is_some_and(|e| e.file.is_none())
    }

    pub fn is_file(&self, handle: Handle) -> bool {
        self.tree.entry(handle).is_some_and(|e| e.file.is_some())
    }

    pub fn children(&self, handle: Handle) -> Children<'_> {
        Children {
            tree: &self.tree,
            next: self.tree.entry(handle).and_then(|e| e.first_child),
        }
    }

    pub fn find_child(&self, parent: Handle, name: &str) -> Option<Handle> {
        self.tree.find_child(parent, name)
    }

    /// Walk `path` from `start`; `\` and `/` both separate segments
    pub fn find_from(&self, start: Handle, path: &str) -> Option<Handle> {
        self.tree.entry(start)?;
        path.split(['\\', '/'])
            .filter(|segment| !segment.is_empty())
            .try_fold(start, |folder, segment| self.tree.find_child(folder, segment))
    }

    pub fn find(&self, path: &str) -> Option<Handle> {
        self.find_from(Handle::ROOT, path)
    }

    pub fn find_file(&self, path: &str) -> Option<Handle> {
        self.find(path).filter(|&handle| self.is_file(handle))
    }

    pub fn find_folder(&self, path: &str) -> Option<Handle> {
        self.find(path).filter(|&handle| self.is_folder(handle))
    }

    /// Files below `folder` whose name ends with `extension`
    pub fn find_files_in_folder(&self, folder: Handle, extension: &str, recursive: bool) -> Vec<Handle> {
        let mut found = Vec::new();
        for child in self.children(folder) {
            if self.is_folder(child) {
                if recursive {
                    found.extend(self.find_files_in_folder(child, extension, recursive));
                }
            } else if self.name(child).ends_with(extension) {
                found.push(child);
            }
        }
        found
    }

    /// Names from the root down to `handle`, joined with `\`
    pub fn full_path(&self, handle: Handle) -> String {
        self.tree.full_path(handle)
    }

    /// Where the bytes of a file are read from: the head of its duplicate chain when it has
    /// one, its own location otherwise
    pub fn source(&self, handle: Handle) -> Option<Source> {
        let slot = self.tree.entry(handle)?.file.as_ref()?;
        match slot.duplicates {
            Some(head) => self.tree.duplicates.get(head.0).map(|d| d.source),
            None => Some(slot.source),
        }
    }

    /// Location of the first copy registered for a file
    pub fn primary_source(&self, handle: Handle) -> Option<Source> {
        self.tree.entry(handle)?.file.as_ref().map(|slot| slot.source)
    }

    pub fn duplicates(&self, handle: Handle) -> Duplicates<'_> {
        Duplicates {
            tree: &self.tree,
            next: self
                .tree
                .entry(handle)
                .and_then(|e| e.file.as_ref())
                .and_then(|slot| slot.duplicates),
        }
    }

    pub fn compressed_size(&self, handle: Handle) -> Option<u32> {
        self.source(handle).map(|s| s.location.compressed)
    }

    pub fn uncompressed_size(&self, handle: Handle) -> Option<u32> {
        self.source(handle).map(|s| s.location.uncompressed)
    }

    /// Number of entries below `handle`
    ///
    /// Non-recursive counts every direct child, folders included. Recursive descends into
    /// child folders and counts only the files found there.
    pub fn count_files(&self, handle: Handle, recursive: bool) -> usize {
        self.children(handle)
            .map(|child| match self.is_folder(child) {
                true if recursive => self.count_files(child, recursive),
                _ => 1,
            })
            .sum()
    }

    /// Decode a file and return a window of it
    ///
    /// `sub_offset` and `sub_length` are clamped to the file; `None` reads to the end.
    pub fn try_open_file_stream(
        &self,
        handle: Handle,
        sub_offset: usize,
        sub_length: Option<usize>,
    ) -> Result<ByteStream> {
        let source = self
            .source(handle)
            .ok_or(FileNotFoundError::Index(handle.0))?;
        let container = self
            .archive(source.archive)
            .ok_or(FileNotFoundError::Archive(source.archive))?;

        let stream = ByteStream::new(container.extract(&source.location)?)
            .with_name(self.full_path(handle));
        Ok(stream.window(sub_offset, sub_length.unwrap_or(usize::MAX)))
    }

    /// Like [`FileSystem::try_open_file_stream`], with failures logged and turned into an empty
    /// stream
    pub fn open_file_stream(&self, handle: Handle, sub_offset: usize, sub_length: Option<usize>) -> ByteStream {
        self.try_open_file_stream(handle, sub_offset, sub_length)
            .unwrap_or_else(|err| {
                warn!(handle = %handle, path = %self.full_path(handle), %err, "extraction failed");
                ByteStream::empty()
            })
    }

    /// Decode the whole file at `path`, or return an empty stream
    pub fn open_file_from_path(&self, path: &str) -> ByteStream {
        match self.find_file(path) {
            Some(handle) => self.open_file_stream(handle, 0, None),
            None => {
                debug!(path, "no such file");
                ByteStream::empty()
            }
        }
    }
}
