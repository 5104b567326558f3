//! Uniform access to the three archive containers

use std::path::Path;
use tracing::instrument;

use crate::{
    compression::Codec,
    error::Result,
    types::{FileLocation, Guid, Package, Title},
    vfi::{FlatTree, UpkArchive, VfiArchive},
    vfx::{RecordKind, VfxArchive},
};

/// Which format an archive path points at
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ContainerKind {
    Vfx,
    Vfi,
    Upk,
}

impl ContainerKind {
    /// Guess the format from the extension: `.vfx*`, `.upk*`, anything else is a VFI
    pub fn from_path(path: &Path) -> Self {
        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        if extension.starts_with("vfx") {
            ContainerKind::Vfx
        } else if extension.starts_with("upk") {
            ContainerKind::Upk
        } else {
            ContainerKind::Vfi
        }
    }
}

/// An opened archive of any format
///
/// Records are addressed by their index in the archive table; [`Container::root`] is the
/// folder everything hangs off.
#[derive(Debug, Clone)]
pub enum Container {
    Vfx(VfxArchive),
    Vfi(VfiArchive),
    Upk(UpkArchive),
}

impl Container {
    #[instrument(skip_all, fields(path = %path.as_ref().display()), err)]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        Ok(match ContainerKind::from_path(path) {
            ContainerKind::Vfx => Container::Vfx(VfxArchive::open(path)?),
            ContainerKind::Vfi => Container::Vfi(VfiArchive::open(path)?),
            ContainerKind::Upk => Container::Upk(UpkArchive::open(path)?),
        })
    }

    pub fn kind(&self) -> ContainerKind {
        match self {
            Container::Vfx(_) => ContainerKind::Vfx,
            Container::Vfi(_) => ContainerKind::Vfi,
            Container::Upk(_) => ContainerKind::Upk,
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Container::Vfx(vfx) => vfx.path(),
            Container::Vfi(vfi) => vfi.path(),
            Container::Upk(upk) => upk.path(),
        }
    }

    pub fn version(&self) -> u32 {
        match self {
            Container::Vfx(vfx) => vfx.version(),
            Container::Vfi(vfi) => vfi.version(),
            Container::Upk(_) => 0,
        }
    }

    pub fn guid(&self) -> Option<&Guid> {
        match self {
            Container::Vfx(vfx) => Some(vfx.guid()),
            Container::Vfi(vfi) => Some(vfi.guid()),
            Container::Upk(_) => None,
        }
    }

    pub fn title(&self) -> Title {
        match self {
            Container::Vfx(vfx) => vfx.title(),
            Container::Vfi(_) | Container::Upk(_) => Title::Metro2033,
        }
    }

    pub fn codec(&self) -> Codec {
        match self {
            Container::Vfx(vfx) => vfx.codec(),
            Container::Vfi(_) | Container::Upk(_) => Codec::Legacy,
        }
    }

    pub fn packages(&self) -> &[Package] {
        match self {
            Container::Vfx(vfx) => vfx.packages(),
            Container::Vfi(vfi) => vfi.packages(),
            Container::Upk(upk) => std::slice::from_ref(upk.package()),
        }
    }

    fn tree(&self) -> Option<&FlatTree> {
        match self {
            Container::Vfx(_) => None,
            Container::Vfi(vfi) => Some(vfi.tree()),
            Container::Upk(upk) => Some(upk.tree()),
        }
    }

    pub fn root(&self) -> usize {
        self.tree().map(FlatTree::root).unwrap_or(0)
    }

    /// Number of records, files and folders
    pub fn len(&self) -> usize {
        match self {
            Container::Vfx(vfx) => vfx.records().len(),
            Container::Vfi(vfi) => vfi.tree().entries().len(),
            Container::Upk(upk) => upk.tree().entries().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn file_count(&self) -> usize {
        match self {
            Container::Vfx(vfx) => vfx.file_count(),
            Container::Vfi(vfi) => vfi.tree().file_count(),
            Container::Upk(upk) => upk.tree().file_count(),
        }
    }

    pub fn name(&self, index: usize) -> &str {
        let name = match (self, self.tree()) {
            (Container::Vfx(vfx), _) => vfx.record(index).map(|r| r.name.as_str()),
            (_, Some(tree)) => tree.entry(index).map(|e| e.name.as_str()),
            (_, None) => None,
        };
        name.unwrap_or_default()
    }

    pub fn is_folder(&self, index: usize) -> bool {
        match (self, self.tree()) {
            (Container::Vfx(vfx), _) => vfx.record(index).is_some_and(|r| r.is_folder()),
            (_, Some(tree)) => tree.entry(index).is_some_and(|e| e.is_folder()),
            (_, None) => false,
        }
    }

    pub fn children(&self, index: usize) -> Vec<usize> {
        match (self, self.tree()) {
            (Container::Vfx(vfx), _) => vfx.children(index).map(|(i, _)| i).collect(),
            (_, Some(tree)) => tree
                .entry(index)
                .map(|e| e.children().to_vec())
                .unwrap_or_default(),
            (_, None) => Vec::new(),
        }
    }

    pub fn location(&self, index: usize) -> Option<FileLocation> {
        match (self, self.tree()) {
            (Container::Vfx(vfx), _) => vfx.record(index).and_then(|r| r.location().copied()),
            (_, Some(tree)) => tree.entry(index).and_then(|e| e.location().copied()),
            (_, None) => None,
        }
    }

    /// Locations of the duplicates the archive itself stores for a record, newest first
    pub fn duplicate_locations(&self, index: usize) -> Vec<FileLocation> {
        match self {
            Container::Vfx(vfx) => match vfx.record(index).map(|r| &r.kind) {
                Some(RecordKind::File { .. }) => {
                    vfx.duplicate_chain(index).map(|d| d.location).collect()
                }
                _ => Vec::new(),
            },
            Container::Vfi(_) | Container::Upk(_) => Vec::new(),
        }
    }

    /// Read and decode the payload at `location`
    pub fn extract(&self, location: &FileLocation) -> Result<Vec<u8>> {
        match self {
            Container::Vfx(vfx) => vfx.extract(location),
            Container::Vfi(vfi) => vfi.extract(location),
            Container::Upk(upk) => upk.extract(location),
        }
    }
}
