//! Bulk extraction of a mounted tree onto disk

use bon::Builder;
use std::{
    fs::File,
    io::Write,
    path::{Component, Path, PathBuf},
};
use tracing::{debug, info, instrument, warn};

use crate::{
    error::Result,
    fs::{FileSystem, Handle},
};

/// Options for how files are written out
#[derive(Debug, Clone, Builder)]
pub struct UnpackOptions {
    /// Replace files that already exist in the output folder
    #[builder(default)]
    pub overwrite: bool,

    /// Only write files whose name ends with this suffix
    #[builder(into)]
    pub extension: Option<String>,
}

impl Default for UnpackOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Reported after every file
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Progress<'a> {
    /// Files handled so far, this one included
    pub done: usize,
    pub total: usize,
    /// Full path of the file just handled
    pub path: &'a str,
}

/// Outcome of an unpack run
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct UnpackSummary {
    pub written: usize,
    /// Files whose payload could not be read
    pub failed: usize,
    /// Files that were selected
    pub total: usize,
    /// The progress callback stopped the run before every file was handled
    pub cancelled: bool,
}

/// Mount the archive at `archive` on its own and write its tree into `out`
///
/// `progress` is called after every file; returning `false` stops the run.
#[instrument(skip(options, progress), err)]
pub fn unpack<F>(archive: &Path, out: &Path, options: &UnpackOptions, progress: F) -> Result<UnpackSummary>
where
    F: FnMut(Progress<'_>) -> bool,
{
    let mut fs = FileSystem::new();
    fs.mount_archive(archive)?;
    unpack_file_system(&fs, out, options, progress)
}

/// Write every file of a mounted tree into `out`, recreating its folders
///
/// A file whose payload can not be read is logged and counted as failed; failing to write to
/// the output folder aborts the run.
#[instrument(skip(fs, options, progress), fields(out = %out.display()), err)]
pub fn unpack_file_system<F>(
    fs: &FileSystem,
    out: &Path,
    options: &UnpackOptions,
    mut progress: F,
) -> Result<UnpackSummary>
where
    F: FnMut(Progress<'_>) -> bool,
{
    let (folders, files) = collect(fs, options);
    let mut summary = UnpackSummary {
        total: files.len(),
        ..Default::default()
    };
    info!(files = summary.total, "unpacking");

    for folder in folders {
        std::fs::create_dir_all(output_path(out, &fs.full_path(folder)))?;
    }

    for (done, file) in files.into_iter().enumerate() {
        let path = fs.full_path(file);
        let target = output_path(out, &path);

        match fs.try_open_file_stream(file, 0, None) {
            Ok(stream) => {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let mut output = match options.overwrite {
                    true => File::create(&target)?,
                    false => File::create_new(&target)?,
                };
                output.write_all(stream.as_slice())?;
                debug!(%path, size = stream.len(), "wrote");
                summary.written += 1;
            }
            Err(err) => {
                warn!(%path, %err, "skipping unreadable file");
                summary.failed += 1;
            }
        }

        let keep_going = progress(Progress {
            done: done + 1,
            total: summary.total,
            path: &path,
        });
        if !keep_going {
            info!(done = done + 1, "unpack cancelled");
            summary.cancelled = true;
            break;
        }
    }

    Ok(summary)
}

/// Folders and selected files of the tree, parents before their children
fn collect(fs: &FileSystem, options: &UnpackOptions) -> (Vec<Handle>, Vec<Handle>) {
    let mut folders = Vec::new();
    let mut files = Vec::new();
    let mut pending = vec![fs.root()];

    while let Some(folder) = pending.pop() {
        folders.push(folder);
        let children: Vec<_> = fs.children(folder).collect();
        for &child in children.iter().rev() {
            if fs.is_folder(child) {
                pending.push(child);
            } else if options
                .extension
                .as_deref()
                .map_or(true, |extension| fs.name(child).ends_with(extension))
            {
                files.push(child);
            }
        }
    }
    (folders, files)
}

/// Where an archive path lands below `out`; segments that would leave `out` are dropped
fn output_path(out: &Path, path: &str) -> PathBuf {
    let mut target = out.to_path_buf();
    for segment in path.split(['\\', '/']) {
        let mut components = Path::new(segment).components();
        if let (Some(Component::Normal(name)), None) = (components.next(), components.next()) {
            target.push(name);
        }
    }
    target
}
