use clap::Args;
use metro_vfs::{unpack_file_system, UnpackOptions};
use miette::{miette, Context, Result};
use std::{path::PathBuf, sync::mpsc};
use tracing::{info, warn};

use super::Source;

#[derive(Args)]
pub struct ExtractArgs {
    #[command(flatten)]
    source: Source,

    /// A target directory
    #[arg(short, long, value_name = "DIR")]
    pub directory: PathBuf,

    /// Only extract files whose name ends with this suffix
    #[arg(short, long, value_name = "SUFFIX")]
    pub extension: Option<String>,

    /// Allow overwriting the target
    #[arg(long, default_value_t = false)]
    pub overwrite: bool,
}

impl ExtractArgs {
    pub fn handle(&self) -> Result<()> {
        let fs = self.source.mount()?;
        let options = UnpackOptions::builder()
            .overwrite(self.overwrite)
            .maybe_extension(self.extension.clone())
            .build();
        info!("extracting into {}", self.directory.display());

        let (tx, rx) = mpsc::channel();
        let summary = std::thread::scope(|scope| {
            let fs = &fs;
            let directory = &self.directory;
            let worker = scope.spawn(move || {
                unpack_file_system(fs, directory, &options, |progress| {
                    tx.send((progress.done, progress.total, progress.path.to_string()))
                        .is_ok()
                })
            });

            for (done, total, path) in rx {
                info!("[{done}/{total}] {path}");
            }
            worker.join()
        })
        .map_err(|_| miette!("extraction worker panicked"))?
        .context(format!("extracting into {}", self.directory.display()))?;

        if summary.failed > 0 {
            warn!("{} of {} files could not be read", summary.failed, summary.total);
        }
        info!("wrote {} of {} files", summary.written, summary.total);
        Ok(())
    }
}
