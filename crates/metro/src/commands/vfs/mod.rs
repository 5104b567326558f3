pub mod extract;
pub mod info;
pub mod list;
pub mod resolve;

use std::path::PathBuf;

use clap::Args;
use metro_vfs::FileSystem;
use miette::{Context, Result};
use tracing::info;

#[derive(clap::Subcommand)]
pub enum VfsCommands {
    /// Describe an archive or every archive of a game folder
    Info(info::InfoArgs),
    /// Print the tree of an archive or a game folder
    List(list::ListArgs),
    /// Extract an archive or a game folder into a directory
    Extract(extract::ExtractArgs),
    /// Find which layer of a game folder a path resolves to
    Resolve(resolve::ResolveArgs),
}

impl VfsCommands {
    pub fn handle(&self) -> Result<()> {
        match self {
            VfsCommands::Info(info) => info.handle(),
            VfsCommands::List(list) => list.handle(),
            VfsCommands::Extract(extract) => extract.handle(),
            VfsCommands::Resolve(resolve) => resolve.handle(),
        }
    }
}

/// A single archive or a whole game folder
#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
pub struct Source {
    /// An input archive (.vfx, .vfi or .upk)
    #[arg(short, long, value_name = "FILE")]
    file: Option<PathBuf>,

    /// A game folder holding content.vfx or content.vfi
    #[arg(short, long, value_name = "DIR")]
    game: Option<PathBuf>,
}

impl Source {
    /// Mount the archive, or every archive of the game folder merged into one tree
    pub fn mount(&self) -> Result<FileSystem> {
        let mut fs = FileSystem::new();
        match (&self.file, &self.game) {
            (Some(file), _) => {
                fs.mount_archive(file)
                    .context(format!("mounting {}", file.display()))?;
            }
            (None, Some(game)) => {
                let count = fs
                    .mount_game_folder(game)
                    .context(format!("mounting {}", game.display()))?;
                info!("mounted {count} archives from {}", game.display());
            }
            (None, None) => return Err(miette::miette!("either --file or --game is required")),
        }
        Ok(fs)
    }
}
