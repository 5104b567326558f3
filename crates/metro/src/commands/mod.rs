pub mod vfs;

#[derive(clap::Subcommand)]
pub enum Commands {
    /// Handle VFX, VFI and UPK archives
    Vfs {
        #[command(subcommand)]
        command: vfs::VfsCommands,
    },
}

impl Commands {
    pub fn handle(&self) -> miette::Result<()> {
        match self {
            Commands::Vfs { command } => command.handle(),
        }
    }
}
