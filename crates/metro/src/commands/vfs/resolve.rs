use clap::Args;
use metro_vfs::{overlay::OverlayRecord, LayeredFileSystem, RecordRef};
use miette::{miette, Context, Result};
use owo_colors::OwoColorize;
use std::path::PathBuf;

#[derive(Args)]
pub struct ResolveArgs {
    /// A game folder holding content.vfx
    #[arg(short, long, value_name = "DIR")]
    game: PathBuf,

    /// Path to look up, `\` or `/` separated
    #[arg(value_name = "PATH")]
    pub path: String,
}

impl ResolveArgs {
    pub fn handle(&self) -> Result<()> {
        let fs = LayeredFileSystem::open_game_folder(&self.game)
            .context(format!("opening {}", self.game.display()))?;
        let found = fs
            .find(&self.path)
            .ok_or(miette!("{} is not in any layer", self.path))?;
        let record = fs
            .record(found)
            .ok_or(miette!("record {found} is out of range"))?;

        println!("{} {}", self.path.bold(), found.dimmed());
        print_layer(&fs, found);

        match record.location() {
            Some(location) => {
                let package = fs
                    .package(found)
                    .map(|p| p.package.name.as_str())
                    .unwrap_or("?");
                println!("  package:  {package}");
                println!(
                    "  payload:  {} bytes at {} ({} packed)",
                    location.uncompressed, location.offset, location.compressed
                );
                let duplicates = fs.duplicates(found);
                if !duplicates.is_empty() {
                    println!("  copies:   {}", duplicates.len());
                }
            }
            None => print_folder(&fs, found, record),
        }
        Ok(())
    }
}

fn print_layer(fs: &LayeredFileSystem, record: RecordRef) {
    if let Some(layer) = fs.layer(record.layer) {
        println!("  layer:    {} ({})", record.layer, layer.path().display());
    }
}

fn print_folder(fs: &LayeredFileSystem, folder: RecordRef, record: &OverlayRecord) {
    if let Some(replaced) = record.overrides {
        println!("  replaces: {replaced}");
    }
    let tail = fs.find_tail(folder);
    if tail != folder {
        println!("  newest:   {}", tail.green());
        print_layer(fs, tail);
    }
    println!(
        "  entries:  {} ({} files below)",
        fs.children(folder).len(),
        fs.count_files(folder, true)
    );
}
