use clap::Args;
use itertools::Itertools;
use metro_vfs::{Container, ContainerKind};
use miette::{miette, Context, Result};
use owo_colors::OwoColorize;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Args)]
#[group(required = true, multiple = false)]
pub struct InfoArgs {
    /// An input archive
    #[arg(short, long, value_name = "FILE")]
    file: Option<PathBuf>,

    /// Describe every archive found directly inside this folder
    #[arg(short, long, value_name = "DIR")]
    game: Option<PathBuf>,
}

impl InfoArgs {
    pub fn handle(&self) -> Result<()> {
        if let Some(file) = &self.file {
            return describe(file);
        }

        let dir = self.game.as_ref().ok_or(miette!("either --file or --game is required"))?;
        let archives = WalkDir::new(dir)
            .max_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file() && is_registry(e.path()))
            .collect::<Vec<_>>();

        if archives.is_empty() {
            return Err(miette!("no archives in {}", dir.display()));
        }
        for entry in archives {
            describe(entry.path())?;
            println!();
        }
        Ok(())
    }
}

/// Registries and self-contained packages; `.upk0` style blobs of a registry are skipped
fn is_registry(path: &Path) -> bool {
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    extension.starts_with("vfx") || extension == "vfi" || extension == "upk"
}

fn describe(path: &Path) -> Result<()> {
    let container = Container::open(path).context(format!("path: {}", path.display()))?;

    println!("{}", path.display().bold());
    println!("  kind:     {:?}", container.kind());
    println!("  version:  {}", container.version());
    if let Some(guid) = container.guid() {
        println!("  guid:     {guid}");
    }
    println!("  title:    {}", container.title());
    println!("  codec:    {:?}", container.codec());
    if let Container::Vfx(vfx) = &container {
        if let Some(content_version) = vfx.content_version() {
            println!("  content:  {content_version}");
        }
    }

    let duplicates = match &container {
        Container::Vfx(vfx) => vfx.duplicates().len(),
        _ => 0,
    };
    println!(
        "  entries:  {} ({} files, {} folders, {} duplicates)",
        container.len(),
        container.file_count(),
        container.len() - container.file_count(),
        duplicates
    );

    println!("  packages: {}", container.packages().len());
    for package in container.packages() {
        let present = match container.kind() {
            ContainerKind::Upk => true,
            _ => path
                .parent()
                .map(|dir| dir.join(&package.name))
                .is_some_and(|blob| blob.is_file()),
        };
        let state = match present {
            true => "".to_string(),
            false => format!(" {}", "missing".red()),
        };
        println!("    {} {} bytes{state}", package.name, package.size);
        if !package.levels.is_empty() {
            println!("      levels: {}", package.levels.iter().join(", ").dimmed());
        }
    }
    Ok(())
}
