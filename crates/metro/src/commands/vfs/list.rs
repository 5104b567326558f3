use clap::Args;
use itertools::Itertools;
use metro_vfs::{FileSystem, Handle};
use miette::{miette, Result};
use owo_colors::OwoColorize;

use super::Source;

#[derive(Args)]
pub struct ListArgs {
    #[command(flatten)]
    source: Source,

    /// Only list the folder at this path
    #[arg(value_name = "PATH")]
    path: Option<String>,

    /// Print one full path per file instead of a tree
    #[arg(long, default_value_t = false)]
    flat: bool,
}

impl ListArgs {
    pub fn handle(&self) -> Result<()> {
        let fs = self.source.mount()?;
        let start = match &self.path {
            Some(path) => fs
                .find_folder(path)
                .ok_or(miette!("no folder at {path}"))?,
            None => fs.root(),
        };

        match self.flat {
            true => {
                for file in fs.find_files_in_folder(start, "", true) {
                    println!("{}", fs.full_path(file));
                }
            }
            false => print_tree(&fs, start, 0),
        }

        println!(
            "{} files in {} archives",
            fs.count_files(start, true),
            fs.archive_count()
        );
        Ok(())
    }
}

fn print_tree(fs: &FileSystem, folder: Handle, depth: usize) {
    let indent = "  ".repeat(depth);
    let children = fs
        .children(folder)
        .sorted_by_key(|&child| (fs.is_file(child), fs.name(child).to_ascii_lowercase()));

    for child in children {
        if fs.is_folder(child) {
            println!("{indent}{}\\", fs.name(child).blue().bold());
            print_tree(fs, child, depth + 1);
            continue;
        }

        let size = fs.uncompressed_size(child).unwrap_or_default();
        let packed = fs.compressed_size(child).unwrap_or_default();
        let copies = fs.duplicates(child).count();
        let mut line = format!("{indent}{} {size}", fs.name(child));
        if packed != size {
            line.push_str(&format!(" ({packed} packed)").dimmed().to_string());
        }
        if copies > 0 {
            line.push_str(&format!(" +{copies}").yellow().to_string());
        }
        println!("{line}");
    }
}
