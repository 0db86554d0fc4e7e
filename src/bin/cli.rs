//! SectorStore CLI
//!
//! Administers a data directory directly: folders, sectors and usage.

use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use sectorstore::config::DEFAULT_SECTOR_SIZE;
use sectorstore::{Config, Engine, Result, SectorRoot, StoreError};
use tracing_subscriber::{fmt, EnvFilter};

/// SectorStore CLI
#[derive(Parser, Debug)]
#[command(name = "sectorstore-cli")]
#[command(about = "Manage a SectorStore data directory")]
#[command(version)]
struct Args {
    /// Data directory (WAL and index)
    #[arg(short, long, default_value = "./sectorstore_data")]
    data_dir: PathBuf,

    /// Sector size in bytes; must match the size the directory was created with
    #[arg(short, long, default_value_t = DEFAULT_SECTOR_SIZE)]
    sector_size: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Add a storage folder
    AddFolder {
        /// Folder directory
        path: PathBuf,

        /// Capacity in bytes, rounded down to whole sectors
        size: u64,
    },

    /// Remove a storage folder, moving its sectors elsewhere
    RemoveFolder {
        path: PathBuf,
    },

    /// Grow or shrink a storage folder
    ResizeFolder {
        path: PathBuf,

        /// New capacity in bytes
        size: u64,
    },

    /// Show capacity and usage of every folder
    Usage,

    /// Store a file as one sector, zero-padded to the sector size
    Put {
        file: PathBuf,
    },

    /// Write a sector's bytes to a file or stdout
    Get {
        root: SectorRoot,

        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Drop one reference to each listed sector
    Delete {
        #[arg(required = true)]
        roots: Vec<SectorRoot>,
    },

    /// Print the reference count of a sector
    Exists {
        root: SectorRoot,
    },

    /// Print the folder, slot and reference count of a sector
    Locate {
        root: SectorRoot,
    },
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sectorstore=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();

    let config = Config::builder()
        .data_dir(&args.data_dir)
        .sector_size(args.sector_size)
        .build();

    let engine = match Engine::open(config) {
        Ok(e) => e,
        Err(e) => {
            tracing::error!("Failed to open engine: {}", e);
            std::process::exit(1);
        }
    };

    let result = run(&engine, args.command);
    let closed = engine.close();

    if let Err(e) = result.and(closed) {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

fn run(engine: &Engine, command: Commands) -> Result<()> {
    match command {
        Commands::AddFolder { path, size } => {
            engine.add_folder(&path, size)?;
            println!("added {}", path.display());
        }
        Commands::RemoveFolder { path } => {
            engine.remove_folder(&path)?;
            println!("removed {}", path.display());
        }
        Commands::ResizeFolder { path, size } => {
            engine.resize_folder(&path, size)?;
            println!("resized {}", path.display());
        }
        Commands::Usage => {
            for usage in engine.folder_usage()? {
                println!(
                    "{:>4}  {:<40}  {:>10}/{:<10}  {:?}",
                    usage.id,
                    usage.path.display(),
                    usage.used,
                    usage.capacity,
                    usage.status
                );
            }
        }
        Commands::Put { file } => {
            let mut data = fs::read(&file)?;
            let sector_size = engine.sector_size() as usize;
            if data.len() > sector_size {
                return Err(StoreError::InvalidInput(format!(
                    "{} is {} bytes, larger than one sector ({} bytes)",
                    file.display(),
                    data.len(),
                    sector_size
                )));
            }
            data.resize(sector_size, 0);
            println!("{}", engine.write(&data)?);
        }
        Commands::Get { root, out } => {
            let data = engine.read(&root)?;
            match out {
                Some(path) => fs::write(path, &data)?,
                None => io::stdout().write_all(&data)?,
            }
        }
        Commands::Delete { roots } => {
            engine.delete_batch(&roots)?;
            println!("deleted {} references", roots.len());
        }
        Commands::Exists { root } => {
            println!("{}", engine.sector_count(&root)?);
        }
        Commands::Locate { root } => match engine.sector_location(&root)? {
            Some(loc) => println!(
                "folder {} slot {} count {}",
                loc.folder_id, loc.index, loc.count
            ),
            None => return Err(StoreError::SectorNotFound(root.to_string())),
        },
    }
    Ok(())
}
