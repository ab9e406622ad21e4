//! FERRY CLI
//!
//! Hash and verify files, and inspect or edit a persisted download queue.

mod config;
mod progress;

use clap::{Parser, Subcommand};
use ferry_files::{ContentId, HashTree, READ_BUFFER_SIZE, TreeHash};
use ferry_queue::{AddRequest, Priority, QueueManager, QueueStore, UserId};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

use config::Config;
use progress::{ByteProgress, format_bytes, format_duration, format_speed};

/// FERRY - verified multi-source downloads
#[derive(Parser)]
#[command(name = "ferry")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute the tree root of a file
    Hash {
        /// File to hash
        path: PathBuf,

        /// Do not show a progress bar
        #[arg(short, long)]
        quiet: bool,
    },

    /// Check a file against an expected root
    Verify {
        /// File to check
        path: PathBuf,

        /// Expected root (base-32)
        #[arg(long)]
        root: String,
    },

    /// Inspect or edit the persisted queue
    Queue {
        #[command(subcommand)]
        command: QueueCommand,
    },
}

#[derive(Subcommand)]
enum QueueCommand {
    /// List queued items
    List,

    /// Queue a file from a source
    Add {
        /// Absolute target path
        target: PathBuf,

        /// File size in bytes
        #[arg(long)]
        size: u64,

        /// Content id (base-32 root)
        #[arg(long)]
        root: Option<String>,

        /// Source user id (base-32)
        #[arg(long)]
        source: String,

        /// Hub the source was seen on
        #[arg(long, default_value = "")]
        hub: String,

        /// Priority (paused, lowest, low, normal, high, highest)
        #[arg(long)]
        priority: Option<String>,
    },

    /// Remove a queued item
    Remove {
        /// Target path
        target: PathBuf,
    },

    /// Set the priority of a queued item
    Priority {
        /// Target path
        target: PathBuf,

        /// New priority
        level: String,
    },

    /// Re-admit bad sources of a queued item
    Readd {
        /// Target path
        target: PathBuf,

        /// Only this source (default: all)
        #[arg(long)]
        source: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = if cli.config.is_some() {
        Config::load(&config_path)?
    } else {
        Config::load_or_default(&config_path)?
    };

    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.to_lowercase()
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    config.validate()?;

    match cli.command {
        Commands::Hash { path, quiet } => {
            hash_file(&path, quiet).await?;
        }
        Commands::Verify { path, root } => {
            verify_file(&path, &root).await?;
        }
        Commands::Queue { command } => {
            run_queue_command(command, &config).await?;
        }
    }

    Ok(())
}

/// Hash `path` with a progress bar
async fn compute_tree(path: &Path, progress: ByteProgress) -> anyhow::Result<TreeHash> {
    let path = path.to_path_buf();

    let tree = tokio::task::spawn_blocking(move || -> anyhow::Result<TreeHash> {
        let mut file = std::fs::File::open(&path)?;
        let size = file.metadata()?.len();
        let mut tree = HashTree::for_file_size(size);
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];

        loop {
            let n = file.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            tree.update(&buffer[..n])?;
            progress.inc(n as u64);
        }

        Ok(tree.into_tree_hash())
    })
    .await??;

    Ok(tree)
}

async fn hash_file(path: &Path, quiet: bool) -> anyhow::Result<()> {
    let size = tokio::fs::metadata(path).await?.len();
    let label = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown");
    let progress = if quiet {
        ByteProgress::hidden()
    } else {
        ByteProgress::new(size, label)
    };

    let start = Instant::now();
    let tree = match compute_tree(path, progress.clone()).await {
        Ok(tree) => tree,
        Err(e) => {
            progress.abandon();
            return Err(e);
        }
    };
    let elapsed = start.elapsed();
    progress.finish_with_message(format!("Hashed: {label}"));

    println!("File:       {}", path.display());
    println!("Size:       {}", format_bytes(tree.file_size));
    println!("Block size: {}", format_bytes(tree.block_size));
    println!("Leaves:     {}", tree.leaf_count());
    println!("Root:       {}", tree.content_id());
    println!(
        "Time:       {} ({})",
        format_duration(elapsed),
        format_speed(tree.file_size, elapsed)
    );

    Ok(())
}

async fn verify_file(path: &Path, root: &str) -> anyhow::Result<()> {
    let expected: ContentId = root.parse()?;
    let tree = compute_tree(path, ByteProgress::hidden()).await?;
    let actual = tree.content_id();

    if actual != expected {
        tracing::warn!("Root mismatch for {}", path.display());
        anyhow::bail!(
            "Root mismatch for {}: expected {}, got {}",
            path.display(),
            expected,
            actual
        );
    }

    println!("OK {} {}", actual, path.display());
    Ok(())
}

fn parse_priority(level: &str) -> anyhow::Result<Priority> {
    level.parse::<Priority>().map_err(anyhow::Error::msg)
}

async fn run_queue_command(command: QueueCommand, config: &Config) -> anyhow::Result<()> {
    let manager = QueueManager::new(config.queue.clone())?;
    let store = QueueStore::new(&config.queue.queue_file);
    let loaded = manager.load_from(&store).await?;
    tracing::debug!("Loaded {} items from {}", loaded, store.path().display());

    match command {
        QueueCommand::List => {
            list_queue(&manager).await;
            return Ok(());
        }
        QueueCommand::Add {
            target,
            size,
            root,
            source,
            hub,
            priority,
        } => {
            let user: UserId = source.parse()?;
            let mut request = AddRequest::new(&target, size, user, hub);
            if let Some(root) = root {
                request = request.with_content_id(root.parse()?);
            }
            if let Some(level) = priority {
                request = request.with_priority(parse_priority(&level)?);
            }
            manager.add(request).await?;
            println!("Queued {}", target.display());
        }
        QueueCommand::Remove { target } => {
            manager.remove(&target).await?;
            println!("Removed {}", target.display());
        }
        QueueCommand::Priority { target, level } => {
            let priority = parse_priority(&level)?;
            manager.set_priority(&target, priority).await?;
            println!("{} -> {}", target.display(), priority);
        }
        QueueCommand::Readd { target, source } => {
            let user = source.map(|s| s.parse::<UserId>()).transpose()?;
            let count = manager.readd(&target, user).await?;
            println!("Re-added {count} sources to {}", target.display());
        }
    }

    manager.save(&store).await?;
    Ok(())
}

async fn list_queue(manager: &QueueManager) {
    let items = manager.items().await;
    if items.is_empty() {
        println!("Queue is empty");
        return;
    }

    for item in &items {
        let size = item
            .size()
            .map_or_else(|| "?".to_string(), format_bytes);
        println!(
            "[{:>7}] {} {}/{}",
            item.priority().as_str(),
            item.target().display(),
            format_bytes(item.downloaded()),
            size
        );
        if let Some(id) = item.content_id() {
            println!("          root {id}");
        }
        for source in item.sources().good() {
            println!("          + {} {}", source.user, source.hub);
        }
        for bad in item.sources().bad() {
            println!("          - {} ({})", bad.user, bad.status_text());
        }
    }
    println!("{} items", items.len());
}
