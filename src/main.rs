//! CloudMount Cache - operator tool for the local file cache
//!
//! Opens the cache for a directory-backed remote to inspect, clean or wipe
//! it, or to run the background cleaner in the foreground.

use anyhow::{anyhow, Result};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use cloudmount_cache::remote::LocalRemote;
use cloudmount_cache::{Cache, CacheOptions, Remote};

/// Remote name used in the cache layout for directory remotes
const LOCAL_REMOTE_NAME: &str = "local";

/// CLI command
#[derive(Debug)]
enum Command {
    /// Print item count and usage
    Stats { remote_dir: PathBuf },
    /// Run one cleaning pass
    Clean { remote_dir: PathBuf },
    /// Delete the whole cache
    Cleanup { remote_dir: PathBuf },
    /// Run the background cleaner until Ctrl+C
    Watch { remote_dir: PathBuf },
    /// Show help
    Help,
}

fn print_help() {
    eprintln!(
        r#"CloudMount Cache - Inspect and maintain the local file cache

USAGE:
    cloudmount-cache stats <remote-dir>
    cloudmount-cache clean <remote-dir>
    cloudmount-cache cleanup <remote-dir>
    cloudmount-cache watch <remote-dir>
    cloudmount-cache help

COMMANDS:
    stats    Show cached item count and bytes used
    clean    Run one cleaning pass (age sweep, then quota sweep)
    cleanup  Delete the cache for this remote entirely
    watch    Run the background cleaner until Ctrl+C
    help     Show this help message

ENVIRONMENT:
    CLOUDMOUNT_CACHE_CONFIG         JSON file with cache options
    CLOUDMOUNT_CACHE_DIR            Cache directory (default: platform cache dir)
    CLOUDMOUNT_CACHE_MAX_AGE        Max age of unused files, seconds (default: 3600)
    CLOUDMOUNT_CACHE_MAX_SIZE       Cache quota in bytes, 0 for none (default: 0)
    CLOUDMOUNT_CACHE_POLL_INTERVAL  Seconds between passes, 0 disables (default: 60)
    RUST_LOG                        Log level (trace, debug, info, warn, error)
"#
    );
}

fn parse_args() -> Result<Command> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        return Ok(Command::Help);
    }

    let remote_dir = || -> Result<PathBuf> {
        args.get(2)
            .map(PathBuf::from)
            .ok_or_else(|| anyhow!("Usage: cloudmount-cache {} <remote-dir>", args[1]))
    };

    match args[1].as_str() {
        "stats" => Ok(Command::Stats {
            remote_dir: remote_dir()?,
        }),
        "clean" => Ok(Command::Clean {
            remote_dir: remote_dir()?,
        }),
        "cleanup" => Ok(Command::Cleanup {
            remote_dir: remote_dir()?,
        }),
        "watch" => Ok(Command::Watch {
            remote_dir: remote_dir()?,
        }),
        "help" | "--help" | "-h" => Ok(Command::Help),
        _ => {
            eprintln!("Unknown command: {}", args[1]);
            Ok(Command::Help)
        }
    }
}

/// Open the cache for a directory remote
///
/// One-shot commands pass `cleaner = false` so no background pass runs.
async fn open_cache(
    remote_dir: PathBuf,
    cleaner: bool,
    cancel: CancellationToken,
) -> Result<Arc<Cache>> {
    let mut opts = CacheOptions::from_env()?;
    if !cleaner {
        opts.poll_interval = Duration::ZERO;
    }

    let remote_dir = remote_dir.canonicalize().unwrap_or(remote_dir);
    let remote: Arc<dyn Remote> = Arc::new(LocalRemote::new(LOCAL_REMOTE_NAME, remote_dir));
    Cache::new(remote, opts, cancel).await
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let log_level = env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Parse command
    let command = match parse_args() {
        Ok(cmd) => cmd,
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(1);
        }
    };

    let cancel = CancellationToken::new();

    match command {
        Command::Stats { remote_dir } => {
            let cache = open_cache(remote_dir, false, cancel).await?;
            let used = cache.update_used();
            println!("Cache root: {}", cache.layout().root().display());
            println!("Metadata root: {}", cache.layout().meta_root().display());
            println!("Items: {}", cache.len());
            println!("Used: {} bytes", used);
        }
        Command::Clean { remote_dir } => {
            let cache = open_cache(remote_dir, false, cancel).await?;
            let worker = Arc::clone(&cache);
            match tokio::task::spawn_blocking(move || worker.clean()).await? {
                Some(report) => {
                    println!(
                        "Evicted {} items ({} bytes); {} items, {} bytes remain",
                        report.evicted_items,
                        report.evicted_bytes,
                        report.items_after,
                        report.bytes_after
                    );
                    cache.purge_empty_dirs();
                }
                None => println!("Cache is empty, nothing to clean"),
            }
        }
        Command::Cleanup { remote_dir } => {
            let cache = open_cache(remote_dir, false, cancel).await?;
            if let Err(e) = cache.cleanup() {
                error!(error = %e, "Failed to clean up cache");
                return Err(e.into());
            }
            println!("Removed {}", cache.layout().root().display());
        }
        Command::Watch { remote_dir } => {
            let cache = open_cache(remote_dir, true, cancel.clone()).await?;
            info!(
                root = %cache.layout().root().display(),
                "Cache cleaner running. Press Ctrl+C to stop."
            );

            // Wait for Ctrl+C
            tokio::signal::ctrl_c().await?;

            info!("Received shutdown signal, stopping cleaner...");
            cancel.cancel();
            cache.shutdown().await;

            info!("Shutdown complete.");
        }
        Command::Help => {
            print_help();
        }
    }

    Ok(())
}
