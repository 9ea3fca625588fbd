//! linkcache command-line tool.
//!
//! Fetches resources through a local cache directory and inspects or
//! maintains that directory.

use std::io::Write;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use linkcache::config::{Cli, Command, Config};
use linkcache::ResourceCache;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "linkcache=debug"
    } else {
        "linkcache=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    info!("linkcache v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    if let Some(dir) = cli.cache_dir {
        config.store.cache_dir = dir;
    }

    // Key derivation needs no store.
    if let Command::Key { locator, digest } = &cli.command {
        let kind = digest.clone().unwrap_or_else(|| config.key.digest.clone());
        let key = linkcache::KeyCodec::new().compute_key(locator, &kind)?;
        println!("{key}");
        return Ok(());
    }

    let cache = ResourceCache::open(config).await?;

    match cli.command {
        Command::Fetch {
            locator,
            output,
            policy,
        } => {
            let policy = policy.unwrap_or(cache.config().store.cache_policy);
            let data = cache
                .fetch_with(&locator, policy, None)
                .await
                .with_context(|| format!("fetching {locator}"))?;
            match output {
                Some(path) => {
                    tokio::fs::write(&path, &data)
                        .await
                        .with_context(|| format!("writing {}", path.display()))?;
                    info!(path = %path.display(), bytes = data.len(), "Payload written");
                }
                None => {
                    let key = cache.key_for(&locator)?;
                    println!("{key}\t{} bytes", data.len());
                }
            }
        }
        Command::Key { .. } => {}
        Command::Remove { locator } => {
            let removed = cache.remove(&locator).await?;
            println!("{}", if removed { "removed" } else { "not cached" });
        }
        Command::Sweep => {
            let report = cache.sweep().await;
            println!(
                "expired={} evicted={} skipped_busy={} failed={} bytes_freed={} total_bytes={}",
                report.expired,
                report.evicted,
                report.skipped_busy,
                report.failed,
                report.bytes_freed,
                report.total_bytes
            );
        }
        Command::Stats => {
            let stats = cache.stats();
            let mut out = std::io::stdout().lock();
            writeln!(out, "entries: {}", stats.entries)?;
            writeln!(out, "disk_bytes: {}", stats.disk_bytes)?;
            writeln!(
                out,
                "memory: {} entries, {}/{} bytes",
                stats.memory_entries, stats.memory_bytes, stats.memory_capacity
            )?;
            writeln!(out)?;
            write!(out, "{}", cache.metrics().render()?)?;
        }
        Command::Clear => {
            cache.clear().await?;
            println!("cleared");
        }
    }

    Ok(())
}
