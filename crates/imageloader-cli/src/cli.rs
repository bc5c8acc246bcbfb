//! Exposes the command line application.
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Args, Parser, Subcommand};
use console::style;
use imageloader_service::caching::{CacheStore, CleanupStats};
use imageloader_service::config::Config;
use imageloader_service::dispatch::dispatch_queue;
use imageloader_service::fetch::FilesystemOpener;
use imageloader_service::metrics;
use imageloader_service::{
    CacheValidity, Delivery, LoadCoordinator, LoadOptions, RawDecoder, Request,
};

use crate::logging;

/// Image loader commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Load one image through the caches and report where it came from.
    Fetch(FetchArgs),

    /// Remove disk cache entries that have not been written for a while.
    Cleanup(CleanupArgs),
}

#[derive(Debug, Args)]
struct FetchArgs {
    /// URL, `content://` URI or path of the image.
    locator: String,

    /// Neither read nor write the disk cache.
    #[arg(long)]
    no_disk_cache: bool,

    /// How long a cached entry stays valid, e.g. `60s` or `forever`.
    #[arg(long, value_name = "VALIDITY")]
    validity: Option<CacheValidity>,

    /// Write the loaded bytes to this file.
    #[arg(long, short, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Serve `content://` URIs from this directory.
    #[arg(long, value_name = "DIR")]
    content_root: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct CleanupArgs {
    /// Overrides `caches.disk.max_unused_for`, e.g. `7d`.
    #[arg(long, value_parser = humantime::parse_duration, value_name = "DURATION")]
    max_unused_for: Option<Duration>,
}

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(name = "imageloader", version)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Overrides the configured cache directory.
    #[arg(long, global = true, value_name = "DIR")]
    cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::get(cli.config()).context("failed loading config")?;
    if let Some(cache_dir) = cli.cache_dir {
        config.cache_dir = Some(cache_dir);
    }

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    logging::init_logging(&config);
    if let Some(ref statsd) = config.metrics.statsd {
        metrics::configure_statsd(
            &config.metrics.prefix,
            statsd.as_str(),
            config.metrics.custom_tags.clone(),
        )
        .context("failed to configure statsd")?;
    }

    match cli.command {
        Command::Fetch(args) => fetch(config, args).context("failed to load image")?,
        Command::Cleanup(args) => cleanup(&config, args).context("failed to clean up caches")?,
    }

    Ok(())
}

fn fetch(config: Config, args: FetchArgs) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create runtime")?;

    runtime.block_on(run_fetch(config, args))
}

async fn run_fetch(config: Config, args: FetchArgs) -> Result<()> {
    let (dispatcher, mut queue) = dispatch_queue::<Bytes>();

    let mut builder =
        LoadCoordinator::builder(&config, RawDecoder).dispatcher(Arc::new(dispatcher));
    if let Some(root) = args.content_root {
        builder = builder.content_opener(Arc::new(FilesystemOpener::new(root)));
    }
    let coordinator = builder.build()?;

    let request = Request::new(args.locator)?.with_options(LoadOptions {
        enable_disk_cache: !args.no_disk_cache,
        disk_cache_validity: args.validity,
        ..Default::default()
    });
    tracing::debug!("Loading `{}` with key {}", request.name(), request.key());

    let handle = coordinator.submit(Arc::new(request), print_delivery);
    // the delivery runs here, on the main task
    queue.run_next().await;
    let loaded = handle.wait().await?;

    if let Some(output) = args.output {
        tokio::fs::write(&output, &loaded.image[..])
            .await
            .with_context(|| format!("failed to write `{}`", output.display()))?;
    }

    Ok(())
}

fn print_delivery(delivery: Delivery<Bytes>) {
    let name = delivery.request.name();
    match delivery.result {
        Ok(loaded) => println!(
            "{} {} from {} ({} bytes)",
            style("loaded").green().bold(),
            name,
            loaded.from,
            loaded.image.len()
        ),
        Err(error) => println!("{} {}: {}", style("failed").red().bold(), name, error),
    }
}

fn cleanup(config: &Config, args: CleanupArgs) -> Result<()> {
    let store = CacheStore::from_config(config).context("failed to open cache directory")?;
    let Some(cache_dir) = store.cache_dir() else {
        anyhow::bail!("no cache directory configured");
    };

    let Some(max_unused_for) = args.max_unused_for.or(config.caches.disk.max_unused_for) else {
        tracing::info!("Disk cache cleanup is disabled");
        return Ok(());
    };

    tracing::info!(
        "Cleaning up `{}`, removing entries unused for {}",
        cache_dir.display(),
        humantime::format_duration(max_unused_for)
    );
    store
        .clear_tmp()
        .context("failed to clear temporary files")?;
    let stats = store.cleanup(max_unused_for)?;
    print_stats(&stats);

    Ok(())
}

fn print_stats(stats: &CleanupStats) {
    println!(
        "{} {} entries ({} bytes), kept {}",
        style("removed").bold(),
        stats.removed,
        stats.removed_bytes,
        stats.retained
    );
}
