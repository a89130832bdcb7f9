#![deny(unsafe_code)]

// Use mimalloc for reduced allocation latency (enabled by default).
#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use gatekeeper_core::{
    Catalog, CatalogNotifier, GatekeeperConfig, LockCache, MemoryCatalog, PolicyStats, Reconciler,
    RestCatalog, parse_duration,
};
use gatekeeper_fuse::config::DEFAULT_FSNAME;
use gatekeeper_fuse::{GatekeeperFS, MountConfig, Passthrough, mount};
use gatekeeper_mount::{
    DEFAULT_ACCESS_TIMEOUT, check_mountpoint, ensure_source_dir, fuse_available,
    install_signal_handler, request_shutdown, wait_for_shutdown_timeout,
};

/// How often the main thread checks whether the mount went away.
const LIVENESS_POLL: Duration = Duration::from_secs(1);

/// Passthrough filesystem that enforces remote file locks
#[derive(Parser)]
#[command(name = "gatekeeper")]
#[command(author, version)]
#[command(propagate_version = true)]
#[command(after_help = "EXAMPLES:
    # Mount ./shared at /mnt/shared, locks from a Supabase project
    GATEKEEPER_API_KEY=... gatekeeper mount ./shared /mnt/shared \\
        --catalog-url https://project.supabase.co

    # Run one reconciliation cycle and print the report
    gatekeeper sync ./shared --config gatekeeper.toml

    # Mount without a catalog (nothing is ever locked)
    gatekeeper mount ./shared /mnt/shared --offline
")]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file (TOML)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mount SOURCE at MOUNTPOINT and enforce catalog locks
    Mount(MountArgs),

    /// Run a single reconciliation cycle and print its report as JSON
    Sync(SyncArgs),
}

#[derive(Args)]
struct MountArgs {
    /// Directory holding the real files (created if missing)
    source: PathBuf,

    /// Existing empty directory to mount on
    mountpoint: PathBuf,

    /// Filesystem name shown in mount tables
    #[arg(long, default_value = DEFAULT_FSNAME)]
    fsname: String,

    /// Allow other users to access the mount
    #[arg(long)]
    allow_other: bool,

    #[command(flatten)]
    catalog: CatalogArgs,
}

#[derive(Args)]
struct SyncArgs {
    /// Directory holding the real files
    source: PathBuf,

    #[command(flatten)]
    catalog: CatalogArgs,
}

/// Overrides for the `[catalog]` and `[sync]` config sections.
#[derive(Args)]
struct CatalogArgs {
    /// Catalog base URL
    #[arg(long, env = "GATEKEEPER_CATALOG_URL")]
    catalog_url: Option<String>,

    /// Catalog API key
    #[arg(long, env = "GATEKEEPER_API_KEY", hide_env_values = true, hide = true)]
    api_key: Option<String>,

    /// Reconciliation interval, e.g. "2s" or "500ms"
    #[arg(long, value_parser = parse_duration)]
    interval: Option<Duration>,

    /// Use an in-memory catalog; nothing is ever locked
    #[arg(long)]
    offline: bool,
}

impl CatalogArgs {
    fn apply(&self, config: &mut GatekeeperConfig) {
        if let Some(url) = &self.catalog_url {
            config.catalog.url = Some(url.clone());
        }
        if let Some(key) = &self.api_key {
            config.catalog.api_key = Some(key.clone());
        }
        if let Some(interval) = self.interval {
            config.sync.interval = interval;
        }
    }

    fn build_catalog(&self, config: &GatekeeperConfig) -> Result<Arc<dyn Catalog>> {
        if self.offline {
            tracing::warn!("Offline mode: using an in-memory catalog, no file is locked");
            return Ok(Arc::new(MemoryCatalog::new()));
        }
        if config.catalog.url.is_none() {
            bail!("no catalog configured; pass --catalog-url, set catalog.url, or use --offline");
        }
        let catalog = RestCatalog::new(&config.catalog).context("Failed to create catalog client")?;
        Ok(Arc::new(catalog))
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = match &cli.config {
        Some(path) => GatekeeperConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => GatekeeperConfig::default(),
    };

    match &cli.command {
        Commands::Mount(args) => {
            args.catalog.apply(&mut config);
            config.validate().context("Invalid configuration")?;
            run_mount(args, &config)
        }
        Commands::Sync(args) => {
            args.catalog.apply(&mut config);
            config.validate().context("Invalid configuration")?;
            run_sync(args, &config)
        }
    }
}

fn build_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .thread_name("gatekeeper-sync")
        .enable_all()
        .build()
        .context("Failed to start async runtime")
}

fn run_sync(args: &SyncArgs, config: &GatekeeperConfig) -> Result<()> {
    let source = ensure_source_dir(&args.source).context("Invalid source directory")?;
    let catalog = args.catalog.build_catalog(config)?;
    let stats = Arc::new(PolicyStats::new());
    let reconciler = Reconciler::new(
        &source,
        catalog,
        Arc::new(LockCache::new()),
        Arc::clone(&stats),
        &config.sync,
    );

    let runtime = build_runtime()?;
    let report = runtime
        .block_on(reconciler.run_cycle())
        .context("Reconciliation failed")?;

    let output = serde_json::json!({
        "report": report,
        "stats": stats.snapshot(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn run_mount(args: &MountArgs, config: &GatekeeperConfig) -> Result<()> {
    if !fuse_available() {
        bail!("FUSE is not available; install libfuse (Linux) or macFUSE (macOS)");
    }
    let source = ensure_source_dir(&args.source).context("Invalid source directory")?;
    let mountpoint = check_mountpoint(&args.mountpoint, &source, DEFAULT_ACCESS_TIMEOUT)
        .context("Invalid mount point")?;

    install_signal_handler().context("Failed to install signal handler")?;

    let runtime = build_runtime()?;
    let catalog = args.catalog.build_catalog(config)?;
    let stats = Arc::new(PolicyStats::new());
    let cache = Arc::new(LockCache::new());

    let (notifier, notifier_task) = CatalogNotifier::spawn(
        Arc::clone(&catalog),
        config.sync.queue_capacity,
        Arc::clone(&stats),
        runtime.handle(),
    );

    let reconciler = Reconciler::new(
        &source,
        catalog,
        Arc::clone(&cache),
        Arc::clone(&stats),
        &config.sync,
    );
    // Prime the cache before the mount becomes visible. Failure is logged
    // and the mount proceeds fail-open.
    let _ = runtime.block_on(reconciler.run_cycle());
    let reconciler = reconciler.spawn(runtime.handle());

    let mount_config = MountConfig::default()
        .fsname(args.fsname.clone())
        .allow_other(args.allow_other);
    let fs = GatekeeperFS::new(
        Passthrough::new(&source, Arc::clone(&cache), notifier, Arc::clone(&stats)),
        mount_config.clone(),
    );

    let mounted = mount(fs, &mountpoint, &mount_config);
    let handle = match mounted {
        Ok(handle) => handle,
        Err(e) => {
            runtime.block_on(async {
                reconciler.shutdown().await;
                notifier_task.shutdown(config.sync.drain_timeout).await;
            });
            return Err(e).with_context(|| format!("Failed to mount at {}", mountpoint.display()));
        }
    };

    tracing::info!(
        source = %source.display(),
        mountpoint = %mountpoint.display(),
        "Gatekeeper mounted (Ctrl-C to unmount)"
    );

    wait_until_done(&mountpoint, || handle.is_mounted());

    handle.unmount();
    runtime.block_on(async {
        reconciler.shutdown().await;
        notifier_task.shutdown(config.sync.drain_timeout).await;
    });

    let snapshot = stats.snapshot();
    tracing::info!(
        denied = snapshot.access_denied,
        dropped = snapshot.notifications_dropped,
        cycles = snapshot.cycles_completed,
        "Gatekeeper stopped"
    );
    Ok(())
}

/// Blocks until a shutdown signal arrives or the mount disappears.
fn wait_until_done(mountpoint: &Path, is_mounted: impl Fn() -> bool) {
    loop {
        if wait_for_shutdown_timeout(LIVENESS_POLL) {
            return;
        }
        if !is_mounted() {
            tracing::warn!(mountpoint = %mountpoint.display(), "Mount went away, shutting down");
            request_shutdown();
            return;
        }
    }
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => "warn,gatekeeper=info,gatekeeper_fuse=info,gatekeeper_core=info,gatekeeper_mount=info",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with_writer(io::stderr)
        .init();
}
