//! Masternode - caching reverse proxy for protected domains.
//!
//! Loads the JSON configuration, starts the proxy server on a multi-threaded
//! runtime and runs until Ctrl-C or SIGTERM.

use std::panic;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use directories::ProjectDirs;
use masternode_proxy::{GatewayPoller, MasternodeConfig, NetworkState, ProxyServer};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Masternode - caching reverse proxy for protected domains
#[derive(Parser, Debug)]
#[command(name = "masternode", version, about)]
struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "masternode", "Masternode")
}

/// Get the logs directory path.
fn logs_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.data_dir().join("logs"))
}

/// Config file used when `--config` is not given.
fn default_config_path() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().join("config.json"))
}

/// Initialize logging with file rotation.
fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = if args.debug { "debug" } else { &args.log_level };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("masternode={},warn", log_level)));

    if let Some(log_dir) = logs_dir() {
        if std::fs::create_dir_all(&log_dir).is_ok() {
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(5)
                .filename_prefix("masternode")
                .filename_suffix("log")
                .build(&log_dir)
                .ok();

            if let Some(appender) = file_appender {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);

                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(std::io::stdout))
                    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                    .init();

                tracing::info!("Logging to {:?}", log_dir);
                return Some(guard);
            }
        }
    }

    // Fallback: console logging only
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::warn!("File logging unavailable, using console only");
    None
}

/// Reads the configuration and applies command line overrides.
fn load_config(path: &Path, port: Option<u16>) -> anyhow::Result<MasternodeConfig> {
    let mut config = MasternodeConfig::from_file(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;

    if let Some(port) = port {
        config = config.with_port(port);
    }
    Ok(config)
}

fn build_runtime(threads: usize) -> anyhow::Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all().thread_name("masternode-worker");
    if threads > 0 {
        builder.worker_threads(threads);
    }
    builder.build().context("failed to build the async runtime")
}

/// Resolves when the process is asked to stop.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn serve(config: MasternodeConfig) -> anyhow::Result<()> {
    let mut server = ProxyServer::new(&config).context("failed to create proxy server")?;

    if config.peer_network.enabled {
        let state = NetworkState::new();
        let poller = GatewayPoller::new(state.clone(), &config.peer_network)
            .context("failed to create gateway poller")?;
        tracing::info!("Polling edge nodes from {}", poller.url());
        tokio::spawn(poller.start_polling());
        server = server.with_network_state(state);
    }

    let cache = server.cache().clone();
    let handle = server.start().context("failed to start proxy server")?;
    tracing::info!(
        "Masternode listening on {} for {} domain(s)",
        handle.addr(),
        config.protected_domains.len()
    );

    shutdown_signal().await;
    tracing::info!("Shutdown requested");
    handle.stop().await;

    let flush_cache = cache.clone();
    tokio::task::spawn_blocking(move || flush_cache.flush())
        .await
        .context("cache flush task failed")?;

    if let Some(stats) = cache.persist_stats() {
        tracing::info!(
            written = stats.written(),
            failed = stats.failed(),
            dropped = stats.dropped(),
            "Cache persistence finished"
        );
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Keep the guard alive for the duration of the program
    let _log_guard = init_logging(&args);

    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        tracing::error!("PANIC: {}", panic_info);
        default_hook(panic_info);
    }));

    tracing::info!("Starting Masternode...");
    tracing::debug!("Args: {:?}", args);

    let config_path = args
        .config
        .clone()
        .or_else(default_config_path)
        .context("no configuration file given and no default location available")?;
    let config = load_config(&config_path, args.port)?;

    let runtime = build_runtime(config.server.threads)?;
    runtime.block_on(serve(config))?;

    tracing::info!("Masternode shutting down");
    Ok(())
}
