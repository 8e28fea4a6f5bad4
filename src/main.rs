use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, ValueEnum};
use tokio::signal;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use tiergate::config::{ServiceConfig, StoreBackend};
use tiergate::http::HttpGateway;
use tiergate::ratelimit::{
    CounterStore, MemoryCounterStore, RateLimiter, RedisCounterStore, RuleRegistry,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

/// Multi-tier request rate limiting gateway.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// YAML configuration file
    #[arg(short, long, env = "TIERGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on, overrides the configuration
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Counter store backend, overrides the configuration
    #[arg(long, value_parser = parse_backend)]
    store: Option<StoreBackend>,

    /// Log output format
    #[arg(long, value_enum, default_value = "pretty")]
    log_format: LogFormat,

    /// Print the effective configuration as YAML and exit
    #[arg(long)]
    print_config: bool,
}

fn parse_backend(value: &str) -> Result<StoreBackend, String> {
    match value.to_ascii_lowercase().as_str() {
        "memory" => Ok(StoreBackend::Memory),
        "redis" => Ok(StoreBackend::Redis),
        other => Err(format!("unknown store backend '{}'", other)),
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    info!("Starting Tiergate rate limiting gateway");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = ServiceConfig::load(args.config.as_deref())?;
    if let Some(bind) = args.bind {
        config.server.bind_addr = bind;
    }
    if let Some(backend) = args.store {
        config.store.backend = backend;
    }

    if args.print_config {
        print!("{}", serde_yaml::to_string(&config)?);
        return Ok(());
    }

    let rules = config.limits.to_rule_set()?;
    info!(
        bind_addr = %config.server.bind_addr,
        backend = ?config.store.backend,
        rules = rules.len(),
        "Configuration loaded"
    );

    let store: Arc<dyn CounterStore> = match config.store.backend {
        StoreBackend::Memory => {
            let store = Arc::new(MemoryCounterStore::new());
            spawn_purge(store.clone(), config.store.purge_interval_secs);
            store
        }
        StoreBackend::Redis => Arc::new(RedisCounterStore::connect(&config.store).await?),
    };

    let registry = Arc::new(RuleRegistry::new(rules));
    if let Some(path) = args.config.clone() {
        spawn_reload(registry.clone(), path, config.server.reload_interval_secs);
    }

    let limiter = Arc::new(
        RateLimiter::new(store, registry).with_store_timeout(config.store.timeout()),
    );
    info!("Rate limiter initialized");

    let gateway = HttpGateway::new(
        config.server.bind_addr,
        limiter,
        config.server.exempt_patterns(),
    );
    gateway.serve_with_shutdown(shutdown_signal()).await?;

    info!("Tiergate stopped");
    Ok(())
}

/// Periodically drop expired in-memory counters.
fn spawn_purge(store: Arc<MemoryCounterStore>, interval_secs: u64) {
    if interval_secs == 0 {
        return;
    }
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        loop {
            ticker.tick().await;
            let purged = store.purge_expired(Utc::now());
            if purged > 0 {
                debug!(purged, remaining = store.len(), "Purged expired counters");
            }
        }
    });
}

/// Periodically re-read the limits from the configuration file.
///
/// A file that fails to load or validate leaves the active rules in place.
fn spawn_reload(registry: Arc<RuleRegistry>, path: PathBuf, interval_secs: u64) {
    if interval_secs == 0 {
        return;
    }
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        // The first tick fires immediately and the rules were just loaded.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(err) =
                registry.reload(|| ServiceConfig::load(Some(path.as_path()))?.limits.to_rule_set())
            {
                debug!(error = %err, path = %path.display(), "Rule reload skipped");
            }
        }
    });
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
