//! mailwise daemon: serves the optimization middleware over a local Unix
//! socket and forwards admitted work, in batches, to an OpenAI-compatible
//! analysis backend.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

use mailwise::adapters::openai::OpenAiBatchBackend;
use mailwise::adapters::{EmailAnalysis, EmailAnalysisRequest};
use mailwise::cache::store::{CacheStore, SqliteCacheStore};
use mailwise::server::Server;
use mailwise::{BatchExecutor, Config, Optimizer};

/// Set to `json` for machine-readable logs.
const LOG_FORMAT_ENV: &str = "MAILWISE_LOG_FORMAT";

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "mailwise=info".into());
    let json = std::env::var(LOG_FORMAT_ENV).map(|v| v.eq_ignore_ascii_case("json")).unwrap_or(false);

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown requested"),
        Err(e) => warn!(error = %e, "Could not listen for Ctrl-C, running until killed"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("mailwise v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load().context("Failed to load configuration")?;
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("Failed to create {}", config.data_dir.display()))?;

    // ── Analysis backend ────────────────────────────────────────────
    let backend: Arc<dyn BatchExecutor<EmailAnalysisRequest, EmailAnalysis>> = Arc::new(
        OpenAiBatchBackend::new(config.backend.clone()).context("Failed to configure analysis backend")?,
    );
    info!(base_url = %config.backend.base_url, model = %config.backend.model, "Analysis backend ready");

    // ── Durable cache ───────────────────────────────────────────────
    // A store that cannot be opened is not fatal: the cache runs in memory.
    let store: Option<Box<dyn CacheStore>> = match &config.cache_db_path {
        Some(path) => match SqliteCacheStore::open(path) {
            Ok(store) => {
                info!(path = %path.display(), "Cache store opened");
                Some(Box::new(store) as Box<dyn CacheStore>)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %format!("{:#}", e), "Cache store unavailable, running memory-only");
                None
            }
        },
        None => None,
    };

    // ── Middleware ──────────────────────────────────────────────────
    let optimizer = Arc::new(
        Optimizer::new(&config.optimizer, backend, store).context("Invalid optimizer configuration")?,
    );
    info!(
        cache_max_size = config.optimizer.cache_max_size,
        rpm = config.optimizer.requests_per_minute,
        batch_size = config.optimizer.batch_size,
        batch_timeout_ms = config.optimizer.batch_timeout_ms,
        policy = ?config.optimizer.admission_policy,
        "Optimizer ready"
    );

    // ── Server ──────────────────────────────────────────────────────
    let server = Server::new(
        config.socket_path.clone(),
        Arc::clone(&optimizer),
        config.metrics_pulse_interval,
    );
    let served = server.run(shutdown_signal()).await;

    // Drain pending batches even if the listener failed
    optimizer.shutdown().await;
    info!(summary = %optimizer.metrics().summary(), "mailwise stopped");

    served
}
