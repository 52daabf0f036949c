//! Optimization coordinator: the single `analyze` entry point.
//!
//! ```text
//!   analyze(req)
//!     ├─ cache hit ───────────────────────────────► Cached(value)
//!     ├─ admission denied (after policy) ─────────► Denied { retry_after }
//!     └─ coalescer ─► executor ─► cache write ────► Computed(value)
//! ```
//!
//! Cache hits never touch the limiter, so quota is only spent on work that
//! actually reaches the backend.

use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::batch::{BatchCoalescer, BatchExecutor};
use crate::cache::store::CacheStore;
use crate::cache::{FingerprintCache, MatchKind};
use crate::config::{AdmissionPolicy, OptimizerConfig};
use crate::error::{AnalyzeError, ConfigError};
use crate::limiter::AdmissionLimiter;
use crate::metrics::{self, MetricsDashboard};

/// How a request identifies itself to the cache.
pub trait Fingerprint {
    /// Exact cache key. Identical keys must mean identical work.
    fn cache_key(&self) -> String;

    /// Raw content compared during similarity lookup.
    fn content(&self) -> String;
}

impl Fingerprint for String {
    fn cache_key(&self) -> String {
        hex::encode(Sha256::digest(self.as_bytes()))
    }

    fn content(&self) -> String {
        self.clone()
    }
}

/// Non-error outcomes of [`Optimizer::analyze`].
#[derive(Debug, Clone, PartialEq)]
pub enum AnalyzeOutcome<R> {
    /// Served from the cache (exact or similar match).
    Cached(R),
    /// Computed by the backend in a batch and now cached.
    Computed(R),
    /// Admission refused; try again after `retry_after`.
    Denied { retry_after: Duration },
}

impl<R> AnalyzeOutcome<R> {
    pub fn into_value(self) -> Option<R> {
        match self {
            Self::Cached(v) | Self::Computed(v) => Some(v),
            Self::Denied { .. } => None,
        }
    }

    pub fn is_cached(&self) -> bool {
        matches!(self, Self::Cached(_))
    }
}

pub struct Optimizer<P, R> {
    cache: Arc<FingerprintCache<R>>,
    limiter: Arc<AdmissionLimiter>,
    coalescer: Arc<BatchCoalescer<P, R>>,
    metrics: Arc<MetricsDashboard>,
    policy: AdmissionPolicy,
    max_admission_wait: Duration,
}

impl<P, R> Optimizer<P, R>
where
    P: Fingerprint + Send + 'static,
    R: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Build every component from `config`. With a `store` the cache is
    /// mirrored to it and warmed from it. Must run inside a Tokio runtime.
    pub fn new(
        config: &OptimizerConfig,
        executor: Arc<dyn BatchExecutor<P, R>>,
        store: Option<Box<dyn CacheStore>>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let cache = match store {
            Some(store) => FingerprintCache::with_store(config.cache(), store)?,
            None => FingerprintCache::new(config.cache())?,
        };

        Ok(Self {
            cache: Arc::new(cache),
            limiter: Arc::new(AdmissionLimiter::new(config.limiter())?),
            coalescer: Arc::new(BatchCoalescer::spawn(config.batch(), executor)?),
            metrics: Arc::new(MetricsDashboard::new()),
            policy: config.admission_policy,
            max_admission_wait: config.max_admission_wait(),
        })
    }

    pub async fn analyze(&self, request: P) -> Result<AnalyzeOutcome<R>, AnalyzeError> {
        let started = Instant::now();
        let key = request.cache_key();
        let content = request.content();

        if let Some(hit) = self.cache.lookup(&key, &content) {
            self.metrics.increment(metrics::CACHE_HIT);
            if let MatchKind::Similar { score, .. } = &hit.kind {
                self.metrics.increment(metrics::CACHE_SIMILARITY_HIT);
                debug!(key = %key, score, "Served near-duplicate from cache");
            }
            return Ok(AnalyzeOutcome::Cached(hit.value));
        }

        if let Err(retry_after) = self.admit().await {
            self.metrics.increment(metrics::ADMISSION_DENIED);
            debug!(key = %key, retry_after_ms = retry_after.as_millis() as u64, "Request denied admission");
            return Ok(AnalyzeOutcome::Denied { retry_after });
        }

        let pending = self.coalescer.submit(request)?;
        match pending.wait().await {
            Ok(value) => {
                self.cache.set(key, value.clone(), &content);
                self.metrics.increment(metrics::CACHE_MISS);
                self.metrics
                    .record_metric(metrics::ANALYZE_LATENCY_MS, started.elapsed().as_secs_f64() * 1000.0);
                Ok(AnalyzeOutcome::Computed(value))
            }
            Err(e) => {
                self.metrics.increment(metrics::BATCH_FAILURE);
                warn!(key = %key, error = %e, "Analysis failed");
                Err(e.into())
            }
        }
    }

    /// Apply the admission policy. `Err` carries the wait to report.
    async fn admit(&self) -> Result<(), Duration> {
        let first = self.limiter.can_proceed();
        if first.allowed {
            return Ok(());
        }

        match self.policy {
            AdmissionPolicy::WaitAndRetry if first.wait <= self.max_admission_wait => {
                self.metrics
                    .record_metric(metrics::ADMISSION_WAIT_MS, first.wait.as_secs_f64() * 1000.0);
                tokio::time::sleep(first.wait).await;

                let retry = self.limiter.can_proceed();
                if retry.allowed {
                    Ok(())
                } else {
                    Err(retry.wait)
                }
            }
            _ => Err(first.wait),
        }
    }

    /// Drain the coalescer. Pending requests still resolve.
    pub async fn shutdown(&self) {
        self.coalescer.shutdown().await;
    }

    pub fn cache(&self) -> &Arc<FingerprintCache<R>> {
        &self.cache
    }

    pub fn limiter(&self) -> &Arc<AdmissionLimiter> {
        &self.limiter
    }

    pub fn coalescer(&self) -> &Arc<BatchCoalescer<P, R>> {
        &self.coalescer
    }

    pub fn metrics(&self) -> &Arc<MetricsDashboard> {
        &self.metrics
    }
}
