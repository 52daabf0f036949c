//! mailwise: request optimization middleware for a costly, rate-limited
//! email analysis backend.
//!
//! Callers go through [`Optimizer::analyze`], which answers from the
//! [`FingerprintCache`] when it can, asks the [`AdmissionLimiter`] before
//! spending quota, and hands admitted work to the [`BatchCoalescer`] so
//! concurrent requests share one backend call. Every step reports to the
//! [`MetricsDashboard`].

pub mod adapters;
pub mod batch;
pub mod cache;
pub mod config;
pub mod error;
pub mod limiter;
pub mod metrics;
pub mod optimizer;
pub mod server;

pub use batch::{BatchCoalescer, BatchExecutor, BatchRequest, FnExecutor, PendingResult};
pub use cache::FingerprintCache;
pub use config::{AdmissionPolicy, Config, OptimizerConfig};
pub use error::{AnalyzeError, BatchError, ConfigError};
pub use limiter::{Admission, AdmissionLimiter};
pub use metrics::MetricsDashboard;
pub use optimizer::{AnalyzeOutcome, Fingerprint, Optimizer};
