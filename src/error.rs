//! Error types for the optimization middleware.
//!
//! Only two things are exceptional here: a failed batch execution and a
//! malformed configuration. Cache misses, cache degradation and admission
//! denials are ordinary return values and never show up in these enums.

use std::path::PathBuf;
use thiserror::Error;

/// Configuration rejected at construction time.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for `{field}`: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

/// Failure delivered to every request of an affected batch.
///
/// `Clone` because one executor failure fans out to every waiting caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BatchError {
    #[error("batch executor failed: {0}")]
    Executor(String),

    #[error("batch executor returned {actual} results for {expected} requests")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("coalescer is shut down")]
    Closed,

    #[error("batch was dropped before producing a result")]
    Abandoned,
}

impl BatchError {
    pub fn executor(err: impl std::fmt::Display) -> Self {
        Self::Executor(err.to_string())
    }
}

/// Failure surfaced by `Optimizer::analyze`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnalyzeError {
    #[error(transparent)]
    Batch(#[from] BatchError),
}
