//! Unix socket JSON-RPC server in front of the optimizer.
//!
//! Listens on `<data_dir>/mailwise.sock` for newline-delimited JSON-RPC 2.0
//! requests. Local-only; there is no TCP listener.
//!
//! Methods:
//! - `mw.analyze`            analyze one email (cache → admission → batch)
//! - `mw.metrics`            dashboard summary statistics
//! - `mw.metrics.reset`      clear every metric series
//! - `mw.cache.stats`        fingerprint cache counters
//! - `mw.cache.clear`        drop every cached analysis, in memory and on disk
//! - `mw.limiter.status`     per-window usage and remaining quota
//! - `mw.coalescer.status`   coalescer state and counters
//! - `mw.health`             liveness plus a compact status digest

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tracing::{debug, info, warn};

use crate::adapters::{EmailAnalysis, EmailAnalysisRequest};
use crate::optimizer::{AnalyzeOutcome, Optimizer};

pub type EmailOptimizer = Optimizer<EmailAnalysisRequest, EmailAnalysis>;

/// Per-request read bound. Longer lines are discarded and answered with
/// -32600; the connection stays open.
const MAX_REQUEST_BYTES: u64 = 1_048_576;

// ── JSON-RPC Types ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    #[allow(dead_code)]
    jsonrpc: String,
    method: String,
    params: Option<serde_json::Value>,
    id: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct JsonRpcResponse {
    jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
    id: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct JsonRpcError {
    code: i32,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
}

impl JsonRpcResponse {
    fn success(id: Option<serde_json::Value>, result: serde_json::Value) -> Self {
        Self { jsonrpc: "2.0".into(), result: Some(result), error: None, id }
    }

    fn error(id: Option<serde_json::Value>, code: i32, message: String) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            result: None,
            error: Some(JsonRpcError { code, message, data: None }),
            id,
        }
    }

    fn rate_limited(id: Option<serde_json::Value>, retry_after: Duration) -> Self {
        let retry_after_ms = retry_after.as_millis() as u64;
        Self {
            jsonrpc: "2.0".into(),
            result: None,
            error: Some(JsonRpcError {
                code: -32002,
                message: format!("Rate limited, retry after {} ms", retry_after_ms),
                data: Some(serde_json::json!({ "retry_after_ms": retry_after_ms })),
            }),
            id,
        }
    }

    /// Serialize `value` as the result, or report why it could not be.
    fn serialized<T: Serialize>(id: Option<serde_json::Value>, value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(v) => Self::success(id, v),
            Err(e) => Self::error(id, -32603, format!("Internal error: {}", e)),
        }
    }
}

// ── Server ──────────────────────────────────────────────────────────

pub struct Server {
    socket_path: PathBuf,
    optimizer: Arc<EmailOptimizer>,
    pulse_interval: Duration,
    started_at: Instant,
}

impl Server {
    pub fn new(socket_path: PathBuf, optimizer: Arc<EmailOptimizer>, pulse_interval: Duration) -> Self {
        Self {
            socket_path,
            optimizer,
            pulse_interval,
            started_at: Instant::now(),
        }
    }

    /// Serve until `shutdown` resolves, then remove the socket file.
    /// Draining the optimizer is left to the caller.
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        // Remove stale socket file
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)
                .with_context(|| format!("Failed to remove stale socket {}", self.socket_path.display()))?;
        }

        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("Failed to bind {}", self.socket_path.display()))?;

        // Restrict socket permissions (owner-only)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o600))?;
        }

        info!(socket = %self.socket_path.display(), "mailwise listening");

        let pulse = {
            let optimizer = Arc::clone(&self.optimizer);
            let every = self.pulse_interval;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(every);
                interval.tick().await; // skip the immediate tick
                loop {
                    interval.tick().await;
                    let cache = optimizer.cache().get_stats();
                    let coalescer = optimizer.coalescer().status();
                    info!(
                        cache_size = cache.size,
                        cache_degraded = cache.degraded,
                        batches = coalescer.batches_executed,
                        failed_batches = coalescer.batches_failed,
                        summary = %optimizer.metrics().summary(),
                        "Metrics pulse"
                    );
                }
            })
        };

        tokio::pin!(shutdown);
        let served = loop {
            let stream = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => break Err::<(), _>(e).context("Accept failed"),
                },
                _ = &mut shutdown => break Ok(()),
            };

            let optimizer = Arc::clone(&self.optimizer);
            let started_at = self.started_at;
            tokio::spawn(async move {
                let (reader, mut writer) = stream.into_split();
                let mut reader = BufReader::new(reader);
                let mut buf = Vec::new();

                loop {
                    let response = match read_request(&mut reader, &mut buf).await {
                        Ok(Incoming::Eof) => break,
                        Ok(Incoming::Line(line)) => {
                            if line.trim().is_empty() {
                                continue;
                            }
                            handle_request(&line, &optimizer, started_at).await
                        }
                        Ok(Incoming::TooLarge) => {
                            warn!(limit = MAX_REQUEST_BYTES, "Oversized request discarded");
                            JsonRpcResponse::error(
                                None,
                                -32600,
                                format!("Invalid request: larger than {} bytes", MAX_REQUEST_BYTES),
                            )
                        }
                        Err(e) => {
                            debug!(error = %e, "Connection read failed");
                            break;
                        }
                    };
                    let resp_json = match serde_json::to_string(&response) {
                        Ok(s) => s,
                        Err(e) => {
                            warn!(error = %e, "Failed to serialize response");
                            break;
                        }
                    };
                    if writer.write_all(resp_json.as_bytes()).await.is_err() { break; }
                    if writer.write_all(b"\n").await.is_err() { break; }
                }
            });
        };

        pulse.abort();
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            warn!(error = %e, socket = %self.socket_path.display(), "Failed to remove socket file");
        }
        info!("mailwise stopped accepting connections");
        served
    }
}

// ── Framing ─────────────────────────────────────────────────────────

enum Incoming {
    Line(String),
    TooLarge,
    Eof,
}

/// Read one newline-terminated request of at most `MAX_REQUEST_BYTES`.
/// An oversized request is skipped through its newline.
async fn read_request<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<Incoming>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let n = (&mut *reader).take(MAX_REQUEST_BYTES + 1).read_until(b'\n', buf).await?;
    if n == 0 {
        return Ok(Incoming::Eof);
    }
    if n as u64 > MAX_REQUEST_BYTES && buf.last() != Some(&b'\n') {
        skip_line(reader).await?;
        return Ok(Incoming::TooLarge);
    }
    Ok(Incoming::Line(String::from_utf8_lossy(buf).into_owned()))
}

async fn skip_line<R>(reader: &mut R) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(());
        }
        match available.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                reader.consume(pos + 1);
                return Ok(());
            }
            None => {
                let len = available.len();
                reader.consume(len);
            }
        }
    }
}

// ── Request Handling ────────────────────────────────────────────────

async fn handle_request(raw: &str, optimizer: &EmailOptimizer, started_at: Instant) -> JsonRpcResponse {
    let req: JsonRpcRequest = match serde_json::from_str(raw) {
        Ok(r) => r,
        Err(e) => return JsonRpcResponse::error(None, -32700, format!("Parse error: {}", e)),
    };

    let params = req.params.unwrap_or(serde_json::Value::Null);

    match req.method.as_str() {
        "mw.analyze" => handle_analyze(req.id, params, optimizer).await,
        "mw.metrics" => JsonRpcResponse::serialized(req.id, &optimizer.metrics().get_metrics()),
        "mw.metrics.reset" => {
            optimizer.metrics().reset();
            info!("Metrics reset");
            JsonRpcResponse::success(req.id, serde_json::json!({ "reset": true }))
        }
        "mw.cache.stats" => JsonRpcResponse::serialized(req.id, &optimizer.cache().get_stats()),
        "mw.cache.clear" => {
            let dropped = optimizer.cache().len();
            optimizer.cache().clear();
            JsonRpcResponse::success(req.id, serde_json::json!({ "cleared": dropped }))
        }
        "mw.limiter.status" => JsonRpcResponse::serialized(req.id, &optimizer.limiter().get_status()),
        "mw.coalescer.status" => JsonRpcResponse::serialized(req.id, &optimizer.coalescer().status()),
        "mw.health" => handle_health(req.id, optimizer, started_at),
        _ => JsonRpcResponse::error(req.id, -32601, format!("Unknown method: {}", req.method)),
    }
}

async fn handle_analyze(
    id: Option<serde_json::Value>,
    params: serde_json::Value,
    optimizer: &EmailOptimizer,
) -> JsonRpcResponse {
    let request: EmailAnalysisRequest = match serde_json::from_value(params) {
        Ok(r) => r,
        Err(e) => return JsonRpcResponse::error(id, -32602, format!("Invalid params: {}", e)),
    };
    let message_id = request.message_id.clone();

    match optimizer.analyze(request).await {
        Ok(AnalyzeOutcome::Denied { retry_after }) => JsonRpcResponse::rate_limited(id, retry_after),
        Ok(outcome) => {
            let cached = outcome.is_cached();
            match outcome.into_value() {
                Some(analysis) => JsonRpcResponse::success(
                    id,
                    serde_json::json!({
                        "message_id": message_id,
                        "cached": cached,
                        "analysis": analysis,
                    }),
                ),
                None => JsonRpcResponse::error(id, -32603, "Internal error: empty outcome".into()),
            }
        }
        Err(e) => JsonRpcResponse::error(id, -32000, e.to_string()),
    }
}

fn handle_health(id: Option<serde_json::Value>, optimizer: &EmailOptimizer, started_at: Instant) -> JsonRpcResponse {
    let cache = optimizer.cache().get_stats();
    let coalescer = optimizer.coalescer().status();
    JsonRpcResponse::success(
        id,
        serde_json::json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_secs": started_at.elapsed().as_secs(),
            "cache": {
                "size": cache.size,
                "capacity": cache.capacity,
                "degraded": cache.degraded,
            },
            "coalescer": coalescer.state,
        }),
    )
}
