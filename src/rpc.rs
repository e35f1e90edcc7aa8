//! Unix-domain-socket read surface: line-delimited JSON-RPC 2.0.
//!
//! One request per line, one response per line. Stale socket files are
//! detected with a short dial probe and removed; a live listener on the
//! path is a startup error.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::task::TaskTracker;

use crate::model::QueryOpts;
use crate::store::{Store, StoreError};

/// Maximum accepted request line.
const MAX_LINE_BYTES: usize = 10 * 1024 * 1024;
/// Dial timeout when probing an existing socket file.
const STALE_PROBE_TIMEOUT: Duration = Duration::from_millis(500);
/// How long `stop` waits for connection handlers to drain.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

// JSON-RPC 2.0 error codes.
const CODE_PARSE_ERROR: i64 = -32700;
const CODE_METHOD_NOT_FOUND: i64 = -32601;
const CODE_INVALID_PARAMS: i64 = -32602;
const CODE_INTERNAL_ERROR: i64 = -32603;
const CODE_STORE_ERROR: i64 = -32000;
const CODE_OVERLOADED: i64 = -32001;

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("another instance is already listening on {}", .0.display())]
    AlreadyListening(PathBuf),

    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

pub struct RpcServer {
    socket_path: PathBuf,
    shutdown_tx: watch::Sender<bool>,
    accept_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    tracker: TaskTracker,
    stopped: AtomicBool,
}

impl RpcServer {
    /// Bind the socket and start accepting connections.
    pub async fn start(store: Arc<Store>, socket_path: impl Into<PathBuf>) -> Result<Self, RpcError> {
        let socket_path = socket_path.into();

        if let Some(parent) = socket_path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        if tokio::fs::try_exists(&socket_path).await.unwrap_or(false) {
            match tokio::time::timeout(STALE_PROBE_TIMEOUT, UnixStream::connect(&socket_path)).await
            {
                Ok(Ok(_)) => return Err(RpcError::AlreadyListening(socket_path)),
                _ => {
                    tracing::warn!(path = %socket_path.display(), "removing stale socket");
                    tokio::fs::remove_file(&socket_path).await?;
                }
            }
        }

        let listener = UnixListener::bind(&socket_path)?;
        tracing::info!(path = %socket_path.display(), "rpc server listening");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tracker = TaskTracker::new();
        let accept_handle = tokio::spawn(accept_loop(
            listener,
            store,
            tracker.clone(),
            shutdown_rx,
        ));

        Ok(Self {
            socket_path,
            shutdown_tx,
            accept_handle: std::sync::Mutex::new(Some(accept_handle)),
            tracker,
            stopped: AtomicBool::new(false),
        })
    }

    /// Close the listener and tracked connections, wait for handlers to
    /// drain, remove the socket file. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);

        let accept = self
            .accept_handle
            .lock()
            .expect("accept handle mutex poisoned")
            .take();
        if let Some(handle) = accept {
            let _ = handle.await;
        }

        self.tracker.close();
        if tokio::time::timeout(DRAIN_TIMEOUT, self.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!("rpc connection handlers did not drain in time");
        }

        if let Err(e) = tokio::fs::remove_file(&self.socket_path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(error = %e, "failed to remove socket file");
        }
        tracing::info!("rpc server stopped");
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

async fn accept_loop(
    listener: UnixListener,
    store: Arc<Store>,
    tracker: TaskTracker,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    tracker.spawn(handle_connection(
                        stream,
                        store.clone(),
                        shutdown_rx.clone(),
                    ));
                }
                Err(e) => {
                    // Transient accept errors must not kill the loop.
                    tracing::warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

async fn handle_connection(
    stream: UnixStream,
    store: Arc<Store>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_BYTES));

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            line = framed.next() => {
                let line = match line {
                    None => break,
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "connection read error");
                        break;
                    }
                    Some(Ok(line)) => line,
                };
                if line.trim().is_empty() {
                    continue;
                }
                let response = dispatch(&store, &line).await;
                let text = serde_json::to_string(&response).unwrap_or_else(|_| {
                    r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32603,"message":"encoding failed"}}"#
                        .to_string()
                });
                if framed.send(text).await.is_err() {
                    break;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

enum MethodError {
    Unknown,
    InvalidParams(serde_json::Error),
    Store(StoreError),
    Encode(serde_json::Error),
}

impl From<StoreError> for MethodError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

fn ok_response(id: Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

fn err_response(id: Value, code: i64, message: impl Into<String>) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message.into()}})
}

/// Parse one request line and route it to the read API.
pub(crate) async fn dispatch(store: &Store, line: &str) -> Value {
    let request: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => return err_response(Value::Null, CODE_PARSE_ERROR, format!("parse error: {e}")),
    };
    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let Some(method) = request.get("method").and_then(Value::as_str) else {
        return err_response(id, CODE_METHOD_NOT_FOUND, "missing method");
    };
    let params = request
        .get("params")
        .cloned()
        .unwrap_or_else(|| Value::Object(Default::default()));

    match call_method(store, method, params).await {
        Ok(result) => ok_response(id, result),
        Err(MethodError::Unknown) => {
            err_response(id, CODE_METHOD_NOT_FOUND, format!("unknown method: {method}"))
        }
        Err(MethodError::InvalidParams(e)) => {
            err_response(id, CODE_INVALID_PARAMS, format!("invalid params: {e}"))
        }
        Err(MethodError::Store(e)) if e.is_overload() => {
            err_response(id, CODE_OVERLOADED, e.wire_message())
        }
        Err(MethodError::Store(e)) => err_response(id, CODE_STORE_ERROR, e.wire_message()),
        Err(MethodError::Encode(e)) => {
            err_response(id, CODE_INTERNAL_ERROR, format!("encoding failed: {e}"))
        }
    }
}

// ---------------------------------------------------------------------------
// Method table
// ---------------------------------------------------------------------------

fn default_limit() -> i64 {
    10
}

#[derive(Debug, Default, Deserialize)]
struct OptsParams {
    #[serde(default, alias = "Opts")]
    opts: QueryOpts,
}

#[derive(Debug, Deserialize)]
struct LimitParams {
    #[serde(default = "default_limit", alias = "Limit")]
    limit: i64,
    #[serde(default, alias = "Opts")]
    opts: QueryOpts,
}

#[derive(Debug, Deserialize)]
struct KeyParams {
    #[serde(alias = "Key")]
    key: String,
    #[serde(default = "default_limit", alias = "Limit")]
    limit: i64,
}

#[derive(Debug, Deserialize)]
struct WindowParams {
    /// Window in seconds; defaults to 3600.
    #[serde(default, alias = "Window")]
    window: Option<u64>,
    #[serde(default, alias = "Opts")]
    opts: QueryOpts,
}

#[derive(Debug, Deserialize)]
struct SeverityParams {
    #[serde(alias = "Severity")]
    severity: String,
    #[serde(default = "default_limit", alias = "Limit")]
    limit: i64,
    #[serde(default, alias = "Opts")]
    opts: QueryOpts,
}

#[derive(Debug, Deserialize)]
struct RecentParams {
    #[serde(default = "default_limit", alias = "Limit")]
    limit: i64,
    #[serde(default, alias = "App")]
    app: Option<String>,
    #[serde(default, alias = "SeverityLevels")]
    severity_levels: Vec<String>,
    #[serde(default, alias = "MessagePattern")]
    message_pattern: Option<String>,
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, MethodError> {
    serde_json::from_value(params).map_err(MethodError::InvalidParams)
}

fn encode<T: serde::Serialize>(value: T) -> Result<Value, MethodError> {
    serde_json::to_value(value).map_err(MethodError::Encode)
}

async fn call_method(store: &Store, method: &str, params: Value) -> Result<Value, MethodError> {
    match method {
        "TotalLogCount" => {
            let p: OptsParams = parse_params(params)?;
            encode(store.total_log_count(&p.opts).await?)
        }
        "TotalLogBytes" => {
            let p: OptsParams = parse_params(params)?;
            encode(store.total_log_bytes(&p.opts).await?)
        }
        "TopWords" => {
            let p: LimitParams = parse_params(params)?;
            encode(store.top_words(p.limit, &p.opts).await?)
        }
        "TopAttributes" => {
            let p: LimitParams = parse_params(params)?;
            encode(store.top_attributes(p.limit, &p.opts).await?)
        }
        "TopAttributeKeys" => {
            let p: LimitParams = parse_params(params)?;
            encode(store.top_attribute_keys(p.limit, &p.opts).await?)
        }
        "AttributeKeyValues" => {
            let p: KeyParams = parse_params(params)?;
            encode(store.attribute_key_values(&p.key, p.limit).await?)
        }
        "SeverityCounts" => {
            let p: OptsParams = parse_params(params)?;
            encode(store.severity_counts(&p.opts).await?)
        }
        "SeverityCountsByMinute" => {
            let p: WindowParams = parse_params(params)?;
            let window = p.window.map(Duration::from_secs);
            encode(store.severity_counts_by_minute(window, &p.opts).await?)
        }
        "TopHosts" => {
            let p: LimitParams = parse_params(params)?;
            encode(store.top_hosts(p.limit, &p.opts).await?)
        }
        "TopServices" => {
            let p: LimitParams = parse_params(params)?;
            encode(store.top_services(p.limit, &p.opts).await?)
        }
        "TopServicesBySeverity" => {
            let p: SeverityParams = parse_params(params)?;
            encode(
                store
                    .top_services_by_severity(&p.severity, p.limit, &p.opts)
                    .await?,
            )
        }
        "ListApps" => encode(store.list_apps().await?),
        "RecentLogsFiltered" => {
            let p: RecentParams = parse_params(params)?;
            encode(
                store
                    .recent_logs_filtered(
                        p.limit,
                        p.app.as_deref(),
                        &p.severity_levels,
                        p.message_pattern.as_deref(),
                    )
                    .await?,
            )
        }
        _ => Err(MethodError::Unknown),
    }
}
