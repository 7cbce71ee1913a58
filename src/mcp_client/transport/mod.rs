//! Connection transports.
//!
//! One [`ConnectionTransport`] implementation per transport kind. Every
//! call carries an explicit deadline and fails with the shared error
//! taxonomy in [`McpError`]:
//!
//! - unreachable or reset: `Connection`
//! - deadline exceeded: `Timeout`
//! - 401/403: `Authentication`
//! - 429: `RateLimited` (with `Retry-After` when present)
//! - malformed envelope: `Protocol`
//!
//! Transports never refresh credentials themselves; an expired OAuth token
//! surfaces as `Authentication` and the refresher job picks it up.

pub mod auth;
pub mod http;
pub mod sse;
pub mod stdio;
pub mod websocket;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};

use super::codec;
use super::config::{SourceConfig, TransportKind, TransportSettings};
use super::errors::McpError;
use super::oauth::CredentialStore;
use super::pool::ProcessPool;
use super::types::{JsonRpcRequest, JsonRpcResponse};

pub use auth::AuthPlacement;
pub use http::HttpTransport;
pub use sse::{SseCancelHandle, SseEvent, SseEventStream, SseTransport};
pub use stdio::StdioTransport;
pub use websocket::WebSocketTransport;

/// Stop following `nextCursor` after this many pages.
const MAX_DISCOVERY_PAGES: usize = 20;

// ─── ConnectionTransport ─────────────────────────────────────────────────────

/// Sends JSON-RPC requests to one source.
#[async_trait]
pub trait ConnectionTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn source_id(&self) -> &str;

    /// Send `request` and return the correlated response, bounded by `timeout`.
    async fn send_request(&self, request: JsonRpcRequest, timeout: Duration) -> Result<JsonRpcResponse, McpError>;

    /// Round-trip a `ping` and report how long it took. An error-shaped
    /// reply counts as a failed check.
    async fn test_connection(&self, timeout: Duration) -> Result<Duration, McpError> {
        let started = Instant::now();
        let request = codec::build_request("ping", None, None)?;
        let response = self.send_request(request, timeout).await?;
        check_ping(response)?;
        Ok(started.elapsed())
    }

    /// Enumerate the source's tools as raw candidates, following pagination.
    async fn discover(&self, timeout: Duration) -> Result<Vec<Value>, McpError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_DISCOVERY_PAGES {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let request = codec::build_request("tools/list", params, None)?;
            let result = codec::into_result(self.send_request(request, timeout).await?)?;

            let (page, next) = split_tools_page(self.source_id(), result)?;
            tools.extend(page);

            match next {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(tools),
            }
        }

        tracing::warn!(
            source = self.source_id(),
            pages = MAX_DISCOVERY_PAGES,
            "tools/list pagination limit reached"
        );
        Ok(tools)
    }

    /// Release any held connection. The transport stays usable and reconnects lazily.
    async fn close(&self) {}
}

/// Judge a `ping` reply: any JSON-RPC error object is a failed check.
pub(crate) fn check_ping(response: JsonRpcResponse) -> Result<(), McpError> {
    match response.error {
        Some(err) => Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        }),
        None => Ok(()),
    }
}

/// Pull the tool array and next cursor out of a `tools/list` result.
///
/// Accepts `{"tools": [...], "nextCursor": "..."}` or a bare array.
fn split_tools_page(source_id: &str, result: Value) -> Result<(Vec<Value>, Option<String>), McpError> {
    match result {
        Value::Array(tools) => Ok((tools, None)),
        Value::Object(mut obj) => {
            let next = obj
                .get("nextCursor")
                .and_then(Value::as_str)
                .map(str::to_string);
            match obj.remove("tools") {
                Some(Value::Array(tools)) => Ok((tools, next)),
                Some(_) => Err(McpError::protocol(source_id, "'tools' is not an array")),
                None => Err(McpError::protocol(source_id, "tools/list result has no 'tools' field")),
            }
        }
        _ => Err(McpError::protocol(source_id, "tools/list result is not an object or array")),
    }
}

// ─── SourceConnector ─────────────────────────────────────────────────────────

/// Produces a ready-to-use transport for a source.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    async fn connect(&self, source: &SourceConfig) -> Result<Arc<dyn ConnectionTransport>, McpError>;

    /// Drop any cached connection for the source.
    async fn disconnect(&self, source_id: &str);
}

/// Connector for the four built-in transport kinds.
///
/// Stdio sources go through the [`ProcessPool`]; network sources share one
/// HTTP client. WebSocket connections are cached per source and reused.
pub struct DefaultConnector {
    pool: Arc<ProcessPool>,
    credentials: Arc<CredentialStore>,
    http: reqwest::Client,
    settings: TransportSettings,
    sockets: tokio::sync::Mutex<HashMap<String, Arc<WebSocketTransport>>>,
}

impl DefaultConnector {
    pub fn new(
        pool: Arc<ProcessPool>,
        credentials: Arc<CredentialStore>,
        settings: TransportSettings,
    ) -> Result<Self, McpError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
            .build()
            .map_err(|e| McpError::Config {
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            pool,
            credentials,
            http,
            settings,
            sockets: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    pub fn pool(&self) -> &Arc<ProcessPool> {
        &self.pool
    }
}

#[async_trait]
impl SourceConnector for DefaultConnector {
    async fn connect(&self, source: &SourceConfig) -> Result<Arc<dyn ConnectionTransport>, McpError> {
        let auth = auth::resolve(source, &self.credentials);

        match source.transport {
            TransportKind::Stdio => {
                let init_timeout = Duration::from_secs(self.settings.init_timeout_secs);
                let transport = StdioTransport::connect(&self.pool, source, init_timeout).await?;
                Ok(Arc::new(transport))
            }
            TransportKind::Http => {
                let endpoint = source.require_endpoint()?;
                Ok(Arc::new(HttpTransport::new(&source.id, endpoint, self.http.clone(), auth)))
            }
            TransportKind::Sse => {
                let endpoint = source.require_endpoint()?;
                Ok(Arc::new(SseTransport::new(&source.id, endpoint, self.http.clone(), auth)))
            }
            TransportKind::Websocket => {
                let endpoint = source.require_endpoint()?;
                let mut sockets = self.sockets.lock().await;

                // Reuse the socket unless the endpoint or credentials changed.
                if let Some(existing) = sockets.get(&source.id) {
                    if existing.endpoint() == endpoint && existing.auth() == auth.as_ref() {
                        return Ok(Arc::clone(existing) as Arc<dyn ConnectionTransport>);
                    }
                    existing.close().await;
                }

                let connect_timeout = Duration::from_secs(self.settings.connect_timeout_secs);
                let transport = Arc::new(WebSocketTransport::new(&source.id, endpoint, auth, connect_timeout));
                sockets.insert(source.id.clone(), Arc::clone(&transport));
                Ok(transport)
            }
        }
    }

    async fn disconnect(&self, source_id: &str) {
        let socket = self.sockets.lock().await.remove(source_id);
        if let Some(socket) = socket {
            socket.close().await;
        }
        if let Some(handle) = self.pool.get(source_id).await {
            if let Err(e) = self.pool.terminate(&handle).await {
                tracing::warn!(source = source_id, error = %e, "failed to terminate process on disconnect");
            }
        }
    }
}

// ─── Shared Error Mapping ────────────────────────────────────────────────────

/// Map a non-success HTTP status onto the error taxonomy.
pub(crate) fn status_error(source_id: &str, status: u16, retry_after: Option<&str>) -> McpError {
    match status {
        401 | 403 => McpError::Authentication {
            source_id: source_id.to_string(),
            reason: format!("HTTP {status}"),
        },
        429 => McpError::RateLimited {
            source_id: source_id.to_string(),
            retry_after: retry_after.and_then(parse_retry_after),
        },
        500..=599 => McpError::connection(source_id, format!("HTTP {status}")),
        _ => McpError::protocol(source_id, format!("unexpected HTTP status {status}")),
    }
}

/// Parse a `Retry-After` value: delta-seconds or an HTTP date.
pub(crate) fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let at = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta = at.with_timezone(&chrono::Utc) - chrono::Utc::now();
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}

/// Map a reqwest failure onto the error taxonomy.
pub(crate) fn map_reqwest_error(source_id: &str, e: reqwest::Error, timeout: Duration) -> McpError {
    if e.is_timeout() {
        McpError::timeout(source_id, timeout)
    } else if e.is_connect() {
        McpError::connection(source_id, format!("unreachable: {e}"))
    } else if e.is_decode() {
        McpError::protocol(source_id, format!("failed to decode body: {e}"))
    } else {
        McpError::connection(source_id, e.to_string())
    }
}

/// Check a response answers the request that was sent.
pub(crate) fn ensure_correlated(
    source_id: &str,
    request: &JsonRpcRequest,
    response: JsonRpcResponse,
) -> Result<JsonRpcResponse, McpError> {
    // A null id is only legitimate on an error the server could not attribute.
    if response.id == request.id || (response.id.is_none() && response.error.is_some()) {
        Ok(response)
    } else {
        Err(McpError::protocol(
            source_id,
            format!(
                "response id {:?} does not match request id {:?}",
                response.id, request.id
            ),
        ))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
