//! Stdio transport over a pooled server process.
//!
//! The transport never spawns anything itself: [`StdioTransport::connect`]
//! asks the [`ProcessPool`] for a handle and performs the MCP `initialize`
//! handshake if the handle is still `starting`. After that, requests are
//! only accepted while the handle is `ready`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::super::codec;
use super::super::config::{SourceConfig, TransportKind};
use super::super::errors::McpError;
use super::super::pool::ProcessPool;
use super::super::process::{ProcessHandle, ProcessStatus};
use super::super::types::{InitializeResult, JsonRpcRequest, JsonRpcResponse, MCP_PROTOCOL_VERSION};
use super::ConnectionTransport;

/// Stderr is truncated to this many chars in error messages.
const STDERR_SNIPPET_CHARS: usize = 2000;

pub struct StdioTransport {
    handle: Arc<ProcessHandle>,
}

impl StdioTransport {
    /// Wrap an existing handle. Requests fail with `NotReady` until it is `ready`.
    pub fn new(handle: Arc<ProcessHandle>) -> Self {
        Self { handle }
    }

    /// Acquire a process for `source` and make sure it has completed its handshake.
    pub async fn connect(
        pool: &ProcessPool,
        source: &SourceConfig,
        init_timeout: Duration,
    ) -> Result<Self, McpError> {
        let handle = pool.acquire(source).await?;

        // Concurrent callers for a fresh process wait here for one handshake.
        let _init = handle.init_lock().lock().await;

        match handle.status() {
            ProcessStatus::Ready => return Ok(Self::new(Arc::clone(&handle))),
            ProcessStatus::Starting => {}
            status => {
                return Err(McpError::NotReady {
                    source_id: source.id.clone(),
                    status,
                })
            }
        }

        match initialize(&handle, init_timeout).await {
            Ok(init) => {
                handle.set_initialized(init.capabilities, init.server_info.clone());
                handle.update_status(ProcessStatus::Ready)?;

                tracing::info!(
                    source = %source.id,
                    server = ?init.server_info.and_then(|s| s.name),
                    protocol = ?init.protocol_version,
                    "MCP server initialized"
                );
                Ok(Self::new(Arc::clone(&handle)))
            }
            Err(e) => {
                // Let the drain task catch up with whatever the server printed
                tokio::time::sleep(Duration::from_millis(50)).await;
                let stderr_ctx = truncate_stderr(handle.stderr_tail());
                if !stderr_ctx.is_empty() {
                    tracing::warn!(
                        source = %source.id,
                        stderr = %stderr_ctx,
                        "server stderr captured on failure"
                    );
                }

                let _ = handle.update_status(ProcessStatus::Error);
                if let Err(term_err) = pool.terminate(&handle).await {
                    tracing::warn!(source = %source.id, error = %term_err, "failed to terminate after init failure");
                }

                Err(with_stderr(e, &stderr_ctx))
            }
        }
    }

    pub fn handle(&self) -> &Arc<ProcessHandle> {
        &self.handle
    }
}

/// Run the `initialize` request and the `notifications/initialized` follow-up.
async fn initialize(handle: &ProcessHandle, timeout: Duration) -> Result<InitializeResult, McpError> {
    let source_id = handle.configuration_id();
    let request = codec::build_request(
        "initialize",
        Some(json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            }
        })),
        None,
    )?;

    let result = codec::into_result(handle.exchange(&request, timeout).await?)?;
    let init: InitializeResult = serde_json::from_value(result)
        .map_err(|e| McpError::protocol(source_id, format!("failed to parse initialize response: {e}")))?;

    let initialized = codec::build_notification("notifications/initialized", None)?;
    handle.notify(&initialized, timeout).await?;

    Ok(init)
}

fn truncate_stderr(mut stderr: String) -> String {
    if stderr.len() > STDERR_SNIPPET_CHARS {
        let mut cut = STDERR_SNIPPET_CHARS;
        while !stderr.is_char_boundary(cut) {
            cut -= 1;
        }
        stderr.truncate(cut);
        stderr.push_str("...(truncated)");
    }
    stderr
}

/// Append server stderr to the reason of a connection-level error.
fn with_stderr(err: McpError, stderr: &str) -> McpError {
    if stderr.is_empty() {
        return err;
    }
    let suffix = format!(" | stderr: {}", stderr.trim());
    match err {
        McpError::Connection { source_id, reason } => McpError::Connection {
            source_id,
            reason: format!("{reason}{suffix}"),
        },
        McpError::Protocol { source_id, reason } => McpError::Protocol {
            source_id,
            reason: format!("{reason}{suffix}"),
        },
        other => other,
    }
}

#[async_trait]
impl ConnectionTransport for StdioTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    fn source_id(&self) -> &str {
        self.handle.configuration_id()
    }

    async fn send_request(&self, request: JsonRpcRequest, timeout: Duration) -> Result<JsonRpcResponse, McpError> {
        let status = self.handle.status();
        if status != ProcessStatus::Ready {
            return Err(McpError::NotReady {
                source_id: self.source_id().to_string(),
                status,
            });
        }
        let response = self.handle.exchange(&request, timeout).await?;
        self.handle.mark_used();
        Ok(response)
    }

    async fn discover(&self, timeout: Duration) -> Result<Vec<Value>, McpError> {
        let request = codec::build_request("tools/list", None, None)?;
        let result = codec::into_result(self.send_request(request, timeout).await?)?;
        let (tools, next) = super::split_tools_page(self.source_id(), result)?;
        if next.is_some() {
            tracing::debug!(source = self.source_id(), "ignoring nextCursor from stdio server");
        }
        self.handle.set_tools(tools.clone());
        Ok(tools)
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use crate::mcp_client::config::PoolSettings;

    /// Answers every request line with `{"ok": true}` under the same id.
    const ECHO_RESPONDER: &str =
        r#"s/.*"id":\("[^"]*"\).*/{"jsonrpc":"2.0","id":\1,"result":{"ok":true}}/"#;

    fn pool() -> ProcessPool {
        ProcessPool::new(PoolSettings {
            grace_period_ms: 300,
            ..PoolSettings::default()
        })
    }

    #[tokio::test]
    async fn test_request_to_starting_handle_is_not_ready() {
        let pool = pool();
        let handle = pool
            .acquire(&SourceConfig::stdio("echo", "echo", &["hi"]))
            .await
            .unwrap();
        assert_eq!(handle.status(), ProcessStatus::Starting);

        let transport = StdioTransport::new(Arc::clone(&handle));
        let request = codec::build_request("tools/list", None, None).unwrap();
        let err = transport
            .send_request(request, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            McpError::NotReady {
                status: ProcessStatus::Starting,
                ..
            }
        ));

        pool.terminate(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_performs_handshake() {
        let pool = pool();
        let source = SourceConfig::stdio("sed", "sed", &["-u", ECHO_RESPONDER]);

        let transport = StdioTransport::connect(&pool, &source, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(transport.handle().status(), ProcessStatus::Ready);

        // Second connect reuses the ready handle.
        let again = StdioTransport::connect(&pool, &source, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(Arc::ptr_eq(transport.handle(), again.handle()));

        pool.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_concurrent_requests_are_serialized() {
        let pool = pool();
        let source = SourceConfig::stdio("sed", "sed", &["-u", ECHO_RESPONDER]);
        let transport = Arc::new(
            StdioTransport::connect(&pool, &source, Duration::from_secs(5))
                .await
                .unwrap(),
        );

        let mut tasks = Vec::new();
        for i in 0..16 {
            let transport = Arc::clone(&transport);
            tasks.push(tokio::spawn(async move {
                let request = codec::build_request("ping", None, Some(format!("req-{i}").as_str().into())).unwrap();
                let id = request.id.clone();
                let response = transport.send_request(request, Duration::from_secs(5)).await.unwrap();
                assert_eq!(response.id, id);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        pool.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_handshake_failure_terminates_process() {
        let pool = pool();
        let source = SourceConfig::stdio("mute", "sh", &["-c", "echo booting >&2; exit 3"]);

        let err = StdioTransport::connect(&pool, &source, Duration::from_secs(2))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, McpError::Connection { .. }), "got {err:?}");
        assert!(pool.get("mute").await.is_none());
    }

    #[tokio::test]
    async fn test_crash_after_handshake_consumes_restart_budget() {
        let pool = ProcessPool::new(PoolSettings {
            max_restarts: 2,
            grace_period_ms: 300,
            ..PoolSettings::default()
        });
        // Answers `initialize`, then exits after reading the initialized notification
        let source = SourceConfig::stdio("crashy", "sed", &["-u", "-e", ECHO_RESPONDER, "-e", "2q"]);

        let mut spawns = 0;
        let err = loop {
            match StdioTransport::connect(&pool, &source, Duration::from_secs(5)).await {
                Ok(transport) => {
                    spawns += 1;
                    assert!(spawns <= 3, "restart budget never ran out");
                    let request = codec::build_request("ping", None, None).unwrap();
                    assert!(transport.send_request(request, Duration::from_secs(2)).await.is_err());
                    pool.terminate(transport.handle()).await.unwrap();
                }
                Err(e) => break e,
            }
        };

        assert!(matches!(err, McpError::RestartExhausted { attempts: 2, .. }), "got {err:?}");
        assert_eq!(spawns, 3);
    }

    #[tokio::test]
    async fn test_served_request_resets_restart_budget() {
        let pool = pool();
        let source = SourceConfig::stdio("sed", "sed", &["-u", ECHO_RESPONDER]);

        let first = StdioTransport::connect(&pool, &source, Duration::from_secs(5)).await.unwrap();
        pool.terminate(first.handle()).await.unwrap();

        let second = StdioTransport::connect(&pool, &source, Duration::from_secs(5)).await.unwrap();
        assert_eq!(second.handle().restart_count(), 1, "handshake alone does not reset");
        let request = codec::build_request("ping", None, None).unwrap();
        second.send_request(request, Duration::from_secs(5)).await.unwrap();
        pool.terminate(second.handle()).await.unwrap();

        let third = StdioTransport::connect(&pool, &source, Duration::from_secs(5)).await.unwrap();
        assert_eq!(third.handle().restart_count(), 0);
        pool.shutdown_all().await;
    }

    #[test]
    fn test_truncate_stderr() {
        let long = "x".repeat(STDERR_SNIPPET_CHARS + 10);
        let truncated = truncate_stderr(long);
        assert!(truncated.ends_with("...(truncated)"));
        assert_eq!(truncated.len(), STDERR_SNIPPET_CHARS + "...(truncated)".len());
    }
}
