//! MCP Client: the orchestrator's public entry point.
//!
//! Wires the pool, transports, registry, discovery scheduler, health
//! monitor and OAuth refresher together and exposes the operations the
//! assistant runtime calls: discover, invoke, test, inspect.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::codec;
use super::config::{ConfigProvider, Settings, SourceConfig};
use super::discovery::ToolDiscoveryScheduler;
use super::error_handler::{AttentionRecord, Disposition, ErrorHandler, ErrorKind, RetryPolicy};
use super::errors::McpError;
use super::events::{AuditEntry, AuditSink, AuditStatus, BroadcastEventBus, EventSink, McpEvent, TracingAuditSink};
use super::health::{HealthMonitor, HealthRecord};
use super::oauth::{CredentialStore, TokenRefresher};
use super::pool::ProcessPool;
use super::process::ProcessHandleView;
use super::registry::ToolRegistry;
use super::transport::{DefaultConnector, SourceConnector};
use super::types::{ConnectionTestResult, ToolCallResult, ToolDefinition, UserContext};

// ─── Builder ─────────────────────────────────────────────────────────────────

/// Builds an [`McpClient`], optionally with custom sinks or connector.
pub struct McpClientBuilder {
    provider: Arc<dyn ConfigProvider>,
    settings: Settings,
    events: Option<Arc<dyn EventSink>>,
    audit: Option<Arc<dyn AuditSink>>,
    connector: Option<Arc<dyn SourceConnector>>,
}

impl McpClientBuilder {
    pub fn new(provider: Arc<dyn ConfigProvider>, settings: Settings) -> Self {
        Self {
            provider,
            settings,
            events: None,
            audit: None,
            connector: None,
        }
    }

    pub fn event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Replace the built-in transport selection.
    pub fn connector(mut self, connector: Arc<dyn SourceConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn build(self) -> Result<McpClient, McpError> {
        let settings = self.settings;
        let pool = Arc::new(ProcessPool::new(settings.pool.clone()));
        let credentials = Arc::new(CredentialStore::default());

        let connector: Arc<dyn SourceConnector> = match self.connector {
            Some(connector) => connector,
            None => Arc::new(DefaultConnector::new(
                Arc::clone(&pool),
                Arc::clone(&credentials),
                settings.transport.clone(),
            )?),
        };
        let events: Arc<dyn EventSink> = self
            .events
            .unwrap_or_else(|| Arc::new(BroadcastEventBus::default()));
        let audit: Arc<dyn AuditSink> = self.audit.unwrap_or_else(|| Arc::new(TracingAuditSink));

        let registry = Arc::new(ToolRegistry::new(Duration::from_secs(settings.registry.ttl_secs)));
        let errors = Arc::new(ErrorHandler::new(RetryPolicy::from(&settings.discovery)));

        let discovery = Arc::new(ToolDiscoveryScheduler::new(
            Arc::clone(&self.provider),
            Arc::clone(&connector),
            Arc::clone(&registry),
            Arc::clone(&errors),
            Arc::clone(&events),
            settings.discovery.clone(),
            Duration::from_secs(settings.transport.request_timeout_secs),
        ));
        let health = Arc::new(HealthMonitor::new(
            Arc::clone(&pool),
            Arc::clone(&self.provider),
            Arc::clone(&connector),
            Arc::clone(&errors),
            Arc::clone(&events),
            settings.health.clone(),
        ));

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(settings.transport.connect_timeout_secs))
            .build()
            .map_err(|e| McpError::Config {
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        let refresher = Arc::new(TokenRefresher::new(
            Arc::clone(&self.provider),
            Arc::clone(&credentials),
            Arc::clone(&errors),
            Arc::clone(&events),
            http,
            settings.oauth.clone(),
        ));

        Ok(McpClient {
            provider: self.provider,
            settings,
            pool,
            credentials,
            connector,
            registry,
            errors,
            events,
            audit,
            discovery,
            health,
            refresher,
            background: Mutex::new(None),
        })
    }
}

// ─── McpClient ───────────────────────────────────────────────────────────────

struct Background {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// Shared orchestrator for every configured MCP source.
pub struct McpClient {
    provider: Arc<dyn ConfigProvider>,
    settings: Settings,
    pool: Arc<ProcessPool>,
    credentials: Arc<CredentialStore>,
    connector: Arc<dyn SourceConnector>,
    registry: Arc<ToolRegistry>,
    errors: Arc<ErrorHandler>,
    events: Arc<dyn EventSink>,
    audit: Arc<dyn AuditSink>,
    discovery: Arc<ToolDiscoveryScheduler>,
    health: Arc<HealthMonitor>,
    refresher: Arc<TokenRefresher>,
    background: Mutex<Option<Background>>,
}

impl McpClient {
    /// A client with the default connector and sinks.
    pub fn new(provider: Arc<dyn ConfigProvider>, settings: Settings) -> Result<Self, McpError> {
        McpClientBuilder::new(provider, settings).build()
    }

    pub fn builder(provider: Arc<dyn ConfigProvider>, settings: Settings) -> McpClientBuilder {
        McpClientBuilder::new(provider, settings)
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn enabled_source(&self, source_id: &str) -> Result<SourceConfig, McpError> {
        let source = self.provider.source(source_id).ok_or_else(|| McpError::UnknownSource {
            source_id: source_id.to_string(),
        })?;
        if !source.enabled {
            return Err(McpError::SourceDisabled {
                source_id: source_id.to_string(),
            });
        }
        Ok(source)
    }

    // ─── Discovery ───────────────────────────────────────────────────────

    /// Discover a source's tools, honouring the cooldown unless `force` is set.
    pub async fn discover_tools(&self, source_id: &str, force: bool) -> Result<Vec<ToolDefinition>, McpError> {
        self.discovery.discover(source_id, force).await
    }

    /// Cached tools for a source, discovering them if nothing is cached.
    pub async fn available_tools(&self, source_id: &str) -> Result<Vec<ToolDefinition>, McpError> {
        if self.registry.contains(source_id) {
            return Ok(self.registry.get(source_id));
        }
        self.discovery.discover(source_id, false).await
    }

    /// Drop a source's cached tools, cooldown and attention flag so the
    /// next request goes back to the source.
    pub async fn invalidate_source(&self, source_id: &str) {
        self.registry.invalidate(source_id);
        self.discovery.reset_cooldown(source_id);
        self.errors.clear(source_id);
        self.connector.disconnect(source_id).await;
        tracing::info!(source = source_id, "source invalidated");
    }

    // ─── Invocation ──────────────────────────────────────────────────────

    /// Call a tool on a source.
    ///
    /// A JSON-RPC error from the server is an unsuccessful [`ToolCallResult`],
    /// not an `Err`. Every attempt on a known source is audited.
    pub async fn invoke_tool(
        &self,
        source_id: &str,
        tool_name: &str,
        arguments: Value,
        context: &UserContext,
    ) -> Result<ToolCallResult, McpError> {
        let source = self.enabled_source(source_id)?;
        if let Some(reason) = self.errors.requires_attention(source_id) {
            return Err(McpError::RequiresAttention {
                source_id: source_id.to_string(),
                reason,
            });
        }

        let started = Instant::now();
        let request_payload = json!({ "name": tool_name, "arguments": arguments.clone() });
        let outcome = self.call_tool(&source, tool_name, &arguments, &request_payload).await;
        let elapsed = started.elapsed().as_millis() as u64;

        let (status, response_payload, error) = match &outcome {
            Ok(result) if result.success => (AuditStatus::Success, result.result.clone(), None),
            Ok(result) => (AuditStatus::Failure, None, result.error.clone()),
            Err(e @ McpError::Timeout { .. }) => (AuditStatus::Timeout, None, Some(e.to_string())),
            Err(e) => (AuditStatus::Failure, None, Some(e.to_string())),
        };
        self.audit.record(AuditEntry {
            user_id: context.user_id.clone(),
            request_id: context.request_id.clone(),
            source_id: source_id.to_string(),
            tool_name: tool_name.to_string(),
            request_payload,
            response_payload,
            status,
            error,
            duration_ms: elapsed,
            recorded_at: Utc::now(),
        });

        let mut result = outcome?;
        result.execution_time_ms = elapsed;
        Ok(result)
    }

    async fn call_tool(
        &self,
        source: &SourceConfig,
        tool_name: &str,
        arguments: &Value,
        params: &Value,
    ) -> Result<ToolCallResult, McpError> {
        if !self.registry.contains(&source.id) {
            self.discovery.discover(&source.id, false).await?;
        }
        self.registry.validate_arguments(&source.id, tool_name, arguments)?;

        let timeout = source
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(self.settings.transport.invoke_timeout_secs));

        let response = async {
            let transport = self.connector.connect(source).await?;
            let request = codec::build_request("tools/call", Some(params.clone()), None)?;
            transport.send_request(request, timeout).await
        }
        .await;

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                self.handle_invoke_error(&source.id, &err).await;
                return Err(err);
            }
        };
        self.health.record_success(&source.id);

        let call = |success, result, error| ToolCallResult {
            source_id: source.id.clone(),
            tool_name: tool_name.to_string(),
            success,
            result,
            error,
            execution_time_ms: 0,
        };
        match codec::into_result(response) {
            Ok(result) => Ok(call(true, Some(result), None)),
            Err(McpError::ServerError { code, message, .. }) => {
                tracing::info!(source = %source.id, tool = tool_name, code, "tool call returned an error");
                Ok(call(false, None, Some(format!("[{code}] {message}"))))
            }
            Err(e) => Err(e),
        }
    }

    /// Invocations are not retried (tools may have side effects); this only
    /// parks the source or drops a broken connection.
    async fn handle_invoke_error(&self, source_id: &str, err: &McpError) {
        let kind = ErrorKind::classify(err);
        match self.errors.disposition(err, self.errors.policy().max_attempts) {
            Disposition::Disable => {
                let reason = err.to_string();
                if self.errors.mark_requires_attention(source_id, &reason) {
                    self.events.publish(McpEvent::SourceRequiresAttention {
                        source_id: source_id.to_string(),
                        reason,
                    });
                }
            }
            Disposition::Retry { .. } | Disposition::Surface => {
                if matches!(kind, ErrorKind::Connection | ErrorKind::Timeout) {
                    self.connector.disconnect(source_id).await;
                }
            }
        }
        tracing::warn!(source = source_id, kind = kind.as_str(), error = %err, "tool invocation failed");
    }

    // ─── Health ──────────────────────────────────────────────────────────

    /// Check a source with `ping`. Failures are reported, not returned.
    pub async fn test_connection(&self, source_id: &str) -> Result<ConnectionTestResult, McpError> {
        let source = self.enabled_source(source_id)?;
        let timeout = Duration::from_secs(self.settings.health.ping_timeout_secs);
        let started = Instant::now();

        let attempt = match self.connector.connect(&source).await {
            Ok(transport) => transport.test_connection(timeout).await,
            Err(e) => Err(e),
        };

        Ok(match attempt {
            Ok(elapsed) => {
                self.health.record_success(source_id);
                ConnectionTestResult {
                    healthy: true,
                    response_time_ms: elapsed.as_millis() as u64,
                    error: None,
                }
            }
            Err(e) => ConnectionTestResult {
                healthy: false,
                response_time_ms: started.elapsed().as_millis() as u64,
                error: Some(e.to_string()),
            },
        })
    }

    pub fn health_snapshot(&self) -> BTreeMap<String, HealthRecord> {
        self.health.snapshot()
    }

    pub async fn process_snapshot(&self) -> Vec<ProcessHandleView> {
        self.pool.snapshot().await
    }

    pub fn attention_snapshot(&self) -> Vec<AttentionRecord> {
        self.errors.attention_snapshot()
    }

    // ─── Background Jobs ─────────────────────────────────────────────────

    /// Spawn the discovery, health and OAuth refresh loops. Calling it again is a no-op.
    pub fn start_background(&self) {
        let mut background = self.background.lock().unwrap_or_else(PoisonError::into_inner);
        if background.is_some() {
            return;
        }

        let (shutdown, rx) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(Arc::clone(&self.discovery).run_loop(rx.clone())),
            tokio::spawn(Arc::clone(&self.health).run_process_loop(rx.clone())),
            tokio::spawn(Arc::clone(&self.health).run_server_loop(rx.clone())),
            tokio::spawn(Arc::clone(&self.refresher).run_loop(rx)),
        ];
        tracing::info!(jobs = tasks.len(), "MCP background jobs started");
        *background = Some(Background { shutdown, tasks });
    }

    /// Stop background jobs, drop connections and terminate every process.
    pub async fn shutdown(&self) {
        let background = self.background.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(background) = background {
            let _ = background.shutdown.send(true);
            for task in background.tasks {
                if let Err(e) = task.await {
                    tracing::warn!(error = %e, "background job ended abnormally");
                }
            }
        }

        for source in self.provider.sources() {
            self.connector.disconnect(&source.id).await;
        }
        self.pool.shutdown_all().await;
        tracing::info!("MCP client shut down");
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::config::{InMemorySources, TransportKind};
    use crate::mcp_client::events::MemoryAuditSink;
    use crate::mcp_client::testing::{MockConnector, MockTransport, RecordingSink};
    use crate::mcp_client::types::error_codes;

    struct Fixture {
        client: McpClient,
        transport: Arc<MockTransport>,
        audit: Arc<MemoryAuditSink>,
        events: Arc<RecordingSink>,
    }

    fn fixture(timeout_secs: Option<u64>) -> Fixture {
        let mut source = SourceConfig::remote("github", TransportKind::Http, "https://mcp.example.test");
        source.timeout_secs = timeout_secs;
        let mut disabled = SourceConfig::remote("off", TransportKind::Http, "https://off.test");
        disabled.enabled = false;

        let transport = Arc::new(MockTransport::new("github"));
        let connector = Arc::new(MockConnector::default());
        connector.add(Arc::clone(&transport));
        let audit = Arc::new(MemoryAuditSink::default());
        let events = Arc::new(RecordingSink::default());

        let client = McpClient::builder(Arc::new(InMemorySources::new([source, disabled])), Settings::default())
            .connector(connector)
            .audit_sink(Arc::clone(&audit) as Arc<dyn AuditSink>)
            .event_sink(Arc::clone(&events) as Arc<dyn EventSink>)
            .build()
            .unwrap();

        Fixture {
            client,
            transport,
            audit,
            events,
        }
    }

    fn push_catalog(transport: &MockTransport) {
        transport.push_result(json!({"tools": [{
            "name": "search",
            "description": "Search issues",
            "inputSchema": {"type": "object", "required": ["query"]}
        }]}));
    }

    fn ctx() -> UserContext {
        UserContext {
            user_id: Some("u1".into()),
            request_id: Some("r1".into()),
        }
    }

    #[tokio::test]
    async fn test_invoke_success_is_audited() {
        let f = fixture(None);
        push_catalog(&f.transport);
        f.transport.push_result(json!({"content": [{"type": "text", "text": "3 issues"}]}));

        let result = f
            .client
            .invoke_tool("github", "search", json!({"query": "bug"}), &ctx())
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.source_id, "github");

        let sent = f.transport.sent_requests();
        assert_eq!(sent[1].method, "tools/call");
        assert_eq!(sent[1].params, Some(json!({"name": "search", "arguments": {"query": "bug"}})));

        let entries = f.audit.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, AuditStatus::Success);
        assert_eq!(entries[0].user_id.as_deref(), Some("u1"));
        assert!(entries[0].response_payload.is_some());
        assert!(f.client.health_snapshot()["github"].healthy);
    }

    #[tokio::test]
    async fn test_jsonrpc_error_is_unsuccessful_result() {
        let f = fixture(None);
        push_catalog(&f.transport);
        f.transport.push_error(error_codes::INTERNAL_ERROR, "rate exceeded upstream");

        let result = f
            .client
            .invoke_tool("github", "search", json!({"query": "bug"}), &ctx())
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("rate exceeded upstream"));
        assert_eq!(f.audit.entries()[0].status, AuditStatus::Failure);
    }

    #[tokio::test]
    async fn test_missing_required_argument_never_reaches_server() {
        let f = fixture(None);
        push_catalog(&f.transport);

        let err = f
            .client
            .invoke_tool("github", "search", json!({}), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Validation { .. }));
        assert_eq!(f.transport.calls(), 1, "only the discovery call");
        assert_eq!(f.audit.entries()[0].status, AuditStatus::Failure);
    }

    #[tokio::test]
    async fn test_timeout_is_audited_as_timeout() {
        let f = fixture(Some(1));
        push_catalog(&f.transport);
        f.client.discover_tools("github", false).await.unwrap();

        f.transport.set_delay(Duration::from_secs(5));
        let err = f
            .client
            .invoke_tool("github", "search", json!({"query": "x"}), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Timeout { .. }));
        assert_eq!(f.audit.entries()[0].status, AuditStatus::Timeout);
    }

    #[tokio::test]
    async fn test_authentication_failure_parks_source() {
        let f = fixture(None);
        push_catalog(&f.transport);
        f.client.discover_tools("github", false).await.unwrap();
        f.transport.push_failure(McpError::Authentication {
            source_id: "github".into(),
            reason: "HTTP 401".into(),
        });

        let err = f
            .client
            .invoke_tool("github", "search", json!({"query": "x"}), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Authentication { .. }));
        assert_eq!(f.client.attention_snapshot().len(), 1);
        assert!(f
            .events
            .events()
            .iter()
            .any(|e| matches!(e, McpEvent::SourceRequiresAttention { .. })));

        let err = f
            .client
            .invoke_tool("github", "search", json!({"query": "x"}), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::RequiresAttention { .. }));

        f.client.invalidate_source("github").await;
        assert!(f.client.attention_snapshot().is_empty());
        assert!(!f.client.registry().contains("github"));
    }

    #[tokio::test]
    async fn test_unknown_and_disabled_sources() {
        let f = fixture(None);
        assert!(matches!(
            f.client.invoke_tool("nope", "x", json!({}), &ctx()).await,
            Err(McpError::UnknownSource { .. })
        ));
        assert!(matches!(
            f.client.test_connection("off").await,
            Err(McpError::SourceDisabled { .. })
        ));
        assert!(f.audit.entries().is_empty());
    }

    #[tokio::test]
    async fn test_available_tools_discovers_once() {
        let f = fixture(None);
        push_catalog(&f.transport);

        assert_eq!(f.client.available_tools("github").await.unwrap().len(), 1);
        assert_eq!(f.client.available_tools("github").await.unwrap().len(), 1);
        assert_eq!(f.transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_connection_check_reports_failures() {
        let f = fixture(None);
        f.transport.push_result(json!({}));
        let ok = f.client.test_connection("github").await.unwrap();
        assert!(ok.healthy);
        assert!(ok.error.is_none());

        f.transport.push_error(error_codes::INTERNAL_ERROR, "down");
        let failed = f.client.test_connection("github").await.unwrap();
        assert!(!failed.healthy);
        assert!(failed.error.is_some());
    }

    #[tokio::test]
    async fn test_background_jobs_stop_on_shutdown() {
        let f = fixture(None);
        push_catalog(&f.transport);
        f.client.start_background();
        f.client.start_background();

        tokio::time::timeout(Duration::from_secs(10), f.client.shutdown())
            .await
            .expect("shutdown should finish");
        assert!(f.client.process_snapshot().await.is_empty());
    }
}
