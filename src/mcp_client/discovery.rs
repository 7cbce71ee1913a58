//! Tool discovery scheduler.
//!
//! Decides when a source's tools are (re)discovered, runs the discovery
//! through the source's transport with the shared retry policy, and feeds
//! validated, normalised tools into the [`ToolRegistry`].
//!
//! A per-source cooldown record is taken *before* the transport call, so
//! concurrent non-forced requests for the same source collapse into one.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::watch;

use super::config::{ConfigProvider, DiscoverySettings, SourceConfig};
use super::error_handler::{Disposition, ErrorHandler, ErrorKind};
use super::errors::McpError;
use super::events::{EventSink, McpEvent};
use super::health::wait_or_shutdown;
use super::registry::ToolRegistry;
use super::transport::SourceConnector;
use super::types::ToolDefinition;

// ─── Scheduler ───────────────────────────────────────────────────────────────

pub struct ToolDiscoveryScheduler {
    provider: Arc<dyn ConfigProvider>,
    connector: Arc<dyn SourceConnector>,
    registry: Arc<ToolRegistry>,
    errors: Arc<ErrorHandler>,
    events: Arc<dyn EventSink>,
    settings: DiscoverySettings,
    request_timeout: Duration,
    /// Source id → end of its cooldown window.
    cooldowns: Mutex<HashMap<String, Instant>>,
}

impl ToolDiscoveryScheduler {
    pub fn new(
        provider: Arc<dyn ConfigProvider>,
        connector: Arc<dyn SourceConnector>,
        registry: Arc<ToolRegistry>,
        errors: Arc<ErrorHandler>,
        events: Arc<dyn EventSink>,
        settings: DiscoverySettings,
        request_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            connector,
            registry,
            errors,
            events,
            settings,
            request_timeout,
            cooldowns: Mutex::new(HashMap::new()),
        }
    }

    fn cooldown(&self) -> Duration {
        Duration::from_secs(self.settings.cooldown_secs)
    }

    /// Take the cooldown slot for a source. `false` if another discovery
    /// happened within the window and `force` is not set.
    fn claim_cooldown(&self, source_id: &str, force: bool) -> bool {
        let now = Instant::now();
        let mut cooldowns = self.cooldowns.lock().unwrap_or_else(PoisonError::into_inner);
        cooldowns.retain(|_, until| *until > now);

        if !force && cooldowns.contains_key(source_id) {
            return false;
        }
        cooldowns.insert(source_id.to_string(), now + self.cooldown());
        true
    }

    /// Forget the cooldown so the next request goes to the source.
    pub fn reset_cooldown(&self, source_id: &str) {
        self.cooldowns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(source_id);
    }

    /// Discover a source's tools.
    ///
    /// Without `force`, a source in its cooldown window is answered from the
    /// registry and a source that requires attention is refused.
    pub async fn discover(&self, source_id: &str, force: bool) -> Result<Vec<ToolDefinition>, McpError> {
        let source = self.provider.source(source_id).ok_or_else(|| McpError::UnknownSource {
            source_id: source_id.to_string(),
        })?;
        if !source.enabled {
            return Err(McpError::SourceDisabled {
                source_id: source_id.to_string(),
            });
        }

        if !force {
            if let Some(reason) = self.errors.requires_attention(source_id) {
                return Err(McpError::RequiresAttention {
                    source_id: source_id.to_string(),
                    reason,
                });
            }
            if !self.claim_cooldown(source_id, false) {
                tracing::debug!(source = source_id, "discovery in cooldown, serving cached tools");
                return Ok(self.registry.get(source_id));
            }
        } else {
            self.claim_cooldown(source_id, true);
        }

        self.run(&source).await
    }

    /// Discover every enabled source. Sources needing attention are skipped.
    pub async fn discover_all(&self, force: bool) -> Vec<(String, Result<usize, McpError>)> {
        let purged = self.registry.purge_expired();
        if purged > 0 {
            tracing::debug!(purged, "dropped expired registry entries");
        }

        let sources: Vec<SourceConfig> = self.provider.sources().into_iter().filter(|s| s.enabled).collect();

        let runs = sources.iter().map(|source| async move {
            let outcome = self.discover(&source.id, force).await.map(|tools| tools.len());
            (source.id.clone(), outcome)
        });
        futures::future::join_all(runs).await
    }

    /// Retry loop around one discovery.
    async fn run(&self, source: &SourceConfig) -> Result<Vec<ToolDefinition>, McpError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.fetch(source).await {
                Ok(raw) => return Ok(self.accept(source, raw)),
                Err(err) => err,
            };

            let kind = ErrorKind::classify(&err);
            match self.errors.disposition(&err, attempt) {
                Disposition::Retry { delay } => {
                    tracing::warn!(
                        source = %source.id,
                        attempt,
                        kind = kind.as_str(),
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "discovery failed, retrying"
                    );
                    if matches!(kind, ErrorKind::Connection | ErrorKind::Timeout) {
                        // Drop the dead process/socket so the retry starts clean
                        self.connector.disconnect(&source.id).await;
                    }
                    tokio::time::sleep(delay).await;
                }
                Disposition::Disable => {
                    self.registry.invalidate(&source.id);
                    let reason = err.to_string();
                    if self.errors.mark_requires_attention(&source.id, &reason) {
                        self.events.publish(McpEvent::SourceRequiresAttention {
                            source_id: source.id.clone(),
                            reason,
                        });
                    }
                    return Err(err);
                }
                Disposition::Surface => {
                    if kind.is_transient() {
                        tracing::warn!(
                            source = %source.id,
                            attempts = attempt,
                            error = %err,
                            "discovery failed, keeping cached tools"
                        );
                    } else {
                        tracing::warn!(source = %source.id, error = %err, "discovery failed, cache invalidated");
                        self.registry.invalidate(&source.id);
                    }
                    return Err(err);
                }
            }
        }
    }

    async fn fetch(&self, source: &SourceConfig) -> Result<Vec<Value>, McpError> {
        let timeout = source
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.request_timeout);
        let transport = self.connector.connect(source).await?;
        transport.discover(timeout).await
    }

    /// Validate, normalise and store a successful discovery.
    fn accept(&self, source: &SourceConfig, raw: Vec<Value>) -> Vec<ToolDefinition> {
        let tools = normalize_tools(source, &raw, Utc::now(), &self.settings.schema_version);
        let dropped = raw.len() - tools.len();

        self.registry.put(&source.id, tools.clone());
        self.errors.clear(&source.id);
        self.events.publish(McpEvent::ToolsUpdated {
            source_id: source.id.clone(),
            tool_count: tools.len(),
            tool_names: tools.iter().map(|t| t.name.clone()).collect(),
        });

        tracing::info!(
            source = %source.id,
            tools = tools.len(),
            dropped,
            "tool discovery complete"
        );
        tools
    }

    /// Periodic discovery pass until `shutdown` flips to `true`.
    pub async fn run_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.settings.interval_secs.max(1));
        loop {
            for (source_id, outcome) in self.discover_all(false).await {
                match outcome {
                    Ok(_) => {}
                    Err(McpError::RequiresAttention { .. }) => {
                        tracing::debug!(source = %source_id, "skipping source that requires attention");
                    }
                    Err(e) => tracing::debug!(source = %source_id, error = %e, "scheduled discovery failed"),
                }
            }

            if !wait_or_shutdown(interval, &mut shutdown).await {
                break;
            }
        }
        tracing::debug!("discovery loop stopped");
    }
}

// ─── Validation & Normalisation ──────────────────────────────────────────────

/// Check one raw candidate. Errors describe why it is dropped.
pub fn validate_candidate(candidate: &Value) -> Result<(), McpError> {
    let obj = candidate.as_object().ok_or_else(|| McpError::Validation {
        reason: "tool candidate is not an object".into(),
    })?;

    let non_blank = |field: &str| {
        obj.get(field)
            .and_then(Value::as_str)
            .is_some_and(|s| !s.trim().is_empty())
    };
    if !non_blank("name") {
        return Err(McpError::Validation {
            reason: "tool name is missing or blank".into(),
        });
    }
    if !non_blank("description") {
        return Err(McpError::Validation {
            reason: "tool description is missing or blank".into(),
        });
    }

    // `null` counts as absent, like a missing field
    if let Some(schema) = obj.get("inputSchema").filter(|v| !v.is_null()) {
        let is_object_schema = schema
            .as_object()
            .and_then(|s| s.get("type"))
            .and_then(Value::as_str)
            == Some("object");
        if !is_object_schema {
            return Err(McpError::Validation {
                reason: "inputSchema must be an object schema with type \"object\"".into(),
            });
        }
    }

    Ok(())
}

/// Turn a validated candidate into a [`ToolDefinition`] stamped with source metadata.
pub fn normalize_candidate(
    candidate: &Value,
    source: &SourceConfig,
    discovered_at: DateTime<Utc>,
    schema_version: &str,
) -> Result<ToolDefinition, McpError> {
    validate_candidate(candidate)?;

    let text = |field: &str| {
        candidate
            .get(field)
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string())
            .unwrap_or_default()
    };
    let schema = |field: &str| {
        candidate
            .get(field)
            .filter(|v| !v.is_null())
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()))
    };

    Ok(ToolDefinition {
        name: text("name"),
        description: text("description"),
        input_schema: schema("inputSchema"),
        output_schema: schema("outputSchema"),
        source_id: source.id.clone(),
        source_name: source.display_name().to_string(),
        discovered_at,
        schema_version: schema_version.to_string(),
    })
}

/// Normalise a batch. Invalid candidates and repeated names are dropped, not fatal.
pub fn normalize_tools(
    source: &SourceConfig,
    raw: &[Value],
    discovered_at: DateTime<Utc>,
    schema_version: &str,
) -> Vec<ToolDefinition> {
    let mut seen = HashSet::new();
    let mut tools = Vec::with_capacity(raw.len());

    for (index, candidate) in raw.iter().enumerate() {
        match normalize_candidate(candidate, source, discovered_at, schema_version) {
            Ok(tool) => {
                if seen.insert(tool.name.clone()) {
                    tools.push(tool);
                } else {
                    tracing::warn!(source = %source.id, tool = %tool.name, "dropping duplicate tool name");
                }
            }
            Err(e) => {
                tracing::warn!(source = %source.id, index, error = %e, "dropping invalid tool candidate");
            }
        }
    }

    tools
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::config::{InMemorySources, TransportKind};
    use crate::mcp_client::error_handler::RetryPolicy;
    use crate::mcp_client::testing::{MockConnector, MockTransport, RecordingSink};
    use serde_json::json;

    struct Fixture {
        scheduler: ToolDiscoveryScheduler,
        transport: Arc<MockTransport>,
        registry: Arc<ToolRegistry>,
        errors: Arc<ErrorHandler>,
        events: Arc<RecordingSink>,
        connector: Arc<MockConnector>,
    }

    fn fixture() -> Fixture {
        fixture_with(ToolRegistry::default())
    }

    fn fixture_with(registry: ToolRegistry) -> Fixture {
        let source = SourceConfig::remote("github", TransportKind::Http, "https://mcp.example.test");
        let provider = Arc::new(InMemorySources::new([source]));
        let transport = Arc::new(MockTransport::new("github"));
        let connector = Arc::new(MockConnector::default());
        connector.add(Arc::clone(&transport));

        let settings = DiscoverySettings {
            retry_delay_ms: 1,
            backoff_unit_ms: 1,
            ..DiscoverySettings::default()
        };
        let registry = Arc::new(registry);
        let errors = Arc::new(ErrorHandler::new(RetryPolicy::from(&settings)));
        let events = Arc::new(RecordingSink::default());

        let scheduler = ToolDiscoveryScheduler::new(
            provider,
            Arc::clone(&connector) as Arc<dyn SourceConnector>,
            Arc::clone(&registry),
            Arc::clone(&errors),
            Arc::clone(&events) as Arc<dyn EventSink>,
            settings,
            Duration::from_secs(5),
        );

        Fixture {
            scheduler,
            transport,
            registry,
            errors,
            events,
            connector,
        }
    }

    #[tokio::test]
    async fn test_malformed_candidates_are_dropped() {
        let f = fixture();
        f.transport.push_result(json!({"tools": [
            {"name": "search", "description": "Search issues"},
            {"name": "", "description": "bad"}
        ]}));

        let tools = f.scheduler.discover("github", false).await.unwrap();
        assert_eq!(tools.len(), 1);

        let cached = f.registry.get("github");
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].name, "search");
        assert_eq!(cached[0].input_schema, json!({}));
        assert_eq!(cached[0].schema_version, "1.0");
        assert_eq!(cached[0].source_id, "github");

        let events = f.events.events();
        assert!(matches!(
            events.as_slice(),
            [McpEvent::ToolsUpdated { tool_count: 1, .. }]
        ));
    }

    #[tokio::test]
    async fn test_cooldown_collapses_requests() {
        let f = fixture();
        f.transport.push_result(json!({"tools": [{"name": "a", "description": "A"}]}));
        f.transport.push_result(json!({"tools": [{"name": "b", "description": "B"}]}));

        f.scheduler.discover("github", false).await.unwrap();
        let second = f.scheduler.discover("github", false).await.unwrap();
        assert_eq!(f.transport.calls(), 1);
        assert_eq!(second[0].name, "a", "served from cache");

        let forced = f.scheduler.discover("github", true).await.unwrap();
        assert_eq!(f.transport.calls(), 2);
        assert_eq!(forced[0].name, "b");
    }

    #[tokio::test]
    async fn test_concurrent_requests_hit_transport_once() {
        let f = fixture();
        f.transport.push_result(json!({"tools": []}));
        f.transport.push_result(json!({"tools": []}));

        let (a, b) = tokio::join!(
            f.scheduler.discover("github", false),
            f.scheduler.discover("github", false)
        );
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(f.transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_authentication_error_parks_source() {
        let f = fixture();
        f.registry.put("github", vec![]);
        f.transport.push_failure(McpError::Authentication {
            source_id: "github".into(),
            reason: "HTTP 401".into(),
        });

        let err = f.scheduler.discover("github", true).await.unwrap_err();
        assert!(matches!(err, McpError::Authentication { .. }));
        assert_eq!(f.transport.calls(), 1, "authentication errors are not retried");
        assert!(!f.registry.contains("github"));
        assert!(f.errors.requires_attention("github").is_some());

        // Next three scheduled passes do not touch the transport
        for _ in 0..3 {
            f.scheduler.reset_cooldown("github");
            let err = f.scheduler.discover("github", false).await.unwrap_err();
            assert!(matches!(err, McpError::RequiresAttention { .. }));
        }
        assert_eq!(f.transport.calls(), 1);

        assert!(f
            .events
            .events()
            .iter()
            .any(|e| matches!(e, McpEvent::SourceRequiresAttention { .. })));
    }

    #[tokio::test]
    async fn test_transient_errors_retry_then_keep_cache() {
        let f = fixture();
        f.transport.push_result(json!({"tools": [{"name": "a", "description": "A"}]}));
        f.scheduler.discover("github", false).await.unwrap();

        for _ in 0..3 {
            f.transport.push_failure(McpError::connection("github", "reset"));
        }
        let err = f.scheduler.discover("github", true).await.unwrap_err();
        assert!(matches!(err, McpError::Connection { .. }));
        assert_eq!(f.transport.calls(), 4, "one success plus three attempts");
        assert_eq!(f.connector.disconnects(), 2, "connection dropped between attempts");
        assert_eq!(f.registry.get("github").len(), 1, "stale cache stays available");
        assert!(f.errors.requires_attention("github").is_none());
    }

    #[tokio::test]
    async fn test_rate_limit_recovers_on_retry() {
        let f = fixture();
        f.transport.push_failure(McpError::RateLimited {
            source_id: "github".into(),
            retry_after: None,
        });
        f.transport.push_result(json!({"tools": [{"name": "a", "description": "A"}]}));

        let tools = f.scheduler.discover("github", false).await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(f.transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_protocol_error_invalidates() {
        let f = fixture();
        f.registry.put("github", vec![]);
        f.transport.push_result(json!("not a tool list"));

        let err = f.scheduler.discover("github", false).await.unwrap_err();
        assert!(matches!(err, McpError::Protocol { .. }));
        assert!(!f.registry.contains("github"));
    }

    #[tokio::test]
    async fn test_unknown_and_disabled_sources() {
        let f = fixture();
        assert!(matches!(
            f.scheduler.discover("nope", false).await,
            Err(McpError::UnknownSource { .. })
        ));
    }

    #[test]
    fn test_validate_candidate_rules() {
        assert!(validate_candidate(&json!({"name": "a", "description": "b"})).is_ok());
        assert!(validate_candidate(&json!({"name": "  ", "description": "b"})).is_err());
        assert!(validate_candidate(&json!({"name": "a"})).is_err());
        assert!(validate_candidate(&json!(["a"])).is_err());
        assert!(validate_candidate(&json!({
            "name": "a", "description": "b", "inputSchema": {"type": "array"}
        }))
        .is_err());
        assert!(validate_candidate(&json!({
            "name": "a", "description": "b", "inputSchema": {"type": "object", "properties": {}}
        }))
        .is_ok());
    }

    #[test]
    fn test_null_input_schema_means_absent() {
        let candidate = json!({"name": "a", "description": "b", "inputSchema": null});
        assert!(validate_candidate(&candidate).is_ok());

        let source = SourceConfig::remote("linear", TransportKind::Sse, "https://x.test");
        let tool = normalize_candidate(&candidate, &source, Utc::now(), "1.0").unwrap();
        assert_eq!(tool.input_schema, json!({}));
    }

    #[tokio::test]
    async fn test_scheduled_pass_purges_expired_entries() {
        let f = fixture_with(ToolRegistry::new(Duration::ZERO));
        f.registry.put("retired", vec![]);
        f.transport.push_result(json!({"tools": [{"name": "a", "description": "A"}]}));

        let outcomes = f.scheduler.discover_all(false).await;
        assert!(matches!(outcomes.as_slice(), [(id, Ok(1))] if id == "github"));
        assert!(f.registry.fingerprint("retired").is_none());
        assert_eq!(f.registry.len(), 1);
    }

    #[test]
    fn test_normalize_trims_and_dedupes() {
        let source = SourceConfig::remote("linear", TransportKind::Sse, "https://x.test");
        let raw = vec![
            json!({"name": "  search ", "description": " Find things "}),
            json!({"name": "search", "description": "dup"}),
            json!({"name": "report", "description": "R", "outputSchema": {"type": "object"}}),
        ];
        let tools = normalize_tools(&source, &raw, Utc::now(), "2.0");
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name, "search");
        assert_eq!(tools[0].description, "Find things");
        assert_eq!(tools[1].output_schema, json!({"type": "object"}));
        assert!(tools.iter().all(|t| t.schema_version == "2.0" && t.source_name == "linear"));
    }
}
