//! Outbound events and the tool-invocation audit trail.
//!
//! The orchestrator only publishes; delivery to UI, pub/sub or storage is
//! up to whoever implements [`EventSink`] and [`AuditSink`].

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

// ─── Events ──────────────────────────────────────────────────────────────────

/// A named notification for external listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum McpEvent {
    /// Discovery replaced a source's tool list.
    ToolsUpdated {
        source_id: String,
        tool_count: usize,
        tool_names: Vec<String>,
    },
    /// A process or connection failed a health check.
    ServerUnhealthy {
        source_id: String,
        consecutive_failures: u32,
    },
    /// Result of a server-level health pass.
    GlobalHealth {
        healthy_count: usize,
        unhealthy_count: usize,
        /// Healthy share in percent; 100 when nothing was checked.
        percentage: f64,
    },
    /// A source was parked and needs human action (usually re-authentication).
    SourceRequiresAttention { source_id: String, reason: String },
}

impl McpEvent {
    /// Topic name for pub/sub style consumers.
    pub fn name(&self) -> &'static str {
        match self {
            McpEvent::ToolsUpdated { .. } => "tools_updated",
            McpEvent::ServerUnhealthy { .. } => "server_unhealthy",
            McpEvent::GlobalHealth { .. } => "global_health",
            McpEvent::SourceRequiresAttention { .. } => "source_requires_attention",
        }
    }
}

/// Receives orchestrator events. Must not block.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: McpEvent);
}

/// Fan-out bus on a tokio broadcast channel.
///
/// Publishing with no subscribers is not an error; lagging subscribers lose
/// the oldest events.
pub struct BroadcastEventBus {
    sender: broadcast::Sender<McpEvent>,
}

impl BroadcastEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<McpEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventSink for BroadcastEventBus {
    fn publish(&self, event: McpEvent) {
        tracing::debug!(event = event.name(), "publishing MCP event");
        let _ = self.sender.send(event);
    }
}

// ─── Audit ───────────────────────────────────────────────────────────────────

/// Outcome of an audited invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Success,
    Failure,
    Timeout,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditStatus::Success => "success",
            AuditStatus::Failure => "failure",
            AuditStatus::Timeout => "timeout",
        }
    }
}

/// One tool invocation, as handed to the audit sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub user_id: Option<String>,
    pub request_id: Option<String>,
    pub source_id: String,
    pub tool_name: String,
    pub request_payload: serde_json::Value,
    pub response_payload: Option<serde_json::Value>,
    pub status: AuditStatus,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub recorded_at: DateTime<Utc>,
}

/// Persists audit entries. Failures are the sink's problem; the invocation result stands.
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: AuditEntry);
}

/// Writes audit entries to the `mcp_orchestrator::audit` tracing target.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, entry: AuditEntry) {
        tracing::info!(
            target: "mcp_orchestrator::audit",
            user = ?entry.user_id,
            source = %entry.source_id,
            tool = %entry.tool_name,
            status = entry.status.as_str(),
            duration_ms = entry.duration_ms,
            error = ?entry.error,
            "tool invocation"
        );
    }
}

/// Keeps entries in memory. Useful for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditSink {
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, entry: AuditEntry) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }
}
