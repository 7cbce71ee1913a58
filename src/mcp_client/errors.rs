//! MCP orchestration error types.

use std::time::Duration;

use thiserror::Error;

use super::process::ProcessStatus;

/// Errors that can occur while spawning, talking to, or supervising MCP sources.
#[derive(Debug, Error)]
pub enum McpError {
    /// The transport could not reach the source, or the connection was reset.
    #[error("connection to '{source_id}' failed: {reason}")]
    Connection {
        source_id: String,
        reason: String,
    },

    /// A request exceeded its deadline.
    #[error("request to '{source_id}' timed out after {timeout_ms}ms")]
    Timeout {
        source_id: String,
        timeout_ms: u64,
    },

    /// Credentials were rejected (401/403 or equivalent).
    #[error("authentication rejected by '{source_id}': {reason}")]
    Authentication {
        source_id: String,
        reason: String,
    },

    /// The source throttled us (429 or equivalent).
    #[error("rate limited by '{source_id}'{}", format_retry_after(.retry_after))]
    RateLimited {
        source_id: String,
        retry_after: Option<Duration>,
    },

    /// Malformed or semantically invalid JSON-RPC traffic.
    #[error("protocol error from '{source_id}': {reason}")]
    Protocol {
        source_id: String,
        reason: String,
    },

    /// The pool is at capacity and cannot spawn another process.
    #[error("process pool exhausted ({max_processes} processes running)")]
    PoolExhausted {
        max_processes: usize,
    },

    /// A process handle was asked to make a transition outside its state table.
    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition {
        from: ProcessStatus,
        to: ProcessStatus,
    },

    /// Malformed tool or configuration data.
    #[error("validation failed: {reason}")]
    Validation {
        reason: String,
    },

    /// A caller passed arguments that violate an API contract.
    #[error("invalid argument: {reason}")]
    InvalidArgument {
        reason: String,
    },

    /// The stdio process has not completed its handshake yet.
    #[error("source '{source_id}' is not ready (status: {status})")]
    NotReady {
        source_id: String,
        status: ProcessStatus,
    },

    /// The OS refused to start the server process.
    #[error("failed to spawn '{source_id}': {reason}")]
    SpawnFailed {
        source_id: String,
        reason: String,
    },

    /// The server answered with a JSON-RPC error object.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// No configuration exists for the requested source.
    #[error("unknown source: '{source_id}'")]
    UnknownSource {
        source_id: String,
    },

    /// The source exists but is switched off.
    #[error("source '{source_id}' is disabled")]
    SourceDisabled {
        source_id: String,
    },

    /// The source was parked after a non-retriable failure.
    #[error("source '{source_id}' requires attention: {reason}")]
    RequiresAttention {
        source_id: String,
        reason: String,
    },

    /// Respawning a stdio source was refused after too many attempts.
    #[error("source '{source_id}' failed after {attempts} restart attempts")]
    RestartExhausted {
        source_id: String,
        attempts: u32,
    },

    /// Configuration loading error.
    #[error("config error: {reason}")]
    Config {
        reason: String,
    },
}

impl McpError {
    /// The source this error relates to, when it carries one.
    pub fn source_id(&self) -> Option<&str> {
        match self {
            McpError::Connection { source_id, .. }
            | McpError::Timeout { source_id, .. }
            | McpError::Authentication { source_id, .. }
            | McpError::RateLimited { source_id, .. }
            | McpError::Protocol { source_id, .. }
            | McpError::NotReady { source_id, .. }
            | McpError::SpawnFailed { source_id, .. }
            | McpError::UnknownSource { source_id }
            | McpError::SourceDisabled { source_id }
            | McpError::RequiresAttention { source_id, .. }
            | McpError::RestartExhausted { source_id, .. } => Some(source_id),
            _ => None,
        }
    }

    /// Shorthand used by the transports.
    pub(crate) fn protocol(source_id: &str, reason: impl Into<String>) -> Self {
        McpError::Protocol {
            source_id: source_id.to_string(),
            reason: reason.into(),
        }
    }

    /// Shorthand used by the transports.
    pub(crate) fn connection(source_id: &str, reason: impl Into<String>) -> Self {
        McpError::Connection {
            source_id: source_id.to_string(),
            reason: reason.into(),
        }
    }

    /// Shorthand used by the transports.
    pub(crate) fn timeout(source_id: &str, timeout: Duration) -> Self {
        McpError::Timeout {
            source_id: source_id.to_string(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

fn format_retry_after(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(" (retry after {}s)", d.as_secs()),
        None => String::new(),
    }
}

impl From<serde_yaml::Error> for McpError {
    fn from(e: serde_yaml::Error) -> Self {
        McpError::Config {
            reason: format!("failed to parse YAML: {e}"),
        }
    }
}
