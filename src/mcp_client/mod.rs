//! MCP Client: orchestration core for Model Context Protocol servers.
//!
//! This module handles:
//! - Spawning, pooling and terminating stdio MCP server processes
//! - JSON-RPC 2.0 over stdio, HTTP, SSE and WebSocket transports
//! - Tool discovery with cooldown, validation and a TTL'd registry
//! - Health sweeps, zombie reaping and failure escalation
//! - Failure classification, retry and "requires attention" parking
//! - OAuth token refresh for remote sources
//!
//! [`McpClient`] wires everything together; the components are public so
//! hosts can assemble their own.

pub mod client;
pub mod codec;
pub mod config;
pub mod discovery;
pub mod error_handler;
pub mod errors;
pub mod events;
pub mod health;
pub mod oauth;
pub mod pool;
pub mod process;
pub mod registry;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testing;

// Re-exports for convenience
pub use client::{McpClient, McpClientBuilder};
pub use config::{
    load_config, AuthConfig, ConfigProvider, InMemorySources, OrchestratorConfig, Settings, SourceConfig,
    TransportKind,
};
pub use discovery::ToolDiscoveryScheduler;
pub use error_handler::{Disposition, ErrorHandler, ErrorKind, RetryPolicy};
pub use errors::McpError;
pub use events::{AuditEntry, AuditSink, AuditStatus, BroadcastEventBus, EventSink, McpEvent};
pub use health::{HealthMonitor, HealthRecord};
pub use pool::ProcessPool;
pub use process::{ProcessHandle, ProcessHandleView, ProcessStatus};
pub use registry::ToolRegistry;
pub use transport::{ConnectionTransport, SourceConnector};
pub use types::{ToolCallResult, ToolDefinition, UserContext};
