//! Orchestration core for MCP (Model Context Protocol) tool servers.
//!
//! See [`mcp_client::McpClient`] for the entry point and [`logging`] for
//! tracing setup.

pub mod logging;
pub mod mcp_client;

pub use mcp_client::{McpClient, McpError};
