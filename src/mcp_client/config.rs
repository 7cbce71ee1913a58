//! Source definitions and orchestrator settings.
//!
//! Loaded from a YAML (or JSON) file with two top-level keys:
//!
//! ```yaml
//! settings:
//!   pool: { max_processes: 8 }
//! sources:
//!   github:
//!     transport: stdio
//!     command: npx
//!     args: ["-y", "@modelcontextprotocol/server-github"]
//!     env: { GITHUB_TOKEN: "{{GITHUB_TOKEN}}" }
//!   linear:
//!     transport: http
//!     endpoint: https://mcp.linear.app/rpc
//!     auth: { kind: bearer_token, token: "..." }
//! ```
//!
//! The core never writes configuration back; the surrounding application
//! owns persistence and hands sources in through [`ConfigProvider`].

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::McpError;

// ─── Source Configuration ────────────────────────────────────────────────────

/// How the core talks to a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Stdio,
    Http,
    Sse,
    #[serde(alias = "ws")]
    Websocket,
}

/// Credentials attached to every request for a source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthConfig {
    #[default]
    None,
    ApiKey {
        key: String,
        /// Header carrying the key. Defaults to `X-API-Key` when neither
        /// `header` nor `query_param` is set.
        #[serde(default)]
        header: Option<String>,
        #[serde(default)]
        query_param: Option<String>,
    },
    BearerToken {
        token: String,
    },
    #[serde(rename = "oauth")]
    OAuth {
        access_token: String,
        #[serde(default)]
        refresh_token: Option<String>,
        #[serde(default)]
        expires_at: Option<DateTime<Utc>>,
        #[serde(default)]
        token_url: Option<String>,
        #[serde(default)]
        client_id: Option<String>,
        #[serde(default)]
        client_secret: Option<String>,
    },
}

/// One logical MCP source: a spawn command or a network endpoint plus credentials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Filled from the map key when loaded from a file.
    #[serde(default)]
    pub id: String,
    /// Human-readable name; defaults to the id.
    #[serde(default)]
    pub name: String,
    pub transport: TransportKind,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub owner_id: Option<String>,
    /// Per-source override of the request deadline.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_true() -> bool {
    true
}

impl SourceConfig {
    fn bare(id: &str, transport: TransportKind) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            transport,
            auth: AuthConfig::None,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            endpoint: None,
            enabled: true,
            owner_id: None,
            timeout_secs: None,
        }
    }

    /// A stdio source running `command args...`.
    pub fn stdio(id: &str, command: &str, args: &[&str]) -> Self {
        Self {
            command: Some(command.to_string()),
            args: args.iter().map(|a| a.to_string()).collect(),
            ..Self::bare(id, TransportKind::Stdio)
        }
    }

    /// A network source of the given kind.
    pub fn remote(id: &str, transport: TransportKind, endpoint: &str) -> Self {
        Self {
            endpoint: Some(endpoint.to_string()),
            ..Self::bare(id, transport)
        }
    }

    /// Display name, falling back to the id.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// The endpoint for network transports.
    pub fn require_endpoint(&self) -> Result<&str, McpError> {
        self.endpoint
            .as_deref()
            .filter(|e| !e.trim().is_empty())
            .ok_or_else(|| McpError::Config {
                reason: format!("source '{}' has no endpoint", self.id),
            })
    }

    /// The spawn command for stdio transports.
    pub fn require_command(&self) -> Result<&str, McpError> {
        self.command
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| McpError::Config {
                reason: format!("source '{}' has no command", self.id),
            })
    }

    /// Check the fields the transport kind needs are present.
    pub fn validate(&self) -> Result<(), McpError> {
        if self.id.trim().is_empty() {
            return Err(McpError::Validation {
                reason: "source id must not be blank".into(),
            });
        }
        match self.transport {
            TransportKind::Stdio => self.require_command().map(|_| ()),
            _ => self.require_endpoint().map(|_| ()),
        }
    }
}

// ─── Settings ────────────────────────────────────────────────────────────────
//
// Every settings struct is `#[serde(default)]`: missing keys take the value
// from its `Default` impl.

/// Process pool limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub max_processes: usize,
    /// How long `terminate` waits after SIGTERM before SIGKILL.
    pub grace_period_ms: u64,
    pub max_restarts: u32,
    /// Ready processes are evicted after this long without a caller request.
    pub idle_timeout_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_processes: 10,
            grace_period_ms: 5_000,
            max_restarts: super::process::DEFAULT_MAX_RESTARTS,
            idle_timeout_secs: 900,
        }
    }
}

impl PoolSettings {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Tool cache lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    pub ttl_secs: u64,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            ttl_secs: super::registry::DEFAULT_TTL.as_secs(),
        }
    }
}

/// Discovery cadence and retry budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    pub cooldown_secs: u64,
    pub max_attempts: u32,
    /// Fixed delay between attempts for connection and timeout failures.
    pub retry_delay_ms: u64,
    /// One "unit" of the rate-limit backoff (`min(2^n, max_backoff_units)` units).
    pub backoff_unit_ms: u64,
    pub max_backoff_units: u32,
    pub schema_version: String,
    /// Interval of the scheduled discovery pass over all sources.
    pub interval_secs: u64,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            cooldown_secs: 60,
            max_attempts: 3,
            retry_delay_ms: 5_000,
            backoff_unit_ms: 1_000,
            max_backoff_units: 30,
            schema_version: super::types::DEFAULT_SCHEMA_VERSION.to_string(),
            interval_secs: 600,
        }
    }
}

/// Health sweep cadence and escalation threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub process_interval_secs: u64,
    pub server_interval_secs: u64,
    pub stale_after_secs: u64,
    pub unhealthy_threshold: u32,
    pub ping_timeout_secs: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            process_interval_secs: 30,
            server_interval_secs: 300,
            stale_after_secs: super::process::DEFAULT_STALE_THRESHOLD.as_secs(),
            unhealthy_threshold: 3,
            ping_timeout_secs: 10,
        }
    }
}

/// Deadlines applied to transport calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    pub request_timeout_secs: u64,
    pub invoke_timeout_secs: u64,
    /// Budget for the stdio `initialize` handshake. Servers that import
    /// heavy frameworks at startup need the full 30s.
    pub init_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            invoke_timeout_secs: 120,
            init_timeout_secs: 30,
            connect_timeout_secs: 5,
        }
    }
}

/// Background OAuth refresh job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthSettings {
    pub refresh_interval_secs: u64,
    /// Tokens expiring within this window are refreshed.
    pub refresh_window_secs: u64,
}

impl Default for OAuthSettings {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 300,
            refresh_window_secs: 600,
        }
    }
}

/// Every tunable of the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub pool: PoolSettings,
    pub registry: RegistrySettings,
    pub discovery: DiscoverySettings,
    pub health: HealthSettings,
    pub transport: TransportSettings,
    pub oauth: OAuthSettings,
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub sources: HashMap<String, SourceConfig>,
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Load an orchestrator config file. `.json` files are parsed as JSON,
/// everything else as YAML.
pub fn load_config(path: &Path) -> Result<OrchestratorConfig, McpError> {
    let raw = std::fs::read_to_string(path).map_err(|e| McpError::Config {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    let mut config: OrchestratorConfig = if is_json {
        serde_json::from_str(&raw).map_err(|e| McpError::Config {
            reason: format!("failed to parse {}: {e}", path.display()),
        })?
    } else {
        serde_yaml::from_str(&raw)?
    };

    for (key, source) in config.sources.iter_mut() {
        if source.id.is_empty() {
            source.id = key.clone();
        }
        if source.name.is_empty() {
            source.name = key.clone();
        }
        source.validate()?;
    }

    tracing::info!(
        path = %path.display(),
        sources = config.sources.len(),
        "loaded MCP orchestrator config"
    );

    Ok(config)
}

// ─── Placeholder Resolution ──────────────────────────────────────────────────

/// Replace `{{VAR}}` placeholders with values from the host environment.
///
/// Unknown variables resolve to an empty string (with a warning) so a
/// missing secret surfaces as an auth failure, not a literal `{{VAR}}`.
pub fn resolve_placeholders(input: &str) -> String {
    resolve_placeholders_with(input, |name| std::env::var(name).ok())
}

/// [`resolve_placeholders`] against an arbitrary lookup.
pub fn resolve_placeholders_with<F>(input: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("{{") {
        result.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        match after_open.find("}}") {
            Some(end) => {
                let name = after_open[..end].trim();
                match lookup(name) {
                    Some(value) => result.push_str(&value),
                    None => {
                        tracing::warn!(variable = name, "unresolved env placeholder");
                    }
                }
                rest = &after_open[end + 2..];
            }
            None => {
                // Unterminated: keep the remainder verbatim
                result.push_str(&rest[start..]);
                rest = "";
            }
        }
    }

    result.push_str(rest);
    result
}

/// Resolve placeholders in every value of an env map.
pub fn resolve_env(env: &HashMap<String, String>) -> HashMap<String, String> {
    env.iter()
        .map(|(k, v)| (k.clone(), resolve_placeholders(v)))
        .collect()
}

// ─── ConfigProvider ──────────────────────────────────────────────────────────

/// Read-only source lookup supplied by the surrounding application.
pub trait ConfigProvider: Send + Sync {
    /// The configuration for one source.
    fn source(&self, source_id: &str) -> Option<SourceConfig>;

    /// Every configured source (enabled or not).
    fn sources(&self) -> Vec<SourceConfig>;
}

/// Fixed in-memory [`ConfigProvider`], typically built from a loaded file.
#[derive(Debug, Default)]
pub struct InMemorySources {
    sources: HashMap<String, SourceConfig>,
}

impl InMemorySources {
    pub fn new(sources: impl IntoIterator<Item = SourceConfig>) -> Self {
        Self {
            sources: sources.into_iter().map(|s| (s.id.clone(), s)).collect(),
        }
    }
}

impl From<OrchestratorConfig> for InMemorySources {
    fn from(config: OrchestratorConfig) -> Self {
        Self::new(config.sources.into_values())
    }
}

impl ConfigProvider for InMemorySources {
    fn source(&self, source_id: &str) -> Option<SourceConfig> {
        self.sources.get(source_id).cloned()
    }

    fn sources(&self) -> Vec<SourceConfig> {
        let mut all: Vec<SourceConfig> = self.sources.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
