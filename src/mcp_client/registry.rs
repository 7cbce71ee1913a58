//! Tool registry: the shared per-source cache of discovered tools.
//!
//! Provides:
//! - Wholesale per-source storage with a TTL and a monotonic version counter
//! - Cross-source lookup for callers that need to disambiguate tool names
//! - Expired-entry purging, run by the scheduled discovery pass
//! - Argument validation against a tool's input schema
//!
//! The registry never triggers discovery; an empty answer is the caller's
//! cue to ask the discovery scheduler.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use super::errors::McpError;
use super::types::ToolDefinition;

/// Default lifetime of a cached tool list.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
struct CacheEntry {
    tools: Vec<ToolDefinition>,
    expires_at: Instant,
    fingerprint: String,
}

#[derive(Debug, Default)]
struct RegistryState {
    entries: HashMap<String, CacheEntry>,
    /// Survives invalidation so versions never go backwards.
    versions: HashMap<String, u64>,
}

// ─── ToolRegistry ────────────────────────────────────────────────────────────

/// Process-wide cache from source id to validated tool list.
#[derive(Debug)]
pub struct ToolRegistry {
    ttl: Duration,
    state: RwLock<RegistryState>,
}

impl ToolRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: RwLock::new(RegistryState::default()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cached tools for a source; empty when nothing is cached or the entry expired.
    pub fn get(&self, source_id: &str) -> Vec<ToolDefinition> {
        let now = Instant::now();
        self.read()
            .entries
            .get(source_id)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.tools.clone())
            .unwrap_or_default()
    }

    /// Whether a live (unexpired) entry exists, even if its tool list is empty.
    pub fn contains(&self, source_id: &str) -> bool {
        let now = Instant::now();
        self.read()
            .entries
            .get(source_id)
            .is_some_and(|entry| entry.expires_at > now)
    }

    /// Replace the source's tools. Returns the new version.
    pub fn put(&self, source_id: &str, tools: Vec<ToolDefinition>) -> u64 {
        let fingerprint = fingerprint(&tools);
        let mut state = self.write();

        let version = state.versions.entry(source_id.to_string()).or_insert(0);
        *version += 1;
        let version = *version;

        let changed = state
            .entries
            .get(source_id)
            .map_or(true, |previous| previous.fingerprint != fingerprint);

        tracing::debug!(
            source = source_id,
            version,
            tools = tools.len(),
            changed,
            "registry updated"
        );

        state.entries.insert(
            source_id.to_string(),
            CacheEntry {
                tools,
                expires_at: Instant::now() + self.ttl,
                fingerprint,
            },
        );
        version
    }

    /// Drop the cached entry for a source. Returns whether one existed.
    pub fn invalidate(&self, source_id: &str) -> bool {
        let removed = self.write().entries.remove(source_id).is_some();
        if removed {
            tracing::debug!(source = source_id, "registry entry invalidated");
        }
        removed
    }

    /// Number of `put` calls ever made for the source (0 if never).
    pub fn version(&self, source_id: &str) -> u64 {
        self.read().versions.get(source_id).copied().unwrap_or(0)
    }

    /// Content hash of the cached tool list, if one is cached.
    pub fn fingerprint(&self, source_id: &str) -> Option<String> {
        self.read()
            .entries
            .get(source_id)
            .map(|entry| entry.fingerprint.clone())
    }

    /// Remove expired entries. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.write();
        let before = state.entries.len();
        state.entries.retain(|_, entry| entry.expires_at > now);
        before - state.entries.len()
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().entries.is_empty()
    }

    /// Look up one tool of one source.
    pub fn find_tool(&self, source_id: &str, tool_name: &str) -> Option<ToolDefinition> {
        self.get(source_id).into_iter().find(|t| t.name == tool_name)
    }

    /// Every source currently exposing a tool called `tool_name`, sorted.
    pub fn sources_with_tool(&self, tool_name: &str) -> Vec<String> {
        let now = Instant::now();
        let mut sources: Vec<String> = self
            .read()
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires_at > now && entry.tools.iter().any(|t| t.name == tool_name))
            .map(|(id, _)| id.clone())
            .collect();
        sources.sort();
        sources
    }

    /// Check `arguments` carry every field the tool's input schema marks as required.
    pub fn validate_arguments(
        &self,
        source_id: &str,
        tool_name: &str,
        arguments: &serde_json::Value,
    ) -> Result<(), McpError> {
        let def = self
            .find_tool(source_id, tool_name)
            .ok_or_else(|| McpError::Validation {
                reason: format!("unknown tool '{tool_name}' for source '{source_id}'"),
            })?;

        if !(arguments.is_object() || arguments.is_null()) {
            return Err(McpError::Validation {
                reason: format!("arguments for '{tool_name}' must be an object"),
            });
        }

        if let Some(required) = def.input_schema.get("required").and_then(|r| r.as_array()) {
            let args_obj = arguments.as_object();
            for field_name in required.iter().filter_map(|f| f.as_str()) {
                let has_field = args_obj.is_some_and(|obj| obj.contains_key(field_name));
                if !has_field {
                    return Err(McpError::Validation {
                        reason: format!("'{tool_name}' is missing required field '{field_name}'"),
                    });
                }
            }
        }

        Ok(())
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

/// Stable hash of the tool list contents (names, descriptions, schemas).
fn fingerprint(tools: &[ToolDefinition]) -> String {
    let mut hasher = Sha256::new();
    for tool in tools {
        hasher.update(tool.name.as_bytes());
        hasher.update([0u8]);
        hasher.update(tool.description.as_bytes());
        hasher.update([0u8]);
        hasher.update(tool.input_schema.to_string().as_bytes());
        hasher.update([0u8]);
        hasher.update(tool.output_schema.to_string().as_bytes());
        hasher.update([0xffu8]);
    }
    format!("{:x}", hasher.finalize())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
