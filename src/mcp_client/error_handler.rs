//! Failure classification and retry policy.
//!
//! Every failure the scheduler or facade sees is sorted into an
//! [`ErrorKind`] and given a [`Disposition`]: retry after a delay, surface to
//! the caller, or disable the source until someone intervenes. Disabled
//! sources are tracked here as "requires attention".

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::config::DiscoverySettings;
use super::errors::McpError;

// ─── Classification ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    Timeout,
    Authentication,
    RateLimit,
    Protocol,
    PoolExhausted,
    InvalidState,
    Validation,
    Configuration,
    /// Gave up on the source already (restart budget spent, parked).
    Permanent,
}

impl ErrorKind {
    pub fn classify(err: &McpError) -> Self {
        match err {
            McpError::Connection { .. } | McpError::NotReady { .. } | McpError::SpawnFailed { .. } => {
                ErrorKind::Connection
            }
            McpError::Timeout { .. } => ErrorKind::Timeout,
            McpError::Authentication { .. } => ErrorKind::Authentication,
            McpError::RateLimited { .. } => ErrorKind::RateLimit,
            McpError::Protocol { .. } | McpError::ServerError { .. } => ErrorKind::Protocol,
            McpError::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            McpError::InvalidStateTransition { .. } => ErrorKind::InvalidState,
            McpError::Validation { .. } | McpError::InvalidArgument { .. } => ErrorKind::Validation,
            McpError::Config { .. } | McpError::UnknownSource { .. } | McpError::SourceDisabled { .. } => {
                ErrorKind::Configuration
            }
            McpError::RestartExhausted { .. } | McpError::RequiresAttention { .. } => ErrorKind::Permanent,
        }
    }

    /// Transient failures that the retry budget applies to.
    pub fn is_transient(self) -> bool {
        matches!(self, ErrorKind::Connection | ErrorKind::Timeout | ErrorKind::RateLimit)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Authentication => "authentication",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Protocol => "protocol",
            ErrorKind::PoolExhausted => "pool_exhausted",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::Validation => "validation",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Permanent => "permanent",
        }
    }
}

/// What to do about a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Retry { delay: Duration },
    Surface,
    /// Stop using the source until it is cleared.
    Disable,
}

// ─── Retry Policy ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Delay between attempts for connection and timeout failures.
    pub fixed_delay: Duration,
    /// Rate-limit backoff is `min(2^n, max_backoff_units)` of these.
    pub backoff_unit: Duration,
    pub max_backoff_units: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&DiscoverySettings::default())
    }
}

impl From<&DiscoverySettings> for RetryPolicy {
    fn from(settings: &DiscoverySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            fixed_delay: Duration::from_millis(settings.retry_delay_ms),
            backoff_unit: Duration::from_millis(settings.backoff_unit_ms),
            max_backoff_units: settings.max_backoff_units,
        }
    }
}

impl RetryPolicy {
    /// Rate-limit wait after the `attempt`-th failure (1-based).
    pub fn rate_limit_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let ceiling = self.backoff_unit * self.max_backoff_units;
        match retry_after {
            Some(hint) => hint.min(ceiling),
            None => {
                let units = 2u32.saturating_pow(attempt).min(self.max_backoff_units);
                self.backoff_unit * units
            }
        }
    }
}

// ─── ErrorHandler ────────────────────────────────────────────────────────────

/// A source parked after a non-retriable failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttentionRecord {
    pub source_id: String,
    pub reason: String,
    pub since: DateTime<Utc>,
}

/// Shared failure policy plus the set of sources needing attention.
#[derive(Debug)]
pub struct ErrorHandler {
    policy: RetryPolicy,
    attention: Mutex<HashMap<String, AttentionRecord>>,
}

impl ErrorHandler {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attention: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn attention(&self) -> MutexGuard<'_, HashMap<String, AttentionRecord>> {
        self.attention.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decide what to do after `attempt` attempts (1-based) ended in `err`.
    pub fn disposition(&self, err: &McpError, attempt: u32) -> Disposition {
        let kind = ErrorKind::classify(err);
        let retries_left = attempt < self.policy.max_attempts;

        match kind {
            ErrorKind::Connection | ErrorKind::Timeout if retries_left => Disposition::Retry {
                delay: self.policy.fixed_delay,
            },
            ErrorKind::RateLimit if retries_left => {
                let retry_after = match err {
                    McpError::RateLimited { retry_after, .. } => *retry_after,
                    _ => None,
                };
                Disposition::Retry {
                    delay: self.policy.rate_limit_delay(attempt, retry_after),
                }
            }
            ErrorKind::Connection | ErrorKind::Timeout | ErrorKind::RateLimit => Disposition::Surface,
            ErrorKind::Authentication | ErrorKind::PoolExhausted | ErrorKind::Permanent => Disposition::Disable,
            ErrorKind::InvalidState => {
                // Pool/handle bookkeeping is broken; make it loud.
                tracing::error!(error = %err, "invalid process state transition");
                Disposition::Surface
            }
            ErrorKind::Protocol | ErrorKind::Validation | ErrorKind::Configuration => Disposition::Surface,
        }
    }

    /// Park a source. Returns `true` if it was not already parked.
    pub fn mark_requires_attention(&self, source_id: &str, reason: &str) -> bool {
        let mut attention = self.attention();
        if attention.contains_key(source_id) {
            return false;
        }
        tracing::warn!(source = source_id, reason, "source requires attention");
        attention.insert(
            source_id.to_string(),
            AttentionRecord {
                source_id: source_id.to_string(),
                reason: reason.to_string(),
                since: Utc::now(),
            },
        );
        true
    }

    /// The reason a source is parked, if it is.
    pub fn requires_attention(&self, source_id: &str) -> Option<String> {
        self.attention().get(source_id).map(|r| r.reason.clone())
    }

    /// Un-park a source (after re-authentication, a config change or a successful discovery).
    pub fn clear(&self, source_id: &str) -> bool {
        let cleared = self.attention().remove(source_id).is_some();
        if cleared {
            tracing::info!(source = source_id, "source attention flag cleared");
        }
        cleared
    }

    pub fn attention_snapshot(&self) -> Vec<AttentionRecord> {
        let mut records: Vec<AttentionRecord> = self.attention().values().cloned().collect();
        records.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        records
    }
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::process::ProcessStatus;

    fn handler() -> ErrorHandler {
        ErrorHandler::new(RetryPolicy {
            max_attempts: 3,
            fixed_delay: Duration::from_secs(5),
            backoff_unit: Duration::from_secs(1),
            max_backoff_units: 30,
        })
    }

    #[test]
    fn test_classification() {
        assert_eq!(
            ErrorKind::classify(&McpError::connection("s", "reset")),
            ErrorKind::Connection
        );
        assert_eq!(
            ErrorKind::classify(&McpError::ServerError {
                code: -32601,
                message: "nope".into(),
                data: None
            }),
            ErrorKind::Protocol
        );
        assert_eq!(
            ErrorKind::classify(&McpError::RestartExhausted {
                source_id: "s".into(),
                attempts: 3
            }),
            ErrorKind::Permanent
        );
        assert!(ErrorKind::RateLimit.is_transient());
        assert!(!ErrorKind::Authentication.is_transient());
    }

    #[test]
    fn test_transient_errors_retry_until_budget_spent() {
        let handler = handler();
        let err = McpError::timeout("s", Duration::from_secs(30));
        assert_eq!(
            handler.disposition(&err, 1),
            Disposition::Retry {
                delay: Duration::from_secs(5)
            }
        );
        assert_eq!(
            handler.disposition(&err, 2),
            Disposition::Retry {
                delay: Duration::from_secs(5)
            }
        );
        assert_eq!(handler.disposition(&err, 3), Disposition::Surface);
    }

    #[test]
    fn test_rate_limit_backs_off_exponentially() {
        let policy = handler().policy().clone();
        assert_eq!(policy.rate_limit_delay(1, None), Duration::from_secs(2));
        assert_eq!(policy.rate_limit_delay(2, None), Duration::from_secs(4));
        assert_eq!(policy.rate_limit_delay(5, None), Duration::from_secs(30));
        assert_eq!(policy.rate_limit_delay(40, None), Duration::from_secs(30));
        assert_eq!(
            policy.rate_limit_delay(1, Some(Duration::from_secs(7))),
            Duration::from_secs(7)
        );
        assert_eq!(
            policy.rate_limit_delay(1, Some(Duration::from_secs(3600))),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_auth_and_pool_exhaustion_disable() {
        let handler = handler();
        let auth = McpError::Authentication {
            source_id: "s".into(),
            reason: "HTTP 401".into(),
        };
        assert_eq!(handler.disposition(&auth, 1), Disposition::Disable);
        assert_eq!(
            handler.disposition(&McpError::PoolExhausted { max_processes: 2 }, 1),
            Disposition::Disable
        );
    }

    #[test]
    fn test_invalid_state_is_surfaced() {
        let err = McpError::InvalidStateTransition {
            from: ProcessStatus::Stopped,
            to: ProcessStatus::Ready,
        };
        assert_eq!(handler().disposition(&err, 1), Disposition::Surface);
    }

    #[test]
    fn test_attention_lifecycle() {
        let handler = handler();
        assert!(handler.mark_requires_attention("github", "HTTP 401"));
        assert!(!handler.mark_requires_attention("github", "again"));
        assert_eq!(handler.requires_attention("github").as_deref(), Some("HTTP 401"));
        assert_eq!(handler.attention_snapshot().len(), 1);

        assert!(handler.clear("github"));
        assert!(handler.requires_attention("github").is_none());
    }
}
