//! OAuth token storage and background refresh.
//!
//! Transports read the freshest access token from the [`CredentialStore`]
//! and never refresh on their own. The [`TokenRefresher`] job exchanges
//! refresh tokens shortly before expiry. A source whose refresh token is
//! rejected is parked as requiring attention; transient failures (network,
//! 5xx, rate limits) are retried on the next pass.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::watch;

use super::config::{AuthConfig, ConfigProvider, OAuthSettings, SourceConfig};
use super::error_handler::ErrorHandler;
use super::errors::McpError;
use super::events::{EventSink, McpEvent};
use super::health::wait_or_shutdown;
use super::transport::{map_reqwest_error, status_error};

const TOKEN_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// ─── CredentialStore ─────────────────────────────────────────────────────────

#[derive(Clone, PartialEq)]
pub struct StoredToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub stored_at: DateTime<Utc>,
}

impl std::fmt::Debug for StoredToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredToken")
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .field("stored_at", &self.stored_at)
            .finish()
    }
}

/// Refreshed OAuth tokens, keyed by source id.
#[derive(Debug, Default)]
pub struct CredentialStore {
    tokens: RwLock<HashMap<String, StoredToken>>,
}

impl CredentialStore {
    pub fn access_token(&self, source_id: &str) -> Option<String> {
        self.token(source_id).map(|t| t.access_token)
    }

    pub fn token(&self, source_id: &str) -> Option<StoredToken> {
        self.tokens
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(source_id)
            .cloned()
    }

    pub fn store(
        &self,
        source_id: &str,
        access_token: String,
        refresh_token: Option<String>,
        expires_at: Option<DateTime<Utc>>,
    ) {
        let token = StoredToken {
            access_token,
            refresh_token,
            expires_at,
            stored_at: Utc::now(),
        };
        self.tokens
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(source_id.to_string(), token);
    }

    pub fn clear(&self, source_id: &str) -> bool {
        self.tokens
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(source_id)
            .is_some()
    }
}

// ─── TokenRefresher ──────────────────────────────────────────────────────────

/// Standard token endpoint response.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    /// Lifetime in seconds.
    #[serde(default)]
    expires_in: Option<i64>,
}

/// What the refresher knows about one OAuth source.
struct OAuthState {
    refresh_token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    token_url: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
}

pub struct TokenRefresher {
    provider: Arc<dyn ConfigProvider>,
    credentials: Arc<CredentialStore>,
    errors: Arc<ErrorHandler>,
    events: Arc<dyn EventSink>,
    http: reqwest::Client,
    settings: OAuthSettings,
}

impl TokenRefresher {
    pub fn new(
        provider: Arc<dyn ConfigProvider>,
        credentials: Arc<CredentialStore>,
        errors: Arc<ErrorHandler>,
        events: Arc<dyn EventSink>,
        http: reqwest::Client,
        settings: OAuthSettings,
    ) -> Self {
        Self {
            provider,
            credentials,
            errors,
            events,
            http,
            settings,
        }
    }

    /// Stored tokens win over the ones in the configuration.
    fn state(&self, source: &SourceConfig) -> Option<OAuthState> {
        let AuthConfig::OAuth {
            refresh_token,
            expires_at,
            token_url,
            client_id,
            client_secret,
            ..
        } = &source.auth
        else {
            return None;
        };

        let stored = self.credentials.token(&source.id);
        Some(OAuthState {
            refresh_token: stored
                .as_ref()
                .and_then(|t| t.refresh_token.clone())
                .or_else(|| refresh_token.clone()),
            expires_at: match &stored {
                Some(t) => t.expires_at,
                None => *expires_at,
            },
            token_url: token_url.clone(),
            client_id: client_id.clone(),
            client_secret: client_secret.clone(),
        })
    }

    /// Enabled OAuth sources whose token expires within the refresh window.
    pub fn due_sources(&self, now: DateTime<Utc>) -> Vec<SourceConfig> {
        let window = chrono::Duration::seconds(self.settings.refresh_window_secs as i64);
        self.provider
            .sources()
            .into_iter()
            .filter(|s| s.enabled)
            .filter(|s| {
                self.state(s)
                    .and_then(|state| state.expires_at)
                    .is_some_and(|expires_at| expires_at - now <= window)
            })
            .collect()
    }

    /// Refresh every due token.
    pub async fn refresh_due(&self) -> Vec<(String, Result<(), McpError>)> {
        let mut outcomes = Vec::new();
        for source in self.due_sources(Utc::now()) {
            let outcome = self.refresh(&source).await;
            match &outcome {
                Err(e @ (McpError::Authentication { .. } | McpError::Config { .. })) => self.park(&source.id, e),
                Err(e) => {
                    tracing::warn!(source = %source.id, error = %e, "OAuth refresh failed, retrying next pass");
                }
                Ok(()) => {}
            }
            outcomes.push((source.id, outcome));
        }
        outcomes
    }

    fn park(&self, source_id: &str, err: &McpError) {
        let reason = format!("OAuth refresh failed: {err}");
        if self.errors.mark_requires_attention(source_id, &reason) {
            self.events.publish(McpEvent::SourceRequiresAttention {
                source_id: source_id.to_string(),
                reason,
            });
        }
    }

    /// Exchange the refresh token for a new access token.
    pub async fn refresh(&self, source: &SourceConfig) -> Result<(), McpError> {
        let state = self.state(source).ok_or_else(|| McpError::Config {
            reason: format!("source '{}' does not use OAuth", source.id),
        })?;
        let Some(refresh_token) = state.refresh_token else {
            return Err(McpError::Authentication {
                source_id: source.id.clone(),
                reason: "token expiring and no refresh token available".into(),
            });
        };
        let Some(token_url) = state.token_url else {
            return Err(McpError::Authentication {
                source_id: source.id.clone(),
                reason: "token expiring and no token_url configured".into(),
            });
        };

        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.clone()),
        ];
        if let Some(client_id) = state.client_id {
            form.push(("client_id", client_id));
        }
        if let Some(client_secret) = state.client_secret {
            form.push(("client_secret", client_secret));
        }

        let response = self
            .http
            .post(&token_url)
            .timeout(TOKEN_REQUEST_TIMEOUT)
            .form(&form)
            .send()
            .await
            .map_err(|e| map_reqwest_error(&source.id, e, TOKEN_REQUEST_TIMEOUT))?;

        let status = response.status();
        if !status.is_success() {
            // Token endpoints reject bad grants with 400 invalid_grant or 401
            let code = status.as_u16();
            if status.is_client_error() && code != 408 && code != 429 {
                return Err(McpError::Authentication {
                    source_id: source.id.clone(),
                    reason: format!("refresh token rejected (HTTP {code})"),
                });
            }
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            return Err(status_error(&source.id, status.as_u16(), retry_after.as_deref()));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| McpError::protocol(&source.id, format!("invalid token response: {e}")))?;

        let expires_at = token
            .expires_in
            .map(|secs| Utc::now() + chrono::Duration::seconds(secs));
        self.credentials.store(
            &source.id,
            token.access_token,
            token.refresh_token.or(Some(refresh_token)),
            expires_at,
        );
        self.errors.clear(&source.id);

        tracing::info!(source = %source.id, expires_at = ?expires_at, "OAuth token refreshed");
        Ok(())
    }

    /// Periodic refresh until `shutdown` flips to `true`.
    pub async fn run_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.settings.refresh_interval_secs.max(1));
        loop {
            let refreshed = self.refresh_due().await;
            tracing::debug!(count = refreshed.len(), "OAuth refresh pass done");

            if !wait_or_shutdown(interval, &mut shutdown).await {
                break;
            }
        }
        tracing::debug!("OAuth refresh loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::config::{InMemorySources, TransportKind};
    use crate::mcp_client::testing::{serve_once, RecordingSink};

    fn oauth_source(id: &str, token_url: Option<String>, expires_in_secs: i64) -> SourceConfig {
        let mut source = SourceConfig::remote(id, TransportKind::Http, "https://mcp.example.test");
        source.auth = AuthConfig::OAuth {
            access_token: "old".into(),
            refresh_token: Some("r1".into()),
            expires_at: Some(Utc::now() + chrono::Duration::seconds(expires_in_secs)),
            token_url,
            client_id: Some("client".into()),
            client_secret: None,
        };
        source
    }

    fn refresher(sources: Vec<SourceConfig>) -> (TokenRefresher, Arc<CredentialStore>, Arc<ErrorHandler>, Arc<RecordingSink>) {
        let credentials = Arc::new(CredentialStore::default());
        let errors = Arc::new(ErrorHandler::default());
        let events = Arc::new(RecordingSink::default());
        let refresher = TokenRefresher::new(
            Arc::new(InMemorySources::new(sources)),
            Arc::clone(&credentials),
            Arc::clone(&errors),
            Arc::clone(&events) as Arc<dyn EventSink>,
            reqwest::Client::new(),
            OAuthSettings::default(),
        );
        (refresher, credentials, errors, events)
    }

    #[test]
    fn test_credential_store_roundtrip() {
        let store = CredentialStore::default();
        assert!(store.access_token("a").is_none());
        store.store("a", "tok".into(), None, None);
        assert_eq!(store.access_token("a").as_deref(), Some("tok"));
        assert!(!format!("{:?}", store.token("a").unwrap()).contains("tok"));
        assert!(store.clear("a"));
        assert!(!store.clear("a"));
    }

    #[test]
    fn test_due_sources_respects_window() {
        let (refresher, _, _, _) = refresher(vec![
            oauth_source("soon", None, 60),
            oauth_source("later", None, 86_400),
            SourceConfig::remote("plain", TransportKind::Http, "https://x.test"),
        ]);
        let due: Vec<String> = refresher.due_sources(Utc::now()).into_iter().map(|s| s.id).collect();
        assert_eq!(due, vec!["soon".to_string()]);
    }

    #[tokio::test]
    async fn test_refresh_stores_new_token() {
        let addr = serve_once(
            "200 OK",
            &[("Content-Type", "application/json")],
            r#"{"access_token":"new","expires_in":3600}"#,
        )
        .await;
        let source = oauth_source("gh", Some(format!("http://{addr}/token")), 60);
        let (refresher, credentials, _, _) = refresher(vec![source]);

        let outcomes = refresher.refresh_due().await;
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].1.is_ok());

        let token = credentials.token("gh").unwrap();
        assert_eq!(token.access_token, "new");
        assert_eq!(token.refresh_token.as_deref(), Some("r1"), "old refresh token kept");
        assert!(token.expires_at.is_some_and(|t| t > Utc::now()));
    }

    #[tokio::test]
    async fn test_rejected_refresh_parks_source() {
        let addr = serve_once("400 Bad Request", &[], r#"{"error":"invalid_grant"}"#).await;
        let source = oauth_source("gh", Some(format!("http://{addr}/token")), 60);
        let (refresher, credentials, errors, events) = refresher(vec![source]);

        let outcomes = refresher.refresh_due().await;
        assert!(matches!(outcomes[0].1, Err(McpError::Authentication { .. })));
        assert!(credentials.token("gh").is_none());
        assert!(errors.requires_attention("gh").is_some());
        assert!(matches!(
            events.events().as_slice(),
            [McpEvent::SourceRequiresAttention { .. }]
        ));
    }

    #[tokio::test]
    async fn test_unavailable_token_endpoint_does_not_park() {
        let addr = serve_once("503 Service Unavailable", &[], "").await;
        let source = oauth_source("gh", Some(format!("http://{addr}/token")), 60);
        let (refresher, credentials, errors, events) = refresher(vec![source]);

        let outcomes = refresher.refresh_due().await;
        assert!(matches!(outcomes[0].1, Err(McpError::Connection { .. })));
        assert!(credentials.token("gh").is_none());
        assert!(errors.requires_attention("gh").is_none());
        assert!(events.events().is_empty());
    }

    #[tokio::test]
    async fn test_missing_token_url_is_authentication_error() {
        let source = oauth_source("gh", None, 60);
        let (refresher, _, _, _) = refresher(vec![source.clone()]);
        assert!(matches!(
            refresher.refresh(&source).await,
            Err(McpError::Authentication { .. })
        ));
    }
}
