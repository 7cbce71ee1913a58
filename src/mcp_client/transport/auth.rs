//! Per-source authentication.

use super::super::config::{AuthConfig, SourceConfig};
use super::super::oauth::CredentialStore;

/// Header used for API keys when the source does not name one.
pub const DEFAULT_API_KEY_HEADER: &str = "X-API-Key";

/// Where a credential goes on an outgoing request.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthPlacement {
    Header { name: String, value: String },
    Query { name: String, value: String },
}

// Secrets stay out of logs.
impl std::fmt::Debug for AuthPlacement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthPlacement::Header { name, .. } => write!(f, "Header({name}: ***)"),
            AuthPlacement::Query { name, .. } => write!(f, "Query({name}=***)"),
        }
    }
}

impl AuthPlacement {
    fn bearer(token: &str) -> Self {
        AuthPlacement::Header {
            name: "Authorization".into(),
            value: format!("Bearer {token}"),
        }
    }

    /// Attach the credential to a reqwest request.
    pub fn apply(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self {
            AuthPlacement::Header { name, value } => builder.header(name.as_str(), value.as_str()),
            AuthPlacement::Query { name, value } => builder.query(&[(name.as_str(), value.as_str())]),
        }
    }
}

/// Work out the credential for `source`.
///
/// For OAuth the most recently refreshed access token wins over the one in
/// the configuration. An expired token is still sent; the server's 401 is
/// what flags the source for re-authentication.
pub fn resolve(source: &SourceConfig, credentials: &CredentialStore) -> Option<AuthPlacement> {
    match &source.auth {
        AuthConfig::None => None,
        AuthConfig::ApiKey {
            key,
            header,
            query_param,
        } => match (header, query_param) {
            (Some(header), _) => Some(AuthPlacement::Header {
                name: header.clone(),
                value: key.clone(),
            }),
            (None, Some(param)) => Some(AuthPlacement::Query {
                name: param.clone(),
                value: key.clone(),
            }),
            (None, None) => Some(AuthPlacement::Header {
                name: DEFAULT_API_KEY_HEADER.into(),
                value: key.clone(),
            }),
        },
        AuthConfig::BearerToken { token } => Some(AuthPlacement::bearer(token)),
        AuthConfig::OAuth { access_token, .. } => {
            let token = credentials
                .access_token(&source.id)
                .unwrap_or_else(|| access_token.clone());
            Some(AuthPlacement::bearer(&token))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::config::TransportKind;

    fn source(auth: AuthConfig) -> SourceConfig {
        let mut source = SourceConfig::remote("api", TransportKind::Http, "https://example.test/rpc");
        source.auth = auth;
        source
    }

    #[test]
    fn test_no_auth() {
        assert_eq!(resolve(&source(AuthConfig::None), &CredentialStore::default()), None);
    }

    #[test]
    fn test_api_key_placements() {
        let store = CredentialStore::default();

        let default = resolve(
            &source(AuthConfig::ApiKey {
                key: "k".into(),
                header: None,
                query_param: None,
            }),
            &store,
        );
        assert_eq!(
            default,
            Some(AuthPlacement::Header {
                name: "X-API-Key".into(),
                value: "k".into()
            })
        );

        let query = resolve(
            &source(AuthConfig::ApiKey {
                key: "k".into(),
                header: None,
                query_param: Some("api_key".into()),
            }),
            &store,
        );
        assert_eq!(
            query,
            Some(AuthPlacement::Query {
                name: "api_key".into(),
                value: "k".into()
            })
        );
    }

    #[test]
    fn test_bearer_token() {
        let placement = resolve(
            &source(AuthConfig::BearerToken { token: "t0k".into() }),
            &CredentialStore::default(),
        );
        assert_eq!(
            placement,
            Some(AuthPlacement::Header {
                name: "Authorization".into(),
                value: "Bearer t0k".into()
            })
        );
    }

    #[test]
    fn test_oauth_prefers_refreshed_token() {
        let src = source(AuthConfig::OAuth {
            access_token: "stale".into(),
            refresh_token: Some("r".into()),
            expires_at: None,
            token_url: None,
            client_id: None,
            client_secret: None,
        });
        let store = CredentialStore::default();
        assert_eq!(
            resolve(&src, &store),
            Some(AuthPlacement::bearer("stale"))
        );

        store.store("api", "fresh".into(), None, None);
        assert_eq!(resolve(&src, &store), Some(AuthPlacement::bearer("fresh")));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let rendered = format!("{:?}", AuthPlacement::bearer("s3cret"));
        assert!(!rendered.contains("s3cret"));
    }
}
