//! Plain HTTP transport: one POST per JSON-RPC request.

use std::time::Duration;

use async_trait::async_trait;

use super::super::codec;
use super::super::config::TransportKind;
use super::super::errors::McpError;
use super::super::types::{JsonRpcRequest, JsonRpcResponse};
use super::auth::AuthPlacement;
use super::{ensure_correlated, map_reqwest_error, status_error, ConnectionTransport};

pub struct HttpTransport {
    source_id: String,
    endpoint: String,
    client: reqwest::Client,
    auth: Option<AuthPlacement>,
}

impl HttpTransport {
    pub fn new(source_id: &str, endpoint: &str, client: reqwest::Client, auth: Option<AuthPlacement>) -> Self {
        Self {
            source_id: source_id.to_string(),
            endpoint: endpoint.to_string(),
            client,
            auth,
        }
    }
}

#[async_trait]
impl ConnectionTransport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn send_request(&self, request: JsonRpcRequest, timeout: Duration) -> Result<JsonRpcResponse, McpError> {
        let mut builder = self
            .client
            .post(&self.endpoint)
            .timeout(timeout)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&request);
        if let Some(auth) = &self.auth {
            builder = auth.apply(builder);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| map_reqwest_error(&self.source_id, e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            tracing::debug!(
                source = %self.source_id,
                status = status.as_u16(),
                method = %request.method,
                "HTTP request rejected"
            );
            return Err(status_error(&self.source_id, status.as_u16(), retry_after.as_deref()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| map_reqwest_error(&self.source_id, e, timeout))?;

        let decoded = codec::decode_response(&self.source_id, &body)?;
        ensure_correlated(&self.source_id, &request, decoded)
    }
}
