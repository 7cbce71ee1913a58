//! WebSocket transport.
//!
//! One socket per source, opened lazily and reused across requests. Requests
//! on the socket are serialised; the reply is matched by id and anything
//! else arriving in between (notifications, stale replies) is skipped.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::super::codec;
use super::super::config::TransportKind;
use super::super::errors::McpError;
use super::super::types::{JsonRpcRequest, JsonRpcResponse};
use super::auth::AuthPlacement;
use super::{status_error, ConnectionTransport};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WebSocketTransport {
    source_id: String,
    endpoint: String,
    auth: Option<AuthPlacement>,
    connect_timeout: Duration,
    socket: tokio::sync::Mutex<Option<WsStream>>,
}

impl WebSocketTransport {
    pub fn new(source_id: &str, endpoint: &str, auth: Option<AuthPlacement>, connect_timeout: Duration) -> Self {
        Self {
            source_id: source_id.to_string(),
            endpoint: endpoint.to_string(),
            auth,
            connect_timeout,
            socket: tokio::sync::Mutex::new(None),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn auth(&self) -> Option<&AuthPlacement> {
        self.auth.as_ref()
    }

    pub async fn is_connected(&self) -> bool {
        self.socket.lock().await.is_some()
    }

    /// The endpoint with an API-key query parameter applied, if configured.
    fn connect_url(&self) -> Result<String, McpError> {
        match &self.auth {
            Some(AuthPlacement::Query { name, value }) => {
                let mut url = reqwest::Url::parse(&self.endpoint).map_err(|e| McpError::Config {
                    reason: format!("invalid websocket endpoint for '{}': {e}", self.source_id),
                })?;
                url.query_pairs_mut().append_pair(name, value);
                Ok(url.to_string())
            }
            _ => Ok(self.endpoint.clone()),
        }
    }

    async fn open(&self) -> Result<WsStream, McpError> {
        let url = self.connect_url()?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| McpError::Config {
                reason: format!("invalid websocket endpoint for '{}': {e}", self.source_id),
            })?;

        if let Some(AuthPlacement::Header { name, value }) = &self.auth {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| McpError::Config {
                reason: format!("invalid auth header name: {e}"),
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| McpError::Config {
                reason: format!("invalid auth header value: {e}"),
            })?;
            request.headers_mut().insert(name, value);
        }

        let connected = tokio::time::timeout(self.connect_timeout, connect_async(request)).await;
        match connected {
            Ok(Ok((stream, _response))) => {
                tracing::debug!(source = %self.source_id, endpoint = %self.endpoint, "websocket connected");
                Ok(stream)
            }
            Ok(Err(e)) => Err(self.map_connect_error(e)),
            Err(_) => Err(McpError::timeout(&self.source_id, self.connect_timeout)),
        }
    }

    fn map_connect_error(&self, e: tungstenite::Error) -> McpError {
        match e {
            tungstenite::Error::Http(response) => {
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                status_error(&self.source_id, response.status().as_u16(), retry_after.as_deref())
            }
            other => McpError::connection(&self.source_id, format!("websocket connect failed: {other}")),
        }
    }

    async fn exchange(&self, socket: &mut Option<WsStream>, request: &JsonRpcRequest) -> Result<JsonRpcResponse, McpError> {
        if socket.is_none() {
            *socket = Some(self.open().await?);
        }
        let Some(ws) = socket.as_mut() else {
            return Err(McpError::connection(&self.source_id, "websocket not connected"));
        };

        let json = serde_json::to_string(request).map_err(|e| McpError::InvalidArgument {
            reason: format!("failed to serialize request: {e}"),
        })?;
        ws.send(Message::Text(json.into()))
            .await
            .map_err(|e| McpError::connection(&self.source_id, format!("send error: {e}")))?;

        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    let Ok(value) = serde_json::from_str::<serde_json::Value>(text.as_str()) else {
                        tracing::debug!(source = %self.source_id, "skipping non-JSON websocket frame");
                        continue;
                    };
                    match codec::response_from_value(&value) {
                        Some(response) if response.id == request.id => return Ok(response),
                        _ => continue,
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err(McpError::connection(&self.source_id, "websocket closed by server"));
                }
                Some(Ok(_)) => {} // binary/ping/pong
                Some(Err(e)) => {
                    return Err(McpError::connection(&self.source_id, format!("read error: {e}")));
                }
            }
        }
    }
}

#[async_trait]
impl ConnectionTransport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Websocket
    }

    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn send_request(&self, request: JsonRpcRequest, timeout: Duration) -> Result<JsonRpcResponse, McpError> {
        let outcome = tokio::time::timeout(timeout, async {
            let mut socket = self.socket.lock().await;
            let result = self.exchange(&mut socket, &request).await;
            if matches!(result, Err(McpError::Connection { .. })) {
                // Reconnect on the next call
                *socket = None;
            }
            result
        })
        .await;

        match outcome {
            Ok(result) => result,
            Err(_) => {
                // A reply may still be in flight; drop the socket so it is never read.
                self.socket.lock().await.take();
                Err(McpError::timeout(&self.source_id, timeout))
            }
        }
    }

    async fn close(&self) {
        if let Some(mut ws) = self.socket.lock().await.take() {
            let _ = ws.close(None).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::testing::serve_websocket;

    #[tokio::test]
    async fn test_request_response_over_socket() {
        let addr = serve_websocket(|text| {
            let value: serde_json::Value = serde_json::from_str(&text).unwrap();
            vec![
                r#"{"jsonrpc":"2.0","method":"notifications/message"}"#.to_string(),
                format!(r#"{{"jsonrpc":"2.0","id":{},"result":{{"ok":true}}}}"#, value["id"]),
            ]
        })
        .await;

        let transport = WebSocketTransport::new("ws", &format!("ws://{addr}"), None, Duration::from_secs(2));
        for _ in 0..2 {
            let request = codec::build_request("ping", None, None).unwrap();
            let response = transport.send_request(request, Duration::from_secs(2)).await.unwrap();
            assert_eq!(response.result, Some(serde_json::json!({"ok": true})));
        }
        assert!(transport.is_connected().await);

        transport.close().await;
        assert!(!transport.is_connected().await);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint() {
        let transport = WebSocketTransport::new("ws", "ws://127.0.0.1:9", None, Duration::from_secs(2));
        let request = codec::build_request("ping", None, None).unwrap();
        let err = transport.send_request(request, Duration::from_secs(3)).await.unwrap_err();
        assert!(matches!(err, McpError::Connection { .. } | McpError::Timeout { .. }));
        assert!(!transport.is_connected().await);
    }

    #[test]
    fn test_query_auth_applied_to_url() {
        let transport = WebSocketTransport::new(
            "ws",
            "wss://mcp.example.test/socket",
            Some(AuthPlacement::Query {
                name: "api_key".into(),
                value: "k".into(),
            }),
            Duration::from_secs(1),
        );
        assert_eq!(transport.connect_url().unwrap(), "wss://mcp.example.test/socket?api_key=k");
    }
}
