//! Test doubles shared by the module tests.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use super::codec;
use super::config::{SourceConfig, TransportKind};
use super::errors::McpError;
use super::events::{EventSink, McpEvent};
use super::transport::{ConnectionTransport, SourceConnector};
use super::types::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RequestId};

// ─── MockTransport ───────────────────────────────────────────────────────────

enum Scripted {
    Result(Value),
    RpcError(i64, String),
    Failure(McpError),
}

/// Transport that answers from a script, echoing the request id.
pub(crate) struct MockTransport {
    source_id: String,
    script: Mutex<VecDeque<Scripted>>,
    sent: Mutex<Vec<JsonRpcRequest>>,
    calls: AtomicUsize,
    delay: Mutex<Option<Duration>>,
}

impl MockTransport {
    pub(crate) fn new(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            script: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            delay: Mutex::new(None),
        }
    }

    fn push(&self, item: Scripted) {
        self.script.lock().unwrap_or_else(PoisonError::into_inner).push_back(item);
    }

    pub(crate) fn push_result(&self, result: Value) {
        self.push(Scripted::Result(result));
    }

    pub(crate) fn push_error(&self, code: i64, message: &str) {
        self.push(Scripted::RpcError(code, message.to_string()));
    }

    pub(crate) fn push_failure(&self, err: McpError) {
        self.push(Scripted::Failure(err));
    }

    /// Sleep this long before answering each request.
    pub(crate) fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap_or_else(PoisonError::into_inner) = Some(delay);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn sent_requests(&self) -> Vec<JsonRpcRequest> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl ConnectionTransport for MockTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn send_request(&self, request: JsonRpcRequest, timeout: Duration) -> Result<JsonRpcResponse, McpError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());

        let delay = *self.delay.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            if delay >= timeout {
                tokio::time::sleep(timeout).await;
                return Err(McpError::timeout(&self.source_id, timeout));
            }
            tokio::time::sleep(delay).await;
        }

        let next = self.script.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
        let id = request.id.clone().unwrap_or(RequestId::Number(0));
        match next {
            Some(Scripted::Result(result)) => codec::build_response(id, Some(result), None),
            Some(Scripted::RpcError(code, message)) => codec::build_response(
                id,
                None,
                Some(JsonRpcError {
                    code,
                    message,
                    data: None,
                }),
            ),
            Some(Scripted::Failure(err)) => Err(err),
            None => Err(McpError::connection(&self.source_id, "no scripted response")),
        }
    }
}

// ─── MockConnector ───────────────────────────────────────────────────────────

/// Hands out registered [`MockTransport`]s by source id.
#[derive(Default)]
pub(crate) struct MockConnector {
    transports: Mutex<HashMap<String, Arc<MockTransport>>>,
    disconnects: AtomicUsize,
}

impl MockConnector {
    pub(crate) fn add(&self, transport: Arc<MockTransport>) {
        self.transports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(transport.source_id.clone(), transport);
    }

    pub(crate) fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceConnector for MockConnector {
    async fn connect(&self, source: &SourceConfig) -> Result<Arc<dyn ConnectionTransport>, McpError> {
        let transports = self.transports.lock().unwrap_or_else(PoisonError::into_inner);
        match transports.get(&source.id) {
            Some(transport) => Ok(Arc::clone(transport) as Arc<dyn ConnectionTransport>),
            None => Err(McpError::connection(&source.id, "no mock transport registered")),
        }
    }

    async fn disconnect(&self, _source_id: &str) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

// ─── RecordingSink ───────────────────────────────────────────────────────────

#[derive(Default)]
pub(crate) struct RecordingSink {
    events: Mutex<Vec<McpEvent>>,
}

impl RecordingSink {
    pub(crate) fn events(&self) -> Vec<McpEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl EventSink for RecordingSink {
    fn publish(&self, event: McpEvent) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(event);
    }
}

// ─── Loopback Servers ────────────────────────────────────────────────────────

/// Serve exactly one HTTP response on a loopback port.
///
/// The whole request (headers plus `Content-Length` body) is read before
/// replying so the client never sees a reset mid-upload.
pub(crate) async fn serve_once(status_line: &str, headers: &[(&str, &str)], body: &str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let mut response = format!("HTTP/1.1 {status_line}\r\n");
    for (name, value) in headers {
        response.push_str(&format!("{name}: {value}\r\n"));
    }
    response.push_str(&format!(
        "Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    ));

    tokio::spawn(async move {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };
        read_http_request(&mut stream).await;
        let _ = stream.write_all(response.as_bytes()).await;
        let _ = stream.shutdown().await;
    });

    addr
}

async fn read_http_request(stream: &mut tokio::net::TcpStream) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_ascii_lowercase();
    let content_length = head
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);

    while buf.len() < header_end + content_length {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
}

/// Accept WebSocket connections on a loopback port and answer every text
/// frame with the frames `handler` returns.
pub(crate) async fn serve_websocket<F>(handler: F) -> SocketAddr
where
    F: Fn(String) -> Vec<String> + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handler = Arc::new(handler);

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(message)) = ws.next().await {
                    match message {
                        Message::Text(text) => {
                            for reply in handler(text.as_str().to_string()) {
                                if ws.send(Message::Text(reply.into())).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }
            });
        }
    });

    addr
}
