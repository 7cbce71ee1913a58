//! SSE transport.
//!
//! The request is POSTed with `Accept: text/event-stream` and the server
//! answers with a stream of `data:` events: zero or more notifications
//! (progress, logs) followed by the JSON-RPC response for the request.
//! Each call yields a finite [`SseEventStream`]; re-issuing the call starts
//! a fresh one.

use std::fmt::Display;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde_json::Value;

use super::super::codec;
use super::super::config::TransportKind;
use super::super::errors::McpError;
use super::super::types::{JsonRpcRequest, JsonRpcResponse, RequestId};
use super::auth::AuthPlacement;
use super::{map_reqwest_error, status_error, ConnectionTransport};

// ─── Events ──────────────────────────────────────────────────────────────────

/// One decoded SSE event.
#[derive(Debug, Clone, PartialEq)]
pub enum SseEvent {
    /// Anything other than the final response: notifications, progress, server requests.
    Message(Value),
    /// The response to the request that opened the stream. Always last.
    Response(JsonRpcResponse),
}

/// Stops an [`SseEventStream`] from another task.
#[derive(Debug, Clone)]
pub struct SseCancelHandle(Arc<AtomicBool>);

impl SseCancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Event stream for a single request.
///
/// Once cancelled, the next poll drops the underlying connection and the
/// stream ends.
pub struct SseEventStream {
    inner: BoxStream<'static, Result<SseEvent, McpError>>,
    cancelled: Arc<AtomicBool>,
}

impl SseEventStream {
    fn new(inner: BoxStream<'static, Result<SseEvent, McpError>>) -> Self {
        Self {
            inner,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel_handle(&self) -> SseCancelHandle {
        SseCancelHandle(Arc::clone(&self.cancelled))
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

impl Stream for SseEventStream {
    type Item = Result<SseEvent, McpError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.cancelled.load(Ordering::SeqCst) {
            self.inner = stream::empty().boxed();
            return Poll::Ready(None);
        }
        self.inner.poll_next_unpin(cx)
    }
}

// ─── Transport ───────────────────────────────────────────────────────────────

pub struct SseTransport {
    source_id: String,
    endpoint: String,
    client: reqwest::Client,
    auth: Option<AuthPlacement>,
}

impl SseTransport {
    pub fn new(source_id: &str, endpoint: &str, client: reqwest::Client, auth: Option<AuthPlacement>) -> Self {
        Self {
            source_id: source_id.to_string(),
            endpoint: endpoint.to_string(),
            client,
            auth,
        }
    }

    /// Send `request` and stream back the server's events.
    ///
    /// `timeout` bounds the whole exchange, body included.
    pub async fn open_stream(&self, request: &JsonRpcRequest, timeout: Duration) -> Result<SseEventStream, McpError> {
        let mut builder = self
            .client
            .post(&self.endpoint)
            .timeout(timeout)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(request);
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
            return Err(status_error(&self.source_id, status.as_u16(), retry_after.as_deref()));
        }

        let events = parse_event_stream(self.source_id.clone(), request.id.clone(), response.bytes_stream());
        Ok(SseEventStream::new(events.boxed()))
    }
}

#[async_trait]
impl ConnectionTransport for SseTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }

    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn send_request(&self, request: JsonRpcRequest, timeout: Duration) -> Result<JsonRpcResponse, McpError> {
        let outcome = tokio::time::timeout(timeout, async {
            let mut events = self.open_stream(&request, timeout).await?;
            while let Some(event) = events.next().await {
                match event {
                    Ok(SseEvent::Response(response)) => return Ok(response),
                    Ok(SseEvent::Message(message)) => {
                        tracing::trace!(source = %self.source_id, message = %message, "SSE notification");
                    }
                    Err(e) => return Err(e),
                }
            }
            Err(McpError::protocol(&self.source_id, "event stream ended without a response"))
        })
        .await;

        outcome.unwrap_or_else(|_| Err(McpError::timeout(&self.source_id, timeout)))
    }
}

// ─── Parsing ─────────────────────────────────────────────────────────────────

struct ParseState<S> {
    bytes: Pin<Box<S>>,
    buffer: Vec<u8>,
    finished: bool,
}

/// Turn a raw byte stream into SSE events for the request with `request_id`.
///
/// Events are separated by a blank line (`\n\n` or `\r\n\r\n`); `data:`
/// lines within one event are concatenated. Framing works on raw bytes so
/// that line breaks and code points split across chunks survive. Comments, `event:`/`id:` fields and keep-alives are
/// ignored. The stream ends after the matching response.
pub(crate) fn parse_event_stream<S, B, E>(
    source_id: String,
    request_id: Option<RequestId>,
    bytes: S,
) -> impl Stream<Item = Result<SseEvent, McpError>> + Send + 'static
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let state = ParseState {
        bytes: Box::pin(bytes),
        buffer: Vec::new(),
        finished: false,
    };

    stream::unfold(state, move |mut state| {
        let source_id = source_id.clone();
        let request_id = request_id.clone();
        async move {
            if state.finished {
                return None;
            }
            loop {
                if let Some((event_end, separator)) = find_event_end(&state.buffer) {
                    let event: Vec<u8> = state.buffer.drain(..event_end + separator).take(event_end).collect();

                    match decode_event_bytes(&source_id, request_id.as_ref(), event) {
                        Some(Ok(event)) => {
                            state.finished = matches!(event, SseEvent::Response(_));
                            return Some((Ok(event), state));
                        }
                        Some(Err(e)) => return Some((Err(e), state)),
                        None => continue, // keep-alive or comment
                    }
                }

                match state.bytes.next().await {
                    Some(Ok(chunk)) => state.buffer.extend_from_slice(chunk.as_ref()),
                    Some(Err(e)) => {
                        state.finished = true;
                        return Some((
                            Err(McpError::connection(&source_id, format!("stream read error: {e}"))),
                            state,
                        ));
                    }
                    None => {
                        // Stream ended; flush a trailing event without its blank line
                        state.finished = true;
                        let rest = std::mem::take(&mut state.buffer);
                        return decode_event_bytes(&source_id, request_id.as_ref(), rest).map(|item| (item, state));
                    }
                }
            }
        }
    })
}

/// Position and length of the first blank-line separator in `buffer`.
fn find_event_end(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n").map(|at| (at, 2));
    let crlf = buffer.windows(4).position(|w| w == b"\r\n\r\n").map(|at| (at, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn decode_event_bytes(
    source_id: &str,
    request_id: Option<&RequestId>,
    event: Vec<u8>,
) -> Option<Result<SseEvent, McpError>> {
    match String::from_utf8(event) {
        Ok(text) => decode_event(source_id, request_id, text.trim()),
        Err(e) => Some(Err(McpError::protocol(
            source_id,
            format!("SSE event is not valid UTF-8: {e}"),
        ))),
    }
}

fn decode_event(source_id: &str, request_id: Option<&RequestId>, event: &str) -> Option<Result<SseEvent, McpError>> {
    let mut data = String::new();
    for line in event.lines() {
        if let Some(value) = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")) {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(value.trim());
        }
    }

    if data.is_empty() {
        return None;
    }

    let value: Value = match serde_json::from_str(&data) {
        Ok(value) => value,
        Err(e) => {
            return Some(Err(McpError::protocol(
                source_id,
                format!("failed to parse SSE data: {e} (data: {data})"),
            )))
        }
    };

    match codec::response_from_value(&value) {
        Some(response) if response.id.as_ref() == request_id => Some(Ok(SseEvent::Response(response))),
        _ => Some(Ok(SseEvent::Message(value))),
    }
}
