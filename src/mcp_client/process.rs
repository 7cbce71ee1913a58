//! A single stdio MCP server process and its status state machine.
//!
//! The handle owns the child's IO channel and wait handle but never signals
//! the process itself; spawning and killing belong to
//! [`ProcessPool`](super::pool::ProcessPool).

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use uuid::Uuid;

use super::codec;
use super::errors::McpError;
use super::types::{JsonRpcRequest, JsonRpcResponse, ServerInfo};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Idle time after which a handle counts as stale and gets an active ping.
pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(300);

/// Restart attempts tolerated before a configuration is given up on.
pub const DEFAULT_MAX_RESTARTS: u32 = 3;

/// Lines of stderr retained for diagnostics.
const STDERR_TAIL_LINES: usize = 50;

// ─── Status ──────────────────────────────────────────────────────────────────

/// Lifecycle status of a process handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Starting,
    Ready,
    Error,
    Stopping,
    Stopped,
}

impl ProcessStatus {
    pub const ALL: [ProcessStatus; 5] = [
        ProcessStatus::Starting,
        ProcessStatus::Ready,
        ProcessStatus::Error,
        ProcessStatus::Stopping,
        ProcessStatus::Stopped,
    ];

    /// Whether the transition table allows `self -> to`.
    pub fn can_transition_to(self, to: ProcessStatus) -> bool {
        use ProcessStatus::*;
        matches!(
            (self, to),
            (Starting, Ready | Error | Stopping | Stopped)
                | (Ready, Error | Stopping | Stopped)
                | (Error, Starting | Stopping | Stopped)
                | (Stopping, Stopped)
                | (Stopped, Starting)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::Starting => "starting",
            ProcessStatus::Ready => "ready",
            ProcessStatus::Error => "error",
            ProcessStatus::Stopping => "stopping",
            ProcessStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Stdio Channel ───────────────────────────────────────────────────────────

/// The child's stdin/stdout pair. Exactly one exchange uses it at a time.
struct StdioChannel {
    writer: ChildStdin,
    reader: BufReader<ChildStdout>,
}

impl StdioChannel {
    /// Read lines until the response to `request` arrives.
    ///
    /// Non-JSON lines (server log output), notifications and responses for
    /// other ids are skipped.
    async fn read_response(&mut self, source_id: &str, request: &JsonRpcRequest) -> Result<JsonRpcResponse, McpError> {
        let mut line_buf = String::new();
        loop {
            line_buf.clear();
            let bytes_read = self
                .reader
                .read_line(&mut line_buf)
                .await
                .map_err(|e| McpError::connection(source_id, format!("failed to read from stdout: {e}")))?;

            if bytes_read == 0 {
                return Err(McpError::connection(
                    source_id,
                    "server stdout closed (process may have exited)",
                ));
            }

            let trimmed = line_buf.trim();
            if trimmed.is_empty() {
                continue;
            }

            let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) else {
                tracing::trace!(source = source_id, line = trimmed, "skipping non-JSON stdout line");
                continue;
            };

            match codec::response_from_value(&value) {
                Some(resp) if resp.id == request.id => return Ok(resp),
                Some(resp) => {
                    tracing::debug!(
                        source = source_id,
                        id = ?resp.id,
                        "skipping response for a different request"
                    );
                }
                None => {
                    tracing::trace!(source = source_id, "skipping non-response message");
                }
            }
        }
    }

    async fn write_line(&mut self, source_id: &str, line: &str) -> Result<(), McpError> {
        self.writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| McpError::connection(source_id, format!("failed to write to stdin: {e}")))?;
        self.writer
            .flush()
            .await
            .map_err(|e| McpError::connection(source_id, format!("failed to flush stdin: {e}")))
    }
}

// ─── ProcessHandle ───────────────────────────────────────────────────────────

/// Mutable bookkeeping guarded by a short-lived lock.
#[derive(Debug)]
struct HandleState {
    status: ProcessStatus,
    process_id: Option<u32>,
    started_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    /// Last caller request. Health pings do not move this.
    last_used: DateTime<Utc>,
    /// At least one caller request completed (the handshake does not count).
    served: bool,
    restart_count: u32,
    capabilities: serde_json::Value,
    server_info: Option<ServerInfo>,
    tools: Vec<serde_json::Value>,
}

/// One spawned stdio MCP server.
pub struct ProcessHandle {
    id: String,
    configuration_id: String,
    owner_id: Option<String>,
    state: Mutex<HandleState>,
    /// Taken by `terminate`; `None` once the pool owns the wait.
    child: Mutex<Option<Child>>,
    /// The request/response channel. Holding this lock is what serialises
    /// requests to one in flight per process.
    io: tokio::sync::Mutex<Option<StdioChannel>>,
    /// Serialises the `initialize` handshake.
    init_lock: tokio::sync::Mutex<()>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("id", &self.id)
            .field("configuration_id", &self.configuration_id)
            .field("status", &self.status())
            .field("process_id", &self.process_id())
            .finish()
    }
}

impl ProcessHandle {
    /// A fresh handle in `starting`, not yet attached to a process.
    pub fn new(configuration_id: &str, owner_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            configuration_id: configuration_id.to_string(),
            owner_id,
            state: Mutex::new(HandleState {
                status: ProcessStatus::Starting,
                process_id: None,
                started_at: now,
                last_activity: now,
                last_used: now,
                served: false,
                restart_count: 0,
                capabilities: serde_json::Value::Object(Default::default()),
                server_info: None,
                tools: Vec::new(),
            }),
            child: Mutex::new(None),
            io: tokio::sync::Mutex::new(None),
            init_lock: tokio::sync::Mutex::new(()),
            stderr_tail: Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES))),
        }
    }

    fn state(&self) -> MutexGuard<'_, HandleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind the spawned child to this handle. Sets the pid exactly once.
    pub(crate) fn attach(&self, mut child: Child) -> Result<(), McpError> {
        let mut state = self.state();
        if state.process_id.is_some() {
            return Err(McpError::InvalidArgument {
                reason: format!("handle {} is already attached to a process", self.id),
            });
        }

        let stdin = child.stdin.take().ok_or_else(|| McpError::SpawnFailed {
            source_id: self.configuration_id.clone(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| McpError::SpawnFailed {
            source_id: self.configuration_id.clone(),
            reason: "failed to capture stdout".into(),
        })?;

        state.process_id = child.id();
        state.started_at = Utc::now();
        state.last_activity = state.started_at;
        drop(state);

        // Nobody else can hold the IO lock before the handle is registered.
        if let Ok(mut io) = self.io.try_lock() {
            *io = Some(StdioChannel {
                writer: stdin,
                reader: BufReader::new(stdout),
            });
        }
        *self.child.lock().unwrap_or_else(PoisonError::into_inner) = Some(child);
        Ok(())
    }

    // ─── Identity ────────────────────────────────────────────────────────

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn configuration_id(&self) -> &str {
        &self.configuration_id
    }

    pub fn owner_id(&self) -> Option<&str> {
        self.owner_id.as_deref()
    }

    pub fn process_id(&self) -> Option<u32> {
        self.state().process_id
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.state().last_activity
    }

    // ─── Status ──────────────────────────────────────────────────────────

    pub fn status(&self) -> ProcessStatus {
        self.state().status
    }

    /// Move to `to`, or fail without touching state if the table forbids it.
    pub fn update_status(&self, to: ProcessStatus) -> Result<(), McpError> {
        let mut state = self.state();
        let from = state.status;
        if !from.can_transition_to(to) {
            return Err(McpError::InvalidStateTransition { from, to });
        }
        state.status = to;
        state.last_activity = Utc::now();
        drop(state);

        tracing::debug!(
            handle = %self.id,
            source = %self.configuration_id,
            from = %from,
            to = %to,
            "process status changed"
        );
        Ok(())
    }

    /// `starting` or `ready`.
    pub fn is_running(&self) -> bool {
        matches!(self.status(), ProcessStatus::Starting | ProcessStatus::Ready)
    }

    pub fn is_ready(&self) -> bool {
        self.status() == ProcessStatus::Ready
    }

    pub fn is_error(&self) -> bool {
        self.status() == ProcessStatus::Error
    }

    /// `stopping` or `stopped`.
    pub fn is_stopped(&self) -> bool {
        matches!(self.status(), ProcessStatus::Stopping | ProcessStatus::Stopped)
    }

    /// Record activity without changing status.
    pub fn touch(&self) {
        self.state().last_activity = Utc::now();
    }

    /// Record a caller request (also counts as activity).
    pub fn mark_used(&self) {
        let mut state = self.state();
        let now = Utc::now();
        state.last_activity = now;
        state.last_used = now;
        state.served = true;
    }

    /// Whether a caller request has ever succeeded on this process.
    pub fn has_served(&self) -> bool {
        self.state().served
    }

    pub fn last_used(&self) -> DateTime<Utc> {
        self.state().last_used
    }

    /// No caller request for longer than `threshold`.
    pub fn is_idle(&self, threshold: Duration) -> bool {
        let unused = Utc::now().signed_duration_since(self.last_used());
        chrono::Duration::from_std(threshold).is_ok_and(|limit| unused > limit)
    }

    /// Whether the handle has been idle for longer than `threshold`.
    pub fn is_stale(&self, threshold: Duration) -> bool {
        let idle = Utc::now().signed_duration_since(self.last_activity());
        chrono::Duration::from_std(threshold).is_ok_and(|limit| idle > limit)
    }

    #[cfg(test)]
    pub(crate) fn set_last_activity(&self, at: DateTime<Utc>) {
        self.state().last_activity = at;
    }

    #[cfg(test)]
    pub(crate) fn set_last_used(&self, at: DateTime<Utc>) {
        self.state().last_used = at;
    }

    // ─── Restart Bookkeeping ─────────────────────────────────────────────

    pub fn restart_count(&self) -> u32 {
        self.state().restart_count
    }

    pub fn increment_restart_count(&self) -> u32 {
        let mut state = self.state();
        state.restart_count += 1;
        state.restart_count
    }

    pub(crate) fn set_restart_count(&self, count: u32) {
        self.state().restart_count = count;
    }

    pub fn exceeded_restart_limit(&self, max_restarts: u32) -> bool {
        self.restart_count() > max_restarts
    }

    // ─── Discovered Data ─────────────────────────────────────────────────

    pub fn capabilities(&self) -> serde_json::Value {
        self.state().capabilities.clone()
    }

    pub fn server_info(&self) -> Option<ServerInfo> {
        self.state().server_info.clone()
    }

    pub(crate) fn set_initialized(&self, capabilities: serde_json::Value, server_info: Option<ServerInfo>) {
        let mut state = self.state();
        state.capabilities = capabilities;
        state.server_info = server_info;
    }

    /// Raw tool candidates from the most recent discovery through this process.
    pub(crate) fn set_tools(&self, tools: Vec<serde_json::Value>) {
        self.state().tools = tools;
    }

    // ─── Liveness ────────────────────────────────────────────────────────

    /// Whether the OS process still exists. Never panics; a process that
    /// cannot be found counts as dead.
    pub fn process_alive(&self) -> bool {
        {
            let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(child) = child.as_mut() {
                return matches!(child.try_wait(), Ok(None));
            }
        }

        match self.process_id() {
            Some(pid) => pid_exists(pid),
            None => false,
        }
    }

    /// Hand the child over to the pool for termination.
    pub(crate) fn take_child(&self) -> Option<Child> {
        self.child.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    // ─── IO ──────────────────────────────────────────────────────────────

    /// Send a request and await its response, bounded by `timeout`.
    ///
    /// The deadline covers waiting for the channel as well as the exchange
    /// itself. Does not check readiness; transports do that.
    pub(crate) async fn exchange(
        &self,
        request: &JsonRpcRequest,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, McpError> {
        if request.is_notification() {
            return Err(McpError::InvalidArgument {
                reason: "exchange requires a request with an id".into(),
            });
        }
        let line = codec::encode_line(request)?;
        let source_id = self.configuration_id.as_str();
        let writing = AtomicBool::new(false);

        let outcome = tokio::time::timeout(timeout, async {
            let mut io = self.io.lock().await;
            let channel = io
                .as_mut()
                .ok_or_else(|| McpError::connection(source_id, "stdio channel is closed"))?;
            writing.store(true, Ordering::SeqCst);
            channel.write_line(source_id, &line).await?;
            writing.store(false, Ordering::SeqCst);
            channel.read_response(source_id, request).await
        })
        .await;

        match outcome {
            Ok(Ok(response)) => {
                self.touch();
                Ok(response)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                if writing.load(Ordering::SeqCst) {
                    self.abandon_channel().await;
                }
                Err(McpError::timeout(source_id, timeout))
            }
        }
    }

    /// Write a notification. No response is read.
    pub(crate) async fn notify(&self, notification: &JsonRpcRequest, timeout: Duration) -> Result<(), McpError> {
        let line = codec::encode_line(notification)?;
        let source_id = self.configuration_id.as_str();
        let writing = AtomicBool::new(false);

        let outcome = tokio::time::timeout(timeout, async {
            let mut io = self.io.lock().await;
            let channel = io
                .as_mut()
                .ok_or_else(|| McpError::connection(source_id, "stdio channel is closed"))?;
            writing.store(true, Ordering::SeqCst);
            channel.write_line(source_id, &line).await
        })
        .await;

        match outcome {
            Ok(result) => result,
            Err(_) => {
                if writing.load(Ordering::SeqCst) {
                    self.abandon_channel().await;
                }
                Err(McpError::timeout(source_id, timeout))
            }
        }
    }

    /// A write cut off by a deadline may have left half a line in stdin;
    /// nothing can safely follow it on this channel.
    async fn abandon_channel(&self) {
        self.io.lock().await.take();
        let _ = self.update_status(ProcessStatus::Error);
        tracing::warn!(
            handle = %self.id,
            source = %self.configuration_id,
            "request timed out mid-write, stdio channel closed"
        );
    }

    /// Close stdin/stdout. Returns `true` only for the call that actually closed them.
    pub async fn close_io(&self) -> bool {
        self.io.lock().await.take().is_some()
    }

    /// Close IO if no request currently holds the channel.
    pub(crate) fn try_close_io(&self) -> bool {
        match self.io.try_lock() {
            Ok(mut io) => io.take().is_some(),
            Err(_) => false,
        }
    }

    pub(crate) fn init_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.init_lock
    }

    // ─── Stderr ──────────────────────────────────────────────────────────

    /// Shared buffer the pool's stderr drain appends to.
    pub(crate) fn stderr_sink(&self) -> Arc<Mutex<VecDeque<String>>> {
        Arc::clone(&self.stderr_tail)
    }

    /// The most recent stderr output, oldest first.
    pub fn stderr_tail(&self) -> String {
        let tail = self.stderr_tail.lock().unwrap_or_else(PoisonError::into_inner);
        tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    /// A read-only copy of the handle for callers outside the pool.
    pub fn view(&self) -> ProcessHandleView {
        let state = self.state();
        ProcessHandleView {
            id: self.id.clone(),
            configuration_id: self.configuration_id.clone(),
            owner_id: self.owner_id.clone(),
            status: state.status,
            process_id: state.process_id,
            restart_count: state.restart_count,
            started_at: state.started_at,
            last_activity: state.last_activity,
            last_used: state.last_used,
            tool_count: state.tools.len(),
        }
    }
}

/// Append a stderr line to a bounded tail buffer.
pub(crate) fn push_stderr_line(tail: &Mutex<VecDeque<String>>, line: String) {
    let mut tail = tail.lock().unwrap_or_else(PoisonError::into_inner);
    if tail.len() == STDERR_TAIL_LINES {
        tail.pop_front();
    }
    tail.push_back(line);
}

/// Snapshot of a [`ProcessHandle`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessHandleView {
    pub id: String,
    pub configuration_id: String,
    pub owner_id: Option<String>,
    pub status: ProcessStatus,
    pub process_id: Option<u32>,
    pub restart_count: u32,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub tool_count: usize,
}

/// Check a pid with signal 0.
#[cfg(unix)]
pub(crate) fn pid_exists(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        // Exists but belongs to someone else
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub(crate) fn pid_exists(_pid: u32) -> bool {
    false
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn handle_in(status: ProcessStatus) -> ProcessHandle {
        let handle = ProcessHandle::new("fs", None);
        // Walk a legal path to the requested status
        let path: &[ProcessStatus] = match status {
            ProcessStatus::Starting => &[],
            ProcessStatus::Ready => &[ProcessStatus::Ready],
            ProcessStatus::Error => &[ProcessStatus::Error],
            ProcessStatus::Stopping => &[ProcessStatus::Stopping],
            ProcessStatus::Stopped => &[ProcessStatus::Stopped],
        };
        for step in path {
            handle.update_status(*step).unwrap();
        }
        assert_eq!(handle.status(), status);
        handle
    }

    #[test]
    fn test_new_handle_starts_in_starting() {
        let handle = ProcessHandle::new("fs", Some("user-1".into()));
        assert_eq!(handle.status(), ProcessStatus::Starting);
        assert!(handle.is_running());
        assert!(!handle.is_ready());
        assert_eq!(handle.process_id(), None);
        assert_eq!(handle.owner_id(), Some("user-1"));
        assert!(!handle.process_alive());
    }

    #[test]
    fn test_transition_table_is_closed() {
        for from in ProcessStatus::ALL {
            for to in ProcessStatus::ALL {
                let handle = handle_in(from);
                let before = handle.last_activity();
                let result = handle.update_status(to);
                if from.can_transition_to(to) {
                    assert!(result.is_ok(), "{from} -> {to} should be allowed");
                    assert_eq!(handle.status(), to);
                    assert!(handle.last_activity() >= before);
                } else {
                    assert!(
                        matches!(result, Err(McpError::InvalidStateTransition { from: f, to: t }) if f == from && t == to),
                        "{from} -> {to} should be rejected"
                    );
                    assert_eq!(handle.status(), from, "rejected transition must not mutate");
                }
            }
        }
    }

    #[test]
    fn test_allowed_transitions_match_table() {
        use ProcessStatus::*;
        assert!(Starting.can_transition_to(Ready));
        assert!(Error.can_transition_to(Starting));
        assert!(Stopped.can_transition_to(Starting));
        assert!(!Stopping.can_transition_to(Ready));
        assert!(!Stopped.can_transition_to(Ready));
        assert!(!Ready.can_transition_to(Starting));
        assert!(!Ready.can_transition_to(Ready));
    }

    #[test]
    fn test_predicates() {
        assert!(handle_in(ProcessStatus::Ready).is_running());
        assert!(handle_in(ProcessStatus::Error).is_error());
        assert!(handle_in(ProcessStatus::Stopping).is_stopped());
        assert!(handle_in(ProcessStatus::Stopped).is_stopped());
        assert!(!handle_in(ProcessStatus::Error).is_running());
    }

    #[test]
    fn test_staleness() {
        let handle = ProcessHandle::new("fs", None);
        assert!(!handle.is_stale(DEFAULT_STALE_THRESHOLD));

        handle.set_last_activity(Utc::now() - chrono::Duration::seconds(301));
        assert!(handle.is_stale(DEFAULT_STALE_THRESHOLD));

        handle.touch();
        assert!(!handle.is_stale(DEFAULT_STALE_THRESHOLD));
    }

    #[test]
    fn test_touch_does_not_reset_idle() {
        let handle = ProcessHandle::new("fs", None);
        handle.set_last_used(Utc::now() - chrono::Duration::seconds(1000));
        handle.touch();
        assert!(handle.is_idle(Duration::from_secs(900)));

        assert!(!handle.has_served());
        handle.mark_used();
        assert!(handle.has_served());
        assert!(!handle.is_idle(Duration::from_secs(900)));
        assert!(!handle.is_stale(DEFAULT_STALE_THRESHOLD));
    }

    #[test]
    fn test_restart_limit() {
        let handle = ProcessHandle::new("fs", None);
        for _ in 0..DEFAULT_MAX_RESTARTS {
            handle.increment_restart_count();
        }
        assert!(!handle.exceeded_restart_limit(DEFAULT_MAX_RESTARTS));
        assert_eq!(handle.increment_restart_count(), 4);
        assert!(handle.exceeded_restart_limit(DEFAULT_MAX_RESTARTS));
    }

    #[test]
    fn test_stderr_tail_is_bounded() {
        let handle = ProcessHandle::new("fs", None);
        let sink = handle.stderr_sink();
        for i in 0..(STDERR_TAIL_LINES + 5) {
            push_stderr_line(&sink, format!("line {i}"));
        }
        let tail = handle.stderr_tail();
        assert!(!tail.contains("line 4\n"));
        assert!(tail.starts_with("line 5"));
        assert!(tail.ends_with(&format!("line {}", STDERR_TAIL_LINES + 4)));
    }

    #[tokio::test]
    async fn test_close_io_without_process_is_noop() {
        let handle = ProcessHandle::new("fs", None);
        assert!(!handle.close_io().await);
    }

    #[tokio::test]
    async fn test_exchange_without_channel_fails_with_connection_error() {
        let handle = ProcessHandle::new("fs", None);
        let req = codec::build_request("ping", None, None).unwrap();
        let err = handle.exchange(&req, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, McpError::Connection { .. }));
    }

    #[test]
    fn test_view_reflects_state() {
        let handle = ProcessHandle::new("fs", None);
        handle.update_status(ProcessStatus::Ready).unwrap();
        handle.set_tools(vec![serde_json::json!({"name": "read"})]);
        let view = handle.view();
        assert_eq!(view.status, ProcessStatus::Ready);
        assert_eq!(view.tool_count, 1);
        assert_eq!(view.configuration_id, "fs");
    }
}
