//! Health monitoring for pooled processes and remote servers.
//!
//! Two independent sweeps:
//!
//! - **process sweep** (every 30s by default) over the pool's tracked
//!   handles. Dead or errored handles count as failures straight away;
//!   stale ones get an active `ping`. A source that fails
//!   `unhealthy_threshold` times in a row is moved to `error` and
//!   terminated through the pool. Zombie reaping and idle eviction run at
//!   the end of each pass.
//! - **server sweep** (every 5 min by default) probing enabled
//!   http/sse/websocket sources and publishing a `global_health` summary.
//!
//! Each loop sleeps after its pass, so a slow pass never overlaps the next.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use super::codec;
use super::config::{ConfigProvider, HealthSettings, TransportKind};
use super::error_handler::ErrorHandler;
use super::events::{EventSink, McpEvent};
use super::pool::ProcessPool;
use super::process::{ProcessHandle, ProcessStatus};
use super::transport::{check_ping, SourceConnector};

// ─── Records ─────────────────────────────────────────────────────────────────

/// Health of one source as last observed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthRecord {
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub last_checked: Option<DateTime<Utc>>,
    /// Handle the failures were counted against; a new process starts over.
    #[serde(skip)]
    handle_id: Option<String>,
}

impl Default for HealthRecord {
    fn default() -> Self {
        Self {
            healthy: true,
            consecutive_failures: 0,
            last_checked: None,
            handle_id: None,
        }
    }
}

/// What one process sweep did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    pub checked: usize,
    pub unhealthy: Vec<String>,
    pub terminated: Vec<String>,
    pub evicted: Vec<String>,
    pub reaped: usize,
}

/// Result of one server sweep.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GlobalHealth {
    pub healthy_count: usize,
    pub unhealthy_count: usize,
    pub percentage: f64,
}

impl GlobalHealth {
    fn new(healthy_count: usize, unhealthy_count: usize) -> Self {
        let total = healthy_count + unhealthy_count;
        let percentage = if total == 0 {
            100.0
        } else {
            healthy_count as f64 * 100.0 / total as f64
        };
        Self {
            healthy_count,
            unhealthy_count,
            percentage,
        }
    }
}

// ─── HealthMonitor ───────────────────────────────────────────────────────────

pub struct HealthMonitor {
    pool: Arc<ProcessPool>,
    provider: Arc<dyn ConfigProvider>,
    connector: Arc<dyn SourceConnector>,
    errors: Arc<ErrorHandler>,
    events: Arc<dyn EventSink>,
    settings: HealthSettings,
    records: Mutex<HashMap<String, HealthRecord>>,
}

impl HealthMonitor {
    pub fn new(
        pool: Arc<ProcessPool>,
        provider: Arc<dyn ConfigProvider>,
        connector: Arc<dyn SourceConnector>,
        errors: Arc<ErrorHandler>,
        events: Arc<dyn EventSink>,
        settings: HealthSettings,
    ) -> Self {
        Self {
            pool,
            provider,
            connector,
            errors,
            events,
            settings,
            records: Mutex::new(HashMap::new()),
        }
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, HealthRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Per-source health, ordered by source id.
    pub fn snapshot(&self) -> BTreeMap<String, HealthRecord> {
        self.records()
            .iter()
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect()
    }

    /// Reset a source after a successful ping or invocation.
    pub fn record_success(&self, source_id: &str) {
        let mut records = self.records();
        let record = records.entry(source_id.to_string()).or_default();
        if record.consecutive_failures > 0 {
            tracing::info!(source = source_id, "source healthy again");
        }
        record.healthy = true;
        record.consecutive_failures = 0;
        record.last_checked = Some(Utc::now());
    }

    /// Count a failure and return the new consecutive total.
    fn record_failure(&self, source_id: &str, handle_id: Option<&str>) -> u32 {
        let mut records = self.records();
        let record = records.entry(source_id.to_string()).or_default();
        if handle_id.is_some() && record.handle_id.as_deref() != handle_id {
            record.consecutive_failures = 0;
            record.handle_id = handle_id.map(str::to_string);
        }
        record.healthy = false;
        record.consecutive_failures += 1;
        record.last_checked = Some(Utc::now());
        record.consecutive_failures
    }

    // ─── Process Sweep ───────────────────────────────────────────────────

    /// One pass over every pooled process.
    pub async fn sweep_processes(&self) -> SweepReport {
        let mut report = SweepReport::default();

        for handle in self.pool.tracked_handles().await {
            // Already being torn down
            if handle.is_stopped() {
                continue;
            }
            report.checked += 1;

            match self.check_process(&handle).await {
                Ok(()) => {
                    let mut records = self.records();
                    let record = records.entry(handle.configuration_id().to_string()).or_default();
                    record.healthy = true;
                    record.consecutive_failures = 0;
                    record.last_checked = Some(Utc::now());
                    record.handle_id = Some(handle.id().to_string());
                }
                Err(reason) => {
                    report.unhealthy.push(handle.configuration_id().to_string());
                    if self.escalate(&handle, &reason).await {
                        report.terminated.push(handle.configuration_id().to_string());
                    }
                }
            }
        }

        report.reaped = self.pool.reap_zombies().await;
        report.evicted = self.pool.evict_idle(self.pool.settings().idle_timeout()).await;

        if !report.unhealthy.is_empty() || report.reaped > 0 || !report.evicted.is_empty() {
            tracing::info!(
                checked = report.checked,
                unhealthy = report.unhealthy.len(),
                terminated = report.terminated.len(),
                evicted = report.evicted.len(),
                reaped = report.reaped,
                "process health sweep"
            );
        }
        report
    }

    /// `Err(reason)` if the handle is unhealthy.
    async fn check_process(&self, handle: &ProcessHandle) -> Result<(), String> {
        if !handle.process_alive() {
            return Err("process is not alive".into());
        }
        if handle.is_error() {
            return Err("process is in error state".into());
        }

        let stale_after = Duration::from_secs(self.settings.stale_after_secs);
        if !handle.is_stale(stale_after) {
            return Ok(());
        }
        if handle.status() != ProcessStatus::Ready {
            return Err(format!("stale while {}", handle.status()));
        }

        let ping_timeout = Duration::from_secs(self.settings.ping_timeout_secs);
        let request = codec::build_request("ping", None, None).map_err(|e| e.to_string())?;
        match handle.exchange(&request, ping_timeout).await {
            Ok(response) => check_ping(response).map_err(|e| format!("ping failed: {e}")),
            Err(e) => Err(format!("ping failed: {e}")),
        }
    }

    /// Record a failure; at the threshold move the handle to `error` and
    /// terminate it. Returns `true` if this call tore the handle down.
    async fn escalate(&self, handle: &Arc<ProcessHandle>, reason: &str) -> bool {
        let source_id = handle.configuration_id();
        let failures = self.record_failure(source_id, Some(handle.id()));

        tracing::warn!(
            source = source_id,
            handle = handle.id(),
            consecutive_failures = failures,
            reason,
            "unhealthy MCP server process"
        );
        self.events.publish(McpEvent::ServerUnhealthy {
            source_id: source_id.to_string(),
            consecutive_failures: failures,
        });

        if failures < self.settings.unhealthy_threshold {
            return false;
        }

        if !handle.is_error() {
            if let Err(e) = handle.update_status(ProcessStatus::Error) {
                tracing::error!(source = source_id, error = %e, "could not mark unhealthy process as error");
            }
        }
        match self.pool.terminate(handle).await {
            Ok(()) => {
                tracing::warn!(source = source_id, failures, "terminated unhealthy MCP server process");
                true
            }
            Err(e) => {
                tracing::error!(source = source_id, error = %e, "failed to terminate unhealthy process");
                false
            }
        }
    }

    // ─── Server Sweep ────────────────────────────────────────────────────

    /// Ping every enabled remote source and publish the global summary.
    pub async fn sweep_servers(&self) -> GlobalHealth {
        let timeout = Duration::from_secs(self.settings.ping_timeout_secs);
        let mut healthy = 0;
        let mut unhealthy = 0;

        let remote = self
            .provider
            .sources()
            .into_iter()
            .filter(|s| s.enabled && s.transport != TransportKind::Stdio);

        for source in remote {
            if self.errors.requires_attention(&source.id).is_some() {
                continue;
            }

            let attempt = match self.connector.connect(&source).await {
                Ok(transport) => transport.test_connection(timeout).await,
                Err(e) => Err(e),
            };

            match attempt {
                Ok(elapsed) => {
                    tracing::debug!(source = %source.id, elapsed_ms = elapsed.as_millis() as u64, "server healthy");
                    self.record_success(&source.id);
                    healthy += 1;
                }
                Err(e) => {
                    unhealthy += 1;
                    let failures = self.record_failure(&source.id, None);
                    tracing::warn!(source = %source.id, consecutive_failures = failures, error = %e, "server health check failed");
                    self.events.publish(McpEvent::ServerUnhealthy {
                        source_id: source.id.clone(),
                        consecutive_failures: failures,
                    });
                    // Reconnect from scratch next time
                    self.connector.disconnect(&source.id).await;
                }
            }
        }

        let summary = GlobalHealth::new(healthy, unhealthy);
        self.events.publish(McpEvent::GlobalHealth {
            healthy_count: summary.healthy_count,
            unhealthy_count: summary.unhealthy_count,
            percentage: summary.percentage,
        });
        summary
    }

    // ─── Loops ───────────────────────────────────────────────────────────

    pub async fn run_process_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.settings.process_interval_secs.max(1));
        while wait_or_shutdown(interval, &mut shutdown).await {
            self.sweep_processes().await;
        }
        tracing::debug!("process health loop stopped");
    }

    pub async fn run_server_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.settings.server_interval_secs.max(1));
        while wait_or_shutdown(interval, &mut shutdown).await {
            self.sweep_servers().await;
        }
        tracing::debug!("server health loop stopped");
    }
}

/// Sleep for `interval`. `false` once shutdown is signalled or its sender is gone.
pub(crate) async fn wait_or_shutdown(interval: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(interval) => {}
        changed = shutdown.changed() => {
            if changed.is_err() {
                return false;
            }
        }
    }
    !*shutdown.borrow()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
