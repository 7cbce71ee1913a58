//! Process pool for stdio MCP servers.
//!
//! The pool is the only component that spawns, signals or reaps OS
//! processes. Everything else (transports, the health monitor) asks the
//! pool to act on a handle and reads pool state through [`ProcessPool::snapshot`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

use super::config::{resolve_env, PoolSettings, SourceConfig};
use super::errors::McpError;
use super::process::{push_stderr_line, ProcessHandle, ProcessHandleView, ProcessStatus};

/// Upper bound on waiting for an in-flight request to release the IO channel
/// after the process has been signalled.
const IO_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

// ─── ProcessPool ─────────────────────────────────────────────────────────────

/// Owns every live stdio server process, keyed by configuration id.
pub struct ProcessPool {
    settings: PoolSettings,
    /// All registry decisions happen under this lock. It is never held
    /// across a process wait or a request.
    handles: tokio::sync::Mutex<HashMap<String, Arc<ProcessHandle>>>,
    /// Restart count carried over to the next spawn of a configuration.
    /// Cleared once a process that served a caller request goes away, so a
    /// server that only survives its handshake still burns the budget.
    restarts: Mutex<HashMap<String, u32>>,
}

impl ProcessPool {
    pub fn new(settings: PoolSettings) -> Self {
        Self {
            settings,
            handles: tokio::sync::Mutex::new(HashMap::new()),
            restarts: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Return the live handle for `source`, spawning one if needed.
    ///
    /// A freshly spawned handle is in `starting`; the caller performs the
    /// handshake. Spawn failures are not retried here.
    pub async fn acquire(&self, source: &SourceConfig) -> Result<Arc<ProcessHandle>, McpError> {
        let command = source.require_command()?;

        loop {
            let leftover = {
                let mut handles = self.handles.lock().await;

                match handles.get(&source.id) {
                    Some(existing) if existing.is_running() => {
                        existing.touch();
                        return Ok(Arc::clone(existing));
                    }
                    Some(existing) => Some(Arc::clone(existing)),
                    None => {
                        let running = handles.values().filter(|h| h.is_running()).count();
                        if running >= self.settings.max_processes {
                            tracing::warn!(
                                source = %source.id,
                                running,
                                max = self.settings.max_processes,
                                "process pool exhausted"
                            );
                            return Err(McpError::PoolExhausted {
                                max_processes: self.settings.max_processes,
                            });
                        }

                        let handle = Arc::new(ProcessHandle::new(&source.id, source.owner_id.clone()));
                        self.apply_restart_budget(&handle)?;

                        let child = spawn_process(source, command, &handle)?;
                        handle.attach(child)?;

                        tracing::info!(
                            source = %source.id,
                            handle = handle.id(),
                            pid = ?handle.process_id(),
                            restart_count = handle.restart_count(),
                            "spawned MCP server process"
                        );

                        handles.insert(source.id.clone(), Arc::clone(&handle));
                        return Ok(handle);
                    }
                }
            };

            // A handle in error/stopping/stopped still occupies the slot.
            // Tear it down outside the lock, then look again.
            if let Some(leftover) = leftover {
                self.terminate(&leftover).await?;
            }
        }
    }

    /// Carry the configuration's restart count onto a new handle and refuse
    /// the spawn once the limit is exceeded.
    fn apply_restart_budget(&self, handle: &ProcessHandle) -> Result<(), McpError> {
        let mut restarts = self.restarts.lock().unwrap_or_else(PoisonError::into_inner);
        let config_id = handle.configuration_id();

        if let Some(previous) = restarts.get(config_id).copied() {
            handle.set_restart_count(previous);
            handle.increment_restart_count();
            if handle.exceeded_restart_limit(self.settings.max_restarts) {
                tracing::error!(
                    source = config_id,
                    attempts = previous,
                    "restart limit exceeded, refusing to respawn"
                );
                return Err(McpError::RestartExhausted {
                    source_id: config_id.to_string(),
                    attempts: previous,
                });
            }
        }

        restarts.insert(config_id.to_string(), handle.restart_count());
        Ok(())
    }

    /// Forget restart history for a configuration.
    pub fn reset_restarts(&self, configuration_id: &str) {
        self.restarts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(configuration_id);
    }

    /// Mark the handle as in use again. Processes are kept warm; nothing is terminated here.
    pub fn release(&self, handle: &ProcessHandle) {
        handle.touch();
    }

    /// Stop a handle's process: graceful signal, bounded wait, then kill.
    ///
    /// Safe to call more than once and from several tasks; the process is
    /// only signalled by whichever call takes ownership of the child.
    pub async fn terminate(&self, handle: &Arc<ProcessHandle>) -> Result<(), McpError> {
        let source_id = handle.configuration_id().to_string();

        match handle.status() {
            ProcessStatus::Stopped => {}
            ProcessStatus::Stopping => {
                tracing::debug!(source = %source_id, handle = handle.id(), "terminate already in progress");
            }
            _ => {
                if let Err(e) = handle.update_status(ProcessStatus::Stopping) {
                    // Lost a race with another terminate
                    if !handle.is_stopped() {
                        return Err(e);
                    }
                }
            }
        }

        if let Some(child) = handle.take_child() {
            // Closing stdin first lets well-behaved servers exit on EOF.
            handle.try_close_io();
            self.stop_child(&source_id, child).await;
        }

        if tokio::time::timeout(IO_CLOSE_TIMEOUT, handle.close_io()).await.is_err() {
            tracing::warn!(source = %source_id, "timed out waiting to close stdio channel");
        }

        if handle.status() != ProcessStatus::Stopped {
            if let Err(e) = handle.update_status(ProcessStatus::Stopped) {
                if handle.status() != ProcessStatus::Stopped {
                    return Err(e);
                }
            }
        }

        if handle.has_served() {
            self.reset_restarts(&source_id);
        }

        let mut handles = self.handles.lock().await;
        let registered = handles
            .get(&source_id)
            .is_some_and(|current| Arc::ptr_eq(current, handle));
        if registered {
            handles.remove(&source_id);
            tracing::info!(source = %source_id, handle = handle.id(), "MCP server process terminated");
        }

        Ok(())
    }

    async fn stop_child(&self, source_id: &str, mut child: Child) {
        let grace = self.settings.grace_period();

        // Already exited and reaped
        let Some(pid) = child.id() else {
            return;
        };

        if send_terminate(pid) {
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!(source = source_id, pid, code = ?status.code(), "server exited after SIGTERM");
                    return;
                }
                Ok(Err(e)) => {
                    tracing::warn!(source = source_id, pid, error = %e, "wait failed after SIGTERM");
                }
                Err(_) => {
                    tracing::warn!(
                        source = source_id,
                        pid,
                        grace_ms = grace.as_millis() as u64,
                        "server did not exit within grace period"
                    );
                }
            }
        }

        tracing::warn!(source = source_id, pid, "sending SIGKILL");
        if let Err(e) = child.kill().await {
            tracing::error!(source = source_id, pid, error = %e, "SIGKILL failed");
        }
    }

    // ─── Inspection ──────────────────────────────────────────────────────

    /// Read-only views of every tracked handle, ordered by configuration id.
    pub async fn snapshot(&self) -> Vec<ProcessHandleView> {
        let handles = self.handles.lock().await;
        let mut views: Vec<ProcessHandleView> = handles.values().map(|h| h.view()).collect();
        views.sort_by(|a, b| a.configuration_id.cmp(&b.configuration_id));
        views
    }

    /// Handles the health monitor should inspect.
    pub(crate) async fn tracked_handles(&self) -> Vec<Arc<ProcessHandle>> {
        self.handles.lock().await.values().cloned().collect()
    }

    pub async fn get(&self, configuration_id: &str) -> Option<Arc<ProcessHandle>> {
        self.handles.lock().await.get(configuration_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.handles.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.handles.lock().await.is_empty()
    }

    // ─── Housekeeping ────────────────────────────────────────────────────

    /// Terminate ready handles with no caller request for longer than
    /// `idle_timeout`. Returns the configuration ids stopped.
    pub async fn evict_idle(&self, idle_timeout: Duration) -> Vec<String> {
        let idle: Vec<Arc<ProcessHandle>> = self
            .tracked_handles()
            .await
            .into_iter()
            .filter(|h| h.is_ready() && h.is_idle(idle_timeout))
            .collect();

        let mut evicted = Vec::with_capacity(idle.len());
        for handle in idle {
            tracing::info!(source = handle.configuration_id(), "evicting idle MCP server");
            self.reset_restarts(handle.configuration_id());
            match self.terminate(&handle).await {
                Ok(()) => evicted.push(handle.configuration_id().to_string()),
                Err(e) => tracing::warn!(source = handle.configuration_id(), error = %e, "idle eviction failed"),
            }
        }
        evicted
    }

    /// Reap defunct child processes that no tracked handle owns.
    ///
    /// Returns the number of processes reaped. Errors (process already gone)
    /// are ignored.
    pub async fn reap_zombies(&self) -> usize {
        let tracked: Vec<u32> = self
            .tracked_handles()
            .await
            .iter()
            .filter_map(|h| h.process_id())
            .collect();

        let zombies = tokio::task::spawn_blocking(find_zombie_children)
            .await
            .unwrap_or_default();

        let mut reaped = 0;
        for pid in zombies.into_iter().filter(|pid| !tracked.contains(pid)) {
            if reap_pid(pid) {
                tracing::debug!(pid, "reaped zombie child process");
                reaped += 1;
            }
        }
        reaped
    }

    /// Terminate every tracked process.
    pub async fn shutdown_all(&self) {
        let handles = self.tracked_handles().await;
        tracing::info!(count = handles.len(), "shutting down all MCP server processes");
        for handle in handles {
            if let Err(e) = self.terminate(&handle).await {
                tracing::warn!(source = handle.configuration_id(), error = %e, "shutdown failed");
            }
        }
    }
}

// ─── Spawning ────────────────────────────────────────────────────────────────

fn spawn_process(source: &SourceConfig, command: &str, handle: &ProcessHandle) -> Result<Child, McpError> {
    let mut cmd = Command::new(command);
    cmd.args(&source.args);

    for (key, value) in resolve_env(&source.env) {
        cmd.env(key, value);
    }

    if let Some(dir) = source.cwd.as_deref() {
        cmd.current_dir(dir);
    }

    #[cfg(target_os = "windows")]
    {
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
        source_id: source.id.clone(),
        reason: format!("{command}: {e}"),
    })?;

    // Stderr is diagnostics only: log it and keep a short tail.
    if let Some(stderr) = child.stderr.take() {
        let sink = handle.stderr_sink();
        let source_id = source.id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(source = %source_id, line = %line, "server stderr");
                push_stderr_line(&sink, line);
            }
        });
    }

    Ok(child)
}

#[cfg(unix)]
fn send_terminate(pid: u32) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(pid, error = %e, "SIGTERM failed");
            false
        }
    }
}

#[cfg(not(unix))]
fn send_terminate(_pid: u32) -> bool {
    false
}

/// Pids of zombie processes whose parent is this process.
fn find_zombie_children() -> Vec<u32> {
    use sysinfo::{ProcessStatus as OsStatus, ProcessesToUpdate, System};

    let Ok(me) = sysinfo::get_current_pid() else {
        return Vec::new();
    };

    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All, true);
    sys.processes()
        .values()
        .filter(|p| p.parent() == Some(me) && p.status() == OsStatus::Zombie)
        .map(|p| p.pid().as_u32())
        .collect()
}

#[cfg(unix)]
fn reap_pid(pid: u32) -> bool {
    use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    matches!(
        waitpid(Pid::from_raw(raw), Some(WaitPidFlag::WNOHANG)),
        Ok(status) if status != WaitStatus::StillAlive
    )
}

#[cfg(not(unix))]
fn reap_pid(_pid: u32) -> bool {
    false
}

// ─── Tests ───────────────────────────────────────────────────────────────────
