//! Tracing setup for hosts embedding the orchestrator.
//!
//! Logs go to stderr or to a line-flushed file in the platform data
//! directory. File logs are rotated on every start (`orchestrator.log` →
//! `.1` → `.2` → `.3`).

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Rotated log files kept next to the live one.
const KEPT_LOG_FILES: u32 = 3;

const LOG_FILE_NAME: &str = "orchestrator.log";

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to open log file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to install tracing subscriber: {reason}")]
    Init { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, overridden by `RUST_LOG`.
    #[serde(default = "default_filter")]
    pub filter: String,
    /// Emit JSON lines instead of human-readable text.
    #[serde(default)]
    pub json: bool,
    /// Write to a log file instead of stderr.
    #[serde(default)]
    pub to_file: bool,
    /// Log directory; defaults to [`data_dir`].
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

fn default_filter() -> String {
    "mcp_orchestrator=info,warn".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            json: false,
            to_file: false,
            directory: None,
        }
    }
}

/// Platform data directory for the orchestrator.
///
/// Falls back to `~/.mcp-orchestrator/` when the platform has none.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("mcp-orchestrator");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mcp-orchestrator")
}

/// Install the global tracing subscriber. Returns the log file path when
/// logging to a file.
pub fn init_tracing(config: &LoggingConfig) -> Result<Option<PathBuf>, LoggingError> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter));

    let log_file = if config.to_file {
        let dir = config.directory.clone().unwrap_or_else(data_dir);
        let _ = std::fs::create_dir_all(&dir);
        let path = dir.join(LOG_FILE_NAME);
        rotate_log_file(&path, KEPT_LOG_FILES);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| LoggingError::Io {
                path: path.display().to_string(),
                source: e,
            })?;
        Some((path, FlushingWriter::new(file)))
    } else {
        None
    };

    let builder = fmt::fmt().with_env_filter(filter).with_target(true).with_thread_ids(false);
    let installed = match (config.json, log_file.as_ref().map(|(_, w)| w.clone())) {
        (true, Some(writer)) => builder.json().with_writer(writer).with_ansi(false).try_init(),
        (true, None) => builder.json().with_writer(std::io::stderr).try_init(),
        (false, Some(writer)) => builder.with_writer(writer).with_ansi(false).try_init(),
        (false, None) => builder.with_writer(std::io::stderr).try_init(),
    };
    installed.map_err(|e| LoggingError::Init { reason: e.to_string() })?;

    let path = log_file.map(|(path, _)| path);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = ?path,
        pid = std::process::id(),
        "mcp orchestrator logging initialised"
    );
    Ok(path)
}

/// Rotate `base` → `base.1` → … → `base.{keep}`; the oldest is deleted.
fn rotate_log_file(base: &Path, keep: u32) {
    let _ = std::fs::remove_file(format!("{}.{keep}", base.display()));

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base.display());
        let to = format!("{}.{}", base.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base.exists() {
        let _ = std::fs::rename(base, format!("{}.1", base.display()));
    }
}

/// File writer that flushes after every write so lines survive a crash.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<Mutex<File>>,
}

impl FlushingWriter {
    fn new(file: File) -> Self {
        Self {
            file: Arc::new(Mutex::new(file)),
        }
    }
}

impl Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = f.write(buf)?;
        f.flush()?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        f.flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
