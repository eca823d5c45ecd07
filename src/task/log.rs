//! Per-sweep structured logging.
//!
//! Each sweep master owns one [`SweepLog`]: timestamped lines appended to a
//! `sweep.log` file inside the master's work directory, mirrored to the
//! tracing console stream. Variants share their master's log.

use anyhow::Result;
use chrono::Utc;
use std::path::Path;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{error, info};

/// Append-only log for one sweep. Created detached (console only) and
/// attached to a file once the master's work directory exists; closed during
/// finalization.
pub struct SweepLog {
    sweep: String,
    file: Mutex<Option<tokio::fs::File>>,
}

impl SweepLog {
    pub(crate) fn detached(sweep: impl Into<String>) -> Self {
        Self {
            sweep: sweep.into(),
            file: Mutex::new(None),
        }
    }

    /// Open (or create) the log file and start appending to it.
    pub(crate) async fn attach(&self, path: &Path) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        *self.file.lock().await = Some(file);
        Ok(())
    }

    pub async fn info(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        info!(sweep = %self.sweep, "{}", message);
        self.append("INFO", message).await;
    }

    pub async fn error(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        error!(sweep = %self.sweep, "{}", message);
        self.append("ERROR", message).await;
    }

    /// Flush and drop the file handle; later lines go to the console only.
    pub(crate) async fn close(&self) {
        let mut guard = self.file.lock().await;
        if let Some(mut file) = guard.take() {
            let _ = file.flush().await;
        }
    }

    async fn append(&self, level: &str, message: &str) {
        let mut guard = self.file.lock().await;
        if let Some(file) = guard.as_mut() {
            let line = format!(
                "{} {:5} [{}] {}\n",
                Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
                level,
                self.sweep,
                message
            );
            // A failed append must never take the sweep down with it.
            if let Err(err) = file.write_all(line.as_bytes()).await {
                error!(sweep = %self.sweep, error = %err, "failed to append to sweep log");
                *guard = None;
            }
        }
    }
}
