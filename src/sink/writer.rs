//! Append-only `error.log` writer with an ordered background queue.

use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::mpsc,
    thread::JoinHandle,
    time::Duration,
};

use chrono::Utc;
use tracing::{debug, error, warn};

use super::{format_line, ErrorLog, LOG_FILE_NAME};
use crate::fault::Incident;
use crate::{AppError, Result};

/// Work items for the writer thread, processed in submission order.
enum Command {
    Append(String),
    Flush(mpsc::SyncSender<()>),
}

/// Appends one record per incident to `<log_dir>/error.log`.
///
/// Appends are handed to a single writer thread over a channel, so callers
/// never block on disk I/O and concurrent records are written whole, in the
/// order they were submitted. The writer is an OS thread rather than a tokio
/// task so the log keeps working from a panic hook on any thread.
pub struct FileErrorLog {
    log_dir: PathBuf,
    log_path: PathBuf,
    queue_tx: Option<mpsc::Sender<Command>>,
    worker: Option<JoinHandle<()>>,
}

impl FileErrorLog {
    /// Construct a log writing to `<log_dir>/error.log`.
    ///
    /// The directory itself is created lazily by each [`ErrorLog::record`].
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] if the writer thread cannot be spawned.
    pub fn new(log_dir: PathBuf) -> Result<Self> {
        let log_path = log_dir.join(LOG_FILE_NAME);
        let (queue_tx, queue_rx) = mpsc::channel();
        let worker_path = log_path.clone();
        let worker = std::thread::Builder::new()
            .name("error-log-writer".into())
            .spawn(move || run_writer(&worker_path, &queue_rx))
            .map_err(|e| AppError::Io(format!("failed to spawn error log writer: {e}")))?;

        Ok(Self {
            log_dir,
            log_path,
            queue_tx: Some(queue_tx),
            worker: Some(worker),
        })
    }

    /// Directory holding the log file.
    #[must_use]
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Full path of `error.log`.
    #[must_use]
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Create the log directory if absent. "Already exists" is success.
    fn ensure_dir(&self) {
        if self.log_dir.is_dir() {
            return;
        }
        if let Err(e) = fs::create_dir_all(&self.log_dir) {
            warn!(
                dir = %self.log_dir.display(),
                "failed to create error log directory: {e}"
            );
        }
    }

    fn submit(&self, diagnostic: &str) {
        self.ensure_dir();
        let line = format_line(Utc::now(), diagnostic);
        let sent = self
            .queue_tx
            .as_ref()
            .is_some_and(|tx| tx.send(Command::Append(line)).is_ok());
        if !sent {
            warn!("error log writer is gone; record dropped: {diagnostic}");
        }
    }
}

impl ErrorLog for FileErrorLog {
    fn record(&self, incident: &Incident) {
        self.submit(&incident.diagnostic());
        error!(operational = incident.is_operational(), "{incident}");
    }

    fn record_message(&self, message: &str) {
        self.submit(message);
        error!("{message}");
    }

    fn flush(&self, timeout: Duration) -> bool {
        let Some(tx) = self.queue_tx.as_ref() else {
            return false;
        };
        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        if tx.send(Command::Flush(ack_tx)).is_err() {
            return false;
        }
        ack_rx.recv_timeout(timeout).is_ok()
    }
}

impl Drop for FileErrorLog {
    fn drop(&mut self) {
        // Closing the channel lets the writer drain what is queued and exit.
        self.queue_tx.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("error log writer panicked");
            }
        }
    }
}

fn run_writer(log_path: &Path, queue_rx: &mpsc::Receiver<Command>) {
    for command in queue_rx {
        match command {
            Command::Append(line) => {
                if let Err(e) = append_line(log_path, &line) {
                    warn!(path = %log_path.display(), "failed to write to error log: {e}");
                }
            }
            Command::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
    debug!("error log writer exiting");
}

fn append_line(log_path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;
    file.write_all(line.as_bytes())
}
