//! Durable error log.
//!
//! Provides the [`ErrorLog`] trait and the line format shared by every
//! implementation. The primary implementation, [`FileErrorLog`], appends
//! one record per incident to `<log_dir>/error.log` through an ordered
//! background write queue and mirrors each incident to the `tracing`
//! subscriber.

pub mod writer;

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::fault::Incident;

/// Fixed file name inside the configured log directory.
pub const LOG_FILE_NAME: &str = "error.log";

/// Records incidents for operators.
///
/// Implementations must be [`Send`] and [`Sync`] so a single log can be
/// shared by every request handler and the process fault trap via
/// [`std::sync::Arc`]. No method may fail or panic: every failure degrades
/// to a diagnostic notice.
pub trait ErrorLog: Send + Sync {
    /// Record one incident. Returns without waiting for the write.
    fn record(&self, incident: &Incident);

    /// Record a free-form diagnostic line.
    fn record_message(&self, message: &str);

    /// Wait until everything recorded so far is persisted.
    ///
    /// Returns `false` if `timeout` elapsed first.
    fn flush(&self, timeout: Duration) -> bool;
}

/// Format a log record: `[<ISO-8601 UTC>] <diagnostic>\n`.
#[must_use]
pub fn format_line(at: DateTime<Utc>, diagnostic: &str) -> String {
    format!(
        "[{}] {diagnostic}\n",
        at.to_rfc3339_opts(SecondsFormat::Millis, true)
    )
}

pub use writer::FileErrorLog;
