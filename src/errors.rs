//! Error types for the crate's own failure modes.
//!
//! These are distinct from [`crate::fault::Fault`]: an `AppError` describes a
//! failure of the error-handling machinery itself (bad configuration, an
//! unusable log directory, a second trap arming), never a caller-facing fault.

use std::fmt::{Display, Formatter};

/// Shared crate result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Internal error enumeration.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// File-system or I/O operation failure.
    Io(String),
    /// Process fault trap could not be armed.
    Trap(String),
    /// HTTP server bind or serve failure.
    Server(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::Trap(msg) => write!(f, "trap: {msg}"),
            Self::Server(msg) => write!(f, "server: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
