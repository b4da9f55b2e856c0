//! Fault taxonomy raised by request-handling code.
//!
//! A [`Fault`] is an operational, classified error: its message and details
//! are safe to show to a caller. Anything else that escapes a handler is an
//! [`Incident::Unexpected`], whose internals are only ever written to the
//! error log.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::borrow::Cow;
use std::error::Error;
use std::fmt::{Display, Formatter};

use serde::Serialize;
use serde_json::Value;

use crate::AppError;

/// Status code used when none is supplied or the supplied one is invalid.
pub const DEFAULT_STATUS_CODE: u16 = 500;

/// Default message for [`FaultKind::Database`].
pub const DATABASE_FAILED: &str = "Database operation failed";

/// Caller-visible classification derived from a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultStatus {
    /// The caller did something wrong (4xx).
    Fail,
    /// The server did something wrong (anything else).
    Error,
}

impl FaultStatus {
    /// Derive the status for `status_code`: `fail` for 400..=499, otherwise `error`.
    #[must_use]
    pub fn from_status_code(status_code: u16) -> Self {
        if (400..=499).contains(&status_code) {
            Self::Fail
        } else {
            Self::Error
        }
    }

    /// Wire representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fail => "fail",
            Self::Error => "error",
        }
    }
}

impl Display for FaultStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Variant tag with the fields each variant carries beyond the base record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultKind {
    /// Plain operational fault with a caller-chosen status.
    Generic,
    /// Input rejected; `field` names the offending input.
    Validation {
        /// Offending input field.
        field: String,
    },
    /// Authentication or authorization failure.
    Auth,
    /// Data-access failure. `query` is diagnostic only.
    Database {
        /// Failing query text; never disclosed to callers.
        query: String,
    },
    /// Requested resource does not exist.
    NotFound {
        /// Resource name used in the message.
        resource: String,
    },
}

impl FaultKind {
    /// Variant name used in log lines.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Generic => "Fault",
            Self::Validation { .. } => "ValidationFault",
            Self::Auth => "AuthFault",
            Self::Database { .. } => "DatabaseFault",
            Self::NotFound { .. } => "NotFoundFault",
        }
    }
}

/// An operational fault. Immutable once built.
#[derive(Debug, Clone)]
pub struct Fault {
    kind: FaultKind,
    message: String,
    status_code: u16,
    details: Option<Value>,
    trace: Option<String>,
}

impl Fault {
    fn build(kind: FaultKind, message: String, status_code: u16) -> Self {
        let status_code = if (100..=999).contains(&status_code) {
            status_code
        } else {
            DEFAULT_STATUS_CODE
        };
        let mut fault = Self {
            kind,
            message,
            status_code,
            details: None,
            trace: None,
        };
        fault.trace = capture_trace(&fault.to_string(), &[]);
        fault
    }

    /// Generic operational fault. Codes outside `100..=999` become 500.
    #[must_use]
    pub fn new(message: impl Into<String>, status_code: u16) -> Self {
        Self::build(FaultKind::Generic, message.into(), status_code)
    }

    /// Generic operational fault with the default 500 status.
    #[must_use]
    pub fn server(message: impl Into<String>) -> Self {
        Self::new(message, DEFAULT_STATUS_CODE)
    }

    /// Input validation failure on `field` (400).
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::build(
            FaultKind::Validation {
                field: field.into(),
            },
            message.into(),
            400,
        )
    }

    /// Authentication failure (401).
    #[must_use]
    pub fn auth(message: impl Into<String>) -> Self {
        Self::auth_with_status(message, 401)
    }

    /// Authentication or authorization failure with an explicit status, e.g. 403.
    #[must_use]
    pub fn auth_with_status(message: impl Into<String>, status_code: u16) -> Self {
        Self::build(FaultKind::Auth, message.into(), status_code)
    }

    /// Data-access failure with the default message (500).
    #[must_use]
    pub fn database(query: impl Into<String>) -> Self {
        Self::database_with_message(DATABASE_FAILED, query)
    }

    /// Data-access failure with a custom message (500).
    #[must_use]
    pub fn database_with_message(message: impl Into<String>, query: impl Into<String>) -> Self {
        Self::build(
            FaultKind::Database {
                query: query.into(),
            },
            message.into(),
            500,
        )
    }

    /// Missing resource (404), message `"<resource> not found"`.
    #[must_use]
    pub fn not_found(resource: impl Into<String>) -> Self {
        let resource = resource.into();
        let message = format!("{resource} not found");
        Self::build(FaultKind::NotFound { resource }, message, 404)
    }

    /// Attach a caller-safe details payload.
    #[must_use]
    pub fn with_details(mut self, details: impl Into<Value>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Variant tag.
    #[must_use]
    pub fn kind(&self) -> &FaultKind {
        &self.kind
    }

    /// Caller-safe message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Status code, always in `100..=999`.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    /// Status derived from [`Self::status_code`].
    #[must_use]
    pub fn status(&self) -> FaultStatus {
        FaultStatus::from_status_code(self.status_code)
    }

    /// Always `true`: every `Fault` comes from the taxonomy.
    #[must_use]
    #[allow(clippy::unused_self)]
    pub fn is_operational(&self) -> bool {
        true
    }

    /// Caller-safe details, if any were attached.
    #[must_use]
    pub fn details(&self) -> Option<&Value> {
        self.details.as_ref()
    }

    /// Details only when present and non-empty.
    #[must_use]
    pub fn disclosed_details(&self) -> Option<&Value> {
        self.details.as_ref().filter(|d| !is_empty_value(d))
    }

    /// Diagnostic trace captured at construction, if backtraces are enabled.
    #[must_use]
    pub fn trace(&self) -> Option<&str> {
        self.trace.as_deref()
    }

    /// Offending field for validation faults.
    #[must_use]
    pub fn field(&self) -> Option<&str> {
        match &self.kind {
            FaultKind::Validation { field } => Some(field),
            _ => None,
        }
    }

    /// Failing query for database faults.
    #[must_use]
    pub fn query(&self) -> Option<&str> {
        match &self.kind {
            FaultKind::Database { query } => Some(query),
            _ => None,
        }
    }

    /// Missing resource for not-found faults.
    #[must_use]
    pub fn resource(&self) -> Option<&str> {
        match &self.kind {
            FaultKind::NotFound { resource } => Some(resource),
            _ => None,
        }
    }
}

impl Display for Fault {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.name(), self.message)?;
        if let FaultKind::Database { query } = &self.kind {
            if !query.is_empty() {
                write!(f, " [query: {query}]")?;
            }
        }
        Ok(())
    }
}

impl Error for Fault {}

/// A fault that did not come from the taxonomy. Never disclosed.
#[derive(Debug, Clone)]
pub struct Unexpected {
    message: String,
    trace: Option<String>,
}

impl Unexpected {
    /// Internal message. Log only.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Cause chain and backtrace, when available. Log only.
    #[must_use]
    pub fn trace(&self) -> Option<&str> {
        self.trace.as_deref()
    }
}

/// Anything propagated out of request-handling code.
///
/// Returned from an axum handler, an incident is logged only on routes
/// layered with [`crate::handler::capture_incidents`].
#[derive(Debug, Clone)]
pub enum Incident {
    /// Classified fault, safe to partially disclose.
    Operational(Fault),
    /// Programming error or foreign failure.
    Unexpected(Unexpected),
}

impl Incident {
    /// Wrap any displayable value as a non-operational incident.
    pub fn unexpected(err: impl Display) -> Self {
        let message = err.to_string();
        let trace = capture_trace(&message, &[]);
        Self::Unexpected(Unexpected { message, trace })
    }

    /// Wrap an error, recording its `source()` chain in the trace.
    pub fn from_error(err: &(dyn Error + 'static)) -> Self {
        let message = err.to_string();
        let mut causes = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }
        let trace = capture_trace(&message, &causes);
        Self::Unexpected(Unexpected { message, trace })
    }

    /// Whether this incident came from the taxonomy.
    #[must_use]
    pub fn is_operational(&self) -> bool {
        match self {
            Self::Operational(fault) => fault.is_operational(),
            Self::Unexpected(_) => false,
        }
    }

    /// The classified fault, if any.
    #[must_use]
    pub fn as_fault(&self) -> Option<&Fault> {
        match self {
            Self::Operational(fault) => Some(fault),
            Self::Unexpected(_) => None,
        }
    }

    /// Raw message. Only safe to disclose when operational.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Operational(fault) => fault.message(),
            Self::Unexpected(unexpected) => unexpected.message(),
        }
    }

    /// Diagnostic trace, if captured.
    #[must_use]
    pub fn trace(&self) -> Option<&str> {
        match self {
            Self::Operational(fault) => fault.trace(),
            Self::Unexpected(unexpected) => unexpected.trace(),
        }
    }

    /// Text written to the error log: the trace if one was captured.
    ///
    /// Without a trace an operational fault falls back to its `Display` form,
    /// so diagnostic-only data such as a database query still reaches the log.
    #[must_use]
    pub fn diagnostic(&self) -> Cow<'_, str> {
        match (self.trace(), self) {
            (Some(trace), _) => Cow::Borrowed(trace),
            (None, Self::Operational(fault)) => Cow::Owned(fault.to_string()),
            (None, Self::Unexpected(unexpected)) => Cow::Borrowed(unexpected.message()),
        }
    }
}

impl Display for Incident {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Operational(fault) => Display::fmt(fault, f),
            Self::Unexpected(unexpected) => write!(f, "unexpected: {}", unexpected.message),
        }
    }
}

impl Error for Incident {}

impl From<Fault> for Incident {
    fn from(fault: Fault) -> Self {
        Self::Operational(fault)
    }
}

impl From<AppError> for Incident {
    fn from(err: AppError) -> Self {
        Self::from_error(&err)
    }
}

impl From<std::io::Error> for Incident {
    fn from(err: std::io::Error) -> Self {
        Self::from_error(&err)
    }
}

impl From<serde_json::Error> for Incident {
    fn from(err: serde_json::Error) -> Self {
        Self::from_error(&err)
    }
}

/// Build a trace from a head line, its causes, and a backtrace.
///
/// Returns `None` when there is nothing beyond the head line to record.
fn capture_trace(head: &str, causes: &[String]) -> Option<String> {
    let backtrace = Backtrace::capture();
    let captured = backtrace.status() == BacktraceStatus::Captured;
    if causes.is_empty() && !captured {
        return None;
    }

    let mut trace = head.to_owned();
    for cause in causes {
        trace.push_str("\nCaused by: ");
        trace.push_str(cause);
    }
    if captured {
        trace.push('\n');
        trace.push_str(&backtrace.to_string());
    }
    Some(trace)
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::String(s) => s.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}
