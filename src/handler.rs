//! Global error handler: turns incidents into caller-facing responses.
//!
//! Every incident is recorded to the [`ErrorLog`] first. Operational faults
//! are answered with their own status, message and (non-empty) details;
//! anything else becomes a generic 500 that reveals nothing about the cause.
//!
//! For axum, handlers return `Result<_, Incident>`. The [`IntoResponse`]
//! impl renders the safe payload and tags the response with the incident;
//! [`capture_incidents`] middleware then routes it through the shared
//! [`GlobalErrorHandler`] so it is logged exactly once. A tagged response
//! that leaves the stack without passing through [`capture_incidents`] is
//! still safe to send, but its incident is not logged; dropping it emits a
//! `warn!` naming the incident.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::fault::{Fault, FaultStatus, Incident};
use crate::sink::ErrorLog;

/// Message returned for every non-operational incident.
pub const UNEXPECTED_MESSAGE: &str = "An unexpected error occurred!";

/// Payload written to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBody {
    /// `fail` or `error`.
    pub status: FaultStatus,
    /// Caller-safe message.
    pub message: String,
    /// Caller-safe details; omitted when absent or empty.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Something that can emit one status and one payload to a caller.
///
/// `respond` consumes the channel, so a response is written at most once.
pub trait ResponseChannel {
    /// What writing the response produces, e.g. an axum [`Response`].
    type Output;

    /// Set the status and write the payload.
    fn respond(self, status: StatusCode, body: ErrorBody) -> Self::Output;
}

/// Channel producing an axum JSON response.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonChannel;

impl ResponseChannel for JsonChannel {
    type Output = Response;

    fn respond(self, status: StatusCode, body: ErrorBody) -> Response {
        (status, Json(body)).into_response()
    }
}

/// Decide the status and payload a caller may see for `incident`.
#[must_use]
pub fn render(incident: &Incident) -> (StatusCode, ErrorBody) {
    match incident.as_fault() {
        Some(fault) => (
            status_of(fault),
            ErrorBody {
                status: fault.status(),
                message: fault.message().to_owned(),
                details: fault.disclosed_details().cloned(),
            },
        ),
        None => (
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorBody {
                status: FaultStatus::Error,
                message: UNEXPECTED_MESSAGE.to_owned(),
                details: None,
            },
        ),
    }
}

fn status_of(fault: &Fault) -> StatusCode {
    StatusCode::from_u16(fault.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

/// Logs every incident and answers the caller.
#[derive(Clone)]
pub struct GlobalErrorHandler {
    log: Arc<dyn ErrorLog>,
}

impl GlobalErrorHandler {
    /// Build a handler recording to `log`.
    #[must_use]
    pub fn new(log: Arc<dyn ErrorLog>) -> Self {
        Self { log }
    }

    /// The log incidents are recorded to.
    #[must_use]
    pub fn log(&self) -> &Arc<dyn ErrorLog> {
        &self.log
    }

    /// Record `incident`, then write exactly one response to `channel`.
    ///
    /// The log write is queued, never awaited, so a slow or failing log
    /// cannot delay the response.
    pub fn handle<C: ResponseChannel>(&self, incident: Incident, channel: C) -> C::Output {
        self.log.record(&incident);
        let (status, body) = render(&incident);
        channel.respond(status, body)
    }
}

/// Response extension carrying the incident a handler returned.
#[derive(Clone)]
struct Raised(Option<Incident>);

impl Raised {
    fn take(mut self) -> Option<Incident> {
        self.0.take()
    }
}

impl Drop for Raised {
    fn drop(&mut self) {
        if let Some(incident) = self.0.take() {
            warn!(
                operational = incident.is_operational(),
                "incident response left the stack without capture_incidents; not logged: {incident}"
            );
        }
    }
}

/// Renders the caller-safe payload. The incident is logged only when the
/// route is layered with [`capture_incidents`].
impl IntoResponse for Incident {
    fn into_response(self) -> Response {
        let mut response = JsonChannel.respond_for(&self);
        response.extensions_mut().insert(Raised(Some(self)));
        response
    }
}

impl IntoResponse for Fault {
    fn into_response(self) -> Response {
        Incident::from(self).into_response()
    }
}

impl JsonChannel {
    fn respond_for(self, incident: &Incident) -> Response {
        let (status, body) = render(incident);
        self.respond(status, body)
    }
}

/// Middleware routing incidents returned by handlers through `handler`.
///
/// Install with `axum::middleware::from_fn_with_state(handler, capture_incidents)`.
pub async fn capture_incidents(
    State(handler): State<Arc<GlobalErrorHandler>>,
    request: Request,
    next: Next,
) -> Response {
    let mut response = next.run(request).await;
    match response.extensions_mut().remove::<Raised>().and_then(Raised::take) {
        Some(incident) => handler.handle(incident, JsonChannel),
        None => response,
    }
}
