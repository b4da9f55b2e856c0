//! Demo HTTP server wiring the fault lifecycle into axum.
//!
//! Each route exercises one path through the global error handler; `/jobs`
//! hands a failing background job to the armed fault trap. Extractor
//! rejections and unknown routes are answered as faults too, and a panicking
//! handler becomes a logged generic 500 instead of tripping the trap.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::rejection::{BytesRejection, PathRejection};
use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::catch_panic::CatchPanicLayer;
use tracing::info;

use crate::fault::{Fault, Incident};
use crate::handler::{capture_incidents, GlobalErrorHandler, JsonChannel};
use crate::trap::{self, ArmedTrap};
use crate::{AppError, Result};

/// Token accepted by `GET /private`.
pub const DEMO_TOKEN: &str = "letmein";

/// A stored user.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct User {
    /// Numeric identifier.
    pub id: u64,
    /// Display name.
    pub name: String,
}

/// State shared by every route.
pub struct AppState {
    /// Handler every returned incident is routed through.
    pub handler: Arc<GlobalErrorHandler>,
    /// Armed trap for background jobs; `None` disables `/jobs`.
    pub trap: Option<ArmedTrap>,
    /// Seed data for `/users`.
    pub users: HashMap<u64, User>,
}

impl AppState {
    /// State with the built-in user table.
    #[must_use]
    pub fn new(handler: Arc<GlobalErrorHandler>, trap: Option<ArmedTrap>) -> Self {
        let users = [(1, "Ada"), (2, "Grace")]
            .into_iter()
            .map(|(id, name)| {
                (
                    id,
                    User {
                        id,
                        name: name.to_owned(),
                    },
                )
            })
            .collect();
        Self {
            handler,
            trap,
            users,
        }
    }
}

async fn health() -> &'static str {
    "ok"
}

async fn get_user(
    State(state): State<Arc<AppState>>,
    id: std::result::Result<Path<u64>, PathRejection>,
) -> std::result::Result<Json<User>, Incident> {
    let Path(id) = id.map_err(|rejection| {
        Fault::validation("Invalid user id", "id")
            .with_details(json!({ "id": rejection.body_text() }))
    })?;
    state
        .users
        .get(&id)
        .cloned()
        .map(Json)
        .ok_or_else(|| Fault::not_found("User").into())
}

async fn create_user(
    body: std::result::Result<Bytes, BytesRejection>,
) -> std::result::Result<(StatusCode, Json<User>), Incident> {
    let body = body.map_err(|rejection| {
        Fault::new(rejection.body_text(), rejection.status().as_u16())
    })?;
    let payload: Value = serde_json::from_slice(&body).map_err(|err| {
        Fault::validation("Malformed JSON body", "body")
            .with_details(json!({ "reason": err.to_string() }))
    })?;

    let name = payload
        .get("name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| {
            Fault::validation("Validation failed", "name")
                .with_details(json!({ "name": "is required" }))
        })?;

    Ok((
        StatusCode::CREATED,
        Json(User {
            id: 3,
            name: name.to_owned(),
        }),
    ))
}

async fn private(headers: HeaderMap) -> std::result::Result<Json<Value>, Fault> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    match bearer {
        Some(token) if token == DEMO_TOKEN => Ok(Json(json!({ "secret": 42 }))),
        Some(_) => Err(Fault::auth_with_status("Access denied", 403)),
        None => Err(Fault::auth("Authentication failed")),
    }
}

async fn reports() -> std::result::Result<Json<Value>, Fault> {
    Err(Fault::database(
        "SELECT * FROM reports WHERE owner_token = 'sk-internal'",
    ))
}

async fn crash() -> std::result::Result<Json<Value>, Incident> {
    let err = std::io::Error::other("config file vanished: /etc/app/secret.toml");
    Err(err.into())
}

async fn panic_route() -> Json<Value> {
    panic!("report template index out of range")
}

async fn unknown_route() -> Fault {
    Fault::not_found("Route")
}

async fn enqueue_job(
    State(state): State<Arc<AppState>>,
) -> std::result::Result<(StatusCode, Json<Value>), Fault> {
    let Some(trap) = state.trap.as_ref() else {
        return Err(Fault::new("Background jobs are disabled", 503));
    };
    let _ = trap.spawn_detached("report-export", async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Err::<(), _>("export storage connection reset")
    });
    Ok((StatusCode::ACCEPTED, Json(json!({ "status": "accepted" }))))
}

/// Poll the rest of the stack with panics marked as handled.
async fn guard_panics(request: Request, next: Next) -> Response {
    trap::guarded(next.run(request)).await
}

/// Build the router with incident capture and panic recovery installed.
pub fn router(state: Arc<AppState>) -> Router {
    let handler = Arc::clone(&state.handler);
    let panic_handler = Arc::clone(&state.handler);
    Router::new()
        .route("/health", get(health))
        .route("/users", post(create_user))
        .route("/users/{id}", get(get_user))
        .route("/private", get(private))
        .route("/reports", get(reports))
        .route("/crash", get(crash))
        .route("/panic", get(panic_route))
        .route("/jobs", post(enqueue_job))
        .fallback(unknown_route)
        .layer(middleware::from_fn(guard_panics))
        .layer(CatchPanicLayer::custom(
            move |payload: Box<dyn Any + Send + 'static>| {
                let reason = trap::payload_text(payload.as_ref());
                panic_handler.handle(
                    Incident::unexpected(format!("handler panicked: {reason}")),
                    JsonChannel,
                )
            },
        ))
        .layer(middleware::from_fn_with_state(handler, capture_incidents))
        .with_state(state)
}

/// Serve the demo router on `listener` until `ct` is cancelled.
///
/// # Errors
///
/// Returns `AppError::Server` if serving fails.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    ct: CancellationToken,
) -> Result<()> {
    let bind = listener
        .local_addr()
        .map_err(|err| AppError::Server(format!("listener has no address: {err}")))?;
    info!(%bind, "starting HTTP server");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { ct.cancelled().await })
        .await
        .map_err(|err| AppError::Server(format!("HTTP server error: {err}")))?;

    info!("HTTP server shut down");
    Ok(())
}
