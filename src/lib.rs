#![forbid(unsafe_code)]

//! Fault reporting for axum services: a typed fault taxonomy, a global
//! error handler that decides what callers may see, a process fault trap
//! for failures nobody observes, and an append-only `error.log`.

pub mod config;
pub mod errors;
pub mod fault;
pub mod handler;
pub mod server;
pub mod sink;
pub mod trap;

pub use config::CureConfig;
pub use errors::{AppError, Result};
pub use fault::{Fault, FaultKind, FaultStatus, Incident};
pub use handler::{GlobalErrorHandler, ResponseChannel};
pub use sink::{ErrorLog, FileErrorLog};
pub use trap::{ArmedTrap, FaultTrap};
