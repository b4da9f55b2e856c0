//! Process-wide safety net for failures nobody is waiting on.
//!
//! Two classes of failure are trapped:
//!
//! - an unhandled rejection: a detached task spawned through
//!   [`ArmedTrap::spawn_detached`] finishes with `Err` and no one observes it;
//! - an uncaught panic: a panic on any thread, caught by the process panic hook.
//!
//! Both are handled the same way: the failure is recorded to the
//! [`ErrorLog`], the log is flushed, and the process exits with status `1`.
//! Arming is a one-way transition; the trap stays armed until exit.
//!
//! A panic raised inside [`catch_unwind`] or while polling a [`guarded`]
//! future counts as handled and does not trip the trap. The demo router
//! guards every request this way, and detached tasks are guarded so that
//! their panics surface as rejections instead. A plain
//! `std::panic::catch_unwind` is invisible to the hook and still trips.

use std::any::Any;
use std::cell::Cell;
use std::fmt::Display;
use std::future::Future;
use std::panic::{PanicHookInfo, UnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::sink::ErrorLog;
use crate::{AppError, Result};

/// Exit status used for every trapped failure.
pub const TRAPPED_EXIT_CODE: i32 = 1;

static ARMED: AtomicBool = AtomicBool::new(false);

thread_local! {
    static GUARD_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Marks the current thread as running handled code until dropped.
struct GuardScope;

impl GuardScope {
    fn enter() -> Self {
        GUARD_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self
    }
}

impl Drop for GuardScope {
    fn drop(&mut self) {
        GUARD_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

fn panic_is_guarded() -> bool {
    GUARD_DEPTH.with(|depth| depth.get() > 0)
}

/// Run `f`, catching a panic without tripping the armed trap.
///
/// # Errors
///
/// Returns the panic payload if `f` panicked.
pub fn catch_unwind<F, R>(f: F) -> std::thread::Result<R>
where
    F: FnOnce() -> R + UnwindSafe,
{
    let _scope = GuardScope::enter();
    std::panic::catch_unwind(f)
}

/// Wrap `future` so a panic while polling it counts as handled.
///
/// Whoever drives the future must catch the unwind, e.g. by awaiting the
/// `JoinHandle` of the task it runs on.
#[must_use]
pub fn guarded<F: Future>(future: F) -> Guarded<F> {
    Guarded {
        inner: Box::pin(future),
    }
}

/// Future returned by [`guarded`].
pub struct Guarded<F> {
    inner: Pin<Box<F>>,
}

impl<F: Future> Future for Guarded<F> {
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let _scope = GuardScope::enter();
        self.inner.as_mut().poll(cx)
    }
}

/// Which listener caught the failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapClass {
    /// A detached asynchronous operation failed unobserved.
    UnhandledRejection,
    /// A panic escaped all handling.
    UncaughtPanic,
}

type ExitFn = Arc<dyn Fn(i32) + Send + Sync>;

/// An unarmed trap. Call [`FaultTrap::arm`] once at startup.
pub struct FaultTrap {
    log: Arc<dyn ErrorLog>,
    flush_timeout: Duration,
    exit: ExitFn,
}

impl FaultTrap {
    /// Build a trap that records to `log` and waits at most `flush_timeout`
    /// for the log to drain before exiting.
    #[must_use]
    pub fn new(log: Arc<dyn ErrorLog>, flush_timeout: Duration) -> Self {
        Self {
            log,
            flush_timeout,
            exit: Arc::new(|code| std::process::exit(code)),
        }
    }

    /// Replace process termination, e.g. to observe the exit code in tests.
    #[must_use]
    pub fn with_exit(mut self, exit: impl Fn(i32) + Send + Sync + 'static) -> Self {
        self.exit = Arc::new(exit);
        self
    }

    /// Install the panic hook and return the armed handle.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Trap`] if a trap is already armed in this process.
    pub fn arm(self) -> Result<ArmedTrap> {
        if ARMED.swap(true, Ordering::SeqCst) {
            return Err(AppError::Trap("fault trap is already armed".into()));
        }

        let inner = Arc::new(self);
        let hook_trap = Arc::clone(&inner);
        let default_hook = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |panic_info| {
            default_hook(panic_info);
            if panic_is_guarded() {
                debug!("panic raised in guarded code; left to its handler");
                return;
            }
            hook_trap.trip(TrapClass::UncaughtPanic, &describe_panic(panic_info));
        }));

        info!("process fault trap armed");
        Ok(ArmedTrap { inner })
    }

    /// Record the failure, flush, and terminate.
    fn trip(&self, class: TrapClass, detail: &str) {
        let message = match class {
            TrapClass::UnhandledRejection => format!("Unhandled rejection {detail}"),
            TrapClass::UncaughtPanic => format!("Uncaught panic {detail}"),
        };
        self.log.record_message(&message);
        if !self.log.flush(self.flush_timeout) {
            warn!(timeout = ?self.flush_timeout, "error log did not drain before exit");
        }
        (self.exit)(TRAPPED_EXIT_CODE);
    }
}

/// Handle to the armed trap. Cheap to clone.
#[derive(Clone)]
pub struct ArmedTrap {
    inner: Arc<FaultTrap>,
}

impl ArmedTrap {
    /// Spawn a fire-and-forget task. If it resolves to `Err` or panics, the
    /// trap trips as an unhandled rejection.
    ///
    /// Must be called within a tokio runtime. The returned handle resolves
    /// once the task has finished and any trip has run.
    pub fn spawn_detached<F, E>(&self, name: impl Into<String>, task: F) -> JoinHandle<()>
    where
        F: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let trap = Arc::clone(&self.inner);
        let name = name.into();
        let job = tokio::spawn(guarded(task));
        tokio::spawn(async move {
            let reason = match job.await {
                Ok(Ok(())) => return,
                Ok(Err(reason)) => reason.to_string(),
                Err(err) if err.is_panic() => {
                    let payload = err.into_panic();
                    format!("panicked: {}", payload_text(payload.as_ref()))
                }
                Err(err) => {
                    debug!(task = %name, "detached task cancelled: {err}");
                    return;
                }
            };
            trap.trip(
                TrapClass::UnhandledRejection,
                &format!("in task '{name}': {reason}"),
            );
        })
    }

    /// Trip the trap for a failure observed outside [`Self::spawn_detached`].
    pub fn report_unobserved(&self, source: &str, reason: &dyn Display) {
        self.inner.trip(
            TrapClass::UnhandledRejection,
            &format!("in {source}: {reason}"),
        );
    }
}

fn describe_panic(panic_info: &PanicHookInfo<'_>) -> String {
    let thread = std::thread::current();
    let thread_name = thread.name().unwrap_or("<unnamed>");
    let payload = payload_text(panic_info.payload());
    match panic_info.location() {
        Some(location) => format!("in thread '{thread_name}' at {location}: {payload}"),
        None => format!("in thread '{thread_name}': {payload}"),
    }
}

/// Best-effort text of a panic payload.
#[must_use]
pub fn payload_text(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "Box<dyn Any>"
    }
}
