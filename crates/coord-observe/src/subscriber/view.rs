use std::borrow::Borrow;

use taskvisor::{Event, EventKind};
use tracing::{debug, error, info, trace, warn};

/// Read-only accessors over a supervisor event with log-friendly defaults.
pub trait View {
    fn as_task(&self) -> &str;
    fn as_reason(&self) -> &str;
    fn attempt(&self) -> u32;
    fn delay_ms(&self) -> u32;
    fn kind(&self) -> EventKind;
    fn has_reason(&self) -> bool;
}

impl<T> View for T
where
    T: Borrow<Event>,
{
    #[inline]
    fn as_task(&self) -> &str {
        self.borrow().task.as_deref().unwrap_or("unknown")
    }
    #[inline]
    fn as_reason(&self) -> &str {
        self.borrow().reason.as_deref().unwrap_or("unknown")
    }
    #[inline]
    fn attempt(&self) -> u32 {
        self.borrow().attempt.unwrap_or(0)
    }
    #[inline]
    fn delay_ms(&self) -> u32 {
        self.borrow().delay_ms.unwrap_or(0)
    }
    #[inline]
    fn kind(&self) -> EventKind {
        self.borrow().kind
    }
    #[inline]
    fn has_reason(&self) -> bool {
        self.borrow().reason.is_some()
    }
}

/// Log one supervisor event at a level matching its severity.
///
/// The worker runs a single long-lived task, so only its lifecycle and the
/// shutdown path are logged above trace.
pub fn log_event<E: View>(e: E) {
    match e.kind() {
        EventKind::ShutdownRequested => info!("shutdown requested; stopping worker tasks"),
        EventKind::GraceExceeded => warn!("grace period exceeded; some tasks did not stop in time"),

        EventKind::TaskStarting => info!(task = e.as_task(), attempt = e.attempt(), "task starting"),
        EventKind::TaskStopped => debug!(task = e.as_task(), "task stopped"),
        EventKind::TaskFailed => error!(
            task = e.as_task(),
            attempt = e.attempt(),
            reason = e.as_reason(),
            "task failed"
        ),
        EventKind::BackoffScheduled if e.has_reason() => warn!(
            task = e.as_task(),
            attempt = e.attempt(),
            delay_ms = e.delay_ms(),
            reason = e.as_reason(),
            "task restart scheduled after failure"
        ),
        EventKind::ActorExhausted | EventKind::ActorDead => {
            error!(task = e.as_task(), reason = e.as_reason(), "task will not be restarted")
        }

        kind => trace!(task = e.as_task(), ?kind, "supervisor event"),
    }
}
