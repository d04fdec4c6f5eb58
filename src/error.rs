//! Recoverable error types.
//!
//! Per the invariant/user/platform/cancellation error taxonomy: invariant
//! violations (calling `call()` on a non-`Hold` fiber, `yield_now()` with no
//! outer, resuming a fiber from the wrong thread) are fatal and are reported
//! with `panic!`/`debug_assert!`, not these types. These types cover the
//! genuinely recoverable boundaries: platform failures constructing a fiber,
//! and scheduling onto a scheduler that is shutting down.

use std::fmt;

/// Errors that can occur while constructing or resetting a [`crate::fiber::Fiber`].
#[derive(Debug, thiserror::Error)]
pub enum FiberError {
    /// The underlying stack allocation failed.
    #[error("failed to allocate a {size}-byte fiber stack: {source}")]
    StackAlloc {
        size: usize,
        #[source]
        source: std::io::Error,
    },
}

/// Errors surfaced by [`crate::scheduler::Scheduler`] at its recoverable boundaries.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// `schedule()` was called after `stop()` had already been initiated.
    #[error("cannot schedule work: scheduler is stopping")]
    Stopping,
}

/// The payload captured from a fiber that terminated via an uncaught panic.
///
/// Mirrors `Box<dyn Any + Send>`, the payload type `std::panic::catch_unwind`
/// hands back; wrapped so callers get a `Display` impl without downcasting
/// themselves in the common case.
pub struct PanicPayload(pub Box<dyn std::any::Any + Send + 'static>);

impl PanicPayload {
    pub fn message(&self) -> &str {
        if let Some(s) = self.0.downcast_ref::<&'static str>() {
            s
        } else if let Some(s) = self.0.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Box<dyn Any>"
        }
    }
}

impl fmt::Debug for PanicPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PanicPayload").field(&self.message()).finish()
    }
}

impl fmt::Display for PanicPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fiber panicked at '{}'", self.message())
    }
}

impl std::error::Error for PanicPayload {}
