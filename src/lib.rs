//! Mordor: a fiber-based cooperative concurrency engine.
//!
//! Three layers, each usable on its own:
//!
//! - [`fiber`]: stackful coroutines (`Fiber`/`Handle`) with asymmetric
//!   `call`/`yield_now` and symmetric `yield_to`.
//! - [`scheduler`]: a multi-threaded, thread-affinity-aware ready queue
//!   that runs fibers and closures, plus a [`TimerManager`] that injects
//!   expired callbacks onto it.
//! - [`parallel`]: fan-out combinators (`parallel_do`, `parallel_foreach`,
//!   `SchedulerSwitcher`) built on the two above.

mod error;
pub mod fiber;
pub mod parallel;
pub mod scheduler;
pub mod stack;
mod timer;

#[cfg(test)]
mod tests;

pub use error::{FiberError, PanicPayload, SchedulerError};
pub use fiber::{Fiber, Handle, Options, ResumeResult, State};
pub use parallel::{parallel_do, parallel_foreach, SchedulerSwitcher};
pub use scheduler::Scheduler;
pub use timer::{Timer, TimerManager, NO_TIMER};

/// Spawn a new fiber in `Hold`. Equivalent to [`Fiber::spawn`].
pub fn spawn<F>(f: F) -> Handle
where
    F: FnOnce() + Send + 'static,
{
    Fiber::spawn(f)
}

/// The fiber currently running on this thread. Equivalent to
/// [`Fiber::current`].
pub fn current() -> Handle {
    Fiber::current()
}

/// Yield to the current fiber's caller. Equivalent to [`Fiber::yield_now`].
pub fn yield_now() {
    Fiber::yield_now()
}
