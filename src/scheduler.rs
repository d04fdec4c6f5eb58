//! Multi-threaded fiber scheduler: a shared FIFO ready queue with optional
//! thread affinity, driven by a small pool of OS worker threads (plus,
//! optionally, the constructing thread itself).
//!
//! Idle workers park on [`IdleStrategy`], whose default implementation,
//! `CondvarIdle`, is a counting semaphore built from `std::sync::Condvar`:
//! a worker with nothing to do waits on the condvar, and scheduling new
//! work bumps the credit count and wakes one waiter.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crate::error::SchedulerError;
use crate::fiber::{self, Fiber};
use crate::timer::{self, Timer, TimerManager};

/// Subclass contract for blocking/waking a worker with no ready work.
/// The default (`WorkerPool`-equivalent) strategy is a counting semaphore
/// signaled by `tickle`; an I/O-manager scheduler would instead block on
/// OS completion events with a timeout.
pub trait IdleStrategy: Send + Sync {
    /// Block for at most `timeout_ns` nanoseconds, or indefinitely if
    /// `timeout_ns == timer::NO_TIMER`, until `tickle()` is called or work
    /// may be available.
    fn idle(&self, timeout_ns: u64);

    /// Cause any thread currently blocked in `idle()` to return promptly.
    fn tickle(&self);
}

/// Default idle strategy: a counting semaphore built on `Condvar`.
struct CondvarIdle {
    credits: Mutex<u64>,
    cv: Condvar,
}

impl CondvarIdle {
    fn new() -> CondvarIdle {
        CondvarIdle {
            credits: Mutex::new(0),
            cv: Condvar::new(),
        }
    }
}

impl IdleStrategy for CondvarIdle {
    fn idle(&self, timeout_ns: u64) {
        let mut credits = self.credits.lock().unwrap();
        while *credits == 0 {
            if timeout_ns == timer::NO_TIMER {
                credits = self.cv.wait(credits).unwrap();
            } else {
                let (guard, result) = self
                    .cv
                    .wait_timeout(credits, Duration::from_nanos(timeout_ns))
                    .unwrap();
                credits = guard;
                if result.timed_out() {
                    break;
                }
            }
        }
        if *credits > 0 {
            *credits -= 1;
        }
    }

    fn tickle(&self) {
        *self.credits.lock().unwrap() += 1;
        self.cv.notify_one();
    }
}

/// A simple worker-thread set, all running the same entry procedure.
struct ThreadPool {
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPool {
    fn new() -> ThreadPool {
        ThreadPool {
            threads: Mutex::new(Vec::new()),
        }
    }

    fn start<F>(&self, count: usize, name_prefix: &str, proc: F)
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        let proc = Arc::new(proc);
        let mut threads = self.threads.lock().unwrap();
        for i in 0..count {
            let proc = proc.clone();
            let builder = thread::Builder::new().name(format!("{name_prefix}-{i}"));
            let handle = builder
                .spawn(move || proc(i))
                .expect("failed to spawn scheduler worker thread");
            threads.push(handle);
        }
    }

    fn size(&self) -> usize {
        self.threads.lock().unwrap().len()
    }

    fn join_all(&self) {
        let handles = std::mem::take(&mut *self.threads.lock().unwrap());
        for handle in handles {
            let _ = handle.join();
        }
    }
}

enum Work {
    Fiber(fiber::Handle),
    Closure(Box<dyn FnOnce() + Send + 'static>),
}

struct ReadyEntry {
    work: Work,
    /// `None` means claimable by any worker thread.
    thread: Option<ThreadId>,
}

struct Core {
    ready: Mutex<VecDeque<ReadyEntry>>,
    idle: Arc<dyn IdleStrategy>,
    timers: TimerManager,
    root_thread: ThreadId,
    use_caller: bool,
    thread_count: usize,
    stopping: AtomicBool,
    /// When set, the last [`Scheduler`] handle to be dropped calls `stop()`
    /// on its way out, rather than requiring an explicit call. See
    /// [`Scheduler::auto_stop`].
    auto_stop: AtomicBool,
    pool: ThreadPool,
}

impl Core {
    fn is_empty(&self) -> bool {
        self.ready.lock().unwrap().is_empty()
    }

    /// Scan for the first entry claimable by `thread_id`: one pinned to it,
    /// or one pinned to no thread at all. Entries pinned to a *different*
    /// thread are skipped, not removed — ordering is FIFO only among
    /// entries this worker may claim.
    fn claim(&self, thread_id: ThreadId) -> Option<ReadyEntry> {
        let mut ready = self.ready.lock().unwrap();
        let pos = ready
            .iter()
            .position(|e| e.thread.map_or(true, |t| t == thread_id));
        pos.and_then(|i| ready.remove(i))
    }

    fn push(&self, work: Work, thread: Option<ThreadId>) {
        self.ready.lock().unwrap().push_back(ReadyEntry { work, thread });
        self.idle.tickle();
    }
}

thread_local! {
    static CURRENT_SCHEDULER: std::cell::RefCell<Option<Scheduler>> = std::cell::RefCell::new(None);
}

/// A multi-threaded fiber executor with a shared ready queue and optional
/// thread affinity. Cheap to clone (reference-counted).
#[derive(Clone)]
pub struct Scheduler(Arc<Core>);

impl Scheduler {
    /// `threads` total logical workers (>= 1). If `use_caller`, the
    /// constructing thread becomes one of those workers when it calls
    /// `dispatch()` or implicitly on `stop()`; otherwise all `threads`
    /// workers are separate OS threads.
    pub fn new(threads: usize, use_caller: bool) -> Scheduler {
        assert!(threads >= 1, "a scheduler needs at least one worker");
        let idle: Arc<dyn IdleStrategy> = Arc::new(CondvarIdle::new());
        let hook = idle.clone();
        let timers = TimerManager::with_front_hook(move || hook.tickle());
        let core = Arc::new(Core {
            ready: Mutex::new(VecDeque::new()),
            idle,
            timers,
            root_thread: thread::current().id(),
            use_caller,
            thread_count: threads,
            stopping: AtomicBool::new(false),
            auto_stop: AtomicBool::new(false),
            pool: ThreadPool::new(),
        });

        let spawned = if use_caller { threads - 1 } else { threads };
        if spawned > 0 {
            let core_for_workers = core.clone();
            core.pool.start(spawned, "mordor-worker", move |_i| {
                worker_loop(core_for_workers.clone());
            });
        }
        log::debug!(
            "scheduler started: {} workers ({} spawned, caller participates: {})",
            threads,
            spawned,
            use_caller
        );
        Scheduler(core)
    }

    /// A single-threaded scheduler that hijacks the constructing thread
    /// (via `dispatch()`/`stop()`) rather than spawning any OS thread.
    pub fn single() -> Scheduler {
        Scheduler::new(1, true)
    }

    /// When `enabled`, the last surviving `Scheduler` handle calls `stop()`
    /// on drop instead of leaking the workers/queue if the caller forgets
    /// to call it explicitly. Only reliable for schedulers with no spawned
    /// worker threads (e.g. [`Scheduler::single`]): a spawned worker holds
    /// its own clone of the handle for as long as it runs, so the handle
    /// count can't drop to one while those threads are alive, and they
    /// don't exit until `stopping` is already set.
    pub fn auto_stop(self, enabled: bool) -> Scheduler {
        self.0.auto_stop.store(enabled, Ordering::SeqCst);
        self
    }

    /// The scheduler currently driving this thread's dispatch loop, if any.
    pub fn current() -> Option<Scheduler> {
        CURRENT_SCHEDULER.with(|c| c.borrow().clone())
    }

    /// Whether `self` is the scheduler driving the calling thread's
    /// dispatch loop right now — i.e. whether this call is reentrant
    /// (work scheduling more work from inside its own dispatch) rather
    /// than an external submission.
    fn is_current(&self) -> bool {
        CURRENT_SCHEDULER.with(|c| {
            c.borrow()
                .as_ref()
                .is_some_and(|s| Arc::ptr_eq(&s.0, &self.0))
        })
    }

    /// Enqueue a closure, materialized into a fresh Fiber when dequeued.
    /// Rejected with [`SchedulerError::Stopping`] once `stop()` has begun,
    /// unless this call is itself reentrant (part of draining already
    /// in-flight work, e.g. a `parallel_do` spawning its worker fibers).
    pub fn schedule<F>(&self, f: F, thread: Option<ThreadId>) -> Result<(), SchedulerError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.push_checked(Work::Closure(Box::new(f)), thread)
    }

    /// Enqueue an already-constructed Fiber. See [`Scheduler::schedule`]
    /// for the stopping/reentrancy rule.
    pub fn schedule_fiber(
        &self,
        fiber: fiber::Handle,
        thread: Option<ThreadId>,
    ) -> Result<(), SchedulerError> {
        self.push_checked(Work::Fiber(fiber), thread)
    }

    fn push_checked(&self, work: Work, thread: Option<ThreadId>) -> Result<(), SchedulerError> {
        if self.0.stopping.load(Ordering::SeqCst) && !self.is_current() {
            return Err(SchedulerError::Stopping);
        }
        self.0.push(work, thread);
        Ok(())
    }

    /// Schedule the current fiber (optionally pinned to `thread`), then
    /// suspend until it's resumed again — possibly on a different thread.
    pub fn switch_to(&self, thread: Option<ThreadId>) {
        let current = Fiber::current();
        self.schedule_fiber(current, thread)
            .expect("switch_to called on a stopped scheduler");
        Fiber::suspend_current();
    }

    /// Suspend the current fiber back to this thread's dispatch loop. The
    /// fiber is *not* re-queued; the caller must arrange for that.
    pub fn yield_to(&self) {
        Fiber::suspend_current();
    }

    /// Register a timer whose callback is scheduled onto this scheduler's
    /// ready queue (rather than run inline) when it fires.
    pub fn register_timer<F>(&self, delay_ns: u64, callback: F, recurring: bool) -> Timer
    where
        F: FnMut() + Send + 'static,
    {
        let callback = Arc::new(Mutex::new(callback));
        let scheduler = self.clone();
        self.0.timers.register_timer(
            delay_ns,
            move || {
                let callback = callback.clone();
                let _ = scheduler.schedule(
                    move || {
                        (callback.lock().unwrap())();
                    },
                    None,
                );
            },
            recurring,
        )
    }

    /// Participate as a worker on the calling thread until `stopping()` is
    /// true and the queue is empty. Used to hijack the constructing thread
    /// when `use_caller` is set.
    pub fn dispatch(&self) {
        worker_loop(self.0.clone());
    }

    /// Whether this scheduler has begun stopping. Checked alongside queue
    /// emptiness to decide when a worker's dispatch loop should exit.
    pub fn stopping(&self) -> bool {
        self.0.stopping.load(Ordering::SeqCst)
    }

    /// Begin shutdown: wake every worker once, join the spawned OS
    /// threads, and — if `use_caller` and called from the constructing
    /// thread — drain the queue on the caller before returning.
    pub fn stop(&self) {
        self.0.stopping.store(true, Ordering::SeqCst);
        for _ in 0..self.0.thread_count {
            self.0.idle.tickle();
        }
        self.0.pool.join_all();
        // If `stop()` is itself called from within this scheduler's own
        // dispatch loop (e.g. a timer callback deciding to shut down), that
        // loop will already notice `stopping` on its next iteration — no
        // need to recursively re-enter `dispatch()` on top of it.
        if self.0.use_caller && thread::current().id() == self.0.root_thread && !self.is_current() {
            self.dispatch();
        }
        log::debug!("scheduler stopped");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if self.0.auto_stop.load(Ordering::SeqCst)
            && !self.0.stopping.load(Ordering::SeqCst)
            && Arc::strong_count(&self.0) == 1
        {
            self.stop();
        }
    }
}

fn run_entry(entry: ReadyEntry) {
    let fiber = match entry.work {
        Work::Fiber(f) => f,
        Work::Closure(c) => Fiber::spawn(c),
    };
    log::trace!("dispatching fiber {:?} on {:?}", fiber.name(), thread::current().id());
    fiber.yield_to();
    if fiber.state() == fiber::State::Except {
        // Reached only via `yield_to`, so the panic isn't observed by any
        // `call`-side resumer; still worth a log line instead of letting
        // it disappear silently.
        log::warn!("fiber {:?} terminated via an uncaught panic", fiber.name());
    }
}

fn worker_loop(core: Arc<Core>) {
    CURRENT_SCHEDULER.with(|c| *c.borrow_mut() = Some(Scheduler(core.clone())));
    let tid = thread::current().id();

    loop {
        if let Some(entry) = core.claim(tid) {
            run_entry(entry);
            continue;
        }
        core.timers.process_timers();
        if let Some(entry) = core.claim(tid) {
            run_entry(entry);
            continue;
        }
        if core.stopping.load(Ordering::SeqCst) && core.is_empty() {
            break;
        }
        core.idle.idle(core.timers.next_timer());
    }

    CURRENT_SCHEDULER.with(|c| *c.borrow_mut() = None);
}
