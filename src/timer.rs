//! Ordered set of pending timers keyed by absolute deadline, with recurring
//! re-arm and idempotent cancellation.
//!
//! `next_timer()` returns the earliest non-cancelled deadline (or the
//! sentinel `u64::MAX` when empty), `process_timers()` fires everything due
//! as of the call, and recurring timers re-insert with
//! `deadline = fired_at + period`, not `deadline = now_after_callback +
//! period`, so a slow callback doesn't drift the schedule.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Instant;

/// Sentinel returned by `nextTimer()` when no timer is pending.
pub const NO_TIMER: u64 = u64::MAX;

type Callback = Box<dyn FnMut() + Send + 'static>;

/// Opaque, cloneable, idempotently-cancellable handle to a registered timer.
#[derive(Clone)]
pub struct Timer {
    id: u64,
    cancelled: Arc<AtomicBool>,
    manager: Arc<Shared>,
}

impl Timer {
    /// Cancel this timer. Idempotent: cancelling twice, or cancelling after
    /// it already fired, is a silent no-op.
    pub fn cancel(&self) {
        if self
            .cancelled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.manager.remove(self.id);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

struct Entry {
    id: u64,
    deadline_ns: u64,
    seq: u64,
    period_ns: Option<u64>,
    callback: Callback,
    cancelled: Arc<AtomicBool>,
}

/// Ordered by `(deadline, insertion sequence)`, ties broken FIFO; a
/// `BinaryHeap` is a max-heap, so entries are wrapped in `Reverse` to make
/// it behave as a min-heap on `(deadline_ns, seq)`.
struct Key(u64, u64, u64); // deadline_ns, seq, id — id is payload-only

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        (self.0, self.1) == (other.0, other.1)
    }
}
impl Eq for Key {}
impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Key {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.0, self.1).cmp(&(other.0, other.1))
    }
}

struct Shared {
    heap: Mutex<BinaryHeap<Reverse<Key>>>,
    entries: Mutex<HashMap<u64, Entry>>,
    next_seq: AtomicU64,
    next_id: AtomicU64,
    epoch: Instant,
    on_inserted_at_front: Option<Box<dyn Fn() + Send + Sync + 'static>>,
}

impl Shared {
    fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn remove(&self, id: u64) {
        // Harmless no-op if `id` already isn't present — e.g. it already
        // fired, or it's being cancelled from inside its own callback,
        // where `processTimers` has already popped it out of `entries`.
        // The (now stale) heap key is skipped by `next_timer`/
        // `process_timers`, both of which treat `entries` as the source
        // of truth rather than scanning the heap for it.
        self.entries.lock().unwrap().remove(&id);
    }
}

/// A monotonic-nanosecond, callback-driven timer manager.
///
/// Not `Clone`; share it behind an `Arc` if multiple owners need it (as a
/// `Scheduler` subclass integrating `nextTimer`/`processTimers` would).
pub struct TimerManager {
    shared: Arc<Shared>,
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerManager {
    pub fn new() -> TimerManager {
        TimerManager {
            shared: Arc::new(Shared {
                heap: Mutex::new(BinaryHeap::new()),
                entries: Mutex::new(HashMap::new()),
                next_seq: AtomicU64::new(0),
                next_id: AtomicU64::new(0),
                epoch: Instant::now(),
                on_inserted_at_front: None,
            }),
        }
    }

    /// Build a manager whose `onTimerInsertedAtFront` hook fires whenever a
    /// newly registered (or re-armed) timer becomes the earliest pending
    /// deadline — a scheduler subclass uses this to break out of a
    /// blocking `idle()` early.
    pub fn with_front_hook<F>(hook: F) -> TimerManager
    where
        F: Fn() + Send + Sync + 'static,
    {
        TimerManager {
            shared: Arc::new(Shared {
                heap: Mutex::new(BinaryHeap::new()),
                entries: Mutex::new(HashMap::new()),
                next_seq: AtomicU64::new(0),
                next_id: AtomicU64::new(0),
                epoch: Instant::now(),
                on_inserted_at_front: Some(Box::new(hook)),
            }),
        }
    }

    /// Register a one-shot or recurring timer firing `delay_ns` from now.
    pub fn register_timer<F>(&self, delay_ns: u64, callback: F, recurring: bool) -> Timer
    where
        F: FnMut() + Send + 'static,
    {
        let now = self.shared.now_ns();
        let deadline_ns = now.saturating_add(delay_ns);
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let cancelled = Arc::new(AtomicBool::new(false));
        let entry = Entry {
            id,
            deadline_ns,
            seq: 0,
            period_ns: if recurring { Some(delay_ns) } else { None },
            callback: Box::new(callback),
            cancelled: cancelled.clone(),
        };
        self.insert(entry);
        Timer {
            id,
            cancelled,
            manager: self.shared.clone(),
        }
    }

    /// Insert (or re-insert, on recurring re-arm) an entry, firing the
    /// front-insertion hook if it became the new earliest deadline.
    fn insert(&self, mut entry: Entry) {
        entry.seq = self.shared.next_seq.fetch_add(1, Ordering::SeqCst);
        let key = Key(entry.deadline_ns, entry.seq, entry.id);

        let was_front = {
            let heap = self.shared.heap.lock().unwrap();
            heap.peek()
                .map(|Reverse(top)| key.0 < top.0)
                .unwrap_or(true)
        };

        self.shared.entries.lock().unwrap().insert(entry.id, entry);
        self.shared.heap.lock().unwrap().push(Reverse(key));

        if was_front {
            if let Some(hook) = &self.shared.on_inserted_at_front {
                hook();
            }
        }
    }

    /// Nanoseconds until the earliest non-cancelled deadline, `0` if
    /// already due, or [`NO_TIMER`] if nothing is pending.
    pub fn next_timer(&self) -> u64 {
        let now = self.shared.now_ns();
        let mut heap = self.shared.heap.lock().unwrap();
        let entries = self.shared.entries.lock().unwrap();
        // `BinaryHeap::iter()` has no defined order, so the minimum can only
        // be found via `peek()`; stale keys left behind by a cancelled
        // timer are discarded for good as they're skipped over.
        while let Some(Reverse(top)) = heap.peek() {
            if entries.contains_key(&top.2) {
                return top.0.saturating_sub(now);
            }
            heap.pop();
        }
        NO_TIMER
    }

    /// Pop and fire every expired, non-cancelled timer. Recurring timers
    /// are re-inserted with `deadline = fired_at + period` unless they were
    /// cancelled during their own callback. A callback that panics is
    /// caught per-callback (so one bad timer can't poison the manager's
    /// internal lock state) and the first such panic is re-raised to this
    /// call's caller after the whole due batch has run.
    pub fn process_timers(&self) {
        let now = self.shared.now_ns();
        let mut due = Vec::new();
        {
            let mut heap = self.shared.heap.lock().unwrap();
            let mut entries = self.shared.entries.lock().unwrap();
            while let Some(Reverse(key)) = heap.peek() {
                if key.0 > now {
                    break;
                }
                let key = heap.pop().unwrap().0;
                if let Some(entry) = entries.remove(&key.2) {
                    due.push(entry);
                }
            }
        }

        let mut first_panic = None;
        for mut entry in due {
            if entry.cancelled.load(Ordering::SeqCst) {
                continue;
            }
            let cancelled = entry.cancelled.clone();
            let period = entry.period_ns;
            let result = panic::catch_unwind(AssertUnwindSafe(|| (entry.callback)()));
            if let Err(payload) = result {
                log::warn!("timer {} callback panicked", entry.id);
                if first_panic.is_none() {
                    first_panic = Some(payload);
                }
            }
            if let Some(period) = period {
                if !cancelled.load(Ordering::SeqCst) {
                    entry.deadline_ns = now.saturating_add(period);
                    self.insert(entry);
                }
            }
        }

        if let Some(payload) = first_panic {
            panic::resume_unwind(payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;

    #[test]
    fn single_timer() {
        let manager = TimerManager::new();
        assert_eq!(manager.next_timer(), NO_TIMER);
        let fired = Arc::new(AtomicUsize::new(0));
        {
            let fired = fired.clone();
            manager.register_timer(0, move || { fired.fetch_add(1, Ordering::SeqCst); }, false);
        }
        assert_eq!(manager.next_timer(), 0);
        manager.process_timers();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(manager.next_timer(), NO_TIMER);
    }

    #[test]
    fn multiple_timers_due_together_both_fire() {
        let manager = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let fired = fired.clone();
            manager.register_timer(0, move || { fired.fetch_add(1, Ordering::SeqCst); }, false);
        }
        manager.process_timers();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert_eq!(manager.next_timer(), NO_TIMER);
    }

    #[test]
    fn cancel_is_idempotent_and_prevents_firing() {
        let manager = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let timer = {
            let fired = fired.clone();
            manager.register_timer(0, move || { fired.fetch_add(1, Ordering::SeqCst); }, false)
        };
        timer.cancel();
        timer.cancel();
        assert_eq!(manager.next_timer(), NO_TIMER);
        manager.process_timers();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancel_after_firing_is_a_no_op() {
        let manager = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let timer = {
            let fired = fired.clone();
            manager.register_timer(0, move || { fired.fetch_add(1, Ordering::SeqCst); }, false)
        };
        manager.process_timers();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        timer.cancel();
        timer.cancel();
        assert_eq!(manager.next_timer(), NO_TIMER);
    }

    #[test]
    fn recurring_timer_rearms_until_cancelled() {
        let manager = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let timer = {
            let fired = fired.clone();
            manager.register_timer(0, move || { fired.fetch_add(1, Ordering::SeqCst); }, true)
        };
        manager.process_timers();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(manager.next_timer(), 0);
        manager.process_timers();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        timer.cancel();
        assert_eq!(manager.next_timer(), NO_TIMER);
    }

    #[test]
    fn later_timer_is_a_no_op_before_expiry() {
        let manager = TimerManager::new();
        let one_second = Duration::from_secs(1).as_nanos() as u64;
        let timer = manager.register_timer(one_second, || {}, false);
        let next = manager.next_timer();
        assert!(next <= one_second);
        assert!(next > Duration::from_millis(900).as_nanos() as u64);
        manager.process_timers(); // nothing due yet
        assert!(manager.next_timer() > 0);
        timer.cancel();
        assert_eq!(manager.next_timer(), NO_TIMER);
    }

    #[test]
    fn recurring_timer_cancelled_inside_its_own_callback_does_not_rearm() {
        let manager = Arc::new(TimerManager::new());
        let fired = Arc::new(AtomicUsize::new(0));
        let handle: Arc<Mutex<Option<Timer>>> = Arc::new(Mutex::new(None));
        let timer = {
            let fired = fired.clone();
            let handle = handle.clone();
            manager.register_timer(
                0,
                move || {
                    fired.fetch_add(1, Ordering::SeqCst);
                    if let Some(t) = handle.lock().unwrap().as_ref() {
                        t.cancel();
                    }
                },
                true,
            )
        };
        *handle.lock().unwrap() = Some(timer.clone());
        manager.process_timers();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(manager.next_timer(), NO_TIMER);
    }

    #[test]
    fn panicking_callback_propagates_after_the_whole_batch_runs() {
        let manager = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        {
            let fired = fired.clone();
            manager.register_timer(0, move || panic!("bad timer"), false);
            manager.register_timer(0, move || { fired.fetch_add(1, Ordering::SeqCst); }, false);
        }
        let result = panic::catch_unwind(AssertUnwindSafe(|| manager.process_timers()));
        assert!(result.is_err());
        // the second, non-panicking timer still ran.
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
