//! Fan-out combinators built on [`crate::fiber`] and [`crate::scheduler`]:
//! run a fixed list of closures to completion, or drive a bounded-width
//! worker pool over an iterator, plus a scoped scheduler-switch guard.
//!
//! `parallel_foreach`'s coordinator tracks worker completion through an
//! explicit `std::sync::mpsc` completion channel rather than scanning a
//! shared array of slots for a finished marker. A completing worker only
//! ever sends on that channel and never touches the coordinator fiber
//! directly, so — unlike a scheme where workers reschedule the coordinator
//! fiber themselves — there's no race between two workers finishing at
//! once. The coordinator instead cooperatively re-yields itself
//! (`Scheduler::switch_to`) and polls the channel each time it's
//! redispatched.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, TryRecvError};
use std::sync::Arc;

use crate::error::PanicPayload;
use crate::fiber::Fiber;
use crate::scheduler::Scheduler;

/// Run every job to completion on fresh fibers scheduled onto the current
/// thread's scheduler, waiting for all of them. If any job panics, the
/// *first job to complete* with a panic (not the first in the input list)
/// is re-raised to the caller once the whole batch has finished.
///
/// # Panics
/// Panics if called with no [`Scheduler`] current on this thread.
pub fn parallel_do<I, F>(jobs: I) -> Result<(), PanicPayload>
where
    I: IntoIterator<Item = F>,
    F: FnOnce() + Send + 'static,
{
    let scheduler = Scheduler::current().expect("parallel_do requires a current scheduler");
    let jobs: Vec<F> = jobs.into_iter().collect();
    let total = jobs.len();
    if total == 0 {
        return Ok(());
    }

    let (tx, rx) = mpsc::channel::<Option<PanicPayload>>();
    for job in jobs {
        let tx = tx.clone();
        let fiber = Fiber::spawn(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(job)).err().map(PanicPayload);
            let _ = tx.send(outcome);
        });
        scheduler
            .schedule_fiber(fiber, None)
            .expect("parallel_do: scheduler is stopping");
    }
    drop(tx);

    let mut received = 0;
    let mut first_panic = None;
    while received < total {
        match rx.try_recv() {
            Ok(outcome) => {
                received += 1;
                if first_panic.is_none() {
                    first_panic = outcome;
                }
            }
            Err(TryRecvError::Empty) => scheduler.switch_to(None),
            Err(TryRecvError::Disconnected) => break,
        }
    }

    match first_panic {
        Some(payload) => Err(payload),
        None => Ok(()),
    }
}

enum Done {
    Ok(bool),
    Panic(PanicPayload),
}

/// Apply `predicate` to every item of `iter` using up to `parallelism`
/// concurrent fibers. As soon as one invocation returns `false` or panics,
/// no further items are started (in-flight workers are still drained); the
/// first such panic (by completion order) is then re-raised, otherwise the
/// boolean AND of every result that did run is returned.
///
/// # Panics
/// Panics if called with no [`Scheduler`] current on this thread, or if
/// `parallelism == 0`.
pub fn parallel_foreach<T, I, P>(iter: I, predicate: P, parallelism: usize) -> Result<bool, PanicPayload>
where
    T: Send + 'static,
    I: IntoIterator<Item = T>,
    P: Fn(T) -> bool + Send + Sync + 'static,
{
    assert!(parallelism > 0, "parallel_foreach requires parallelism >= 1");
    let scheduler = Scheduler::current().expect("parallel_foreach requires a current scheduler");
    let predicate = Arc::new(predicate);
    let mut items = iter.into_iter();
    let (tx, rx) = mpsc::channel::<Done>();

    let spawn_worker = |item: T, tx: mpsc::Sender<Done>, predicate: Arc<P>, scheduler: &Scheduler| {
        let fiber = Fiber::spawn(move || {
            let outcome = match panic::catch_unwind(AssertUnwindSafe(|| predicate(item))) {
                Ok(result) => Done::Ok(result),
                Err(payload) => Done::Panic(PanicPayload(payload)),
            };
            let _ = tx.send(outcome);
        });
        scheduler
            .schedule_fiber(fiber, None)
            .expect("parallel_foreach: scheduler is stopping");
    };

    let mut in_flight = 0usize;
    for item in items.by_ref().take(parallelism) {
        spawn_worker(item, tx.clone(), predicate.clone(), &scheduler);
        in_flight += 1;
    }

    let mut result = true;
    let mut first_panic = None;
    let mut draining = false;

    while in_flight > 0 {
        match rx.try_recv() {
            Ok(outcome) => {
                in_flight -= 1;
                match outcome {
                    Done::Panic(payload) => {
                        draining = true;
                        if first_panic.is_none() {
                            first_panic = Some(payload);
                        }
                    }
                    Done::Ok(false) => {
                        result = false;
                        draining = true;
                    }
                    Done::Ok(true) => {}
                }
                if !draining {
                    if let Some(item) = items.next() {
                        spawn_worker(item, tx.clone(), predicate.clone(), &scheduler);
                        in_flight += 1;
                    }
                }
            }
            Err(TryRecvError::Empty) => scheduler.switch_to(None),
            Err(TryRecvError::Disconnected) => break,
        }
    }

    match first_panic {
        Some(payload) => Err(payload),
        None => Ok(result),
    }
}

/// Scoped migration of the current fiber onto a different scheduler: on
/// construction, switches to `target`; on drop, switches back to whichever
/// scheduler was current before. Guarantees release on every exit path,
/// including unwinding.
pub struct SchedulerSwitcher {
    previous: Option<Scheduler>,
}

impl SchedulerSwitcher {
    pub fn new(target: &Scheduler) -> SchedulerSwitcher {
        let previous = Scheduler::current();
        target.switch_to(None);
        SchedulerSwitcher { previous }
    }
}

impl Drop for SchedulerSwitcher {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            previous.switch_to(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn parallel_do_runs_every_job() {
        let scheduler = Scheduler::single();
        let counter = Arc::new(AtomicUsize::new(0));
        let sched2 = scheduler.clone();
        scheduler
            .schedule(
                move || {
                    let counter = counter.clone();
                    let jobs: Vec<Box<dyn FnOnce() + Send>> = (0..5)
                        .map(|_| {
                            let counter = counter.clone();
                            Box::new(move || {
                                counter.fetch_add(1, Ordering::SeqCst);
                            }) as Box<dyn FnOnce() + Send>
                        })
                        .collect();
                    parallel_do(jobs).unwrap();
                    assert_eq!(counter.load(Ordering::SeqCst), 5);
                    let _ = sched2;
                },
                None,
            )
            .unwrap();
        scheduler.stop();
    }

    #[test]
    fn parallel_do_reraises_a_panic_after_the_batch_completes() {
        let scheduler = Scheduler::single();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler
            .schedule(
                move || {
                    let counter = counter.clone();
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        let counter = counter.clone();
                        let jobs: Vec<Box<dyn FnOnce() + Send>> = vec![
                            Box::new(|| panic!("job failed")),
                            Box::new(move || {
                                counter.fetch_add(1, Ordering::SeqCst);
                            }),
                        ];
                        parallel_do(jobs).unwrap();
                    }));
                    assert!(result.is_err());
                    assert_eq!(counter.load(Ordering::SeqCst), 1);
                },
                None,
            )
            .unwrap();
        scheduler.stop();
    }

    #[test]
    fn parallel_foreach_returns_and_of_results() {
        let scheduler = Scheduler::single();
        scheduler
            .schedule(
                || {
                    let ok = parallel_foreach(0..10, |n: i32| n < 100, 4).unwrap();
                    assert!(ok);
                },
                None,
            )
            .unwrap();
        scheduler.stop();
    }

    #[test]
    fn parallel_foreach_stops_starting_new_work_after_a_failure() {
        let scheduler = Scheduler::single();
        let started = Arc::new(AtomicUsize::new(0));
        let started2 = started.clone();
        scheduler
            .schedule(
                move || {
                    let started = started2;
                    let ok = parallel_foreach(
                        0..20,
                        move |n: i32| {
                            started.fetch_add(1, Ordering::SeqCst);
                            n != 0
                        },
                        2,
                    )
                    .unwrap();
                    assert!(!ok);
                },
                None,
            )
            .unwrap();
        scheduler.stop();
        assert!(started.load(Ordering::SeqCst) < 20);
    }
}
