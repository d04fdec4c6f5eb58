// The MIT License (MIT)

// Copyright (c) 2015 Rustcc developers

// Permission is hereby granted, free of charge, to any person obtaining a copy of
// this software and associated documentation files (the "Software"), to deal in
// the Software without restriction, including without limitation the rights to
// use, copy, modify, merge, publish, distribute, sublicense, and/or sell copies of
// the Software, and to permit persons to whom the Software is furnished to do so,
// subject to the following conditions:

// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.

// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS
// FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR
// COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER
// IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN
// CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.

//! Crate-level integration tests exercising fibers, the scheduler, and the
//! parallel combinators together — the unit tests living alongside each
//! module cover that module in isolation.

use std::sync::mpsc::channel;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::fiber::Fiber;
use crate::parallel::{parallel_do, parallel_foreach};
use crate::scheduler::Scheduler;

#[test]
fn fiber_basic_call() {
    let (tx, rx) = channel();
    Fiber::spawn(move || {
        tx.send(1).unwrap();
    })
    .call()
    .expect("call failed");
    assert_eq!(rx.recv().unwrap(), 1);
}

#[test]
fn fiber_yield_then_resume() {
    let (tx, rx) = channel();
    let coro = Fiber::spawn(move || {
        tx.send(1).unwrap();
        Fiber::yield_now();
        tx.send(2).unwrap();
    });
    coro.call().expect("call failed");
    assert_eq!(rx.recv().unwrap(), 1);
    assert!(rx.try_recv().is_err());

    coro.call().expect("call failed");
    assert_eq!(rx.recv().unwrap(), 2);
}

#[test]
fn fiber_spawned_inside_another_fiber() {
    let (tx, rx) = channel();
    let tx2 = tx.clone();
    Fiber::spawn(move || {
        tx.send(1).unwrap();
        Fiber::spawn(move || {
            tx2.send(2).unwrap();
        })
        .call()
        .expect("call failed");
    })
    .call()
    .expect("call failed");

    assert_eq!(rx.recv().unwrap(), 1);
    assert_eq!(rx.recv().unwrap(), 2);
}

#[test]
fn fiber_panic_is_observed_by_the_caller() {
    let coro = Fiber::spawn(|| panic!("boom"));
    assert!(coro.call().is_err());
}

#[test]
fn fiber_child_panic_does_not_poison_the_parent() {
    Fiber::spawn(|| {
        let _ = Fiber::spawn(|| panic!("child panic")).call();
    })
    .call()
    .expect("parent call failed");
}

#[test]
fn scheduler_runs_a_batch_of_closures_to_completion() {
    let scheduler = Scheduler::single();
    let total = Arc::new(AtomicUsize::new(0));
    for _ in 0..8 {
        let total = total.clone();
        scheduler
            .schedule(move || { total.fetch_add(1, Ordering::SeqCst); }, None)
            .unwrap();
    }
    scheduler.stop();
    assert_eq!(total.load(Ordering::SeqCst), 8);
}

#[test]
fn fan_out_and_then_foreach_on_the_same_scheduler() {
    let scheduler = Scheduler::single();
    scheduler
        .schedule(
            || {
                let sum = Arc::new(AtomicUsize::new(0));
                let jobs: Vec<Box<dyn FnOnce() + Send>> = (1..=4)
                    .map(|n| {
                        let sum = sum.clone();
                        Box::new(move || {
                            sum.fetch_add(n, Ordering::SeqCst);
                        }) as Box<dyn FnOnce() + Send>
                    })
                    .collect();
                parallel_do(jobs).expect("parallel_do failed");
                assert_eq!(sum.load(Ordering::SeqCst), 1 + 2 + 3 + 4);

                let all_small = parallel_foreach(0..16, |n: i32| n < 16, 4).expect("parallel_foreach failed");
                assert!(all_small);
            },
            None,
        )
        .unwrap();
    scheduler.stop();
}
