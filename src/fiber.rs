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

/* Fiber transitions, asymmetric `call` vs symmetric `yield_to`:
 *
 *   INIT --construct--> HOLD --call/yield_to--> EXEC
 *   EXEC --yield_now/yield_to--> HOLD
 *   EXEC --return--> TERM
 *   EXEC --uncaught panic--> EXCEPT
 *   TERM/EXCEPT --reset--> HOLD
 *
 * `call` remembers the caller as `outer`, so a bare `Fiber::yield_now()`
 * deep inside the callee always knows who to hand control back to; the
 * caller itself stays EXEC for the duration (it is blocked, not
 * suspended) and is EXEC again as soon as `call` returns.
 *
 * `yield_to` does not touch `outer`, and unlike `call`, the yielding
 * fiber becomes HOLD immediately — it must be re-scheduled by someone
 * else (the Scheduler) to ever run again. Because the underlying
 * coroutine primitive only exposes a nested, blocking resume (not a
 * true context swap), a fiber can't jump straight to a peer from inside
 * its own stack frame without that peer's eventual plain suspend
 * returning control to the wrong place. Instead, `yield_to` called from
 * inside a running fiber suspends that fiber with a "run this other
 * handle next" signal, which the nearest enclosing resume loop (a
 * `call`, or a root-level `yield_to`) picks up and acts on without
 * growing the native stack. `yield_to` called directly from the
 * thread-root fiber has no such enclosing loop, so it starts one.
 */

use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};

use crate::error::{FiberError, PanicPayload};
use crate::stack::{StackPool, DEFAULT_STACK_SIZE};

/// State of a Fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Constructed, never yet resumed. Rarely observed directly: a freshly
    /// constructed Fiber is immediately usable as `Hold`.
    Init,
    /// Suspended; a `call`/`yield_to` will make it `Exec` again.
    Hold,
    /// Currently running on some thread.
    Exec,
    /// Entry procedure returned normally; re-enterable only via `reset`.
    Term,
    /// Entry procedure panicked; the payload is available to whoever
    /// `call`s this fiber next, re-enterable only via `reset`.
    Except,
}

impl State {
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Term | State::Except)
    }
}

/// Return type of [`Handle::call`].
pub type ResumeResult<T> = Result<T, PanicPayload>;

/// Fiber spawn options.
#[derive(Debug, Clone)]
pub struct Options {
    /// The size of the stack.
    pub stack_size: usize,
    /// The name of the Fiber, used only for debug output and logging.
    pub name: Option<String>,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            stack_size: DEFAULT_STACK_SIZE,
            name: None,
        }
    }
}

type Entry = Box<dyn FnOnce() + Send + 'static>;
type Outcome = Result<(), PanicPayload>;
/// What a fiber's coroutine body yields with: `None` for a plain suspend
/// (hand control back to whoever is physically resuming this chain),
/// `Some(target)` to redirect the chain onto `target` next.
type Redirect = Option<Handle>;
type FiberCoroutine = Coroutine<(), Redirect, Outcome, DefaultStack>;

enum Body {
    /// The thread-root fiber: represents the thread's native context, owns
    /// no stack and no coroutine.
    Root,
    Coroutine(FiberCoroutine),
}

struct Inner {
    name: Option<String>,
    state: Cell<State>,
    /// Set the first time this fiber's coroutine body starts executing;
    /// cleared by `reset`. Distinguishes "Hold, never run" from "Hold,
    /// suspended mid-run" for `reset`'s precondition.
    has_run: Cell<bool>,
    body: RefCell<Body>,
    /// The fiber that `call`ed into this one, if any. Cleared once `call`
    /// returns. `yield_to` never sets this.
    outer: RefCell<Option<Handle>>,
    /// Raw pointer to this fiber's own `Yielder`, valid for the lifetime of
    /// its currently running coroutine body (set once, on first entry).
    /// `Fiber::yield_now` uses it to suspend back to whoever is resuming.
    yielder: Cell<*const ()>,
    pool: Option<StackPool>,
    /// Set once at construction; never the target of a coroutine resume.
    /// Checked without borrowing `body`, since `body` may already be
    /// mutably borrowed by an enclosing resume loop while this is read.
    is_root: bool,
}

// SAFETY: a Fiber's mutable state (`RefCell`s, `Cell`s) is only ever
// touched by the single thread that currently owns it: either the thread
// on which it is `Exec`, or the thread that holds it dequeued from a
// scheduler (never both at once).
unsafe impl Send for Inner {}

/// Handle to a Fiber: opaque, reference-counted, cheap to clone.
#[derive(Clone)]
pub struct Handle(Arc<Inner>);

unsafe impl Send for Handle {}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("name", &self.0.name)
            .field("state", &self.0.state.get())
            .finish()
    }
}

impl PartialEq for Handle {
    fn eq(&self, other: &Handle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Handle {}

thread_local! {
    static CURRENT: RefCell<Option<Handle>> = RefCell::new(None);
    static ROOT: Handle = Fiber::construct_root();
}

/// A coroutine is nothing more than a (stack, saved machine context) pair,
/// plus the bookkeeping in `Inner` that turns raw stack switches into the
/// `Init`/`Hold`/`Exec`/`Term`/`Except` state machine described above.
pub struct Fiber;

impl Fiber {
    /// Construct a fiber in `Hold`, with a default-sized stack.
    pub fn spawn<F>(f: F) -> Handle
    where
        F: FnOnce() + Send + 'static,
    {
        Fiber::spawn_opts(f, Options::default()).expect("default stack allocation failed")
    }

    /// Construct a fiber in `Hold` with explicit options.
    pub fn spawn_opts<F>(f: F, opts: Options) -> Result<Handle, FiberError>
    where
        F: FnOnce() + Send + 'static,
    {
        let pool = StackPool::new(opts.stack_size);
        let stack = pool.take().map_err(|source| FiberError::StackAlloc {
            size: opts.stack_size,
            source,
        })?;
        let inner = Arc::new(Inner {
            name: opts.name,
            state: Cell::new(State::Hold),
            has_run: Cell::new(false),
            body: RefCell::new(Body::Root), // placeholder, replaced below
            outer: RefCell::new(None),
            yielder: Cell::new(std::ptr::null()),
            pool: Some(pool),
            is_root: false,
        });
        let coroutine = Self::make_coroutine(&inner, Box::new(f), stack);
        *inner.body.borrow_mut() = Body::Coroutine(coroutine);
        log::trace!("fiber {:?} constructed in Hold", inner.name);
        Ok(Handle(inner))
    }

    fn make_coroutine(inner: &Arc<Inner>, entry: Entry, stack: DefaultStack) -> FiberCoroutine {
        let weak = Arc::downgrade(inner);
        Coroutine::with_stack(stack, move |yielder: &Yielder<(), Redirect>, ()| -> Outcome {
            if let Some(inner) = weak.upgrade() {
                inner.yielder.set(yielder as *const Yielder<(), Redirect> as *const ());
                inner.has_run.set(true);
            }
            panic::catch_unwind(AssertUnwindSafe(entry)).map_err(PanicPayload)
        })
    }

    /// Construct the thread-root fiber: represents the calling thread's
    /// native context, starts `Exec`, owns no stack, never `Term`.
    fn construct_root() -> Handle {
        Handle(Arc::new(Inner {
            name: Some("<root>".to_string()),
            state: Cell::new(State::Exec),
            has_run: Cell::new(true),
            body: RefCell::new(Body::Root),
            outer: RefCell::new(None),
            yielder: Cell::new(std::ptr::null()),
            pool: None,
            is_root: true,
        }))
    }

    /// The fiber currently `Exec` on this thread; the thread-root fiber if
    /// nothing has been resumed here yet.
    pub fn current() -> Handle {
        CURRENT.with(|c| {
            c.borrow()
                .clone()
                .unwrap_or_else(|| ROOT.with(|r| r.clone()))
        })
    }

    /// Yield to the current fiber's `outer` (the fiber that last `call`ed
    /// it). Fails if there is no outer — an invariant violation, since a
    /// fiber reached only via `yield_to` (or the root fiber) has none.
    pub fn yield_now() {
        let current = Fiber::current();
        assert!(
            current.0.outer.borrow().is_some(),
            "Fiber::yield_now called with no outer fiber; use Scheduler::yield_to instead"
        );
        Fiber::raw_suspend(None);
    }

    /// Unconditionally suspend the current fiber's coroutine body, handing
    /// control back to whoever physically resumed it — `call`'s outer,
    /// `yield_to`'s caller, or a scheduler's dispatch loop alike. `yield_now`
    /// is the outer-gated public surface built on top of this; a
    /// [`crate::scheduler::Scheduler`] uses this directly since a fiber
    /// reached via its dispatch loop's `yield_to` has no outer to check.
    pub(crate) fn suspend_current() {
        Fiber::raw_suspend(None);
    }

    /// Suspend the current fiber's coroutine body with a redirect signal:
    /// whoever physically resumed this fiber should resume `target` next
    /// instead of treating this as a plain suspend. Used by
    /// [`Handle::yield_to`] to hand off without growing the native stack.
    fn suspend_redirect(target: Handle) {
        Fiber::raw_suspend(Some(target));
    }

    fn raw_suspend(redirect: Redirect) {
        let current = Fiber::current();
        let ptr = current.0.yielder.get();
        assert!(
            !ptr.is_null(),
            "attempted to suspend a fiber with no running coroutine (root fiber?)"
        );
        // SAFETY: `ptr` was set from a live `&Yielder` at the start of this
        // very coroutine body and remains valid for its entire execution,
        // across any number of suspend/resume cycles.
        let yielder: &Yielder<(), Redirect> = unsafe { &*(ptr as *const Yielder<(), Redirect>) };
        yielder.suspend(redirect);
    }
}

/// Resume `start`, following any chain of `yield_to` redirects in place
/// (without recursive native calls) until something plain-suspends
/// (`Hold`, returns `None`) or terminates (`Term`/`Except`, returns the
/// captured `Outcome`). Never resumes the root fiber directly: a redirect
/// onto root ends the chain, since root has no coroutine body to run.
fn run_chain(start: Handle) -> Option<Outcome> {
    let mut current = start;
    loop {
        assert_eq!(
            current.0.state.get(),
            State::Hold,
            "can only call/yield_to a fiber in Hold"
        );
        current.0.state.set(State::Exec);
        CURRENT.with(|c| *c.borrow_mut() = Some(current.clone()));

        let result = {
            let mut body = current.0.body.borrow_mut();
            match &mut *body {
                Body::Root => unreachable!("the root fiber is never resumed, only yielded to"),
                Body::Coroutine(co) => co.resume(()),
            }
        };

        match result {
            CoroutineResult::Yield(Some(target)) if !target.is_root() => {
                current.0.state.set(State::Hold);
                current = target;
            }
            CoroutineResult::Yield(_) => {
                current.0.state.set(State::Hold);
                return None;
            }
            CoroutineResult::Return(outcome) => {
                current.0.state.set(match outcome {
                    Ok(()) => State::Term,
                    Err(_) => State::Except,
                });
                return Some(outcome);
            }
        }
    }
}

impl Handle {
    fn is_root(&self) -> bool {
        self.0.is_root
    }

    /// Asymmetric transfer: resume this fiber, recording the calling fiber
    /// as its `outer`. Blocks until this fiber (or a chain of fibers it
    /// `yield_to`s into) suspends or terminates; the calling fiber stays
    /// `Exec` throughout — it is blocked, not suspended — and remains so
    /// once this returns. On terminate-via-panic, re-raises the captured
    /// payload into the caller.
    pub fn call(&self) -> ResumeResult<()> {
        let caller = Fiber::current();
        assert_eq!(
            caller.0.state.get(),
            State::Exec,
            "the resuming fiber must be Exec"
        );
        assert_eq!(
            self.0.state.get(),
            State::Hold,
            "can only call/yield_to a fiber in Hold"
        );
        *self.0.outer.borrow_mut() = Some(caller.clone());
        let outcome = run_chain(self.clone());
        *self.0.outer.borrow_mut() = None;
        CURRENT.with(|c| *c.borrow_mut() = Some(caller.clone()));
        match outcome {
            Some(Err(payload)) => Err(payload),
            _ => Ok(()),
        }
    }

    /// Symmetric transfer: resume this fiber without recording an outer.
    /// The caller becomes `Hold` immediately and will not run again until
    /// something else schedules it; any panic captured along the way is
    /// discarded unless the relevant fiber is later `call`ed.
    ///
    /// Called from inside a running fiber, this hands off via a suspend +
    /// redirect signal rather than a nested resume (see the module-level
    /// comment), so that a later plain suspend anywhere in the chain
    /// returns control to the right place instead of back into this
    /// fiber. Called directly from the thread-root fiber, there is no
    /// enclosing resume loop to delegate to, so this one starts it.
    pub fn yield_to(&self) {
        let caller = Fiber::current();
        assert_eq!(
            caller.0.state.get(),
            State::Exec,
            "the yielding fiber must be Exec"
        );
        assert_eq!(
            self.0.state.get(),
            State::Hold,
            "can only call/yield_to a fiber in Hold"
        );
        caller.0.state.set(State::Hold);

        if caller.is_root() {
            let _ = run_chain(self.clone());
            caller.0.state.set(State::Exec);
            CURRENT.with(|c| *c.borrow_mut() = Some(caller.clone()));
        } else {
            Fiber::suspend_redirect(self.clone());
        }
    }

    /// Re-initialize a terminated (or never-run) fiber to re-enter at
    /// `new_entry`, reusing the same backing stack pool.
    pub fn reset<F>(&self, new_entry: F) -> Result<(), FiberError>
    where
        F: FnOnce() + Send + 'static,
    {
        let state = self.0.state.get();
        assert!(
            state.is_terminal() || (state == State::Hold && !self.0.has_run.get()),
            "reset requires a Term/Except fiber, or one that has never run"
        );
        let pool = self
            .0
            .pool
            .clone()
            .expect("reset is not valid on the root fiber");

        let old_stack = {
            let mut body = self.0.body.borrow_mut();
            match std::mem::replace(&mut *body, Body::Root) {
                Body::Coroutine(co) => co.into_stack(),
                Body::Root => unreachable!(),
            }
        };
        pool.give(old_stack);
        let stack = pool.take().map_err(|source| FiberError::StackAlloc {
            size: pool.size(),
            source,
        })?;

        self.0.yielder.set(std::ptr::null());
        self.0.has_run.set(false);
        let coroutine = Fiber::make_coroutine(&self.0, Box::new(new_entry), stack);
        *self.0.body.borrow_mut() = Body::Coroutine(coroutine);
        self.0.state.set(State::Hold);
        log::trace!("fiber {:?} reset to Hold", self.0.name);
        Ok(())
    }

    /// Current state. Only authoritative when read from the owning thread.
    #[inline]
    pub fn state(&self) -> State {
        self.0.state.get()
    }

    #[inline]
    pub fn name(&self) -> Option<&str> {
        self.0.name.as_deref()
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        matches!(self.0.state.get(), State::Term | State::Except)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    #[test]
    fn basic_call_and_yield() {
        let (tx, rx) = channel();
        let a = Fiber::spawn(move || {
            tx.send(1).unwrap();
            Fiber::yield_now();
            tx.send(2).unwrap();
        });
        assert_eq!(a.state(), State::Hold);
        a.call().expect("call failed");
        assert_eq!(rx.recv().unwrap(), 1);
        assert_eq!(a.state(), State::Hold);

        a.call().expect("call failed");
        assert_eq!(rx.recv().unwrap(), 2);
        assert_eq!(a.state(), State::Term);
    }

    #[test]
    fn reset_reenters_with_new_entry() {
        let a = Fiber::spawn(|| {});
        a.call().unwrap();
        assert_eq!(a.state(), State::Term);

        let (tx, rx) = channel();
        a.reset(move || tx.send(42).unwrap()).unwrap();
        assert_eq!(a.state(), State::Hold);
        a.call().unwrap();
        assert_eq!(rx.recv().unwrap(), 42);
    }

    #[test]
    fn panic_is_captured_and_reraised_on_call() {
        let a = Fiber::spawn(|| panic!("boom"));
        let err = a.call().unwrap_err();
        assert_eq!(err.message(), "boom");
        assert_eq!(a.state(), State::Except);
    }

    #[test]
    fn yield_to_does_not_set_outer() {
        let a = Fiber::spawn(|| {
            // no outer was recorded by yield_to, so yield_now must panic.
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(Fiber::yield_now));
            assert!(result.is_err());
        });
        a.yield_to();
    }

    #[test]
    fn symmetric_yield_to_hands_off_to_root_and_back() {
        let root = Fiber::current();
        assert_eq!(root.state(), State::Exec);

        let (tx, rx) = channel();
        let root_for_fiber = root.clone();
        let a = Fiber::spawn(move || {
            tx.send(root_for_fiber.state() == State::Hold).unwrap();
            root_for_fiber.yield_to();
            tx.send(root_for_fiber.state() == State::Hold).unwrap();
        });

        a.yield_to();
        assert_eq!(root.state(), State::Exec, "root resumes once the fiber yields back to it");
        assert_eq!(a.state(), State::Hold);
        assert!(rx.recv().unwrap(), "root must be Hold while the fiber runs");

        a.yield_to();
        assert_eq!(root.state(), State::Exec);
        assert_eq!(a.state(), State::Term);
        assert!(rx.recv().unwrap(), "root is still Hold when the fiber resumes after yielding to it");
    }

    #[test]
    fn current_on_fresh_thread_is_root() {
        let current = Fiber::current();
        assert_eq!(current.state(), State::Exec);
        assert_eq!(current.name(), Some("<root>"));
    }
}
