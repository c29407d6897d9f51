// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod builder;

use crate::backoff::Backoff;
use crate::error::{Cause, GetError, Interrupted, panic_message};
use crate::interrupt::{self, Claim, RunnerSlot};
use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::{AtomicPtr, Ordering};
use crate::loom::thread;
use crate::state::{AtomicState, State};
use crate::status::Status;
use crate::waiters::{Registration, Waiters};
use core::convert::Infallible;
use core::fmt;
use core::panic::AssertUnwindSafe;
use core::ptr;
use core::time::Duration;
use std::time::Instant;

pub use builder::Builder;

pub(crate) type Computation<T, E> = Box<dyn FnMut() -> Result<T, E> + Send>;
pub(crate) type OnDone<T, E> = Box<dyn FnOnce(Status<'_, T, E>) + Send>;

/// A cancellable computation whose single outcome can be awaited by any number of threads.
///
/// A `TaskFuture` is created around a computation and handed to some executor, which calls
/// [`run`][TaskFuture::run] on one of its worker threads. Any number of other threads may
/// block in [`get`][TaskFuture::get] or [`get_timeout`][TaskFuture::get_timeout] until the
/// computation has produced a value or failed, and every one of them observes the same outcome.
///
/// The task can be [cancelled][TaskFuture::cancel] as long as it has not completed. Cancelling
/// with `may_interrupt = true` also [interrupts][crate::interrupt] the thread currently running
/// the computation, which is how long-running computations learn that nobody is interested in
/// their result anymore.
///
/// # Implementation Notes
///
/// The task is driven by a single atomic state word (see [`State`]) that only ever moves
/// forward, and only out of [`State::New`] through compare-and-swap. Whoever wins that CAS owns
/// the transition: the outcome slot may only be written by the thread that moved the task to
/// [`State::Completing`], and it is published by the release store of the terminal state.
/// Readers acquire-load the state before touching the outcome. No lock is involved anywhere;
/// waiting threads park on a lock-free stack (see [`Waiters`]) that the completing thread drains
/// after publishing the terminal state.
pub struct TaskFuture<T, E = Infallible> {
    state: AtomicState,
    /// The thread currently running the computation, if any.
    runner: RunnerSlot,
    /// The computation. Released once the task reaches a terminal state.
    computation: ComputationSlot<T, E>,
    /// Written once by the thread that moved the state to `Completing`, read only after
    /// observing `Normal` or `Exceptional`.
    outcome: UnsafeCell<Option<Result<T, Cause<E>>>>,
    waiters: Waiters,
    /// Invoked once by the thread that moved the task into a terminal state.
    on_done: UnsafeCell<Option<OnDone<T, E>>>,
    name: Option<String>,
    span: tracing::Span,
}

// Safety: all shared mutable state is either atomic or guarded by the state machine. The outcome
// is moved in from whichever thread completes the task (`T: Send`, `E: Send`) and borrowed by
// any number of threads afterwards (`T: Sync`, `E: Sync`).
unsafe impl<T: Send + Sync, E: Send + Sync> Sync for TaskFuture<T, E> {}

static_assertions::assert_impl_all!(TaskFuture<(), ()>: Send, Sync);

/// Owning slot for a task's computation.
///
/// The runner takes the computation out of the slot for the duration of the call, so that a
/// concurrent completion can't drop it under the runner's feet. Whoever finds it in the slot
/// once the task is terminal drops it.
struct ComputationSlot<T, E>(AtomicPtr<Computation<T, E>>);

impl<T, E> TaskFuture<T, E> {
    /// Creates a task that will run `f` when [`run`][TaskFuture::run] is called.
    #[track_caller]
    pub fn new<F>(f: F) -> Self
    where
        F: FnMut() -> Result<T, E> + Send + 'static,
        T: 'static,
        E: 'static,
    {
        Builder::new().build(f)
    }

    /// Creates a task that runs `action` and, if it returns, completes with a clone of `result`.
    ///
    /// The task never fails unless `action` panics.
    #[track_caller]
    pub fn with_result<A>(action: A, result: T) -> Self
    where
        A: FnMut() + Send + 'static,
        T: Clone + Send + 'static,
        E: 'static,
    {
        Builder::new().build_with_result(action, result)
    }

    /// Returns a [`Builder`] for configuring a task before creating it.
    #[must_use]
    pub fn builder<'a>() -> Builder<'a, T, E> {
        Builder::new()
    }

    pub(crate) fn from_parts(
        computation: Computation<T, E>,
        on_done: Option<OnDone<T, E>>,
        name: Option<String>,
        span: tracing::Span,
    ) -> Self {
        Self {
            state: AtomicState::new(),
            runner: RunnerSlot::new(),
            computation: ComputationSlot::new(computation),
            outcome: UnsafeCell::new(None),
            waiters: Waiters::new(),
            on_done: UnsafeCell::new(on_done),
            name,
            span,
        }
    }

    /// The name this task was [built][Builder::name] with.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Runs the computation and publishes its outcome, unless the task has already been
    /// started, completed or cancelled, in which case this does nothing.
    ///
    /// This is the entry point for executors. The computation is run at most once, no matter
    /// how often or from how many threads this is called. A panicking computation is treated
    /// as a failure.
    pub fn run(&self) {
        let Some(claim) = self.claim_runner() else {
            return;
        };
        let _span = self.span.enter();

        // a cancel may have snuck in between our state check and claiming the runner slot
        if self.state.load(Ordering::Acquire) == State::New
            && let Some(mut computation) = self.computation.take()
        {
            tracing::trace!("running computation");
            let outcome = call(&mut computation);
            drop(computation);

            self.publish(outcome);
        }

        self.release_runner(claim);
    }

    /// Runs the computation *without* publishing its value and resets the task so it can be
    /// run again.
    ///
    /// This is the entry point for periodic and other repeated executions. Returns `true` if
    /// the computation ran without failing and the task was neither cancelled nor completed in
    /// the meantime, i.e. if the task may be run again. A failing computation completes the
    /// task exactly like [`run`][TaskFuture::run] would.
    pub fn run_and_reset(&self) -> bool {
        let Some(claim) = self.claim_runner() else {
            return false;
        };
        let _span = self.span.enter();

        let mut ran = false;
        if self.state.load(Ordering::Acquire) == State::New
            && let Some(mut computation) = self.computation.take()
        {
            tracing::trace!("running computation (reset)");
            match call(&mut computation) {
                Ok(_) => {
                    ran = true;
                    self.computation.restore(computation, &self.state);
                }
                Err(cause) => {
                    drop(computation);
                    self.publish(Err(cause));
                }
            }
        }

        let state = self.release_runner(claim);
        ran && state == State::New
    }

    /// Attempts to cancel the task.
    ///
    /// Fails if the task has already completed, been cancelled, or is about to complete. If
    /// `may_interrupt` is `true`, the thread running the computation (if any) is
    /// [interrupted][crate::interrupt::ThreadHandle::interrupt]. Note that cancelling never
    /// stops a running computation by force; it will run until it returns or honors the
    /// interrupt, and its outcome is discarded.
    ///
    /// Returns `true` if this call cancelled the task.
    pub fn cancel(&self, may_interrupt: bool) -> bool {
        let next = if may_interrupt {
            State::Interrupting
        } else {
            State::Cancelled
        };

        if let Err(actual) = self.state.claim(next) {
            tracing::trace!(state = %actual, "cancel: task is no longer new");
            return false;
        }

        if may_interrupt {
            // Safety: we moved the state to `Interrupting` above (`SeqCst`), so a runner that
            // releases the slot after we loaded it is guaranteed to observe `Interrupting` and
            // won't drop its handle until we store `Interrupted` below.
            let interrupted = unsafe { self.runner.interrupt() };
            tracing::debug!(task = ?self.name, interrupted, "cancelled task");

            // unconditional, so the runner never waits on us forever
            self.state.finish_interrupt();
        } else {
            tracing::debug!(task = ?self.name, "cancelled task");
        }

        self.finish_completion();
        true
    }

    /// Publishes `value` as the outcome of the task, unless it has already completed or been
    /// cancelled.
    ///
    /// Returns `true` if `value` became the outcome of the task.
    pub fn set(&self, value: T) -> bool {
        self.publish(Ok(value))
    }

    /// Fails the task with `error`, unless it has already completed or been cancelled.
    ///
    /// Returns `true` if this call failed the task.
    pub fn set_failure(&self, error: E) -> bool {
        self.publish(Err(Cause::Error(error)))
    }

    /// Blocks the calling thread until the task has completed and returns its outcome.
    ///
    /// Every caller, no matter if it called this before or after the task completed, observes
    /// the same outcome.
    ///
    /// # Errors
    ///
    /// - [`GetError::Failed`] if the computation failed.
    /// - [`GetError::Cancelled`] if the task was cancelled.
    /// - [`GetError::Interrupted`] if the calling thread was [interrupted][crate::interrupt]
    ///   while waiting. The interrupt flag is cleared and the task is unaffected.
    pub fn get(&self) -> Result<&T, GetError<'_, E>> {
        let mut state = self.state.load(Ordering::Acquire);
        if !state.is_settled() {
            state = self.await_done(None)?;
        }
        self.report(state)
    }

    /// Blocks the calling thread until the task has completed or `timeout` has elapsed.
    ///
    /// # Errors
    ///
    /// - [`GetError::TimedOut`] if the task has not completed within `timeout`. The task is
    ///   unaffected and may still complete later.
    /// - Otherwise the same errors as [`get`][TaskFuture::get].
    pub fn get_timeout(&self, timeout: Duration) -> Result<&T, GetError<'_, E>> {
        let mut state = self.state.load(Ordering::Acquire);
        if !state.is_settled() {
            state = self.await_done(Some(timeout))?;
            if !state.is_settled() {
                return Err(GetError::TimedOut);
            }
        }
        self.report(state)
    }

    /// Returns the outcome of the task without blocking, or `Ok(None)` if it has not completed
    /// yet.
    ///
    /// # Errors
    ///
    /// - [`GetError::Failed`] if the computation failed.
    /// - [`GetError::Cancelled`] if the task was cancelled.
    pub fn try_get(&self) -> Result<Option<&T>, GetError<'_, E>> {
        let state = self.state.load(Ordering::Acquire);
        if state.is_settled() {
            self.report(state).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Returns the value of the task if it completed normally.
    pub fn result_now(&self) -> Option<&T> {
        match self.status() {
            Status::Completed(value) => Some(value),
            _ => None,
        }
    }

    /// Returns the cause of the failure if the task failed.
    pub fn failure_now(&self) -> Option<&Cause<E>> {
        match self.status() {
            Status::Failed(cause) => Some(cause),
            _ => None,
        }
    }

    /// Returns a view of the task's current outcome.
    pub fn status(&self) -> Status<'_, T, E> {
        match self.state.load(Ordering::Acquire) {
            State::New | State::Completing => Status::Pending,
            State::Normal => match self.outcome() {
                Ok(value) => Status::Completed(value),
                Err(_) => unreachable!("normal completion without a value"),
            },
            State::Exceptional => match self.outcome() {
                Err(cause) => Status::Failed(cause),
                Ok(_) => unreachable!("exceptional completion with a value"),
            },
            State::Cancelled | State::Interrupting | State::Interrupted => Status::Cancelled,
        }
    }

    /// Returns the current [`State`] of the task.
    pub fn state(&self) -> State {
        self.state.load(Ordering::Acquire)
    }

    /// Returns `true` if the task completed, failed or was cancelled.
    pub fn is_done(&self) -> bool {
        self.state().is_done()
    }

    /// Returns `true` if the task was cancelled before it completed.
    pub fn is_cancelled(&self) -> bool {
        self.state().is_cancelled()
    }

    fn claim_runner(&self) -> Option<Claim> {
        let state = self.state.load(Ordering::Acquire);
        if state != State::New {
            tracing::trace!(task = ?self.name, %state, "ignoring run of finished task");
            return None;
        }

        let claim = self.runner.claim();
        if claim.is_none() {
            tracing::trace!(task = ?self.name, "ignoring run of running task");
        }
        claim
    }

    /// Clears the runner slot and returns the state observed right after.
    ///
    /// If the task is being cancelled with an interrupt, this waits for the cancelling thread
    /// to finish delivering the interrupt and then clears it, so the interrupt can't leak into
    /// whatever the calling thread does next.
    fn release_runner(&self, claim: Claim) -> State {
        let handle = self.runner.release(claim);

        // `SeqCst` pairs with the `SeqCst` claim in `cancel`: either the cancelling thread sees
        // the cleared slot, or we see `Interrupting` (or later) here.
        let state = self.state.load(Ordering::SeqCst);
        if state >= State::Interrupting {
            let mut boff = Backoff::new();
            while self.state.load(Ordering::Acquire) == State::Interrupting {
                boff.spin();
            }

            if handle.clear_interrupt() {
                tracing::trace!("cleared cancellation interrupt");
            }
        }

        // only now may the handle go, see `RunnerSlot::interrupt`
        drop(handle);
        state
    }

    fn publish(&self, outcome: Result<T, Cause<E>>) -> bool {
        if let Err(actual) = self.state.claim(State::Completing) {
            tracing::trace!(state = %actual, "discarding outcome of finished task");
            return false;
        }

        let terminal = if outcome.is_ok() {
            State::Normal
        } else {
            State::Exceptional
        };

        self.outcome.with_mut(|slot| {
            // Safety: winning the transition to `Completing` gives us exclusive access to the
            // outcome, readers only look at it after observing the terminal state stored below.
            unsafe { *slot = Some(outcome) }
        });
        self.state.complete(terminal);
        tracing::debug!(task = ?self.name, state = %terminal, "task completed");

        self.finish_completion();
        true
    }

    /// Wakes all waiters, invokes the completion hook and releases the computation.
    ///
    /// Called exactly once, by the thread that moved the task into its terminal state.
    fn finish_completion(&self) {
        let woken = self.waiters.drain();
        tracing::trace!(woken, "drained waiters");

        let on_done = self.on_done.with_mut(|hook| {
            // Safety: only the thread that moved the task out of `New` gets here, and it only
            // gets here once
            unsafe { (*hook).take() }
        });
        if let Some(on_done) = on_done {
            let status = self.status();
            if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(|| on_done(status))) {
                tracing::error!(
                    task = ?self.name,
                    "completion hook panicked: {}",
                    panic_message(payload.as_ref())
                );
            }
        }

        drop(self.computation.take());
    }

    /// Waits for the task to settle, or for `timeout` to elapse.
    ///
    /// Returns the last observed state, which is not settled if the wait timed out.
    fn await_done(&self, timeout: Option<Duration>) -> Result<State, Interrupted> {
        let start = timeout.map(|_| Instant::now());
        // dropping the registration on any return hands the node back for reclamation
        let mut registration: Option<Registration<'_>> = None;
        let mut queued = false;
        let mut boff = Backoff::new();

        loop {
            let state = self.state.load(Ordering::Acquire);

            if state.is_settled() {
                return Ok(state);
            } else if state == State::Completing {
                // the outcome is about to land, no point in parking
                boff.spin();
            } else if interrupt::interrupted() {
                if let Some(registration) = &registration {
                    self.waiters.remove(registration.node());
                }
                tracing::trace!("interrupted while waiting");
                return Err(Interrupted::new());
            } else if let Some(registration) = &registration {
                let node = registration.node();
                if !queued {
                    queued = self.waiters.push(node);
                    continue;
                }

                match (timeout, start) {
                    (Some(timeout), Some(start)) => {
                        let elapsed = start.elapsed();
                        if elapsed >= timeout {
                            self.waiters.remove(node);
                            return Ok(self.state.load(Ordering::Acquire));
                        }

                        tracing::trace!("parking with timeout");
                        crate::loom::park_timeout(timeout - elapsed);
                    }
                    _ => {
                        tracing::trace!("parking");
                        thread::park();
                    }
                }
            } else {
                if timeout.is_some_and(|timeout| timeout.is_zero()) {
                    return Ok(state);
                }
                registration = Some(self.waiters.register());
            }
        }
    }

    fn report(&self, state: State) -> Result<&T, GetError<'_, E>> {
        match state {
            State::Normal | State::Exceptional => self.outcome().as_ref().map_err(GetError::Failed),
            State::Cancelled | State::Interrupting | State::Interrupted => {
                Err(GetError::Cancelled)
            }
            State::New | State::Completing => unreachable!("reporting unsettled task"),
        }
    }

    /// Must only be called after acquire-loading `Normal` or `Exceptional`.
    fn outcome(&self) -> &Result<T, Cause<E>> {
        self.outcome.with(|slot| {
            // Safety: the caller observed a terminal state, so the outcome has been written and
            // will never be written again
            let outcome = unsafe { (*slot).as_ref() };
            outcome.unwrap_or_else(|| unreachable!("completed task has no outcome"))
        })
    }
}

impl<T> TaskFuture<T> {
    /// Creates a task from an infallible computation.
    #[track_caller]
    pub fn from_fn<F>(mut f: F) -> Self
    where
        F: FnMut() -> T + Send + 'static,
        T: 'static,
    {
        Builder::new().build(move || Ok(f()))
    }
}

impl<T, E> fmt::Debug for TaskFuture<T, E>
where
    E: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskFuture")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("status", &format_args!("{}", self.status()))
            .field("runner", &self.runner)
            .field("waiters", &self.waiters)
            .finish_non_exhaustive()
    }
}

fn call<T, E>(computation: &mut Computation<T, E>) -> Result<T, Cause<E>> {
    match std::panic::catch_unwind(AssertUnwindSafe(computation)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(Cause::Error(err)),
        Err(payload) => {
            tracing::debug!("computation panicked");
            Err(Cause::from_panic(payload))
        }
    }
}

// === impl ComputationSlot ===

impl<T, E> ComputationSlot<T, E> {
    fn new(computation: Computation<T, E>) -> Self {
        Self(AtomicPtr::new(Box::into_raw(Box::new(computation))))
    }

    fn take(&self) -> Option<Box<Computation<T, E>>> {
        let ptr = self.0.swap(ptr::null_mut(), Ordering::SeqCst);
        // Safety: every non-null pointer in the slot came from `Box::into_raw` and the swap above
        // makes us its only owner
        (!ptr.is_null()).then(|| unsafe { Box::from_raw(ptr) })
    }

    /// Puts a computation taken by the runner back, or drops it if the task became terminal
    /// in the meantime.
    fn restore(&self, computation: Box<Computation<T, E>>, state: &AtomicState) {
        let prev = self.0.swap(Box::into_raw(computation), Ordering::SeqCst);
        debug_assert!(prev.is_null(), "computation slot should be empty while running");

        // Either a concurrent completion sees the computation we just put back, or we see its
        // claim here (both sides are `SeqCst`). Whoever swaps it out first drops it.
        if state.load(Ordering::SeqCst) != State::New {
            drop(self.take());
        }
    }
}

impl<T, E> Drop for ComputationSlot<T, E> {
    fn drop(&mut self) {
        drop(self.take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom;
    use crate::loom::sync::Arc;
    use crate::loom::sync::atomic::AtomicUsize;

    #[test]
    fn completes_normally() {
        loom::model(|| {
            let task = TaskFuture::from_fn(|| 42);
            assert_eq!(task.state(), State::New);
            assert_eq!(task.status().to_string(), "Not completed");

            task.run();

            assert_eq!(task.get(), Ok(&42));
            assert_eq!(task.try_get(), Ok(Some(&42)));
            assert_eq!(task.result_now(), Some(&42));
            assert_eq!(task.status().to_string(), "Completed normally");
            assert_eq!(task.state(), State::Normal);
            assert!(task.is_done());
            assert!(!task.is_cancelled());
        });
    }

    #[test]
    fn completes_exceptionally() {
        loom::model(|| {
            let task = TaskFuture::<u32, _>::new(|| Err("connection reset"));
            task.run();

            let cause = Cause::Error("connection reset");
            assert_eq!(task.get(), Err(GetError::Failed(&cause)));
            assert_eq!(task.failure_now(), Some(&cause));
            assert_eq!(
                task.status().to_string(),
                "Completed exceptionally: connection reset"
            );
            assert_eq!(task.state(), State::Exceptional);
        });
    }

    #[test]
    fn panics_are_failures() {
        loom::model(|| {
            let task = TaskFuture::<u32, &str>::new(|| panic!("boom"));
            task.run();

            let err = task.get().unwrap_err();
            assert_eq!(err.cause(), Some(&Cause::Panic("boom".to_owned())));
            assert_eq!(task.status().to_string(), "Completed exceptionally: panicked: boom");
        });
    }

    #[test]
    fn with_result() {
        loom::model(|| {
            let calls = Arc::new(AtomicUsize::new(0));
            let task = TaskFuture::<_, Infallible>::with_result(
                {
                    let calls = calls.clone();
                    move || {
                        calls.fetch_add(1, Ordering::Relaxed);
                    }
                },
                "done",
            );

            task.run();
            assert_eq!(task.get(), Ok(&"done"));
            assert_eq!(calls.load(Ordering::Relaxed), 1);
        });
    }

    #[test]
    fn redundant_run_is_ignored() {
        loom::model(|| {
            let calls = Arc::new(AtomicUsize::new(0));
            let task = TaskFuture::from_fn({
                let calls = calls.clone();
                move || calls.fetch_add(1, Ordering::Relaxed)
            });

            task.run();
            task.run();
            assert!(!task.run_and_reset());

            assert_eq!(task.get(), Ok(&0));
            assert_eq!(calls.load(Ordering::Relaxed), 1);
        });
    }

    #[test]
    fn cancel_before_run() {
        loom::model(|| {
            let calls = Arc::new(AtomicUsize::new(0));
            let task = TaskFuture::from_fn({
                let calls = calls.clone();
                move || calls.fetch_add(1, Ordering::Relaxed)
            });

            assert!(task.cancel(false));
            assert!(!task.cancel(false));
            assert!(!task.cancel(true));
            assert_eq!(task.state(), State::Cancelled);

            task.run();
            assert_eq!(calls.load(Ordering::Relaxed), 0);
            assert_eq!(task.get(), Err(GetError::Cancelled));
            assert_eq!(task.try_get(), Err(GetError::Cancelled));
            assert_eq!(task.status().to_string(), "Cancelled");
            assert!(task.is_cancelled());
            assert!(task.is_done());
        });
    }

    #[test]
    fn cancel_after_completion_fails() {
        loom::model(|| {
            let task = TaskFuture::from_fn(|| 7);
            task.run();

            assert!(!task.cancel(false));
            assert!(!task.cancel(true));
            assert_eq!(task.get(), Ok(&7));
            assert_eq!(task.state(), State::Normal);
        });
    }

    #[test]
    fn cancel_with_interrupt_without_runner() {
        loom::model(|| {
            let task = TaskFuture::from_fn(|| 7);
            assert!(task.cancel(true));
            assert_eq!(task.state(), State::Interrupted);
            assert_eq!(task.get(), Err(GetError::Cancelled));
        });
    }

    #[test]
    fn set_is_exactly_once() {
        loom::model(|| {
            let task = TaskFuture::<u32, &str>::new(|| Ok(1));

            assert!(task.set(2));
            assert!(!task.set(3));
            assert!(!task.set_failure("too late"));
            assert!(!task.cancel(true));

            // the computation never gets to run
            task.run();
            assert_eq!(task.get(), Ok(&2));
        });
    }

    #[test]
    fn computation_is_released() {
        loom::model(|| {
            let token = Arc::new(());

            let task = TaskFuture::from_fn({
                let token = token.clone();
                move || Arc::strong_count(&token)
            });
            assert_eq!(Arc::strong_count(&token), 2);
            task.run();
            assert_eq!(Arc::strong_count(&token), 1);
            assert_eq!(task.get(), Ok(&2));

            let task = TaskFuture::from_fn({
                let token = token.clone();
                move || Arc::strong_count(&token)
            });
            assert!(task.cancel(false));
            assert_eq!(Arc::strong_count(&token), 1);
        });
    }

    #[test]
    fn run_and_reset() {
        loom::model(|| {
            let calls = Arc::new(AtomicUsize::new(0));
            let task = TaskFuture::from_fn({
                let calls = calls.clone();
                move || calls.fetch_add(1, Ordering::Relaxed)
            });

            assert!(task.run_and_reset());
            assert!(task.run_and_reset());
            assert_eq!(task.state(), State::New);
            assert_eq!(task.try_get(), Ok(None));

            // a regular run still publishes the outcome afterwards
            task.run();
            assert_eq!(task.get(), Ok(&2));
            assert_eq!(calls.load(Ordering::Relaxed), 3);
        });
    }

    #[test]
    fn run_and_reset_failure_finalizes() {
        loom::model(|| {
            let calls = Arc::new(AtomicUsize::new(0));
            let task = TaskFuture::<(), _>::new({
                let calls = calls.clone();
                move || {
                    if calls.fetch_add(1, Ordering::Relaxed) == 1 {
                        Err("second run failed")
                    } else {
                        Ok(())
                    }
                }
            });

            assert!(task.run_and_reset());
            assert!(!task.run_and_reset());
            assert_eq!(task.state(), State::Exceptional);
            assert_eq!(
                task.get(),
                Err(GetError::Failed(&Cause::Error("second run failed")))
            );

            assert!(!task.run_and_reset());
            assert_eq!(calls.load(Ordering::Relaxed), 2);
        });
    }

    #[test]
    fn run_and_reset_cancelled() {
        loom::model(|| {
            let task = TaskFuture::from_fn(|| ());
            assert!(task.cancel(false));
            assert!(!task.run_and_reset());
            assert_eq!(task.get(), Err(GetError::Cancelled));
        });
    }

    #[test]
    fn on_done_runs_once() {
        loom::model(|| {
            let calls = Arc::new(AtomicUsize::new(0));
            let task = TaskFuture::<u32, Infallible>::builder()
                .name("hooked")
                .on_done({
                    let calls = calls.clone();
                    move |status| {
                        assert_eq!(status, Status::Completed(&5));
                        calls.fetch_add(1, Ordering::Relaxed);
                    }
                })
                .build(|| Ok(5));
            assert_eq!(task.name(), Some("hooked"));

            task.run();
            assert!(!task.cancel(true));
            assert!(!task.set(6));
            assert_eq!(calls.load(Ordering::Relaxed), 1);
        });
    }

    #[test]
    fn on_done_sees_cancellation() {
        loom::model(|| {
            let calls = Arc::new(AtomicUsize::new(0));
            let task = TaskFuture::<u32, Infallible>::builder()
                .on_done({
                    let calls = calls.clone();
                    move |status| {
                        assert_eq!(status, Status::Cancelled);
                        calls.fetch_add(1, Ordering::Relaxed);
                    }
                })
                .build(|| Ok(5));

            assert!(task.cancel(true));
            task.run();
            assert_eq!(calls.load(Ordering::Relaxed), 1);
        });
    }

    #[test]
    fn panicking_hook_is_contained() {
        loom::model(|| {
            let task = TaskFuture::<u32, Infallible>::builder()
                .on_done(|_| panic!("hook failed"))
                .build(|| Ok(5));

            task.run();
            assert_eq!(task.get(), Ok(&5));
            assert!(!task.runner.is_claimed());

            let task = TaskFuture::<u32, Infallible>::builder()
                .on_done(|_| panic!("hook failed"))
                .build(|| Ok(5));
            assert!(task.cancel(true));
            assert_eq!(task.get(), Err(GetError::Cancelled));
        });
    }

    #[test]
    fn get_waits_for_run() {
        loom::model(|| {
            let task = Arc::new(TaskFuture::from_fn(|| 42));

            let runner = thread::spawn({
                let task = task.clone();
                move || task.run()
            });

            assert_eq!(task.get(), Ok(&42));
            runner.join().unwrap();
            assert_eq!(task.waiters.waiting(), 0);
        });
    }

    #[test]
    fn get_waits_for_cancel() {
        loom::model(|| {
            let task = Arc::new(TaskFuture::from_fn(|| 42));

            let canceller = thread::spawn({
                let task = task.clone();
                move || assert!(task.cancel(false))
            });

            assert_eq!(task.get(), Err(GetError::Cancelled));
            canceller.join().unwrap();
        });
    }

    #[test]
    fn complete_races_cancel() {
        loom::model(|| {
            let task = Arc::new(TaskFuture::<u32, Infallible>::new(|| Ok(1)));

            let setter = thread::spawn({
                let task = task.clone();
                move || task.set(2)
            });
            let cancelled = task.cancel(true);
            let set = setter.join().unwrap();

            assert!(set ^ cancelled, "exactly one of set and cancel must win");
            if set {
                assert_eq!(task.get(), Ok(&2));
            } else {
                assert_eq!(task.get(), Err(GetError::Cancelled));
            }
        });
    }

    // The runner spins until the cancelling thread finished delivering the interrupt. Under
    // extreme scheduler starvation of the canceller this can take arbitrarily long.
    #[test]
    fn run_races_cancel_with_interrupt() {
        loom::model(|| {
            let task = Arc::new(TaskFuture::from_fn(|| 1));

            let runner = thread::spawn({
                let task = task.clone();
                move || {
                    task.run();
                    // a cancellation interrupt must never outlive `run`
                    assert!(!interrupt::is_interrupted());
                }
            });

            let cancelled = task.cancel(true);
            runner.join().unwrap();

            if cancelled {
                assert_eq!(task.get(), Err(GetError::Cancelled));
                assert_eq!(task.state(), State::Interrupted);
            } else {
                assert_eq!(task.get(), Ok(&1));
            }
        });
    }

    #[test]
    fn run_and_reset_races_cancel() {
        loom::model(|| {
            let token = Arc::new(());
            let task = Arc::new(TaskFuture::from_fn({
                let token = token.clone();
                move || drop(token.clone())
            }));

            let runner = thread::spawn({
                let task = task.clone();
                move || task.run_and_reset()
            });

            assert!(task.cancel(false));
            let reset = runner.join().unwrap();
            assert!(!reset || task.is_cancelled());

            // whoever saw the computation last released it
            assert_eq!(Arc::strong_count(&token), 1);
        });
    }

    #[cfg(not(loom))]
    mod blocking {
        use super::*;
        use std::sync::atomic::AtomicBool;
        use std::sync::{Barrier, mpsc};
        use tracing_subscriber::EnvFilter;
        use tracing_subscriber::util::SubscriberInitExt;

        fn trace() -> tracing::subscriber::DefaultGuard {
            tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::from_default_env())
                .with_thread_ids(true)
                .set_default()
        }

        #[test]
        fn get_timeout_times_out() {
            let _trace = trace();

            let task = TaskFuture::from_fn(|| 42);
            let start = Instant::now();
            assert_eq!(
                task.get_timeout(Duration::from_millis(50)),
                Err(GetError::TimedOut)
            );
            assert!(start.elapsed() >= Duration::from_millis(50));
            assert_eq!(task.state(), State::New);
            assert_eq!(task.waiters.waiting(), 0);

            // zero timeouts don't even register a waiter
            assert_eq!(task.get_timeout(Duration::ZERO), Err(GetError::TimedOut));

            // the task is unaffected by timed-out waiters
            task.run();
            assert_eq!(task.get_timeout(Duration::ZERO), Ok(&42));
        }

        #[test]
        fn timed_out_polls_release_their_nodes() {
            let _trace = trace();

            let task = TaskFuture::from_fn(|| ());
            for _ in 0..10_000 {
                assert_eq!(
                    task.get_timeout(Duration::from_micros(1)),
                    Err(GetError::TimedOut)
                );
            }
            assert_eq!(task.waiters.waiting(), 0);
            assert_eq!(task.waiters.live(), 0);
        }

        #[test]
        fn concurrent_polls_release_their_nodes() {
            let _trace = trace();

            const POLLERS: usize = 4;
            let task = Arc::new(TaskFuture::from_fn(|| ()));
            let stop = Arc::new(AtomicBool::new(false));

            let pollers: Vec<_> = (0..POLLERS)
                .map(|_| {
                    let task = task.clone();
                    let stop = stop.clone();
                    std::thread::spawn(move || {
                        let mut polls = 0_usize;
                        while !stop.load(Ordering::Relaxed) {
                            assert!(task.get_timeout(Duration::from_micros(50)).is_err());
                            polls += 1;
                        }
                        polls
                    })
                })
                .collect();

            std::thread::sleep(Duration::from_millis(100));
            stop.store(true, Ordering::Relaxed);
            let polls: usize = pollers.into_iter().map(|p| p.join().unwrap()).sum();
            assert!(polls > POLLERS);

            // nodes retired while another poller was walking are picked up by the next
            // reclamation
            task.waiters.try_reclaim();
            assert_eq!(task.waiters.live(), 0);

            task.run();
            assert_eq!(task.get(), Ok(&()));
        }

        #[test]
        fn get_after_timeout_sees_late_outcome() {
            let _trace = trace();

            let task = Arc::new(TaskFuture::from_fn(|| "late"));
            assert!(task.get_timeout(Duration::from_millis(10)).is_err());

            let runner = std::thread::spawn({
                let task = task.clone();
                move || {
                    std::thread::sleep(Duration::from_millis(50));
                    task.run();
                }
            });

            assert_eq!(task.get(), Ok(&"late"));
            assert_eq!(task.get_timeout(Duration::from_secs(1)), Ok(&"late"));
            runner.join().unwrap();
        }

        #[test]
        fn get_timeout_completes_in_time() {
            let _trace = trace();

            let task = Arc::new(TaskFuture::from_fn(|| 7));
            let runner = std::thread::spawn({
                let task = task.clone();
                move || {
                    std::thread::sleep(Duration::from_millis(20));
                    task.run();
                }
            });

            assert_eq!(task.get_timeout(Duration::from_secs(10)), Ok(&7));
            runner.join().unwrap();
        }

        #[test]
        fn every_waiter_sees_the_same_outcome() {
            let _trace = trace();

            const WAITERS: usize = 8;
            let task = Arc::new(TaskFuture::from_fn(|| vec![1, 2, 3]));
            let barrier = Arc::new(Barrier::new(WAITERS + 1));

            let waiters: Vec<_> = (0..WAITERS)
                .map(|i| {
                    let task = task.clone();
                    let barrier = barrier.clone();
                    std::thread::spawn(move || {
                        barrier.wait();
                        let value = if i % 2 == 0 {
                            task.get()
                        } else {
                            task.get_timeout(Duration::from_secs(30))
                        };
                        value.map(|v| ptr::from_ref(v) as usize).map_err(|_| ())
                    })
                })
                .collect();

            barrier.wait();
            std::thread::sleep(Duration::from_millis(20));
            task.run();

            let expected = ptr::from_ref(task.get().unwrap()) as usize;
            for waiter in waiters {
                assert_eq!(waiter.join().unwrap(), Ok(expected));
            }
            assert_eq!(task.get(), Ok(&vec![1, 2, 3]));
            assert_eq!(task.waiters.waiting(), 0);
        }

        #[test]
        fn cancel_discards_running_computation() {
            let _trace = trace();

            let (started_tx, started_rx) = mpsc::channel();
            let finished = Arc::new(AtomicUsize::new(0));
            let task = Arc::new(TaskFuture::from_fn({
                let finished = finished.clone();
                move || {
                    started_tx.send(()).unwrap();
                    std::thread::sleep(Duration::from_millis(200));
                    finished.fetch_add(1, Ordering::Relaxed);
                    42
                }
            }));

            let runner = std::thread::spawn({
                let task = task.clone();
                move || task.run()
            });

            started_rx.recv().unwrap();
            assert!(task.cancel(false));
            assert_eq!(task.get(), Err(GetError::Cancelled));

            runner.join().unwrap();
            assert_eq!(finished.load(Ordering::Relaxed), 1);
            assert_eq!(task.get(), Err(GetError::Cancelled));
            assert_eq!(task.state(), State::Cancelled);
        }

        // Like `run_races_cancel_with_interrupt`, this may be slow or flaky if the cancelling
        // thread is starved between delivering the interrupt and marking it delivered.
        #[test]
        fn cancel_interrupts_runner() {
            let _trace = trace();

            let (started_tx, started_rx) = mpsc::channel();
            let task = Arc::new(TaskFuture::<(), _>::new(move || {
                started_tx.send(()).unwrap();
                interrupt::sleep(Duration::from_secs(60)).map_err(|_| "interrupted")
            }));

            let runner = std::thread::spawn({
                let task = task.clone();
                move || {
                    let start = Instant::now();
                    task.run();
                    (start.elapsed(), interrupt::is_interrupted())
                }
            });

            started_rx.recv().unwrap();
            assert!(task.cancel(true));

            let (elapsed, interrupted) = runner.join().unwrap();
            assert!(elapsed < Duration::from_secs(60));
            assert!(!interrupted);
            assert_eq!(task.state(), State::Interrupted);
            assert_eq!(task.get(), Err(GetError::Cancelled));
        }

        #[test]
        fn interrupted_waiter_leaves() {
            let _trace = trace();

            let task = Arc::new(TaskFuture::from_fn(|| 42));
            let (handle_tx, handle_rx) = mpsc::channel();

            let waiter = std::thread::spawn({
                let task = task.clone();
                move || {
                    handle_tx.send(interrupt::current()).unwrap();
                    let res = task.get().map(|v| *v).map_err(|e| e.is_interrupted());
                    (res, interrupt::is_interrupted())
                }
            });

            let handle = handle_rx.recv().unwrap();
            std::thread::sleep(Duration::from_millis(20));
            handle.interrupt();

            let (res, still_interrupted) = waiter.join().unwrap();
            assert_eq!(res, Err(true));
            assert!(!still_interrupted);

            assert_eq!(task.state(), State::New);
            assert_eq!(task.waiters.waiting(), 0);

            task.run();
            assert_eq!(task.get(), Ok(&42));
        }

        #[test]
        fn concurrent_runs_execute_once() {
            let _trace = trace();

            let calls = Arc::new(AtomicUsize::new(0));
            let barrier = Arc::new(Barrier::new(2));
            let task = Arc::new(TaskFuture::from_fn({
                let calls = calls.clone();
                move || {
                    calls.fetch_add(1, Ordering::Relaxed);
                    std::thread::sleep(Duration::from_millis(20));
                    42
                }
            }));

            let runners: Vec<_> = (0..2)
                .map(|_| {
                    let task = task.clone();
                    let barrier = barrier.clone();
                    std::thread::spawn(move || {
                        barrier.wait();
                        task.run();
                    })
                })
                .collect();

            for runner in runners {
                runner.join().unwrap();
            }

            assert_eq!(calls.load(Ordering::Relaxed), 1);
            assert_eq!(task.get(), Ok(&42));
        }

        #[test]
        fn debug_output() {
            let task = TaskFuture::<u32, &str>::builder()
                .name("debug me")
                .build(|| Ok(1));
            let dbg = format!("{task:?}");
            assert!(dbg.contains("debug me"), "{dbg}");
            assert!(dbg.contains("Not completed"), "{dbg}");

            task.run();
            assert!(format!("{task:?}").contains("Completed normally"));
        }
    }

    #[cfg(not(loom))]
    mod properties {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone, Copy)]
        enum Contender {
            Run,
            Set(u32),
            Fail,
            Cancel(bool),
        }

        fn contender() -> impl Strategy<Value = Contender> {
            prop_oneof![
                Just(Contender::Run),
                (0..u32::MAX).prop_map(Contender::Set),
                Just(Contender::Fail),
                any::<bool>().prop_map(Contender::Cancel),
            ]
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(64))]

            #[test]
            fn exactly_one_contender_completes(
                contenders in proptest::collection::vec(contender(), 1..6)
            ) {
                let hooks = Arc::new(AtomicUsize::new(0));
                let task = Arc::new(
                    TaskFuture::<u32, &str>::builder()
                        .on_done({
                            let hooks = hooks.clone();
                            move |_| {
                                hooks.fetch_add(1, Ordering::Relaxed);
                            }
                        })
                        .build(|| Ok(u32::MAX)),
                );

                let threads: Vec<_> = contenders
                    .iter()
                    .map(|&contender| {
                        let task = task.clone();
                        std::thread::spawn(move || match contender {
                            Contender::Run => {
                                let before = task.state();
                                task.run();
                                // `run` has no success indicator, count it as a win if it
                                // published the computation's value
                                before == State::New && task.result_now() == Some(&u32::MAX)
                            }
                            Contender::Set(v) => task.set(v),
                            Contender::Fail => task.set_failure("failed"),
                            Contender::Cancel(may_interrupt) => task.cancel(may_interrupt),
                        })
                    })
                    .collect();

                let wins: Vec<bool> = threads.into_iter().map(|t| t.join().unwrap()).collect();
                let explicit_wins = contenders
                    .iter()
                    .zip(&wins)
                    .filter(|(c, won)| !matches!(c, Contender::Run) && **won)
                    .count();

                prop_assert!(task.state().is_settled());
                prop_assert_eq!(hooks.load(Ordering::Relaxed), 1);

                if task.result_now() == Some(&u32::MAX) {
                    prop_assert_eq!(explicit_wins, 0);
                } else {
                    prop_assert_eq!(explicit_wins, 1);
                }

                // every later observer sees the same outcome
                let first = task.get().map(|v| *v).map_err(|e| e.to_string());
                let second = task.get().map(|v| *v).map_err(|e| e.to_string());
                prop_assert_eq!(first, second);
            }
        }
    }
}
