// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::sync::atomic::{AtomicU8, Ordering};
use core::fmt;

/// The lifecycle stage of a [`TaskFuture`][crate::TaskFuture].
///
/// States only ever move forward along one of these paths:
///
/// ```text
/// New -> Completing -> Normal
/// New -> Completing -> Exceptional
/// New -> Cancelled
/// New -> Interrupting -> Interrupted
/// ```
///
/// The numeric order of the variants is load-bearing: everything greater than
/// [`State::Completing`] has a published outcome (or none, if cancelled) and everything
/// greater or equal to [`State::Cancelled`] was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum State {
    /// The task has not completed and has not been cancelled. It may be running.
    New = 0,
    /// An outcome is being written. A terminal state follows shortly.
    Completing = 1,
    /// The task produced a value.
    Normal = 2,
    /// The task failed.
    Exceptional = 3,
    /// The task was cancelled without interrupting its runner.
    Cancelled = 4,
    /// The task was cancelled and its runner is about to be interrupted.
    Interrupting = 5,
    /// The task was cancelled and its runner (if any) has been interrupted.
    Interrupted = 6,
}

impl State {
    const fn from_u8(bits: u8) -> Self {
        match bits {
            0 => State::New,
            1 => State::Completing,
            2 => State::Normal,
            3 => State::Exceptional,
            4 => State::Cancelled,
            5 => State::Interrupting,
            6 => State::Interrupted,
            _ => unreachable!(),
        }
    }

    /// Returns `true` if the task left the [`State::New`] state.
    #[inline]
    #[must_use]
    pub fn is_done(self) -> bool {
        self != State::New
    }

    /// Returns `true` if the outcome of the task is settled, i.e. waiters may stop waiting.
    #[inline]
    #[must_use]
    pub fn is_settled(self) -> bool {
        self > State::Completing
    }

    #[inline]
    #[must_use]
    pub fn is_cancelled(self) -> bool {
        self >= State::Cancelled
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::New => "NEW",
            State::Completing => "COMPLETING",
            State::Normal => "NORMAL",
            State::Exceptional => "EXCEPTIONAL",
            State::Cancelled => "CANCELLED",
            State::Interrupting => "INTERRUPTING",
            State::Interrupted => "INTERRUPTED",
        };
        f.pad(s)
    }
}

/// The atomic state word of a task.
///
/// Only the transitions out of [`State::New`] are compare-and-swap operations, the two
/// remaining transitions (`Completing -> Normal | Exceptional` and
/// `Interrupting -> Interrupted`) are plain release stores performed by the thread that won
/// the preceding CAS.
pub(crate) struct AtomicState(AtomicU8);

impl AtomicState {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(State::New as u8))
    }

    #[inline]
    pub(crate) fn load(&self, ordering: Ordering) -> State {
        State::from_u8(self.0.load(ordering))
    }

    /// Attempts to move the state out of [`State::New`] and into `next`.
    ///
    /// Returns the actual state if the task was no longer `New`.
    ///
    /// This is always `SeqCst`. Both the runner handoff (see `TaskFuture::release_runner`)
    /// and the computation handoff (see `ComputationSlot::restore`) rely on this CAS being
    /// totally ordered with a `SeqCst` access to a *different* location.
    #[inline]
    pub(crate) fn claim(&self, next: State) -> Result<(), State> {
        debug_assert!(matches!(
            next,
            State::Completing | State::Cancelled | State::Interrupting
        ));

        self.0
            .compare_exchange(
                State::New as u8,
                next as u8,
                Ordering::SeqCst,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(State::from_u8)
    }

    /// Publishes the final state of a completing task.
    ///
    /// This is the release half of the outcome handoff: every write to the outcome slot
    /// happens-before any thread that acquire-loads `to`.
    #[inline]
    pub(crate) fn complete(&self, to: State) {
        debug_assert!(matches!(to, State::Normal | State::Exceptional));
        debug_assert_eq!(self.load(Ordering::Relaxed), State::Completing);
        self.0.store(to as u8, Ordering::Release);
    }

    /// Marks the runner interrupt of a cancelled task as delivered.
    #[inline]
    pub(crate) fn finish_interrupt(&self) {
        debug_assert_eq!(self.load(Ordering::Relaxed), State::Interrupting);
        self.0.store(State::Interrupted as u8, Ordering::Release);
    }
}

impl fmt::Debug for AtomicState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.load(Ordering::Relaxed), f)
    }
}
