// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Cooperative thread interruption.
//!
//! Rust threads cannot be interrupted from the outside, so this module provides the next best
//! thing: every thread has an interrupt flag that other threads can set through a
//! [`ThreadHandle`]. Setting the flag also unparks the target thread, which means a thread
//! blocked in [`TaskFuture::get`][crate::TaskFuture::get] or [`sleep`] wakes up, observes the
//! flag and bails out with [`Interrupted`].
//!
//! Computations that want to be cancellable through
//! [`TaskFuture::cancel(true)`][crate::TaskFuture::cancel] should call [`check`] at safe points
//! or use [`sleep`] instead of [`std::thread::sleep`].

use crate::error::Interrupted;
use crate::loom::sync::Arc;
use crate::loom::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use crate::loom::thread::{self, Thread, ThreadId};
use core::fmt;
use core::ptr::{self, NonNull};
use core::time::Duration;
use std::time::Instant;

/// A handle to a thread that can be used to interrupt it.
///
/// All handles obtained for the same thread share the same interrupt flag.
#[derive(Clone)]
pub struct ThreadHandle(Arc<Inner>);
static_assertions::assert_impl_all!(ThreadHandle: Send, Sync);

struct Inner {
    thread: Thread,
    interrupted: AtomicBool,
}

crate::loom::thread_local! {
    static CURRENT: ThreadHandle = ThreadHandle(Arc::new(Inner {
        thread: thread::current(),
        interrupted: AtomicBool::new(false),
    }));
}

/// Returns a handle to the calling thread.
#[must_use]
pub fn current() -> ThreadHandle {
    CURRENT.with(ThreadHandle::clone)
}

/// Returns `true` if the calling thread has been interrupted. The flag is left untouched.
#[must_use]
pub fn is_interrupted() -> bool {
    CURRENT.with(ThreadHandle::is_interrupted)
}

/// Returns `true` if the calling thread has been interrupted and clears the flag.
#[must_use]
pub fn interrupted() -> bool {
    CURRENT.with(ThreadHandle::clear_interrupt)
}

/// Consumes a pending interrupt of the calling thread.
///
/// # Errors
///
/// Returns [`Interrupted`] if the calling thread has been interrupted. The interrupt flag is
/// cleared in that case.
pub fn check() -> Result<(), Interrupted> {
    if interrupted() {
        Err(Interrupted::new())
    } else {
        Ok(())
    }
}

/// Puts the calling thread to sleep for at least `dur`, waking up early if it gets
/// interrupted.
///
/// # Errors
///
/// Returns [`Interrupted`] if the calling thread was interrupted before or during the sleep.
/// The interrupt flag is cleared in that case.
pub fn sleep(dur: Duration) -> Result<(), Interrupted> {
    let Some(deadline) = Instant::now().checked_add(dur) else {
        // the deadline is too far in the future to be represented, so this is effectively a
        // sleep until interrupted
        loop {
            check()?;
            thread::park();
        }
    };

    loop {
        check()?;

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(());
        }

        crate::loom::park_timeout(remaining);
    }
}

// === impl ThreadHandle ===

impl ThreadHandle {
    /// Sets the interrupt flag of the thread and unparks it.
    pub fn interrupt(&self) {
        self.0.interrupt();
    }

    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.0.interrupted.load(Ordering::Acquire)
    }

    /// The underlying [`Thread`].
    #[must_use]
    pub fn thread(&self) -> &Thread {
        &self.0.thread
    }

    #[must_use]
    pub fn id(&self) -> ThreadId {
        self.0.thread.id()
    }

    /// Returns `true` if both handles refer to the same thread.
    #[must_use]
    pub fn same_thread(&self, other: &ThreadHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn clear_interrupt(&self) -> bool {
        // avoid the RMW if there is nothing to clear
        self.0.interrupted.load(Ordering::Relaxed)
            && self.0.interrupted.swap(false, Ordering::AcqRel)
    }
}

impl fmt::Debug for ThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadHandle")
            .field("thread", &self.0.thread)
            .field("interrupted", &self.is_interrupted())
            .finish()
    }
}

impl Inner {
    fn interrupt(&self) {
        tracing::trace!(thread = ?self.thread.id(), "interrupting thread");
        self.interrupted.store(true, Ordering::Release);
        self.thread.unpark();
    }
}

// === impl RunnerSlot ===

/// The identity of the thread currently running a task, or nothing.
///
/// The slot holds one strong reference to the runner's handle. It is only ever *dereferenced*
/// by a cancelling thread through [`RunnerSlot::interrupt`]; the reference count is handed
/// back to the runner in [`RunnerSlot::release`], and it is up to the task to make sure the
/// runner keeps that reference alive until every cancelling thread that could have observed
/// the pointer is done with it.
pub(crate) struct RunnerSlot(AtomicPtr<Inner>);

/// Proof that the calling thread occupies a [`RunnerSlot`].
#[must_use = "a claimed runner slot must be released"]
pub(crate) struct Claim(NonNull<Inner>);

impl RunnerSlot {
    pub(crate) fn new() -> Self {
        Self(AtomicPtr::new(ptr::null_mut()))
    }

    /// Attempts to record the calling thread as the runner.
    ///
    /// Returns `None` if another thread is already running the task.
    pub(crate) fn claim(&self) -> Option<Claim> {
        let ptr = Arc::into_raw(current().0).cast_mut();

        match self.0.compare_exchange(
            ptr::null_mut(),
            ptr,
            Ordering::SeqCst,
            Ordering::Relaxed,
        ) {
            // Safety: `Arc::into_raw` never returns null
            Ok(_) => Some(Claim(unsafe { NonNull::new_unchecked(ptr) })),
            Err(_) => {
                // Safety: we just created the raw pointer above and failed to publish it
                drop(unsafe { Arc::from_raw(ptr) });
                None
            }
        }
    }

    /// Clears the slot and hands the runner's handle back.
    ///
    /// The returned handle must be kept alive until no cancelling thread can still be inside
    /// [`RunnerSlot::interrupt`] for this claim.
    pub(crate) fn release(&self, claim: Claim) -> ThreadHandle {
        let prev = self.0.swap(ptr::null_mut(), Ordering::SeqCst);
        debug_assert_eq!(prev, claim.0.as_ptr());

        // Safety: the claim proves we stored this pointer in `claim` and nobody but us may
        // clear the slot.
        ThreadHandle(unsafe { Arc::from_raw(claim.0.as_ptr().cast_const()) })
    }

    /// Interrupts the current runner, if there is one.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that a runner that is about to release the slot cannot drop
    /// its handle until this call returns. `TaskFuture` does this by having the cancelling
    /// thread move the state to `Interrupting` *before* calling this method and having the
    /// runner spin until the state reaches `Interrupted` after releasing the slot.
    pub(crate) unsafe fn interrupt(&self) -> bool {
        let ptr = self.0.load(Ordering::SeqCst);
        if ptr.is_null() {
            return false;
        }

        // Safety: ensured by caller
        unsafe {
            (*ptr).interrupt();
        }
        true
    }
}

#[cfg(test)]
impl RunnerSlot {
    pub(crate) fn is_claimed(&self) -> bool {
        !self.0.load(Ordering::Acquire).is_null()
    }
}

impl fmt::Debug for RunnerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RunnerSlot")
            .field(&self.0.load(Ordering::Relaxed))
            .finish()
    }
}
