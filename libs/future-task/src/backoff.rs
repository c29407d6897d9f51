// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#[cfg(not(loom))]
use core::hint;

/// An exponential backoff for the two short busy-waits of a task: a waiter that observed
/// `Completing`, and a runner waiting for a cancelling thread to finish interrupting it.
///
/// Each call to [`Backoff::spin`] issues `2^exp` spin loop hints until the exponent reaches its
/// cap, after which every call yields the thread to the OS scheduler instead. Both waits are
/// expected to be very short, but the thread they wait on may have been descheduled, so
/// spinning forever would be wasteful.
#[derive(Debug, Copy, Clone)]
pub(crate) struct Backoff {
    exp: u8,
}

impl Backoff {
    /// The exponent after which [`Backoff::spin`] yields instead of spinning (2^6 spins).
    pub(crate) const MAX_SPIN_EXPONENT: u8 = 6;

    #[must_use]
    pub(crate) const fn new() -> Self {
        Self { exp: 0 }
    }

    #[inline]
    pub(crate) fn spin(&mut self) {
        if self.exp >= Self::MAX_SPIN_EXPONENT {
            crate::loom::thread::yield_now();
            return;
        }

        // loom can't make progress on the thread we are waiting for unless we yield, and
        // spinning multiplies the explored interleavings
        #[cfg(loom)]
        crate::loom::thread::yield_now();

        #[cfg(not(loom))]
        for _ in 0..1_u32 << self.exp {
            hint::spin_loop();
        }

        self.exp += 1;
    }

    #[cfg(test)]
    pub(crate) fn is_yielding(&self) -> bool {
        self.exp >= Self::MAX_SPIN_EXPONENT
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
