// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::Cause;
use core::fmt;

/// A borrowed view of a task's outcome, as returned by
/// [`TaskFuture::status`][crate::TaskFuture::status] and passed to completion hooks.
///
/// The [`Display`][fmt::Display] implementation renders the diagnostic status strings
/// `"Completed normally"`, `"Completed exceptionally: <cause>"`, `"Cancelled"` and
/// `"Not completed"`.
#[derive(Debug, PartialEq, Eq)]
pub enum Status<'a, T, E> {
    /// The task has not produced an outcome yet.
    Pending,
    /// The task produced a value.
    Completed(&'a T),
    /// The task failed.
    Failed(&'a Cause<E>),
    /// The task was cancelled.
    Cancelled,
}

impl<T, E> Status<'_, T, E> {
    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self, Status::Pending)
    }
}

impl<T, E> Clone for Status<'_, T, E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T, E> Copy for Status<'_, T, E> {}

impl<T, E: fmt::Display> fmt::Display for Status<'_, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Pending => f.write_str("Not completed"),
            Status::Completed(_) => f.write_str("Completed normally"),
            Status::Failed(cause) => write!(f, "Completed exceptionally: {cause}"),
            Status::Cancelled => f.write_str("Cancelled"),
        }
    }
}
