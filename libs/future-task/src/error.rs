// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::any::Any;
use core::fmt;

/// The reason a task failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cause<E> {
    /// The computation returned an error, or one was published through
    /// [`TaskFuture::set_failure`][crate::TaskFuture::set_failure].
    Error(E),
    /// The computation panicked. Holds the panic message if the payload was a string.
    Panic(String),
}

/// Error returned when waiting for the outcome of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetError<'a, E> {
    /// The computation failed. Every caller observes the same cause.
    Failed(&'a Cause<E>),
    /// The task was cancelled before it could complete.
    Cancelled,
    /// The wait timed out before the task completed. The task is unaffected.
    TimedOut,
    /// The waiting thread was interrupted. The task is unaffected.
    Interrupted,
}

/// Error returned when a thread observes that it has been interrupted.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Interrupted(());

// === impl Cause ===

impl<E> Cause<E> {
    pub(crate) fn from_panic(payload: Box<dyn Any + Send + 'static>) -> Self {
        let msg = match payload.downcast::<String>() {
            Ok(msg) => *msg,
            Err(payload) => panic_message(payload.as_ref()).to_owned(),
        };

        Self::Panic(msg)
    }

    /// Returns the error returned by the computation, if the task did not fail by panicking.
    pub fn error(&self) -> Option<&E> {
        match self {
            Cause::Error(err) => Some(err),
            Cause::Panic(_) => None,
        }
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, Cause::Panic(_))
    }
}

/// Extracts the message of a panic payload, if it has one.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        *msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "Box<dyn Any>"
    }
}

impl<E: fmt::Display> fmt::Display for Cause<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cause::Error(err) => fmt::Display::fmt(err, f),
            Cause::Panic(msg) => write!(f, "panicked: {msg}"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> core::error::Error for Cause<E> {}

// === impl GetError ===

impl<E> GetError<'_, E> {
    /// Returns the cause of the failure if the computation failed.
    pub fn cause(&self) -> Option<&Cause<E>> {
        match self {
            GetError::Failed(cause) => Some(cause),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, GetError::Cancelled)
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, GetError::TimedOut)
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, GetError::Interrupted)
    }
}

impl<E> From<Interrupted> for GetError<'_, E> {
    fn from(_: Interrupted) -> Self {
        Self::Interrupted
    }
}

impl<E: fmt::Display> fmt::Display for GetError<'_, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GetError::Failed(cause) => write!(f, "task failed: {cause}"),
            GetError::Cancelled => f.write_str("task was cancelled"),
            GetError::TimedOut => f.write_str("timed out waiting for task"),
            GetError::Interrupted => f.write_str("interrupted while waiting for task"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> core::error::Error for GetError<'_, E> {}

// === impl Interrupted ===

impl Interrupted {
    pub(crate) const fn new() -> Self {
        Self(())
    }
}

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("interrupted")
    }
}

impl core::error::Error for Interrupted {}
