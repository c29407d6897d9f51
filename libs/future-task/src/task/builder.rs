// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::status::Status;
use crate::task::{OnDone, TaskFuture};
use core::any::type_name;
use core::fmt;
use core::panic::Location;

/// Configures a [`TaskFuture`] before it is created.
///
/// ```
/// use future_task::TaskFuture;
///
/// let task = TaskFuture::<u32, &str>::builder()
///     .name("answer")
///     .on_done(|status| println!("answer: {status}"))
///     .build(|| Ok(42));
///
/// task.run();
/// assert_eq!(task.get(), Ok(&42));
/// ```
pub struct Builder<'a, T, E> {
    location: Option<Location<'a>>,
    name: Option<&'a str>,
    on_done: Option<OnDone<T, E>>,
}

impl<'a, T, E> Builder<'a, T, E> {
    pub(crate) const fn new() -> Self {
        Self {
            location: None,
            name: None,
            on_done: None,
        }
    }

    /// Sets the name of the task, used in diagnostics.
    #[must_use]
    pub fn name(mut self, name: &'a str) -> Self {
        self.name = Some(name);
        self
    }

    /// Overrides the source location the task is attributed to in diagnostics.
    #[must_use]
    pub fn location(mut self, location: Location<'a>) -> Self {
        self.location = Some(location);
        self
    }

    /// Sets a hook that is invoked exactly once when the task completes, fails or is
    /// cancelled.
    ///
    /// The hook runs on the thread that moved the task into its terminal state, after all
    /// waiting threads have been woken up, and receives the final [`Status`] of the task.
    #[must_use]
    pub fn on_done<F>(mut self, f: F) -> Self
    where
        F: FnOnce(Status<'_, T, E>) + Send + 'static,
    {
        self.on_done = Some(Box::new(f));
        self
    }

    /// Creates the task around the fallible computation `f`.
    #[track_caller]
    pub fn build<F>(self, f: F) -> TaskFuture<T, E>
    where
        F: FnMut() -> Result<T, E> + Send + 'static,
        T: 'static,
        E: 'static,
    {
        let loc = self.location.as_ref().unwrap_or(Location::caller());
        let span = tracing::trace_span!(
            "task_future",
            task.name = ?self.name,
            task.output = %type_name::<T>(),
            loc.file = loc.file(),
            loc.line = loc.line(),
            loc.col = loc.column(),
        );

        TaskFuture::from_parts(
            Box::new(f),
            self.on_done,
            self.name.map(str::to_owned),
            span,
        )
    }

    /// Creates a task that runs `action` and, if it returns, completes with a clone of
    /// `result`.
    #[track_caller]
    pub fn build_with_result<A>(self, mut action: A, result: T) -> TaskFuture<T, E>
    where
        A: FnMut() + Send + 'static,
        T: Clone + Send + 'static,
        E: 'static,
    {
        self.build(move || {
            action();
            Ok(result.clone())
        })
    }
}

impl<T, E> fmt::Debug for Builder<'_, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("location", &self.location)
            .field("name", &self.name)
            .field("on_done", &self.on_done.is_some())
            .finish()
    }
}
