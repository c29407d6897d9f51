// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Cancellable single-shot computations.
//!
//! A [`TaskFuture`] wraps a computation that some executor runs exactly once (or, through
//! [`TaskFuture::run_and_reset`], repeatedly without publishing a value). Any number of threads
//! can block on its outcome with [`TaskFuture::get`] and [`TaskFuture::get_timeout`], and any
//! of them can [cancel](TaskFuture::cancel) it, optionally [interrupting](interrupt) the thread
//! that is running it.
//!
//! ```
//! use std::sync::Arc;
//! use future_task::TaskFuture;
//!
//! let task = Arc::new(TaskFuture::from_fn(|| 6 * 7));
//!
//! let worker = std::thread::spawn({
//!     let task = task.clone();
//!     move || task.run()
//! });
//!
//! assert_eq!(task.get(), Ok(&42));
//! worker.join().unwrap();
//! ```

mod backoff;
mod error;
pub mod interrupt;
mod loom;
mod state;
mod status;
mod task;
mod waiters;

pub use error::{Cause, GetError, Interrupted};
pub use state::State;
pub use status::Status;
pub use task::{Builder, TaskFuture};

/// A unit of work that an executor can run.
///
/// This is the executor-facing half of a [`TaskFuture`]. Executors that only ever *run* work
/// can hold on to `Arc<dyn Runnable>` without knowing the output type of the tasks they run.
pub trait Runnable: Send + Sync {
    /// Runs the task to completion. See [`TaskFuture::run`].
    fn run(&self);

    /// Runs the task without completing it. See [`TaskFuture::run_and_reset`].
    fn run_and_reset(&self) -> bool;
}

impl<T, E> Runnable for TaskFuture<T, E>
where
    T: Send + Sync,
    E: Send + Sync,
{
    fn run(&self) {
        TaskFuture::run(self);
    }

    fn run_and_reset(&self) -> bool {
        TaskFuture::run_and_reset(self)
    }
}

static_assertions::assert_obj_safe!(Runnable);
