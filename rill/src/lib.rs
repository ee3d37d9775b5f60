//! rill is an asynchronous concurrency and I/O runtime built around three
//! tightly coupled abstractions: promises (composable handles to
//! values-to-be), queues (task dispatchers deciding *where* continuations
//! run), and an event dispatcher multiplexing OS-level I/O onto those
//! queues.
//!
//! ```no_run
//! use rill::runtime::{Builder, TerminationMode};
//! use rill::with;
//!
//! let scheduler = Builder::new().worker_threads(2).try_build().unwrap();
//! let queue = scheduler.create_queue().unwrap();
//!
//! with(&queue, (17, "hello".to_string()))
//!     .then(|i: i32, s: String| (s.len() as i32) * i)
//!     .then(|n: i32| println!("{n}"))
//!     .detach();
//!
//! scheduler.terminate(TerminationMode::Graceful);
//! scheduler.await_termination();
//! ```

pub mod channel;
pub mod error;
pub mod promise;
pub mod queue;
pub mod runtime;

#[cfg(target_os = "linux")]
pub mod io;

pub use channel::{Channel, Readable, Writable};
pub use error::{
    set_unhandled_rejection_hook, unset_unhandled_rejection_hook, Error, Rejection,
};
pub use promise::{make_promise, rejected, with, Deferred, Promise, SharedPromise};
pub use queue::Queue;
pub use runtime::{Fetched, Scheduler, TaskFetcher, TerminationMode};

#[cfg(test)]
pub(crate) mod test_utils;
