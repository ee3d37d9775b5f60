use crate::error::Rejection;
use crate::queue::Queue;
use std::sync::Arc;

// Public API
pub mod continuation;
pub use continuation::{Continuation, Packed, Spread};

pub mod tuple;
pub use tuple::Tuple;

mod promise;
pub use promise::{Deferred, Promise, SharedPromise};

// Exports
pub(crate) mod state;

#[cfg(test)]
mod tests;

/// An already-fulfilled promise carrying `values`, whose continuations will
/// run on `queue`.
///
/// The values may be a tuple of any arity up to the supported maximum; a
/// continuation of matching arity receives them unpacked, while a unary
/// continuation taking the whole tuple receives it packed.
pub fn with<T: Tuple>(queue: &Arc<Queue>, values: T) -> Promise<T> {
    Promise::from_settled(queue.clone(), Ok(values))
}

/// An already-rejected promise.
pub fn rejected<T: Tuple>(queue: &Arc<Queue>, err: impl Into<Rejection>) -> Promise<T> {
    Promise::from_settled(queue.clone(), Err(err.into()))
}

/// A pending promise plus the deferred that settles it. `resolve` and
/// `reject` consume the deferred, so the terminal transition happens at most
/// once by construction.
pub fn make_promise<T: Tuple>(queue: &Arc<Queue>) -> (Deferred<T>, Promise<T>) {
    Promise::new_pending(queue.clone())
}
