//! Deferred values with exactly-once settlement and turn-based observation.
//!
//! A [`Deferred`] stands for a result that is not known yet. Its producer
//! settles it exactly once through a [`Settler`], with either a success
//! payload or a failure reason, and every consumer registered before or
//! after that moment observes the final outcome exactly once. Observers
//! never run inside the settling call; they are pushed onto a [`TaskQueue`]
//! and run when the host drains it, after the settling call stack has
//! unwound.
//!
//! ```
//! use deferred_out::{Deferred, Step, TaskQueue};
//!
//! let queue = TaskQueue::new();
//! let (settler, value) = Deferred::<i32, String>::new(&queue);
//! let doubled = value.chain_fulfilled(|n| Step::Value(n * 2));
//!
//! settler.fulfill(21);
//! queue.run_until_idle();
//! assert_eq!(doubled.settlement(), Some(Ok(42)));
//! ```
//!
//! A [`Deferred`] can also be awaited: it implements [`Future`] and wakes
//! its tasks when the value settles or is abandoned.
//!
//! [`Future`]: std::future::Future

use thiserror::Error;

pub mod deferred;
pub mod queue;

mod combine;

pub use deferred::{Deferred, Settler};
pub use queue::TaskQueue;

/// What a handler or settlement feeds into a deferred value: an immediate
/// payload, an immediate failure, or another deferred value whose eventual
/// outcome should be adopted in its place.
#[derive(Debug)]
pub enum Step<T, E> {
    /// An opaque success payload, taken as-is.
    Value(T),
    /// An immediate failure.
    Fail(E),
    /// Adopt the eventual outcome of this deferred value.
    Deferred(Deferred<T, E>),
}

/// Why awaiting a [`Deferred`] produced no success payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error<E> {
    /// The producer rejected the value with this reason.
    #[error("deferred value was rejected")]
    Rejected(E),
    /// Every [`Settler`] was dropped before the value settled.
    #[error("every settler was dropped before settlement")]
    Abandoned,
}
