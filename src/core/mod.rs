//! # Core Data Structures
//!
//! Foundational structures the transport layers are built from.
//!
//! ## Components
//! - **KeyedQueue**: insertion-ordered map with O(1) membership and keyed removal
//! - **Completion**: single-shot promise/future pairs with an exactly-once guard
//! - **DeferredIndex**: time-bucketed index triggering ids at or after a deadline

pub mod completion;
pub mod deferred;
pub mod keyed_queue;

pub use completion::{completion, Awaitable, Completion, CompletionState};
pub use deferred::DeferredIndex;
pub use keyed_queue::KeyedQueue;
