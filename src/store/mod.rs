//! # Persistence and queueing front-ends.
//!
//! Three collaborators around the broker:
//! - [`TaskStore`] — the durable record store over a versioned KV bucket;
//!   every mutation is compare-and-swap.
//! - [`TaskPublisher`] — serializes execute/cancel intents and per-function
//!   assignments onto the `TASKS` stream.
//! - [`HintClient`] — publishes and consumes the traffic hints that tell an
//!   agent which function queues currently have work.

mod hints;
mod publisher;
mod tasks;

pub use hints::HintClient;
pub use publisher::{
    TaskPublisher, STREAM_TASKS, SUBJECT_CANCEL, SUBJECT_EXECUTE, SUBJECT_HINTS,
};
pub use tasks::{TaskPage, TaskStore};
