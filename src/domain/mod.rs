//! # Domain model: task records and wire messages.
//!
//! This module groups the durable data model and the broker payloads:
//! - [`Task`], [`TaskState`], [`TaskResult`] the versioned record stored
//!   under `tasks/<id>` and its state machine;
//! - [`ExecuteTaskMessage`], [`CancelTaskMessage`] intent messages on the
//!   `tasks.execute` / `tasks.cancel` subjects;
//! - [`TaskAssignment`] the per-function queue payload consumed by the
//!   agent.
//!
//! The record byte format is self-describing JSON with a stable schema;
//! unknown fields survive read-modify-write cycles.

mod message;
mod task;

pub use message::{CancelTaskMessage, ExecuteTaskMessage, TaskAssignment};
pub use task::{Task, TaskResult, TaskState};

pub(crate) use message::duration_ms;
