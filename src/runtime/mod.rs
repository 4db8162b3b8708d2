//! # Agent runtime: instances, pooling, queue consumption, supervision.
//!
//! This is the dispatch side of the platform: everything that happens
//! after the gateway has stored a record and published an assignment.
//!
//! ## Files & responsibilities
//! - **instance.rs**: one warm in-process executor for one function —
//!   cold start, bounded lifetime, done-signal, concurrent execution.
//! - **manager.rs**: the pool of instances keyed by function name; lazily
//!   spawns, reuses, and garbage-collects them under a global cap.
//! - **consumer.rs**: the per-function loop — fetch → bind → execute →
//!   ack/nak — that drives the durable task state machine.
//! - **supervisor.rs**: owns the hint loop and the consumer registry;
//!   orchestrates graceful shutdown. OS signal handling belongs to the
//!   binary, which cancels the runtime token handed to [`AgentSupervisor::run`].
//!
//! ## Wiring
//! ```text
//! gateway ──► record store + task.<fn> + task.hints
//!                                          │
//!                    AgentSupervisor::run ◄┘  (hint loop)
//!                       │
//!                       ├──► spawn FunctionConsumer per hinted function
//!                       │        │ fetch task.<fn>
//!                       │        ├──► InstanceManager::acquire ──► Instance
//!                       │        ├──► CAS pending → processing
//!                       │        ├──► Instance::execute (bounded by ack_wait)
//!                       │        └──► CAS terminal state, ack
//!                       │
//!                       └──► shutdown: cancel consumers → stop manager,
//!                            bounded by the grace period
//! ```
//!
//! ## Rules
//! - Every loop observes its governing cancellation token; nothing sleeps
//!   without racing the token.
//! - The consumer never propagates errors upward: each failure is retried
//!   (nak + backoff), dead-lettered, or persisted as a terminal `failed`
//!   record. A task never vanishes silently.
//! - Cancel wins: once a cancel is persisted, execute-side CAS loses and
//!   acks without re-transitioning.

mod consumer;
mod instance;
mod manager;
mod supervisor;

pub use consumer::FunctionConsumer;
pub use instance::{ExecError, Instance, Runner, RunnerRef, SimulatedRunner};
pub use manager::InstanceManager;
pub use supervisor::AgentSupervisor;
