//! # funcvisor
//!
//! **Funcvisor** is a minimal Functions-as-a-Service platform: code is
//! registered under durable logical names (`functions/<slug>`), callers
//! enqueue asynchronous executions (`tasks/<uuid>`) against those names,
//! and a fleet of agents pulls tasks, binds each to a warm in-process
//! instance, runs it, and records the outcome.
//!
//! ## Features
//!
//! | Area                | Description                                                            | Key types / traits                          |
//! |---------------------|------------------------------------------------------------------------|---------------------------------------------|
//! | **Record store**    | Durable, versioned `task-id → record` mapping; CAS-only writes.        | [`TaskStore`], [`Task`], [`TaskState`]      |
//! | **Queuing**         | Ordered persistent stream, durable consumers, explicit acks.           | [`Broker`], [`BrokerConsumer`], [`Delivery`]|
//! | **Publishing**      | Execute/cancel intents, per-function assignments, traffic hints.       | [`TaskPublisher`], [`HintClient`]           |
//! | **Gateway service** | Create/get/list/delete/cancel with enqueue-on-create semantics.        | [`TaskService`]                             |
//! | **Agent runtime**   | Instance pool under a global cap, per-function consumer loops.         | [`AgentSupervisor`], [`InstanceManager`]    |
//! | **Errors**          | Typed kinds mapped onto the external status surface.                   | [`Error`], [`Status`]                       |
//! | **Observability**   | Prometheus families + read-only scrape endpoint.                       | [`AgentMetrics`], [`serve_metrics`]         |
//!
//! ## Example
//! ```no_run
//! use std::sync::Arc;
//! use prometheus::Registry;
//! use tokio_util::sync::CancellationToken;
//! use funcvisor::{
//!     AgentConfig, AgentMetrics, AgentSupervisor, MemoryBroker, MemoryKv,
//!     SimulatedRunner, TaskService,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let broker = Arc::new(MemoryBroker::new());
//!     let kv = Arc::new(MemoryKv::new());
//!
//!     let registry = Registry::new();
//!     let metrics = Arc::new(AgentMetrics::register(&registry)?);
//!
//!     // Agent side: pulls assignments and runs them.
//!     let supervisor = AgentSupervisor::connect(
//!         AgentConfig::default(),
//!         broker.clone(),
//!         kv.clone(),
//!         Arc::new(SimulatedRunner),
//!         metrics,
//!     )
//!     .await?;
//!     let token = CancellationToken::new();
//!     tokio::spawn(supervisor.run(token.clone()));
//!
//!     // Gateway side: stores the record and enqueues execution.
//!     let service = TaskService::connect(broker, kv).await?;
//!     let task = service
//!         .create_task("functions/hello", r#"{"execution_time_ms": 10}"#.into())
//!         .await?;
//!     println!("created {}", task.name);
//!
//!     token.cancel();
//!     Ok(())
//! }
//! ```
//!
//! ---

mod broker;
mod config;
mod domain;
mod error;
mod metrics;
mod names;
mod runtime;
mod service;
mod store;

// ---- Public re-exports ----

pub use broker::{
    AckHandle, Broker, BrokerConsumer, BrokerError, ConsumerConfig, Delivery, KvBucket, KvEntry,
    MemoryBroker, MemoryKv,
};
pub use config::{AgentConfig, BrokerConfig, ConsumerSettings, InstancesConfig, MetricsConfig};
pub use domain::{CancelTaskMessage, ExecuteTaskMessage, Task, TaskAssignment, TaskResult, TaskState};
pub use error::{Error, Status};
pub use metrics::{serve_metrics, AgentMetrics};
pub use names::{FunctionName, TaskName};
pub use runtime::{
    AgentSupervisor, ExecError, FunctionConsumer, Instance, InstanceManager, Runner, RunnerRef,
    SimulatedRunner,
};
pub use service::TaskService;
pub use store::{
    HintClient, TaskPage, TaskPublisher, TaskStore, STREAM_TASKS, SUBJECT_CANCEL, SUBJECT_EXECUTE,
    SUBJECT_HINTS,
};
