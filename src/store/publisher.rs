//! # Task publisher.
//!
//! Serializes task intents onto the persistent `TASKS` stream:
//! - `tasks.execute` / `tasks.cancel` carry `{ task_name }`; consumers read
//!   the authoritative record from the store.
//! - `task.<function>` carries the [`TaskAssignment`] a function-queue
//!   consumer binds to an instance.
//!
//! Construction ensures the stream exists with all task subjects bound;
//! the call is idempotent. Publish failures are always surfaced; whether a
//! failure is tolerable is the service layer's decision, never this one's.

use std::sync::Arc;

use crate::broker::{Broker, BrokerError};
use crate::domain::{CancelTaskMessage, ExecuteTaskMessage, TaskAssignment};
use crate::error::Error;
use crate::names::TaskName;

/// Persistent stream carrying all task traffic.
pub const STREAM_TASKS: &str = "TASKS";

/// Execute-intent subject.
pub const SUBJECT_EXECUTE: &str = "tasks.execute";
/// Cancel-intent subject.
pub const SUBJECT_CANCEL: &str = "tasks.cancel";
/// Traffic-hint subject.
pub const SUBJECT_HINTS: &str = "task.hints";

/// Wildcard binding every per-function queue into the stream.
const SUBJECT_QUEUES: &str = "task.>";

/// Publisher of task intents and assignments.
#[derive(Clone)]
pub struct TaskPublisher {
    broker: Arc<dyn Broker>,
}

impl TaskPublisher {
    /// Connects the publisher, idempotently ensuring the `TASKS` stream
    /// covers the execute/cancel/hint/queue subjects.
    pub async fn new(broker: Arc<dyn Broker>) -> Result<Self, Error> {
        broker
            .ensure_stream(
                STREAM_TASKS,
                &[SUBJECT_EXECUTE, SUBJECT_CANCEL, SUBJECT_HINTS, SUBJECT_QUEUES],
            )
            .await?;
        Ok(Self { broker })
    }

    /// Publishes an execute intent for `task_name`.
    pub async fn publish_execute(&self, task_name: &TaskName) -> Result<(), Error> {
        let msg = ExecuteTaskMessage {
            task_name: task_name.clone(),
        };
        self.publish_json(SUBJECT_EXECUTE, &msg).await
    }

    /// Publishes a cancel intent for `task_name`.
    pub async fn publish_cancel(&self, task_name: &TaskName) -> Result<(), Error> {
        let msg = CancelTaskMessage {
            task_name: task_name.clone(),
        };
        self.publish_json(SUBJECT_CANCEL, &msg).await
    }

    /// Publishes the assignment onto its function queue.
    pub async fn publish_assignment(&self, assignment: &TaskAssignment) -> Result<(), Error> {
        let subject = assignment.function_id.queue_subject();
        self.publish_json(&subject, assignment).await
    }

    async fn publish_json<T: serde::Serialize>(
        &self,
        subject: &str,
        payload: &T,
    ) -> Result<(), Error> {
        let bytes = serde_json::to_vec(payload)
            .map_err(|e| Error::internal(format!("encode {subject} payload: {e}")))?;
        self.broker
            .publish(subject, &bytes)
            .await
            .map_err(|e: BrokerError| Error::BrokerUnavailable {
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::broker::{BrokerConsumer, ConsumerConfig, MemoryBroker};
    use crate::domain::Task;
    use crate::names::FunctionName;

    async fn consumer_on(
        broker: &MemoryBroker,
        filter: &str,
    ) -> Arc<dyn BrokerConsumer> {
        broker
            .create_consumer(
                STREAM_TASKS,
                ConsumerConfig {
                    durable_name: format!("test-{filter}"),
                    filter_subject: filter.into(),
                    ack_wait: Duration::from_secs(1),
                    max_ack_pending: 8,
                    max_deliver: 3,
                    backoff: vec![Duration::from_millis(10)],
                },
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn execute_intent_reaches_its_subject() {
        let broker = MemoryBroker::new();
        let publisher = TaskPublisher::new(Arc::new(broker.clone())).await.unwrap();

        let task = Task::new(FunctionName::parse("functions/foo").unwrap(), "{}");
        publisher.publish_execute(&task.name).await.unwrap();

        let cons = consumer_on(&broker, SUBJECT_EXECUTE).await;
        let d = cons.fetch(Duration::from_millis(50)).await.unwrap();
        let msg: ExecuteTaskMessage = serde_json::from_slice(&d.payload).unwrap();
        assert_eq!(msg.task_name, task.name);
        d.ack().await;
    }

    #[tokio::test]
    async fn assignment_lands_on_function_queue() {
        let broker = MemoryBroker::new();
        let publisher = TaskPublisher::new(Arc::new(broker.clone())).await.unwrap();

        let task = Task::new(
            FunctionName::parse("functions/foo").unwrap(),
            r#"{"execution_time_ms": 10}"#,
        );
        let assignment = TaskAssignment::from_task(&task);
        publisher.publish_assignment(&assignment).await.unwrap();

        let cons = consumer_on(&broker, "task.functions/foo").await;
        let d = cons.fetch(Duration::from_millis(50)).await.unwrap();
        let back: TaskAssignment = serde_json::from_slice(&d.payload).unwrap();
        assert_eq!(back, assignment);
        d.ack().await;
    }

    #[tokio::test]
    async fn ensure_stream_is_idempotent() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        TaskPublisher::new(Arc::clone(&broker)).await.unwrap();
        TaskPublisher::new(broker).await.unwrap();
    }
}
