//! # Gateway-side task service.
//!
//! [`TaskService`] is what the transport surface (gRPC, HTTP, CLI) calls
//! into. It composes the record store, the publisher, and the hint client,
//! and owns the one cross-cutting decision of the write path:
//!
//! **Publish is part of create.** A record that exists in `pending` without
//! an enqueued assignment would be invisible to every agent, so on any
//! publish failure the freshly created record is deleted (compensation) and
//! the caller sees `broker-unavailable`. Cancel is the opposite case: once
//! the terminal state is durably written, the cancel intent is best-effort,
//! since agents honor the record, not the message.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::broker::{Broker, KvBucket};
use crate::domain::{Task, TaskAssignment};
use crate::error::Error;
use crate::names::{FunctionName, TaskName};
use crate::store::{HintClient, TaskPage, TaskPublisher, TaskStore};

/// Front door for task CRUD plus enqueueing.
#[derive(Clone)]
pub struct TaskService {
    store: TaskStore,
    publisher: TaskPublisher,
    hints: HintClient,
}

impl TaskService {
    /// Wires a service over the given broker and record bucket, ensuring
    /// the task stream exists.
    pub async fn connect(broker: Arc<dyn Broker>, kv: Arc<dyn KvBucket>) -> Result<Self, Error> {
        let publisher = TaskPublisher::new(Arc::clone(&broker)).await?;
        Ok(Self {
            store: TaskStore::new(kv),
            publisher,
            hints: HintClient::new(broker),
        })
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    /// Creates a task for `function` and enqueues its execution.
    ///
    /// Two-phase: the record is stored first, then assignment + execute
    /// intent + hint are published. Any publish failure rolls the record
    /// back and returns `broker-unavailable`.
    pub async fn create_task(&self, function: &str, parameters: String) -> Result<Task, Error> {
        let function = FunctionName::parse(function)?;
        let task = Task::new(function, parameters);
        self.store.create(&task).await?;

        if let Err(e) = self.enqueue(&task).await {
            warn!(task = %task.name, error = %e, "enqueue failed; rolling back record");
            if let Err(del) = self.store.delete(&task.name).await {
                // The record survives; a later create with a fresh id is
                // unaffected, but operators should see this.
                warn!(task = %task.name, error = %del, "rollback delete failed");
            }
            return Err(e);
        }

        info!(task = %task.name, function = %task.function, "task created");
        Ok(task)
    }

    async fn enqueue(&self, task: &Task) -> Result<(), Error> {
        let assignment = TaskAssignment::from_task(task);
        self.publisher.publish_assignment(&assignment).await?;
        self.publisher.publish_execute(&task.name).await?;
        self.hints.publish_hint(&task.function).await?;
        Ok(())
    }

    /// Returns the record for `name`.
    pub async fn get_task(&self, name: &str) -> Result<Task, Error> {
        let name = TaskName::parse(name)?;
        let (task, _) = self.store.get(&name).await?;
        Ok(task)
    }

    /// Lists records in lexicographic order.
    pub async fn list_tasks(&self, page_size: usize, page_token: &str) -> Result<TaskPage, Error> {
        self.store.list(page_size, page_token).await
    }

    /// Deletes the record for `name`.
    pub async fn delete_task(&self, name: &str) -> Result<(), Error> {
        let name = TaskName::parse(name)?;
        self.store.delete(&name).await
    }

    /// Cancels the task and emits the cancel intent.
    pub async fn cancel_task(&self, name: &str) -> Result<Task, Error> {
        let name = TaskName::parse(name)?;
        let task = self.store.cancel(&name).await?;

        // The durable record is already canceled; agents honor it at their
        // next read, so a lost intent message costs nothing but latency.
        if let Err(e) = self.publisher.publish_cancel(&name).await {
            debug!(task = %name, error = %e, "cancel intent publish failed");
        }
        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MemoryBroker, MemoryKv};
    use crate::domain::TaskState;

    async fn service() -> TaskService {
        TaskService::connect(Arc::new(MemoryBroker::new()), Arc::new(MemoryKv::new()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn create_stores_pending_record() {
        let svc = service().await;
        let task = svc.create_task("functions/foo", "{}".into()).await.unwrap();
        assert_eq!(task.state, TaskState::Pending);

        let read = svc.get_task(task.name.as_str()).await.unwrap();
        assert_eq!(read, task);
    }

    #[tokio::test]
    async fn create_rejects_bad_function_name() {
        let svc = service().await;
        assert!(matches!(
            svc.create_task("functions/", "{}".into()).await,
            Err(Error::InvalidArgument { .. })
        ));
    }

    #[tokio::test]
    async fn cancel_while_pending() {
        let svc = service().await;
        let task = svc.create_task("functions/foo", "{}".into()).await.unwrap();

        let canceled = svc.cancel_task(task.name.as_str()).await.unwrap();
        assert_eq!(canceled.state, TaskState::Canceled);
        assert!(canceled.result.is_none());

        assert!(matches!(
            svc.cancel_task(task.name.as_str()).await,
            Err(Error::AlreadyCompleted)
        ));
    }

    #[tokio::test]
    async fn delete_then_get_is_not_found() {
        let svc = service().await;
        let task = svc.create_task("functions/foo", "{}".into()).await.unwrap();
        svc.delete_task(task.name.as_str()).await.unwrap();
        assert!(matches!(
            svc.get_task(task.name.as_str()).await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn create_rolls_back_when_broker_rejects() {
        // A broker with no streams rejects every publish, so create must
        // compensate by deleting the record.
        let kv: Arc<MemoryKv> = Arc::new(MemoryKv::new());
        let broker = Arc::new(MemoryBroker::new());
        let publisher = TaskPublisher::new(broker.clone()).await.unwrap();
        let svc = TaskService {
            store: TaskStore::new(kv.clone() as Arc<dyn KvBucket>),
            publisher,
            hints: HintClient::new(Arc::new(MemoryBroker::new())),
        };

        // Hint publish goes to a second, stream-less broker and fails.
        let err = svc.create_task("functions/foo", "{}".into()).await.unwrap_err();
        assert!(matches!(err, Error::BrokerUnavailable { .. }));
        assert!(kv.keys().await.unwrap().is_empty());
    }
}
