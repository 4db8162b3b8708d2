//! # Task record store.
//!
//! [`TaskStore`] owns the durable `task-id -> record` mapping inside a
//! versioned KV bucket. It is the **only** writer path; every update is a
//! compare-and-swap against the revision the caller read, so concurrent
//! writers (gateway cancel vs. agent execute) serialize per record without
//! any in-memory locking.
//!
//! ## Rules
//! - Keys are `tasks/<uuid>`; listing filters on that prefix.
//! - `list` pages in lexicographic key order; the page token is the last
//!   key of the previous page and must exist in the current key set.
//! - Page size is clamped to `[1, 1000]`.
//! - Re-writing an identical record at the current revision is a no-op
//!   success, which makes terminal CAS writes idempotent.

use std::sync::Arc;

use chrono::Utc;

use crate::broker::{BrokerError, KvBucket};
use crate::domain::Task;
use crate::error::Error;
use crate::names::TaskName;

const TASK_KEY_PREFIX: &str = "tasks/";

const MIN_PAGE_SIZE: usize = 1;
const MAX_PAGE_SIZE: usize = 1000;

/// One page of records plus the token for the next page.
///
/// An empty `next_page_token` means the listing is exhausted.
#[derive(Debug, Clone, Default)]
pub struct TaskPage {
    pub tasks: Vec<Task>,
    pub next_page_token: String,
}

/// Durable, versioned store of task records.
#[derive(Clone)]
pub struct TaskStore {
    kv: Arc<dyn KvBucket>,
}

impl TaskStore {
    pub fn new(kv: Arc<dyn KvBucket>) -> Self {
        Self { kv }
    }

    /// Atomically creates the record under `tasks/<id>`.
    pub async fn create(&self, task: &Task) -> Result<u64, Error> {
        let bytes = encode(task)?;
        let revision = self.kv.create(task.name.as_str(), &bytes).await?;
        Ok(revision)
    }

    /// Returns the record and its current revision.
    pub async fn get(&self, name: &TaskName) -> Result<(Task, u64), Error> {
        let entry = self.kv.get(name.as_str()).await?;
        let task = decode(&entry.value)?;
        Ok((task, entry.revision))
    }

    /// CAS write: succeeds only while the record still holds
    /// `expected_revision`.
    ///
    /// Writing bytes identical to the current value at the current revision
    /// returns the same revision without a write.
    pub async fn update(&self, task: &Task, expected_revision: u64) -> Result<u64, Error> {
        let bytes = encode(task)?;
        if let Ok(entry) = self.kv.get(task.name.as_str()).await {
            if entry.revision == expected_revision && entry.value == bytes {
                return Ok(expected_revision);
            }
        }
        let revision = self
            .kv
            .update(task.name.as_str(), &bytes, expected_revision)
            .await?;
        Ok(revision)
    }

    /// Tombstones the record. No revision guard.
    pub async fn delete(&self, name: &TaskName) -> Result<(), Error> {
        self.kv.delete(name.as_str()).await?;
        Ok(())
    }

    /// Lists records in lexicographic key order.
    pub async fn list(&self, page_size: usize, page_token: &str) -> Result<TaskPage, Error> {
        let page_size = page_size.clamp(MIN_PAGE_SIZE, MAX_PAGE_SIZE);

        let keys: Vec<String> = self
            .kv
            .keys()
            .await?
            .into_iter()
            .filter(|k| k.starts_with(TASK_KEY_PREFIX))
            .collect();

        let start = if page_token.is_empty() {
            0
        } else {
            match keys.iter().position(|k| k == page_token) {
                Some(i) => i + 1,
                None => return Err(Error::invalid_argument("invalid page token")),
            }
        };

        if start >= keys.len() {
            return Ok(TaskPage::default());
        }

        let end = (start + page_size).min(keys.len());
        let page_keys = &keys[start..end];

        let mut tasks = Vec::with_capacity(page_keys.len());
        for key in page_keys {
            match self.kv.get(key).await {
                Ok(entry) => tasks.push(decode(&entry.value)?),
                // Deleted between the key listing and the read.
                Err(BrokerError::KeyNotFound { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        let next_page_token = if end < keys.len() {
            page_keys.last().cloned().unwrap_or_default()
        } else {
            String::new()
        };

        Ok(TaskPage {
            tasks,
            next_page_token,
        })
    }

    /// Cancels a `pending` or `processing` record via CAS.
    ///
    /// A lost CAS race surfaces as [`Error::CannotCancel`]: whoever moved
    /// the record owns its outcome now.
    pub async fn cancel(&self, name: &TaskName) -> Result<Task, Error> {
        let (mut task, revision) = self.get(name).await?;
        task.cancel(Utc::now())?;

        match self.update(&task, revision).await {
            Ok(_) => Ok(task),
            Err(Error::Conflict { .. }) => Err(Error::CannotCancel),
            Err(e) => Err(e),
        }
    }
}

fn encode(task: &Task) -> Result<Vec<u8>, Error> {
    serde_json::to_vec(task).map_err(|e| Error::internal(format!("encode task record: {e}")))
}

fn decode(bytes: &[u8]) -> Result<Task, Error> {
    serde_json::from_slice(bytes).map_err(|e| Error::internal(format!("decode task record: {e}")))
}
