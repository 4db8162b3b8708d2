//! # Task record: state machine and byte format.
//!
//! A [`Task`] is the durable record of one asynchronous invocation. The
//! record lives in a versioned key-value bucket; every mutation goes through
//! compare-and-swap, so this module only has to keep single-record
//! transitions honest:
//!
//! ```text
//!       create                 start exec             success
//! pending ──────────────────────────► processing ──────────► succeeded
//!    │                                    │
//!    │ cancel                             │ error        │ cancel
//!    ▼                                    ▼              ▼
//! canceled                             failed         canceled
//! ```
//!
//! ## Rules
//! - Terminal states (`succeeded`, `failed`, `canceled`) are sticky.
//! - A result is present **iff** the state is `succeeded` or `failed`;
//!   `canceled` carries no result.
//! - Timestamps are monotonic within one record:
//!   `created_at <= started_at <= ended_at`.
//! - State is encoded as its integer ordinal; the result is a tagged union
//!   with a `type` discriminator. Unknown fields are preserved.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;
use crate::names::{FunctionName, TaskName};

/// Lifecycle state of a task, ordinal-encoded on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum TaskState {
    Unspecified = 0,
    Pending = 1,
    Processing = 2,
    Succeeded = 3,
    Failed = 4,
    Canceled = 5,
}

impl TaskState {
    /// Returns `true` if the state is terminal (sticky, never left).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Canceled
        )
    }

    /// Returns `true` while the task can still be canceled.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskState::Pending | TaskState::Processing)
    }
}

impl From<TaskState> for u8 {
    fn from(s: TaskState) -> u8 {
        s as u8
    }
}

impl TryFrom<u8> for TaskState {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self, Error> {
        match v {
            0 => Ok(TaskState::Unspecified),
            1 => Ok(TaskState::Pending),
            2 => Ok(TaskState::Processing),
            3 => Ok(TaskState::Succeeded),
            4 => Ok(TaskState::Failed),
            5 => Ok(TaskState::Canceled),
            _ => Err(Error::invalid_argument(format!("unknown task state: {v}"))),
        }
    }
}

/// Terminal outcome of a task, tagged by `type` on the wire.
///
/// Constructed through [`TaskResult::inline`], [`TaskResult::object_key`],
/// or [`TaskResult::error`]; the constructors reject empty values so an
/// invalid result is unrepresentable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TaskResult {
    /// Small results carried inline in the record.
    #[serde(rename = "inline_result")]
    Inline { inline_result: Vec<u8> },
    /// Large results stored out of band; the record keeps the object key.
    #[serde(rename = "object_key")]
    ObjectKey { object_key: String },
    /// Failure outcome with a human-readable message.
    #[serde(rename = "error")]
    Error { error_message: String },
}

impl TaskResult {
    /// Builds an inline result; the payload must be non-empty.
    pub fn inline(bytes: impl Into<Vec<u8>>) -> Result<Self, Error> {
        let inline_result = bytes.into();
        if inline_result.is_empty() {
            return Err(Error::InvalidResult {
                reason: "inline_result is empty".into(),
            });
        }
        Ok(TaskResult::Inline { inline_result })
    }

    /// Builds an object-key result; the key must be non-empty.
    pub fn object_key(key: impl Into<String>) -> Result<Self, Error> {
        let object_key = key.into();
        if object_key.is_empty() {
            return Err(Error::InvalidResult {
                reason: "object_key is empty".into(),
            });
        }
        Ok(TaskResult::ObjectKey { object_key })
    }

    /// Builds an error result; the message must be non-empty.
    pub fn error(message: impl Into<String>) -> Result<Self, Error> {
        let error_message = message.into();
        if error_message.is_empty() {
            return Err(Error::InvalidResult {
                reason: "error_message is empty".into(),
            });
        }
        Ok(TaskResult::Error { error_message })
    }

    /// Returns `true` for the failure variant.
    pub fn is_error(&self) -> bool {
        matches!(self, TaskResult::Error { .. })
    }
}

/// Durable record of one asynchronous invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub name: TaskName,
    pub function: FunctionName,
    /// Opaque input, conventionally JSON. The agent never interprets it;
    /// the runner does.
    pub parameters: String,
    pub state: TaskState,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    /// Fields written by newer schema versions, preserved verbatim.
    /// An empty map flattens to nothing.
    #[serde(flatten)]
    pub unknown: BTreeMap<String, serde_json::Value>,
}

impl Task {
    /// Creates a fresh `pending` record for `function`.
    pub fn new(function: FunctionName, parameters: impl Into<String>) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            name: TaskName::from_id(id),
            function,
            parameters: parameters.into(),
            state: TaskState::Pending,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            result: None,
            unknown: BTreeMap::new(),
        }
    }

    /// Transitions `pending -> processing`, stamping `started_at`.
    pub fn start(&mut self, at: DateTime<Utc>) -> Result<(), Error> {
        if self.state != TaskState::Pending {
            return Err(Error::NotPending);
        }
        self.state = TaskState::Processing;
        self.started_at = Some(at);
        Ok(())
    }

    /// Transitions `processing -> succeeded` with a non-error result.
    pub fn succeed(&mut self, result: TaskResult, at: DateTime<Utc>) -> Result<(), Error> {
        if self.state != TaskState::Processing {
            return Err(Error::NotProcessing);
        }
        if self.result.is_some() {
            return Err(Error::ResultAlreadySet);
        }
        if result.is_error() {
            return Err(Error::InvalidResult {
                reason: "succeeded task cannot carry an error result".into(),
            });
        }
        self.state = TaskState::Succeeded;
        self.result = Some(result);
        self.ended_at = Some(at);
        Ok(())
    }

    /// Transitions `processing -> failed` with an error message.
    pub fn fail(&mut self, message: impl Into<String>, at: DateTime<Utc>) -> Result<(), Error> {
        if self.state != TaskState::Processing {
            return Err(Error::NotProcessing);
        }
        if self.result.is_some() {
            return Err(Error::ResultAlreadySet);
        }
        self.state = TaskState::Failed;
        self.result = Some(TaskResult::error(message)?);
        self.ended_at = Some(at);
        Ok(())
    }

    /// Transitions `pending|processing -> canceled`. Carries no result.
    pub fn cancel(&mut self, at: DateTime<Utc>) -> Result<(), Error> {
        match self.state {
            TaskState::Pending | TaskState::Processing => {}
            TaskState::Succeeded | TaskState::Failed | TaskState::Canceled => {
                return Err(Error::AlreadyCompleted);
            }
            TaskState::Unspecified => return Err(Error::InvalidState),
        }
        self.state = TaskState::Canceled;
        self.result = None;
        self.ended_at = Some(at);
        Ok(())
    }
}
