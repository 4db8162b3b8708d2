//! # Resource-name grammar and validators.
//!
//! Two resource kinds exist on the wire:
//! - `tasks/<uuid>` a single asynchronous invocation ([`TaskName`]);
//! - `functions/<slug>` a logical unit of executable code ([`FunctionName`]).
//!
//! ## Rules
//! - Parsing rejects strings that do not start with the **exact** prefix.
//! - Prefix-only and empty remainders are rejected.
//! - The task id must parse as an RFC-4122 UUID (any canonical encoding).
//! - The function slug is a non-empty opaque string; the agent never
//!   inspects it beyond routing.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

const TASK_PREFIX: &str = "tasks/";
const FUNCTION_PREFIX: &str = "functions/";

/// Validated `tasks/<uuid>` resource name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskName(String);

impl TaskName {
    /// Parses and validates a task name.
    pub fn parse(s: &str) -> Result<Self, Error> {
        let id = s
            .strip_prefix(TASK_PREFIX)
            .filter(|rest| !rest.is_empty())
            .ok_or_else(|| Error::invalid_argument(format!("invalid task name: {s:?}")))?;
        Uuid::parse_str(id)
            .map_err(|_| Error::invalid_argument(format!("invalid task id: {id:?}")))?;
        Ok(Self(s.to_string()))
    }

    /// Builds the canonical name for a task id.
    pub fn from_id(id: Uuid) -> Self {
        Self(format!("{TASK_PREFIX}{id}"))
    }

    /// Returns the embedded task id.
    pub fn id(&self) -> Uuid {
        // Validated at construction.
        Uuid::parse_str(&self.0[TASK_PREFIX.len()..]).unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TaskName {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Error> {
        TaskName::parse(&s)
    }
}

impl From<TaskName> for String {
    fn from(n: TaskName) -> String {
        n.0
    }
}

/// Validated `functions/<slug>` resource name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FunctionName(String);

impl FunctionName {
    /// Parses and validates a function name.
    pub fn parse(s: &str) -> Result<Self, Error> {
        s.strip_prefix(FUNCTION_PREFIX)
            .filter(|slug| !slug.is_empty())
            .ok_or_else(|| Error::invalid_argument(format!("invalid function name: {s:?}")))?;
        Ok(Self(s.to_string()))
    }

    /// Returns the opaque slug without the `functions/` prefix.
    pub fn slug(&self) -> &str {
        &self.0[FUNCTION_PREFIX.len()..]
    }

    /// Returns the broker subject of this function's task queue.
    ///
    /// Hints carry the bare function name; consumers derive the queue
    /// subject with this method so producers stay ignorant of the subject
    /// namespace.
    pub fn queue_subject(&self) -> String {
        format!("task.{}", self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FunctionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for FunctionName {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Error> {
        FunctionName::parse(&s)
    }
}

impl From<FunctionName> for String {
    fn from(n: FunctionName) -> String {
        n.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_name_roundtrip() {
        let id = Uuid::new_v4();
        let name = TaskName::from_id(id);
        assert_eq!(name.id(), id);
        assert_eq!(name.as_str(), format!("tasks/{id}"));
        assert_eq!(TaskName::parse(name.as_str()).unwrap(), name);
    }

    #[test]
    fn task_name_rejects_garbage() {
        for bad in ["", "tasks/", "tasks", "task/abc", "tasks/not-a-uuid"] {
            assert!(TaskName::parse(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn function_name_accepts_opaque_slug() {
        let f = FunctionName::parse("functions/foo").unwrap();
        assert_eq!(f.slug(), "foo");
        assert_eq!(f.queue_subject(), "task.functions/foo");
    }

    #[test]
    fn function_name_rejects_prefix_only() {
        for bad in ["", "functions/", "functions", "function/foo"] {
            assert!(FunctionName::parse(bad).is_err(), "accepted {bad:?}");
        }
    }
}
