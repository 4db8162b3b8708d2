//! # Broker wire messages.
//!
//! Three payloads travel over the task stream:
//! - [`ExecuteTaskMessage`] / [`CancelTaskMessage`] — minimal intents on
//!   `tasks.execute` / `tasks.cancel`; consumers read the authoritative
//!   record from the store, so the payload carries only the task name.
//! - [`TaskAssignment`] — the per-function queue payload on
//!   `task.<function>`; this is what the agent's consumer decodes and hands
//!   to an instance.
//!
//! All payloads are canonical JSON. Durations serialize as integer
//! milliseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::Task;
use crate::names::{FunctionName, TaskName};

/// Intent to execute a task, published on `tasks.execute`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteTaskMessage {
    pub task_name: TaskName,
}

/// Intent to cancel a task, published on `tasks.cancel`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelTaskMessage {
    pub task_name: TaskName,
}

/// Per-function queue payload consumed by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub task_id: Uuid,
    pub function_id: FunctionName,
    #[serde(with = "duration_ms")]
    pub execution_time: Duration,
}

impl TaskAssignment {
    /// Derives the assignment for a freshly created record.
    ///
    /// The simulated runner honors an optional `execution_time_ms` field in
    /// the task's parameters JSON; real runners interpret the parameters
    /// themselves and ignore this value.
    pub fn from_task(task: &Task) -> Self {
        let execution_time = serde_json::from_str::<serde_json::Value>(&task.parameters)
            .ok()
            .and_then(|v| v.get("execution_time_ms").and_then(|n| n.as_u64()))
            .map(Duration::from_millis)
            .unwrap_or(Duration::ZERO);

        Self {
            task_id: task.id,
            function_id: task.function.clone(),
            execution_time,
        }
    }

    /// Returns the record name this assignment refers to.
    pub fn task_name(&self) -> TaskName {
        TaskName::from_id(self.task_id)
    }
}

/// Serde helper: `Duration` as integer milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (d.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assignment_roundtrip() {
        let a = TaskAssignment {
            task_id: Uuid::new_v4(),
            function_id: FunctionName::parse("functions/foo").unwrap(),
            execution_time: Duration::from_millis(250),
        };
        let json = serde_json::to_string(&a).unwrap();
        assert!(json.contains(r#""execution_time":250"#));
        let back: TaskAssignment = serde_json::from_str(&json).unwrap();
        assert_eq!(back, a);
    }

    #[test]
    fn assignment_reads_execution_time_from_parameters() {
        let function = FunctionName::parse("functions/foo").unwrap();
        let t = Task::new(function.clone(), r#"{"execution_time_ms": 40}"#);
        let a = TaskAssignment::from_task(&t);
        assert_eq!(a.execution_time, Duration::from_millis(40));
        assert_eq!(a.function_id, function);
        assert_eq!(a.task_name(), t.name);

        let t = Task::new(function, "not json");
        assert_eq!(TaskAssignment::from_task(&t).execution_time, Duration::ZERO);
    }

    #[test]
    fn intent_payload_shape() {
        let t = Task::new(FunctionName::parse("functions/foo").unwrap(), "{}");
        let msg = ExecuteTaskMessage {
            task_name: t.name.clone(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["task_name"], t.name.as_str());
    }
}
