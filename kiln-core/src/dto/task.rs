//! Task queue records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Work item a worker can dequeue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Task {
    /// Execute a fresh trigger
    Run { hook_call_id: i64 },
    /// Execute an existing job's build again
    Restart { job_id: i64 },
}

/// A task handed to a worker
///
/// `id` doubles as the correlation id recorded on the job it produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedTask {
    pub id: Uuid,
    pub task: Task,
    pub enqueued_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_serialization() {
        let json = serde_json::to_value(Task::Restart { job_id: 5 }).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "restart", "job_id": 5}));
    }
}
