//! Job DTOs

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Request to create a running job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub build_id: i64,
    pub hook_call_id: i64,
    pub task_id: Uuid,
}

/// Final state written when a job finishes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishJob {
    pub exit_code: i32,
    pub output: String,
    pub cache_id: Option<String>,
}
