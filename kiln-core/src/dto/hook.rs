//! Hook DTOs

use serde::{Deserialize, Serialize};

use crate::domain::hook::TrackedFile;
use crate::dto::payload::StoredPayload;

/// Request to create a hook
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewHook {
    pub project_id: i64,
    pub title: String,
    pub image: String,
    pub build_script: String,
    pub install_script: Option<String>,
    pub tracked_files: Vec<TrackedFile>,
}

/// Request to record an inbound trigger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewHookCall {
    pub hook_id: i64,
    pub build_id: i64,
    pub payload: StoredPayload,
}
