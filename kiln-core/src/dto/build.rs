//! Build DTOs

use serde::{Deserialize, Serialize};

/// Request to record a new build
///
/// The build number is not part of the request; it is allocated from the
/// project's counter when the build is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewBuild {
    pub project_id: i64,
    pub commit_sha: String,
    pub commit_ref: String,
    pub commit_author: String,
    pub commit_message: String,
}
