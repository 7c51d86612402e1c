//! Build domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::status::CommitStatus;

/// One commit under test
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub id: i64,
    pub project_id: i64,
    pub number: i64,
    pub commit_sha: String,
    /// Branch or pull request ref the commit was pushed to
    pub commit_ref: String,
    pub commit_author: String,
    pub commit_message: String,
    pub created_at: DateTime<Utc>,
    /// Last status reported to the source host
    pub status: Option<CommitStatus>,
    pub status_description: Option<String>,
}

impl Build {
    /// The (status, description) pair last reported for this build
    pub fn last_reported(&self) -> Option<(CommitStatus, &str)> {
        self.status
            .map(|status| (status, self.status_description.as_deref().unwrap_or("")))
    }

    /// Link to this build's page
    pub fn url(&self, public_url: &str) -> String {
        format!(
            "{}/projects/{}/builds/{}",
            public_url.trim_end_matches('/'),
            self.project_id,
            self.id
        )
    }
}
