//! Commit status endpoint

use crate::GitHubClient;
use crate::error::Result;
use kiln_core::domain::status::CommitStatus;
use serde::Serialize;

/// Context shown next to the status on GitHub
pub const STATUS_CONTEXT: &str = "kiln";

/// GitHub rejects longer descriptions
const MAX_DESCRIPTION_CHARS: usize = 140;

#[derive(Debug, Serialize)]
struct StatusRequest<'a> {
    state: &'a str,
    target_url: &'a str,
    description: String,
    context: &'a str,
}

impl GitHubClient {
    /// Create a commit status
    ///
    /// # Arguments
    /// * `repo` - Repository full name ("owner/name")
    /// * `sha` - Commit the status is attached to
    /// * `status` - One of the four GitHub states
    /// * `target_url` - Link shown with the status
    /// * `description` - Short human-readable summary
    pub async fn create_status(
        &self,
        repo: &str,
        sha: &str,
        status: CommitStatus,
        target_url: &str,
        description: &str,
    ) -> Result<()> {
        let url = format!("{}/repos/{}/statuses/{}", self.base_url, repo, sha);
        let body = StatusRequest {
            state: status.as_str(),
            target_url,
            description: description.chars().take(MAX_DESCRIPTION_CHARS).collect(),
            context: STATUS_CONTEXT,
        };

        let response = self.authorized(self.client.post(&url)).json(&body).send().await?;
        self.handle_empty_response(response).await
    }
}
