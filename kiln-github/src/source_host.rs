//! `SourceHost` implementation for GitHub

use async_trait::async_trait;
use kiln_core::domain::status::CommitStatus;
use kiln_core::source::{RemoteContent, SourceHost, SourceHostError};

use crate::GitHubClient;

#[async_trait]
impl SourceHost for GitHubClient {
    async fn get_content(
        &self,
        repo: &str,
        path: &str,
        git_ref: &str,
    ) -> Result<Option<RemoteContent>, SourceHostError> {
        Ok(self.get_contents(repo, path, git_ref).await?)
    }

    async fn set_commit_status(
        &self,
        repo: &str,
        sha: &str,
        status: CommitStatus,
        target_url: &str,
        description: &str,
    ) -> Result<(), SourceHostError> {
        self.create_status(repo, sha, status, target_url, description)
            .await?;
        tracing::debug!(repo, sha, %status, "Commit status reported");
        Ok(())
    }

    async fn add_deploy_key(
        &self,
        repo: &str,
        title: &str,
        public_key: &str,
    ) -> Result<i64, SourceHostError> {
        Ok(self.create_deploy_key(repo, title, public_key).await?)
    }

    async fn remove_deploy_key(&self, repo: &str, key_id: i64) -> Result<(), SourceHostError> {
        Ok(self.delete_deploy_key(repo, key_id).await?)
    }
}
