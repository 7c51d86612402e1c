//! Deploy key endpoints

use crate::GitHubClient;
use crate::error::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
struct CreateKeyRequest<'a> {
    title: &'a str,
    key: &'a str,
    read_only: bool,
}

#[derive(Debug, Deserialize)]
struct DeployKey {
    id: i64,
}

impl GitHubClient {
    /// Install a read-only deploy key on a repository
    ///
    /// # Returns
    /// The key's id
    pub async fn create_deploy_key(&self, repo: &str, title: &str, public_key: &str) -> Result<i64> {
        let url = format!("{}/repos/{}/keys", self.base_url, repo);
        let body = CreateKeyRequest {
            title,
            key: public_key.trim(),
            read_only: true,
        };

        let response = self.authorized(self.client.post(&url)).json(&body).send().await?;
        let key: DeployKey = self.handle_response(response).await?;
        Ok(key.id)
    }

    /// Delete a deploy key
    pub async fn delete_deploy_key(&self, repo: &str, key_id: i64) -> Result<()> {
        let url = format!("{}/repos/{}/keys/{}", self.base_url, repo, key_id);
        let response = self.authorized(self.client.delete(&url)).send().await?;

        self.handle_empty_response(response).await
    }
}
