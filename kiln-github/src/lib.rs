//! Kiln GitHub Client
//!
//! A small client for the parts of the GitHub REST API a build worker
//! touches: repository contents, commit statuses and deploy keys.
//!
//! `GitHubClient` implements `kiln_core::source::SourceHost`, so the runner
//! only ever sees the trait.
//!
//! # Example
//!
//! ```no_run
//! use kiln_github::GitHubClient;
//!
//! # async fn example() -> kiln_github::Result<()> {
//! let client = GitHubClient::new("https://api.github.com", "ghp_token");
//! let content = client.get_contents("octo/repo", "Cargo.toml", "master").await?;
//! println!("{:?}", content);
//! # Ok(())
//! # }
//! ```

pub mod error;
mod contents;
mod keys;
mod source_host;
mod statuses;

pub use error::{GitHubError, Result};

use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;

pub const DEFAULT_API_URL: &str = "https://api.github.com";

const USER_AGENT: &str = concat!("kiln/", env!("CARGO_PKG_VERSION"));

/// HTTP client for the GitHub REST API
#[derive(Debug, Clone)]
pub struct GitHubClient {
    /// Base URL of the API (e.g., "https://api.github.com")
    base_url: String,
    /// Token sent as a bearer credential
    token: String,
    /// HTTP client instance
    client: Client,
}

impl GitHubClient {
    /// Create a new GitHub client
    ///
    /// # Arguments
    /// * `base_url` - The API root, `DEFAULT_API_URL` for github.com
    /// * `token` - An access token with `repo` scope
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self::with_client(base_url, token, Client::new())
    }

    /// Create a new GitHub client with a custom HTTP client
    ///
    /// This allows you to configure timeouts, proxies, TLS settings, etc.
    pub fn with_client(base_url: impl Into<String>, token: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.into(),
            client,
        }
    }

    /// Get the base URL of the API
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Attach the headers every GitHub request carries
    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .bearer_auth(&self.token)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    // =============================================================================
    // Response Handlers
    // =============================================================================

    /// Handle an API response and deserialize JSON
    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(GitHubError::api_error(status.as_u16(), error_text));
        }

        response
            .json()
            .await
            .map_err(|e| GitHubError::Parse(format!("Failed to parse JSON response: {}", e)))
    }

    /// Handle an API response that returns no content (e.g., DELETE operations)
    async fn handle_empty_response(&self, response: reqwest::Response) -> Result<()> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(GitHubError::api_error(status.as_u16(), error_text));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_trims_trailing_slash() {
        let client = GitHubClient::new("https://api.github.com/", "t");
        assert_eq!(client.base_url(), "https://api.github.com");
    }

    #[test]
    fn test_client_with_custom_client() {
        let client = GitHubClient::with_client(DEFAULT_API_URL, "t", Client::new());
        assert_eq!(client.base_url(), DEFAULT_API_URL);
    }
}
