//! Error types for the GitHub client

use kiln_core::source::SourceHostError;
use thiserror::Error;

/// Result of a GitHub API call
pub type Result<T> = std::result::Result<T, GitHubError>;

/// Failures talking to the GitHub REST API
#[derive(Debug, Error)]
pub enum GitHubError {
    #[error("GitHub request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Non-success response; `message` is the response body
    #[error("GitHub returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Unexpected GitHub response: {0}")]
    Parse(String),
}

impl GitHubError {
    pub fn api_error(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Whether GitHub answered 404
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Api { status: 404, .. })
    }
}

impl From<GitHubError> for SourceHostError {
    fn from(err: GitHubError) -> Self {
        match err {
            GitHubError::Request(e) => SourceHostError::Request(e.to_string()),
            GitHubError::Api { status, message } => SourceHostError::Api { status, message },
            GitHubError::Parse(msg) => SourceHostError::Parse(msg),
        }
    }
}
