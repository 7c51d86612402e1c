//! Source host port
//!
//! The source host (GitHub or a test double) is an external collaborator.
//! The runner uses it to:
//! - Look up the content of tracked paths at a commit
//! - Report commit statuses
//! - Install and revoke the throwaway deploy key a job clones with

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::status::CommitStatus;

/// Content of a remote path at a given commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteContent {
    /// A regular file identified by its content hash
    File { sha: String },
    /// A directory and its immediate entries
    Dir(Vec<DirEntry>),
}

/// Immediate entry of a remote directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Repository-relative path of the entry
    pub path: String,
    pub kind: EntryKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    File { sha: String },
    Dir,
}

/// Errors reported by a source host
#[derive(Debug, Error)]
pub enum SourceHostError {
    /// The request never got a response
    #[error("request to source host failed: {0}")]
    Request(String),

    /// The host answered with an error status
    #[error("source host error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// The response could not be understood
    #[error("failed to parse source host response: {0}")]
    Parse(String),
}

/// Operations Kiln needs from the host of a project's repository
///
/// `repo` is the project's full name on the host, e.g. "owner/repo".
#[async_trait]
pub trait SourceHost: Send + Sync {
    /// Looks up a path at a commit
    ///
    /// # Returns
    /// `None` if nothing exists at that path
    async fn get_content(
        &self,
        repo: &str,
        path: &str,
        git_ref: &str,
    ) -> Result<Option<RemoteContent>, SourceHostError>;

    /// Sets the status shown next to a commit
    async fn set_commit_status(
        &self,
        repo: &str,
        sha: &str,
        status: CommitStatus,
        target_url: &str,
        description: &str,
    ) -> Result<(), SourceHostError>;

    /// Installs a read-only deploy key
    ///
    /// # Returns
    /// The host's id for the key, used to remove it again
    async fn add_deploy_key(
        &self,
        repo: &str,
        title: &str,
        public_key: &str,
    ) -> Result<i64, SourceHostError>;

    /// Removes a deploy key installed with `add_deploy_key`
    async fn remove_deploy_key(&self, repo: &str, key_id: i64) -> Result<(), SourceHostError>;
}
