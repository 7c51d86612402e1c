//! Repository contents endpoint

use crate::GitHubClient;
use crate::error::{GitHubError, Result};
use kiln_core::source::{DirEntry, EntryKind, RemoteContent};
use serde::Deserialize;

/// One item of a contents response
#[derive(Debug, Deserialize)]
struct ContentItem {
    #[serde(rename = "type")]
    kind: String,
    path: String,
    sha: String,
}

/// A file answers with an object, a directory with an array of its entries
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ContentResponse {
    Dir(Vec<ContentItem>),
    Single(ContentItem),
}

impl GitHubClient {
    /// Look up a path at a given ref
    ///
    /// # Arguments
    /// * `repo` - Repository full name ("owner/name")
    /// * `path` - Repository-relative path; empty for the root
    /// * `git_ref` - Commit sha, branch or tag
    ///
    /// # Returns
    /// `None` when GitHub reports the path as missing
    pub async fn get_contents(
        &self,
        repo: &str,
        path: &str,
        git_ref: &str,
    ) -> Result<Option<RemoteContent>> {
        let url = format!(
            "{}/repos/{}/contents/{}",
            self.base_url,
            repo,
            path.trim_start_matches('/')
        );
        let request = self.client.get(&url).query(&[("ref", git_ref)]);
        let response = self.authorized(request).send().await?;

        let body: ContentResponse = match self.handle_response(response).await {
            Ok(body) => body,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };

        match body {
            ContentResponse::Dir(items) => {
                let entries = items.into_iter().map(dir_entry).collect();
                Ok(Some(RemoteContent::Dir(entries)))
            }
            ContentResponse::Single(item) if item.kind == "dir" => Err(GitHubError::Parse(
                format!("directory {} returned as a single item", item.path),
            )),
            ContentResponse::Single(item) => Ok(Some(RemoteContent::File { sha: item.sha })),
        }
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Symlinks and submodules are leaves identified by their sha, like files
fn dir_entry(item: ContentItem) -> DirEntry {
    let kind = if item.kind == "dir" {
        EntryKind::Dir
    } else {
        EntryKind::File { sha: item.sha }
    };

    DirEntry {
        path: item.path,
        kind,
    }
}
