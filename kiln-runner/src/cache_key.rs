//! Environment cache fingerprints
//!
//! A fingerprint identifies a prepared build environment: the image, the
//! install script and the content of every tracked remote path. Two jobs
//! with the same fingerprint can share a cached environment.

use std::collections::BTreeSet;
use std::sync::Arc;

use kiln_core::domain::hook::normalize_path;
use kiln_core::source::{EntryKind, RemoteContent, SourceHost, SourceHostError};
use sha2::{Digest, Sha256};
use tracing::debug;

const TAG_ABSENT: u8 = 0x00;
const TAG_FILE: u8 = 0x01;
const TAG_DIR: u8 = 0x02;

/// Derives fingerprints by querying a source host
pub struct CacheKeyComputer {
    source: Arc<dyn SourceHost>,
}

impl CacheKeyComputer {
    pub fn new(source: Arc<dyn SourceHost>) -> Self {
        Self { source }
    }

    /// Computes the fingerprint of an environment at a commit
    ///
    /// Paths are normalized and queried in ascending order; directories
    /// expand to their entries, and subdirectories are queried in turn, still
    /// in ascending order. A path that does not exist contributes a marker
    /// instead of failing.
    ///
    /// # Arguments
    /// * `repo` - Repository on the source host
    /// * `git_ref` - Commit the paths are resolved at
    /// * `image` - Base image of the environment
    /// * `install_script` - Install script text; empty if there is none
    /// * `tracked` - Declared tracked paths
    ///
    /// # Returns
    /// 64 lowercase hex characters
    pub async fn compute(
        &self,
        repo: &str,
        git_ref: &str,
        image: &str,
        install_script: &str,
        tracked: &BTreeSet<String>,
    ) -> Result<String, SourceHostError> {
        let mut hasher = Sha256::new();
        feed(&mut hasher, image.as_bytes());
        feed(&mut hasher, install_script.as_bytes());

        let mut pending: BTreeSet<String> = tracked.iter().map(|p| normalize_path(p)).collect();
        let mut queried = BTreeSet::new();

        // Entries discovered below a path always sort after it, so popping the
        // smallest pending path keeps queries in ascending order
        while let Some(path) = pending.pop_first() {
            if !queried.insert(path.clone()) {
                continue;
            }

            feed(&mut hasher, path.as_bytes());
            match self.source.get_content(repo, &path, git_ref).await? {
                None => {
                    debug!(path = %path, "Tracked path does not exist");
                    hasher.update([TAG_ABSENT]);
                }
                Some(RemoteContent::File { sha }) => {
                    hasher.update([TAG_FILE]);
                    feed(&mut hasher, sha.as_bytes());
                }
                Some(RemoteContent::Dir(mut entries)) => {
                    hasher.update([TAG_DIR]);
                    entries.sort_by(|a, b| a.path.cmp(&b.path));
                    hasher.update((entries.len() as u64).to_be_bytes());

                    for entry in entries {
                        let entry_path = normalize_path(&entry.path);
                        feed(&mut hasher, entry_path.as_bytes());
                        match entry.kind {
                            EntryKind::File { sha } => {
                                hasher.update([TAG_FILE]);
                                feed(&mut hasher, sha.as_bytes());
                            }
                            EntryKind::Dir => {
                                hasher.update([TAG_DIR]);
                                pending.insert(entry_path);
                            }
                        }
                    }
                }
            }
        }

        Ok(hex::encode(hasher.finalize()))
    }
}

/// Feeds a length-prefixed component
fn feed(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}
