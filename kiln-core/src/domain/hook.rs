//! Hook domain types
//!
//! A hook is the build configuration attached to a project: which image to
//! run, which scripts to execute, and which remote files shape the cached
//! build environment.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::dto::payload::StoredPayload;

/// Build configuration attached to a project
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hook {
    pub id: i64,
    pub project_id: i64,
    pub title: String,
    /// Container image the build runs in
    pub image: String,
    pub build_script: String,
    /// Script that prepares the environment; its result is cached
    pub install_script: Option<String>,
    pub tracked_files: Vec<TrackedFile>,
}

impl Hook {
    /// Tracked paths, normalized, deduplicated and sorted
    pub fn normalized_tracked_paths(&self) -> BTreeSet<String> {
        self.tracked_files
            .iter()
            .map(TrackedFile::normalized_path)
            .collect()
    }
}

/// A remote path whose content affects the cache fingerprint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedFile {
    pub path: String,
}

impl TrackedFile {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    pub fn normalized_path(&self) -> String {
        normalize_path(&self.path)
    }
}

/// Collapses `.` and `..` segments of a repository-relative path
///
/// Leading slashes are ignored and `..` never climbs above the repository
/// root, so `./a/../b/../install.sh` becomes `install.sh`.
pub fn normalize_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();

    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }

    segments.join("/")
}

/// One recorded inbound trigger for a hook
///
/// `hook_id` becomes `None` once the hook is deleted; the call itself is kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookCall {
    pub id: i64,
    pub hook_id: Option<i64>,
    pub build_id: i64,
    pub created_at: DateTime<Utc>,
    pub payload: StoredPayload,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("./a/../b/../install.sh"), "install.sh");
        assert_eq!(normalize_path("./Gemfile"), "Gemfile");
        assert_eq!(normalize_path("requirements"), "requirements");
        assert_eq!(normalize_path("/requirements//dev.txt"), "requirements/dev.txt");
        assert_eq!(normalize_path("requirements/"), "requirements");
        assert_eq!(normalize_path("../../etc/passwd"), "etc/passwd");
        assert_eq!(normalize_path("."), "");
    }

    #[test]
    fn test_normalized_tracked_paths_are_sorted_and_deduplicated() {
        let hook = Hook {
            id: 1,
            project_id: 1,
            title: "tests".to_string(),
            image: "debian:stable".to_string(),
            build_script: "./run-tests.sh".to_string(),
            install_script: None,
            tracked_files: vec![
                TrackedFile::new("./a/../b/../install.sh"),
                TrackedFile::new("requirements"),
                TrackedFile::new("./Gemfile"),
                TrackedFile::new("Gemfile"),
            ],
        };

        let paths: Vec<String> = hook.normalized_tracked_paths().into_iter().collect();
        assert_eq!(paths, vec!["Gemfile", "install.sh", "requirements"]);
    }
}
