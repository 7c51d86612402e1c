//! Build numbering and creation

use std::sync::Arc;

use anyhow::{Context, Result};
use kiln_core::domain::build::Build;
use kiln_core::dto::build::NewBuild;
use kiln_store::Store;
use tracing::{debug, info};

/// Hands out per-project build numbers
///
/// Numbers start at 1 and come from an atomic increment of the project's
/// counter, so concurrent allocations never collide.
pub struct BuildNumberAllocator {
    store: Arc<dyn Store>,
}

impl BuildNumberAllocator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn next(&self, project_id: i64) -> Result<i64> {
        self.store
            .next_build_number(project_id)
            .await
            .with_context(|| format!("Failed to allocate build number for project {}", project_id))
    }
}

/// Creates builds for triggered commits
///
/// A commit is built once per project. Its number comes from the same
/// project counter `BuildNumberAllocator` draws from, bumped in the same
/// atomic step that inserts the build.
pub struct BuildService {
    store: Arc<dyn Store>,
}

impl BuildService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Returns the build of a commit, creating and numbering it if needed
    ///
    /// Safe to call concurrently for the same commit: every caller gets the
    /// same build and only one number is used.
    pub async fn create_build(&self, req: NewBuild) -> Result<Build> {
        let project_id = req.project_id;
        let (build, created) = self
            .store
            .find_or_create_build(req)
            .await
            .with_context(|| format!("Failed to create build for project {}", project_id))?;

        if created {
            info!(
                build_id = build.id,
                project_id = build.project_id,
                "Created build #{} for {}",
                build.number,
                build.commit_sha
            );
        } else {
            debug!(build_id = build.id, sha = %build.commit_sha, "Commit already has a build");
        }
        Ok(build)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_store::MemoryStore;

    fn new_build(project_id: i64, sha: &str) -> NewBuild {
        NewBuild {
            project_id,
            commit_sha: sha.to_string(),
            commit_ref: "master".to_string(),
            commit_author: "jdoe".to_string(),
            commit_message: "Fix the widget".to_string(),
        }
    }

    #[tokio::test]
    async fn test_numbers_start_at_one_per_project() {
        let store = Arc::new(MemoryStore::new());
        let owner = store.add_user("jdoe", "J. Doe", None);
        let a = store.add_project(owner.id, "acme/a", "git@github.com:acme/a.git");
        let b = store.add_project(owner.id, "acme/b", "git@github.com:acme/b.git");
        let allocator = BuildNumberAllocator::new(store);

        assert_eq!(allocator.next(a.id).await.unwrap(), 1);
        assert_eq!(allocator.next(a.id).await.unwrap(), 2);
        assert_eq!(allocator.next(b.id).await.unwrap(), 1);
        assert_eq!(allocator.next(a.id).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_unknown_project_is_an_error() {
        let allocator = BuildNumberAllocator::new(Arc::new(MemoryStore::new()));
        assert!(allocator.next(42).await.is_err());
    }

    #[tokio::test]
    async fn test_create_build_reuses_commit() {
        let store = Arc::new(MemoryStore::new());
        let owner = store.add_user("jdoe", "J. Doe", None);
        let project = store.add_project(owner.id, "acme/a", "git@github.com:acme/a.git");
        let service = BuildService::new(store);

        let first = service.create_build(new_build(project.id, "aaa")).await.unwrap();
        let again = service.create_build(new_build(project.id, "aaa")).await.unwrap();
        let second = service.create_build(new_build(project.id, "bbb")).await.unwrap();

        assert_eq!(first.id, again.id);
        assert_eq!(first.number, 1);
        assert_eq!(second.number, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_triggers_for_one_commit() {
        let store = Arc::new(MemoryStore::new());
        let owner = store.add_user("jdoe", "J. Doe", None);
        let project = store.add_project(owner.id, "acme/a", "git@github.com:acme/a.git");
        let service = Arc::new(BuildService::new(store.clone()));
        let project_id = project.id;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let service = service.clone();
                tokio::spawn(async move { service.create_build(new_build(project_id, "aaa")).await })
            })
            .collect();

        let mut ids = std::collections::BTreeSet::new();
        for handle in handles {
            let build = handle.await.unwrap().unwrap();
            assert_eq!(build.number, 1);
            ids.insert(build.id);
        }
        assert_eq!(ids.len(), 1);

        let next = service.create_build(new_build(project.id, "bbb")).await.unwrap();
        assert_eq!(next.number, 2);
    }

    #[tokio::test]
    async fn test_create_build_for_unknown_project() {
        let service = BuildService::new(Arc::new(MemoryStore::new()));
        assert!(service.create_build(new_build(42, "aaa")).await.is_err());
    }
}
