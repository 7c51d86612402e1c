//! Commit status reconciliation
//!
//! A build's status on the source host changes only through `report`. Each
//! distinct (status, description) pair is sent once; repeating the last
//! reported pair does nothing.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use kiln_core::domain::build::Build;
use kiln_core::domain::project::Project;
use kiln_core::domain::status::CommitStatus;
use kiln_core::source::SourceHost;
use kiln_store::Store;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::service::notifier::{Notification, Notifier};

pub struct StatusReconciler {
    store: Arc<dyn Store>,
    source: Arc<dyn SourceHost>,
    notifier: Arc<dyn Notifier>,
    public_url: String,
    // Compare-then-send must not interleave
    reporting: Mutex<()>,
}

impl StatusReconciler {
    /// # Arguments
    /// * `public_url` - Base URL build links in statuses and mail point to
    pub fn new(
        store: Arc<dyn Store>,
        source: Arc<dyn SourceHost>,
        notifier: Arc<dyn Notifier>,
        public_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            source,
            notifier,
            public_url: public_url.into(),
            reporting: Mutex::new(()),
        }
    }

    /// Reports a build's status unless it is already the last one reported
    ///
    /// The source host is updated first; the pair is recorded on the build
    /// only after that succeeds, so a failed call is attempted again by the
    /// next report. Members with a contact address are then notified;
    /// notification failures are logged.
    ///
    /// # Returns
    /// `false` if the pair matched the last reported one and nothing was sent
    pub async fn report(
        &self,
        build_id: i64,
        status: CommitStatus,
        description: &str,
    ) -> Result<bool> {
        let _guard = self.reporting.lock().await;

        let build = self
            .store
            .get_build(build_id)
            .await
            .context("Failed to load build")?
            .ok_or_else(|| anyhow!("Build {} not found", build_id))?;

        if build.last_reported() == Some((status, description)) {
            debug!(build_id, %status, "Status unchanged, not reporting");
            return Ok(false);
        }

        let project = self
            .store
            .get_project(build.project_id)
            .await
            .context("Failed to load project")?
            .ok_or_else(|| anyhow!("Project {} not found", build.project_id))?;

        let target_url = build.url(&self.public_url);
        self.source
            .set_commit_status(
                &project.full_name,
                &build.commit_sha,
                status,
                &target_url,
                description,
            )
            .await
            .with_context(|| format!("Failed to set status of {}", build.commit_sha))?;

        self.store
            .set_build_status(build_id, status, description)
            .await
            .context("Failed to record build status")?;

        info!(build_id, %status, "Reported status: {}", description);

        self.notify(&project, &build, status, &target_url).await;
        Ok(true)
    }

    async fn notify(&self, project: &Project, build: &Build, status: CommitStatus, target_url: &str) {
        let members = match self.store.list_members(project.id).await {
            Ok(members) => members,
            Err(e) => {
                warn!(project_id = project.id, "Failed to list members to notify: {}", e);
                return;
            }
        };

        let recipients: BTreeSet<String> = members
            .iter()
            .filter_map(|user| user.contact_address())
            .map(str::to_string)
            .collect();
        if recipients.is_empty() {
            debug!(project_id = project.id, "No members to notify");
            return;
        }

        let notification = Notification {
            recipients: recipients.into_iter().collect(),
            subject: format!(
                "[{}] Build #{} {} ({})",
                project.full_name, build.number, status, build.commit_ref
            ),
            body: format!(
                "Build #{} of {} is now {}.\n\nCommit: {}\nRef: {}\nAuthor: {}\n\n{}\n\n{}\n",
                build.number,
                project.full_name,
                status,
                build.commit_sha,
                build.commit_ref,
                build.commit_author,
                build.commit_message,
                target_url
            ),
        };

        if let Err(e) = self.notifier.send(&notification).await {
            warn!(build_id = build.id, "Failed to send notification: {:#}", e);
        }
    }
}
