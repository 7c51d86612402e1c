//! PostgreSQL store
//!
//! Query functions live in one module per entity and take the pool
//! explicitly. `PgStore` and `PgLogHub` wrap them behind the repository
//! traits.

pub mod build;
pub mod hook;
pub mod job;
pub mod logs;
pub mod project;
pub mod queue;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use kiln_core::domain::build::Build;
use kiln_core::domain::hook::{Hook, HookCall};
use kiln_core::domain::job::Job;
use kiln_core::domain::project::{Project, User};
use kiln_core::domain::status::CommitStatus;
use kiln_core::dto::build::NewBuild;
use kiln_core::dto::hook::{NewHook, NewHookCall};
use kiln_core::dto::job::{FinishJob, NewJob};
use kiln_core::dto::task::{QueuedTask, Task};
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use std::collections::VecDeque;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::repository::{
    BuildRepository, HookRepository, JobRepository, LogHub, LogSubscription, ProjectRepository,
    TaskQueue,
};

/// Default time after which a claimed but unacknowledged task is handed out again
const DEFAULT_TASK_LEASE: Duration = Duration::from_secs(60 * 60);

/// Store backed by a PostgreSQL pool
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    task_lease: Duration,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            task_lease: DEFAULT_TASK_LEASE,
        }
    }

    /// Overrides how long a worker may hold a task before it is re-delivered
    pub fn with_task_lease(mut self, lease: Duration) -> Self {
        self.task_lease = lease;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ProjectRepository for PgStore {
    async fn get_project(&self, id: i64) -> Result<Option<Project>> {
        Ok(project::find_by_id(&self.pool, id).await?)
    }

    async fn list_members(&self, project_id: i64) -> Result<Vec<User>> {
        Ok(project::list_members(&self.pool, project_id).await?)
    }

    async fn next_build_number(&self, project_id: i64) -> Result<i64> {
        project::next_build_number(&self.pool, project_id)
            .await?
            .ok_or_else(|| StoreError::not_found("project", project_id))
    }
}

#[async_trait]
impl BuildRepository for PgStore {
    async fn insert_build(&self, req: NewBuild, number: i64) -> Result<Build> {
        build::create(&self.pool, req, number)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(db) if db.is_unique_violation() => {
                    StoreError::Conflict(db.message().to_string())
                }
                other => other.into(),
            })
    }

    async fn find_or_create_build(&self, req: NewBuild) -> Result<(Build, bool)> {
        let project_id = req.project_id;
        build::find_or_create(&self.pool, req)
            .await?
            .ok_or_else(|| StoreError::not_found("project", project_id))
    }

    async fn get_build(&self, id: i64) -> Result<Option<Build>> {
        Ok(build::find_by_id(&self.pool, id).await?)
    }

    async fn find_build(&self, project_id: i64, commit_sha: &str) -> Result<Option<Build>> {
        Ok(build::find_by_commit(&self.pool, project_id, commit_sha).await?)
    }

    async fn set_build_status(
        &self,
        id: i64,
        status: CommitStatus,
        description: &str,
    ) -> Result<()> {
        if build::update_status(&self.pool, id, status, description).await? {
            Ok(())
        } else {
            Err(StoreError::not_found("build", id))
        }
    }
}

#[async_trait]
impl HookRepository for PgStore {
    async fn insert_hook(&self, req: NewHook) -> Result<Hook> {
        Ok(hook::create(&self.pool, req).await?)
    }

    async fn get_hook(&self, id: i64) -> Result<Option<Hook>> {
        Ok(hook::find_by_id(&self.pool, id).await?)
    }

    async fn delete_hook(&self, id: i64) -> Result<bool> {
        Ok(hook::delete(&self.pool, id).await?)
    }

    async fn insert_hook_call(&self, req: NewHookCall) -> Result<HookCall> {
        Ok(hook::create_call(&self.pool, req).await?)
    }

    async fn get_hook_call(&self, id: i64) -> Result<Option<HookCall>> {
        Ok(hook::find_call_by_id(&self.pool, id).await?)
    }
}

#[async_trait]
impl JobRepository for PgStore {
    async fn create_job(&self, req: NewJob) -> Result<Job> {
        Ok(job::create(&self.pool, req).await?)
    }

    async fn get_job(&self, id: i64) -> Result<Option<Job>> {
        Ok(job::find_by_id(&self.pool, id).await?)
    }

    async fn find_job_by_task(&self, task_id: Uuid) -> Result<Option<Job>> {
        Ok(job::find_by_task(&self.pool, task_id).await?)
    }

    async fn latest_job(&self, hook_call_id: i64) -> Result<Option<Job>> {
        Ok(job::find_latest_for_call(&self.pool, hook_call_id).await?)
    }

    async fn list_jobs(&self, build_id: i64) -> Result<Vec<Job>> {
        Ok(job::find_by_build(&self.pool, build_id).await?)
    }

    async fn finish_job(&self, id: i64, result: FinishJob) -> Result<bool> {
        Ok(job::finish(&self.pool, id, result).await?)
    }
}

#[async_trait]
impl TaskQueue for PgStore {
    async fn enqueue(&self, task: Task) -> Result<Uuid> {
        let queued = queue::enqueue(&self.pool, task).await?;
        tracing::debug!(task_id = %queued.id, ?task, "Task enqueued");
        Ok(queued.id)
    }

    async fn dequeue(&self, worker_id: &str) -> Result<Option<QueuedTask>> {
        let lease = chrono::Duration::from_std(self.task_lease)
            .map_err(|e| StoreError::Corrupt(format!("invalid task lease: {}", e)))?;
        let stale_before = chrono::Utc::now() - lease;

        Ok(queue::claim(&self.pool, worker_id, stale_before).await?)
    }

    async fn complete(&self, task_id: Uuid) -> Result<()> {
        if !queue::complete(&self.pool, task_id).await? {
            tracing::warn!(%task_id, "Completed task was no longer queued");
        }
        Ok(())
    }
}

/// Log hub backed by the `log_lines` table and `LISTEN`/`NOTIFY`
#[derive(Clone)]
pub struct PgLogHub {
    pool: PgPool,
}

impl PgLogHub {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// State of a live follower
struct Follow {
    listener: PgListener,
    pool: PgPool,
    channel: String,
    last_id: i64,
    pending: VecDeque<String>,
}

#[async_trait]
impl LogHub for PgLogHub {
    async fn publish(&self, channel: &str, lines: &[String]) -> Result<()> {
        Ok(logs::append(&self.pool, channel, lines).await?)
    }

    async fn history(&self, channel: &str) -> Result<Vec<String>> {
        let rows = logs::find_after(&self.pool, channel, 0).await?;
        Ok(rows.into_iter().map(|(_, line)| line).collect())
    }

    async fn subscribe(&self, channel: &str) -> Result<LogSubscription> {
        // Listen before reading history so no batch falls between the two
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(logs::NOTIFY_CHANNEL).await?;

        let rows = logs::find_after(&self.pool, channel, 0).await?;
        let last_id = rows.last().map(|(id, _)| *id).unwrap_or(0);
        let history = rows.into_iter().map(|(_, line)| line).collect();

        let follow = Follow {
            listener,
            pool: self.pool.clone(),
            channel: channel.to_string(),
            last_id,
            pending: VecDeque::new(),
        };

        let live = stream::unfold(follow, |mut f| async move {
            loop {
                if let Some(line) = f.pending.pop_front() {
                    return Some((line, f));
                }

                let notification = match f.listener.recv().await {
                    Ok(n) => n,
                    Err(e) => {
                        tracing::warn!(channel = %f.channel, "Log listener closed: {}", e);
                        return None;
                    }
                };
                if notification.payload() != f.channel {
                    continue;
                }

                match logs::find_after(&f.pool, &f.channel, f.last_id).await {
                    Ok(rows) => {
                        for (id, line) in rows {
                            f.last_id = id;
                            f.pending.push_back(line);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(channel = %f.channel, "Failed to read log lines: {}", e);
                        return None;
                    }
                }
            }
        })
        .boxed();

        Ok(LogSubscription { history, live })
    }

    async fn clear(&self, channel: &str) -> Result<()> {
        let removed = logs::delete_channel(&self.pool, channel).await?;
        tracing::debug!(channel, removed, "Log channel cleared");
        Ok(())
    }
}
