//! Repository traits
//!
//! Data access contracts for the runner. Each trait covers one entity;
//! `Store` bundles them so components can take a single handle.

use async_trait::async_trait;
use futures::stream::BoxStream;
use kiln_core::domain::build::Build;
use kiln_core::domain::hook::{Hook, HookCall};
use kiln_core::domain::job::Job;
use kiln_core::domain::project::{Project, User};
use kiln_core::domain::status::CommitStatus;
use kiln_core::dto::build::NewBuild;
use kiln_core::dto::hook::{NewHook, NewHookCall};
use kiln_core::dto::job::{FinishJob, NewJob};
use kiln_core::dto::task::{QueuedTask, Task};
use uuid::Uuid;

use crate::error::Result;

#[async_trait]
pub trait ProjectRepository: Send + Sync {
    async fn get_project(&self, id: i64) -> Result<Option<Project>>;

    /// Users belonging to a project, owner included
    async fn list_members(&self, project_id: i64) -> Result<Vec<User>>;

    /// Increments the project's build counter and returns the new value
    ///
    /// The increment and the read happen as one atomic operation, so
    /// concurrent callers never receive the same number.
    async fn next_build_number(&self, project_id: i64) -> Result<i64>;
}

#[async_trait]
pub trait BuildRepository: Send + Sync {
    /// Inserts a build with an already allocated number
    ///
    /// Fails with `StoreError::Conflict` if the commit already has a build.
    async fn insert_build(&self, req: NewBuild, number: i64) -> Result<Build>;

    /// Returns the build of the request's commit, creating it with the next
    /// build number if there is none
    ///
    /// Lookup, numbering and insert are one atomic step: concurrent calls
    /// for the same commit get the same build and consume a single number.
    ///
    /// # Returns
    /// The build and whether this call created it
    async fn find_or_create_build(&self, req: NewBuild) -> Result<(Build, bool)>;

    async fn get_build(&self, id: i64) -> Result<Option<Build>>;

    /// Finds the build of a commit; a commit is built at most once per project
    async fn find_build(&self, project_id: i64, commit_sha: &str) -> Result<Option<Build>>;

    /// Records the status last reported to the source host
    async fn set_build_status(
        &self,
        id: i64,
        status: CommitStatus,
        description: &str,
    ) -> Result<()>;
}

#[async_trait]
pub trait HookRepository: Send + Sync {
    async fn insert_hook(&self, req: NewHook) -> Result<Hook>;

    async fn get_hook(&self, id: i64) -> Result<Option<Hook>>;

    /// Deletes a hook and its tracked files
    ///
    /// Hook calls that referenced the hook are kept with their reference
    /// cleared; jobs that ran for those calls are untouched.
    ///
    /// # Returns
    /// `false` if no such hook existed
    async fn delete_hook(&self, id: i64) -> Result<bool>;

    async fn insert_hook_call(&self, req: NewHookCall) -> Result<HookCall>;

    async fn get_hook_call(&self, id: i64) -> Result<Option<HookCall>>;
}

#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Creates a job in the running state
    async fn create_job(&self, req: NewJob) -> Result<Job>;

    async fn get_job(&self, id: i64) -> Result<Option<Job>>;

    /// Finds the job produced by a queue task
    async fn find_job_by_task(&self, task_id: Uuid) -> Result<Option<Job>>;

    /// Newest job run for a hook call
    async fn latest_job(&self, hook_call_id: i64) -> Result<Option<Job>>;

    async fn list_jobs(&self, build_id: i64) -> Result<Vec<Job>>;

    /// Moves a job to the finished state
    ///
    /// # Returns
    /// `false` if the job had already finished; the stored result is then
    /// left as it was
    async fn finish_job(&self, id: i64, result: FinishJob) -> Result<bool>;
}

/// Everything the runner reads and writes
pub trait Store: ProjectRepository + BuildRepository + HookRepository + JobRepository {}

impl<T> Store for T where T: ProjectRepository + BuildRepository + HookRepository + JobRepository {}

/// Queue of work for workers
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Adds a task to the queue
    ///
    /// # Returns
    /// The task's correlation id
    async fn enqueue(&self, task: Task) -> Result<Uuid>;

    /// Claims the oldest task nobody is working on
    async fn dequeue(&self, worker_id: &str) -> Result<Option<QueuedTask>>;

    /// Acknowledges a claimed task so it is never handed out again
    async fn complete(&self, task_id: Uuid) -> Result<()>;
}

/// Stream of lines published after a subscription started
pub type LogStream = BoxStream<'static, String>;

/// A channel's durable history plus everything published afterwards
pub struct LogSubscription {
    pub history: Vec<String>,
    pub live: LogStream,
}

/// Line-oriented log fan-out
///
/// Every published batch is appended to the channel's durable list and
/// broadcast to live subscribers.
#[async_trait]
pub trait LogHub: Send + Sync {
    async fn publish(&self, channel: &str, lines: &[String]) -> Result<()>;

    /// All lines published to a channel so far, in order
    async fn history(&self, channel: &str) -> Result<Vec<String>>;

    /// Subscribes to a channel
    ///
    /// The returned history and live stream together contain every line
    /// published to the channel, in order.
    async fn subscribe(&self, channel: &str) -> Result<LogSubscription>;

    /// Drops a channel's durable list
    async fn clear(&self, channel: &str) -> Result<()>;
}
