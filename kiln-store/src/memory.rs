//! In-memory store
//!
//! Process-local implementations of the repository traits, the task queue
//! and the log hub. Used by tests and by single-process runs without a
//! database. State sits behind a `std::sync::Mutex`; no lock is held across
//! an await point.

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use futures::stream;
use kiln_core::domain::build::Build;
use kiln_core::domain::hook::{Hook, HookCall};
use kiln_core::domain::job::Job;
use kiln_core::domain::project::{DeployKeyPair, Membership, Project, User};
use kiln_core::domain::status::CommitStatus;
use kiln_core::dto::build::NewBuild;
use kiln_core::dto::hook::{NewHook, NewHookCall};
use kiln_core::dto::job::{FinishJob, NewJob};
use kiln_core::dto::task::{QueuedTask, Task};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::repository::{
    BuildRepository, HookRepository, JobRepository, LogHub, LogSubscription, ProjectRepository,
    TaskQueue,
};

#[derive(Default)]
struct State {
    next_id: i64,
    users: BTreeMap<i64, User>,
    projects: BTreeMap<i64, Project>,
    members: Vec<Membership>,
    builds: BTreeMap<i64, Build>,
    hooks: BTreeMap<i64, Hook>,
    hook_calls: BTreeMap<i64, HookCall>,
    jobs: BTreeMap<i64, Job>,
    pending: VecDeque<QueuedTask>,
    claimed: HashMap<Uuid, QueuedTask>,
}

impl State {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn find_build(&self, project_id: i64, commit_sha: &str) -> Option<&Build> {
        self.builds
            .values()
            .find(|b| b.project_id == project_id && b.commit_sha == commit_sha)
    }

    fn insert_build(&mut self, req: NewBuild, number: i64) -> Build {
        let build = Build {
            id: self.allocate_id(),
            project_id: req.project_id,
            number,
            commit_sha: req.commit_sha,
            commit_ref: req.commit_ref,
            commit_author: req.commit_author,
            commit_message: req.commit_message,
            created_at: Utc::now(),
            status: None,
            status_description: None,
        };
        self.builds.insert(build.id, build.clone());
        build
    }
}

/// Store kept entirely in process memory
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ===== Seeding =====

    pub fn add_user(&self, login: &str, name: &str, email: Option<&str>) -> User {
        let mut state = self.lock();
        let user = User {
            id: state.allocate_id(),
            login: login.to_string(),
            name: name.to_string(),
            email: email.map(str::to_string),
        };
        state.users.insert(user.id, user.clone());
        user
    }

    pub fn add_project(&self, owner_id: i64, full_name: &str, clone_url: &str) -> Project {
        let mut state = self.lock();
        let project = Project {
            id: state.allocate_id(),
            owner_id,
            full_name: full_name.to_string(),
            clone_url: clone_url.to_string(),
            deploy_key: None,
            build_cursor: 0,
        };
        state.projects.insert(project.id, project.clone());
        project
    }

    pub fn add_member(&self, project_id: i64, user_id: i64) {
        self.lock().members.push(Membership {
            project_id,
            user_id,
            allows_management: false,
            created_at: Utc::now(),
        });
    }

    pub fn set_deploy_key(&self, project_id: i64, key: DeployKeyPair) {
        if let Some(project) = self.lock().projects.get_mut(&project_id) {
            project.deploy_key = Some(key);
        }
    }

    /// Number of tasks nobody has claimed yet
    pub fn pending_tasks(&self) -> usize {
        self.lock().pending.len()
    }
}

#[async_trait]
impl ProjectRepository for MemoryStore {
    async fn get_project(&self, id: i64) -> Result<Option<Project>> {
        Ok(self.lock().projects.get(&id).cloned())
    }

    async fn list_members(&self, project_id: i64) -> Result<Vec<User>> {
        let state = self.lock();
        let Some(project) = state.projects.get(&project_id) else {
            return Ok(Vec::new());
        };

        let mut users: Vec<User> = state.users.get(&project.owner_id).cloned().into_iter().collect();
        users.extend(
            state
                .members
                .iter()
                .filter(|m| m.project_id == project_id && m.user_id != project.owner_id)
                .filter_map(|m| state.users.get(&m.user_id).cloned()),
        );
        Ok(users)
    }

    async fn next_build_number(&self, project_id: i64) -> Result<i64> {
        let mut state = self.lock();
        let project = state
            .projects
            .get_mut(&project_id)
            .ok_or_else(|| StoreError::not_found("project", project_id))?;
        project.build_cursor += 1;
        Ok(project.build_cursor)
    }
}

#[async_trait]
impl BuildRepository for MemoryStore {
    async fn insert_build(&self, req: NewBuild, number: i64) -> Result<Build> {
        let mut state = self.lock();
        if state.find_build(req.project_id, &req.commit_sha).is_some() {
            return Err(StoreError::Conflict(format!(
                "commit {} of project {} already has a build",
                req.commit_sha, req.project_id
            )));
        }
        Ok(state.insert_build(req, number))
    }

    async fn find_or_create_build(&self, req: NewBuild) -> Result<(Build, bool)> {
        let mut state = self.lock();
        if let Some(existing) = state.find_build(req.project_id, &req.commit_sha) {
            return Ok((existing.clone(), false));
        }

        let project = state
            .projects
            .get_mut(&req.project_id)
            .ok_or_else(|| StoreError::not_found("project", req.project_id))?;
        project.build_cursor += 1;
        let number = project.build_cursor;

        Ok((state.insert_build(req, number), true))
    }

    async fn get_build(&self, id: i64) -> Result<Option<Build>> {
        Ok(self.lock().builds.get(&id).cloned())
    }

    async fn find_build(&self, project_id: i64, commit_sha: &str) -> Result<Option<Build>> {
        Ok(self.lock().find_build(project_id, commit_sha).cloned())
    }

    async fn set_build_status(
        &self,
        id: i64,
        status: CommitStatus,
        description: &str,
    ) -> Result<()> {
        let mut state = self.lock();
        let build = state
            .builds
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("build", id))?;
        build.status = Some(status);
        build.status_description = Some(description.to_string());
        Ok(())
    }
}

#[async_trait]
impl HookRepository for MemoryStore {
    async fn insert_hook(&self, req: NewHook) -> Result<Hook> {
        let mut state = self.lock();
        let hook = Hook {
            id: state.allocate_id(),
            project_id: req.project_id,
            title: req.title,
            image: req.image,
            build_script: req.build_script,
            install_script: req.install_script,
            tracked_files: req.tracked_files,
        };
        state.hooks.insert(hook.id, hook.clone());
        Ok(hook)
    }

    async fn get_hook(&self, id: i64) -> Result<Option<Hook>> {
        Ok(self.lock().hooks.get(&id).cloned())
    }

    async fn delete_hook(&self, id: i64) -> Result<bool> {
        let mut state = self.lock();
        for call in state.hook_calls.values_mut() {
            if call.hook_id == Some(id) {
                call.hook_id = None;
            }
        }
        Ok(state.hooks.remove(&id).is_some())
    }

    async fn insert_hook_call(&self, req: NewHookCall) -> Result<HookCall> {
        let mut state = self.lock();
        let call = HookCall {
            id: state.allocate_id(),
            hook_id: Some(req.hook_id),
            build_id: req.build_id,
            created_at: Utc::now(),
            payload: req.payload,
        };
        state.hook_calls.insert(call.id, call.clone());
        Ok(call)
    }

    async fn get_hook_call(&self, id: i64) -> Result<Option<HookCall>> {
        Ok(self.lock().hook_calls.get(&id).cloned())
    }
}

#[async_trait]
impl JobRepository for MemoryStore {
    async fn create_job(&self, req: NewJob) -> Result<Job> {
        let mut state = self.lock();
        let job = Job {
            id: state.allocate_id(),
            build_id: req.build_id,
            hook_call_id: req.hook_call_id,
            started_at: Utc::now(),
            finished_at: None,
            exit_code: None,
            output: None,
            cache_id: None,
            task_id: req.task_id,
        };
        state.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, id: i64) -> Result<Option<Job>> {
        Ok(self.lock().jobs.get(&id).cloned())
    }

    async fn find_job_by_task(&self, task_id: Uuid) -> Result<Option<Job>> {
        Ok(self
            .lock()
            .jobs
            .values()
            .rev()
            .find(|j| j.task_id == task_id)
            .cloned())
    }

    async fn latest_job(&self, hook_call_id: i64) -> Result<Option<Job>> {
        Ok(self
            .lock()
            .jobs
            .values()
            .rev()
            .find(|j| j.hook_call_id == hook_call_id)
            .cloned())
    }

    async fn list_jobs(&self, build_id: i64) -> Result<Vec<Job>> {
        Ok(self
            .lock()
            .jobs
            .values()
            .filter(|j| j.build_id == build_id)
            .cloned()
            .collect())
    }

    async fn finish_job(&self, id: i64, result: FinishJob) -> Result<bool> {
        let mut state = self.lock();
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("job", id))?;
        if job.is_finished() {
            return Ok(false);
        }
        job.finished_at = Some(Utc::now());
        job.exit_code = Some(result.exit_code);
        job.output = Some(result.output);
        job.cache_id = result.cache_id;
        Ok(true)
    }
}

#[async_trait]
impl TaskQueue for MemoryStore {
    async fn enqueue(&self, task: Task) -> Result<Uuid> {
        let queued = QueuedTask {
            id: Uuid::new_v4(),
            task,
            enqueued_at: Utc::now(),
        };
        let id = queued.id;
        self.lock().pending.push_back(queued);
        Ok(id)
    }

    async fn dequeue(&self, _worker_id: &str) -> Result<Option<QueuedTask>> {
        let mut state = self.lock();
        let Some(task) = state.pending.pop_front() else {
            return Ok(None);
        };
        state.claimed.insert(task.id, task.clone());
        Ok(Some(task))
    }

    async fn complete(&self, task_id: Uuid) -> Result<()> {
        self.lock().claimed.remove(&task_id);
        Ok(())
    }
}

const CHANNEL_CAPACITY: usize = 1024;

struct Channel {
    lines: Vec<String>,
    sender: broadcast::Sender<String>,
}

impl Channel {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            lines: Vec::new(),
            sender,
        }
    }
}

/// Log hub kept in process memory
///
/// Each channel keeps its full list plus a broadcast sender for live
/// subscribers.
#[derive(Default)]
pub struct MemoryLogHub {
    channels: Mutex<HashMap<String, Channel>>,
}

impl MemoryLogHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Channel>> {
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl LogHub for MemoryLogHub {
    async fn publish(&self, channel: &str, lines: &[String]) -> Result<()> {
        let mut channels = self.lock();
        let entry = channels
            .entry(channel.to_string())
            .or_insert_with(Channel::new);

        for line in lines {
            entry.lines.push(line.clone());
            // No receivers is not an error
            let _ = entry.sender.send(line.clone());
        }
        Ok(())
    }

    async fn history(&self, channel: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()
            .get(channel)
            .map(|c| c.lines.clone())
            .unwrap_or_default())
    }

    async fn subscribe(&self, channel: &str) -> Result<LogSubscription> {
        let (history, receiver) = {
            let mut channels = self.lock();
            let entry = channels
                .entry(channel.to_string())
                .or_insert_with(Channel::new);
            (entry.lines.clone(), entry.sender.subscribe())
        };

        let channel = channel.to_string();
        let live = stream::unfold(receiver, move |mut receiver| {
            let channel = channel.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok(line) => return Some((line, receiver)),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(%channel, skipped, "Log subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        })
        .boxed();

        Ok(LogSubscription { history, live })
    }

    async fn clear(&self, channel: &str) -> Result<()> {
        if let Some(entry) = self.lock().get_mut(channel) {
            entry.lines.clear();
        }
        Ok(())
    }
}
