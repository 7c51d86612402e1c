//! Job dispatch
//!
//! Turns a queued task into exactly one finished job:
//! - Resolves the hook call, hook, build and project
//! - Creates the job and reports the build as pending
//! - Installs a throwaway deploy key for the checkout
//! - Fingerprints the build environment
//! - Runs the job through a `JobExecution` strategy
//! - Revokes the key, records the outcome and reports the final status
//!
//! A task that already produced a finished job is acknowledged without
//! running again. A job left unfinished under the same task (a worker died
//! mid-run) is closed as errored and the task runs again on a new job.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use kiln_core::domain::build::Build;
use kiln_core::domain::hook::{Hook, HookCall};
use kiln_core::domain::job::{Job, JobOutcome};
use kiln_core::domain::project::Project;
use kiln_core::domain::status::CommitStatus;
use kiln_core::dto::job::{FinishJob, NewJob};
use kiln_core::dto::task::{QueuedTask, Task};
use kiln_core::source::SourceHost;
use kiln_store::{LogHub, Store};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::builder::{BuildRequest, Builder, CacheLocks, InstallStep, LOG_FILE};
use crate::cache_key::CacheKeyComputer;
use crate::keypair::{KeyPairProvisioner, ThrowawayKey};
use crate::podman::ContainerRuntime;
use crate::service::StatusReconciler;
use crate::tailer::{TailOutcome, Tailer, TailerSettings};

const ORPHANED_OUTPUT: &str = "kiln: the worker running this job stopped before it finished\n";

/// Everything needed to execute one job
pub struct ExecutionRequest {
    pub job_id: i64,
    /// Log channel live output goes to
    pub channel: String,
    pub image: String,
    pub build_script: String,
    pub install: Option<InstallStep>,
    pub clone_url: String,
    pub commit_sha: String,
    pub key: ThrowawayKey,
    /// Fresh empty directory, removed by the dispatcher afterwards
    pub work_dir: PathBuf,
}

/// Strategy that runs a prepared job
#[async_trait]
pub trait JobExecution: Send + Sync {
    /// Runs the job; faults are reported through the outcome
    async fn execute(&self, req: ExecutionRequest) -> JobOutcome;
}

/// Runs jobs in containers with a tailer following the log
pub struct ContainerExecution {
    runtime: Arc<dyn ContainerRuntime>,
    hub: Arc<dyn LogHub>,
    cache_locks: Arc<CacheLocks>,
    tailer: TailerSettings,
    clone_timeout: Duration,
}

impl ContainerExecution {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        hub: Arc<dyn LogHub>,
        tailer: TailerSettings,
        clone_timeout: Duration,
    ) -> Self {
        Self {
            runtime,
            hub,
            cache_locks: Arc::new(CacheLocks::new()),
            tailer,
            clone_timeout,
        }
    }
}

#[async_trait]
impl JobExecution for ContainerExecution {
    async fn execute(&self, req: ExecutionRequest) -> JobOutcome {
        let job_id = req.job_id;
        let (handoff_tx, handoff_rx) = mpsc::channel(1);
        let finished = CancellationToken::new();

        let tailer = Tailer::new(
            req.work_dir.join(LOG_FILE),
            req.channel.clone(),
            self.hub.clone(),
            self.runtime.clone(),
            self.tailer,
        );
        let tail_task = tokio::spawn(tailer.run(handoff_rx, finished.clone()));

        let builder = Builder::new(
            self.runtime.clone(),
            self.cache_locks.clone(),
            self.clone_timeout,
        );
        let outcome = builder
            .run(
                BuildRequest {
                    job_id,
                    image: req.image,
                    build_script: req.build_script,
                    install: req.install,
                    clone_url: req.clone_url,
                    commit_sha: req.commit_sha,
                    private_key: req.key.private_key,
                    passphrase: req.key.passphrase,
                    work_dir: req.work_dir,
                },
                handoff_tx,
            )
            .await;

        finished.cancel();
        match tail_task.await {
            Ok(TailOutcome::Stalled) => info!(job_id, "Job was killed after its output stalled"),
            Ok(TailOutcome::Finished) => {}
            Err(e) => warn!(job_id, "Tailer task failed: {}", e),
        }

        outcome
    }
}

/// Name of the image a prepared environment is cached as
pub fn cache_image_name(fingerprint: &str) -> String {
    format!("kiln-cache:{}", fingerprint)
}

/// Status description shown on the source host
pub fn status_description(build_number: i64, status: CommitStatus) -> String {
    let state = match status {
        CommitStatus::Pending => "is pending",
        CommitStatus::Success => "has passed",
        CommitStatus::Failure => "has failed",
        CommitStatus::Error => "has errored",
    };
    format!("Kiln build #{} {}.", build_number, state)
}

pub struct Dispatcher {
    store: Arc<dyn Store>,
    hub: Arc<dyn LogHub>,
    source: Arc<dyn SourceHost>,
    reconciler: Arc<StatusReconciler>,
    keys: KeyPairProvisioner,
    cache_keys: CacheKeyComputer,
    execution: Arc<dyn JobExecution>,
    work_root: PathBuf,
}

impl Dispatcher {
    /// # Arguments
    /// * `work_root` - Directory per-job working directories are created in
    pub fn new(
        store: Arc<dyn Store>,
        hub: Arc<dyn LogHub>,
        source: Arc<dyn SourceHost>,
        reconciler: Arc<StatusReconciler>,
        execution: Arc<dyn JobExecution>,
        work_root: PathBuf,
    ) -> Self {
        Self {
            store,
            hub,
            cache_keys: CacheKeyComputer::new(source.clone()),
            source,
            reconciler,
            keys: KeyPairProvisioner::default(),
            execution,
            work_root,
        }
    }

    /// Handles a task from the queue
    pub async fn handle(&self, task: &QueuedTask) -> Result<()> {
        if let Some(job) = self
            .store
            .find_job_by_task(task.id)
            .await
            .context("Failed to look up job for task")?
        {
            if job.is_finished() {
                info!(task_id = %task.id, job_id = job.id, "Task already produced a finished job");
                return Ok(());
            }
            self.close_orphan(&job).await?;
        }

        match task.task {
            Task::Run { hook_call_id } => self.run(hook_call_id, task.id).await?,
            Task::Restart { job_id } => self.restart(job_id, task.id).await?,
        };
        Ok(())
    }

    /// Executes a fresh trigger
    ///
    /// # Returns
    /// The finished job
    pub async fn run(&self, hook_call_id: i64, task_id: Uuid) -> Result<Job> {
        let call = self
            .store
            .get_hook_call(hook_call_id)
            .await
            .context("Failed to load hook call")?
            .ok_or_else(|| anyhow!("Hook call {} not found", hook_call_id))?;

        self.execute(call, task_id).await
    }

    /// Executes an existing job's hook call again on a new job
    ///
    /// The channel's history is cleared first so observers only see the new
    /// run. The previous job is left as it is.
    pub async fn restart(&self, job_id: i64, task_id: Uuid) -> Result<Job> {
        let previous = self
            .store
            .get_job(job_id)
            .await
            .context("Failed to load job")?
            .ok_or_else(|| anyhow!("Job {} not found", job_id))?;
        let call = self
            .store
            .get_hook_call(previous.hook_call_id)
            .await
            .context("Failed to load hook call")?
            .ok_or_else(|| anyhow!("Hook call {} not found", previous.hook_call_id))?;

        self.hub
            .clear(&previous.log_channel())
            .await
            .context("Failed to clear log channel")?;

        info!(job_id, hook_call_id = call.id, "Restarting job");
        self.execute(call, task_id).await
    }

    async fn execute(&self, call: HookCall, task_id: Uuid) -> Result<Job> {
        let hook_id = call
            .hook_id
            .ok_or_else(|| anyhow!("Hook of call {} has been deleted", call.id))?;
        let hook = self
            .store
            .get_hook(hook_id)
            .await
            .context("Failed to load hook")?
            .ok_or_else(|| anyhow!("Hook {} not found", hook_id))?;
        let build = self
            .store
            .get_build(call.build_id)
            .await
            .context("Failed to load build")?
            .ok_or_else(|| anyhow!("Build {} not found", call.build_id))?;
        let project = self
            .store
            .get_project(build.project_id)
            .await
            .context("Failed to load project")?
            .ok_or_else(|| anyhow!("Project {} not found", build.project_id))?;

        let job = self
            .store
            .create_job(NewJob {
                build_id: build.id,
                hook_call_id: call.id,
                task_id,
            })
            .await
            .context("Failed to create job")?;

        info!(
            job_id = job.id,
            build_id = build.id,
            hook = %hook.title,
            "Dispatching {} build #{}",
            project.full_name,
            build.number
        );
        self.report(&build, CommitStatus::Pending).await;

        let mut cache_id = None;
        let (outcome, status) = match self
            .execute_job(&job, &hook, &build, &project, &mut cache_id)
            .await
        {
            Ok(outcome) if outcome.succeeded() => (outcome, CommitStatus::Success),
            Ok(outcome) => (outcome, CommitStatus::Failure),
            Err(e) => {
                error!(job_id = job.id, "Job errored: {:#}", e);
                (JobOutcome::fault(format!("kiln: {:#}\n", e)), CommitStatus::Error)
            }
        };

        info!(job_id = job.id, exit_code = outcome.exit_code, "Job finished");
        let recorded = self
            .store
            .finish_job(
                job.id,
                FinishJob {
                    exit_code: outcome.exit_code,
                    output: outcome.output,
                    cache_id,
                },
            )
            .await
            .context("Failed to record job result")?;
        if !recorded {
            warn!(job_id = job.id, "Job had already finished; keeping the stored result");
        }

        self.report(&build, status).await;

        self.store
            .get_job(job.id)
            .await
            .context("Failed to reload job")?
            .ok_or_else(|| anyhow!("Job {} disappeared", job.id))
    }

    /// Provisions a deploy key around the actual execution
    async fn execute_job(
        &self,
        job: &Job,
        hook: &Hook,
        build: &Build,
        project: &Project,
        cache_id: &mut Option<String>,
    ) -> Result<JobOutcome> {
        let provisioner = self.keys.clone();
        let key = tokio::task::spawn_blocking(move || provisioner.generate(None))
            .await
            .context("Key generation task failed")?
            .context("Failed to generate deploy key")?;

        let key_id = self
            .source
            .add_deploy_key(
                &project.full_name,
                &format!("kiln job {}", job.id),
                &key.public_key,
            )
            .await
            .context("Failed to install deploy key")?;

        let result = self
            .run_with_key(job, hook, build, project, key, cache_id)
            .await;

        if let Err(e) = self
            .source
            .remove_deploy_key(&project.full_name, key_id)
            .await
        {
            warn!(job_id = job.id, key_id, "Failed to revoke deploy key: {}", e);
        }

        result
    }

    async fn run_with_key(
        &self,
        job: &Job,
        hook: &Hook,
        build: &Build,
        project: &Project,
        key: ThrowawayKey,
        cache_id: &mut Option<String>,
    ) -> Result<JobOutcome> {
        let fingerprint = self
            .cache_keys
            .compute(
                &project.full_name,
                &build.commit_sha,
                &hook.image,
                hook.install_script.as_deref().unwrap_or(""),
                &hook.normalized_tracked_paths(),
            )
            .await
            .context("Failed to compute cache fingerprint")?;
        *cache_id = Some(fingerprint.clone());

        let install = hook
            .install_script
            .as_ref()
            .filter(|script| !script.trim().is_empty())
            .map(|script| InstallStep {
                script: script.clone(),
                cache_image: cache_image_name(&fingerprint),
            });

        let work_dir = tempfile::Builder::new()
            .prefix(&format!("kiln-job-{}-", job.id))
            .tempdir_in(&self.work_root)
            .with_context(|| {
                format!("Failed to create working directory in {}", self.work_root.display())
            })?;

        let outcome = self
            .execution
            .execute(ExecutionRequest {
                job_id: job.id,
                channel: job.log_channel(),
                image: hook.image.clone(),
                build_script: hook.build_script.clone(),
                install,
                clone_url: project.clone_url.clone(),
                commit_sha: build.commit_sha.clone(),
                key,
                work_dir: work_dir.path().to_path_buf(),
            })
            .await;

        let path = work_dir.path().to_path_buf();
        if let Err(e) = work_dir.close() {
            warn!(job_id = job.id, "Failed to remove {}: {}", path.display(), e);
        }

        Ok(outcome)
    }

    /// Closes a job a crashed worker left running
    async fn close_orphan(&self, job: &Job) -> Result<()> {
        warn!(job_id = job.id, "Job was left unfinished by a previous attempt");

        let closed = self
            .store
            .finish_job(
                job.id,
                FinishJob {
                    exit_code: 1,
                    output: ORPHANED_OUTPUT.to_string(),
                    cache_id: job.cache_id.clone(),
                },
            )
            .await
            .context("Failed to close unfinished job")?;

        if closed {
            if let Some(build) = self
                .store
                .get_build(job.build_id)
                .await
                .context("Failed to load build")?
            {
                self.report(&build, CommitStatus::Error).await;
            }
        }
        Ok(())
    }

    async fn report(&self, build: &Build, status: CommitStatus) {
        let description = status_description(build.number, status);
        if let Err(e) = self.reconciler.report(build.id, status, &description).await {
            warn!(build_id = build.id, %status, "Failed to report status: {:#}", e);
        }
    }
}
