//! Task poller
//!
//! Polls the task queue and executes claimed tasks.
//! Each task runs in its own tokio task; a semaphore caps how many run at once.

use anyhow::{Context, Result};
use kiln_core::dto::task::QueuedTask;
use kiln_store::TaskQueue;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{self, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dispatcher::Dispatcher;

/// Task poller that continuously claims and executes tasks
pub struct TaskPoller {
    worker_id: String,
    queue: Arc<dyn TaskQueue>,
    dispatcher: Arc<Dispatcher>,
    poll_interval: Duration,
    max_parallel_jobs: usize,
    semaphore: Arc<Semaphore>,
}

impl TaskPoller {
    /// Creates a new task poller
    pub fn new(
        worker_id: String,
        queue: Arc<dyn TaskQueue>,
        dispatcher: Arc<Dispatcher>,
        poll_interval: Duration,
        max_parallel_jobs: usize,
    ) -> Self {
        Self {
            worker_id,
            queue,
            dispatcher,
            poll_interval,
            max_parallel_jobs,
            semaphore: Arc::new(Semaphore::new(max_parallel_jobs)),
        }
    }

    /// Polls until `shutdown` is cancelled, then waits for running tasks
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(
            worker_id = %self.worker_id,
            "Starting task poller (interval: {:?}, max parallel jobs: {})",
            self.poll_interval,
            self.max_parallel_jobs
        );

        let mut interval = time::interval(self.poll_interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            debug!("Polling for tasks");

            match self.poll_once().await {
                Ok(started) => {
                    if started > 0 {
                        info!("Started {} task(s) this cycle", started);
                    }
                }
                Err(e) => {
                    error!("Error during poll cycle: {:#}", e);
                }
            }
        }

        info!("Shutting down, waiting for running jobs to finish");
        let permits = u32::try_from(self.max_parallel_jobs).unwrap_or(u32::MAX);
        let _all = self
            .semaphore
            .acquire_many(permits)
            .await
            .context("Job semaphore closed")?;
        info!("All jobs finished");

        Ok(())
    }

    /// Claims and starts tasks while there is capacity
    ///
    /// # Returns
    /// Number of tasks started
    pub async fn poll_once(&self) -> Result<usize> {
        let mut started = 0;

        loop {
            let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
                debug!("Max parallel jobs reached, leaving tasks queued");
                break;
            };

            let Some(task) = self
                .queue
                .dequeue(&self.worker_id)
                .await
                .context("Failed to claim task")?
            else {
                break;
            };

            self.spawn_task(task, permit);
            started += 1;
        }

        Ok(started)
    }

    /// Spawns a task to execute a single queued task
    fn spawn_task(
        &self,
        task: QueuedTask,
        permit: OwnedSemaphorePermit,
    ) -> tokio::task::JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let dispatcher = Arc::clone(&self.dispatcher);

        tokio::spawn(async move {
            info!(task_id = %task.id, "Executing {:?}", task.task);

            if let Err(e) = dispatcher.handle(&task).await {
                error!(task_id = %task.id, "Task failed: {:#}", e);
            }

            // Failed tasks are not retried; the failure is already recorded
            if let Err(e) = queue.complete(task.id).await {
                warn!(task_id = %task.id, "Failed to acknowledge task: {:#}", e);
            }
            drop(permit);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::StatusReconciler;
    use crate::testing::{FakeExecution, FakeSourceHost, RecordingNotifier};
    use kiln_core::domain::job::JobOutcome;
    use kiln_core::dto::build::NewBuild;
    use kiln_core::dto::hook::{NewHook, NewHookCall};
    use kiln_core::dto::payload::StoredPayload;
    use kiln_core::dto::task::Task;
    use kiln_store::{
        BuildRepository, HookRepository, JobRepository, MemoryLogHub, MemoryStore,
    };

    struct Fixture {
        store: Arc<MemoryStore>,
        execution: Arc<FakeExecution>,
        poller: TaskPoller,
        build_ids: Vec<i64>,
        _work_root: tempfile::TempDir,
    }

    async fn fixture(tasks: usize, max_parallel_jobs: usize) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let owner = store.add_user("jdoe", "J. Doe", None);
        let project = store.add_project(owner.id, "acme/widgets", "git@github.com:acme/widgets.git");
        let hook = store
            .insert_hook(NewHook {
                project_id: project.id,
                title: "tests".to_string(),
                image: "debian:stable".to_string(),
                build_script: "make test".to_string(),
                install_script: None,
                tracked_files: Vec::new(),
            })
            .await
            .unwrap();

        let mut build_ids = Vec::new();
        for i in 0..tasks {
            let build = store
                .insert_build(
                    NewBuild {
                        project_id: project.id,
                        commit_sha: format!("sha{}", i),
                        commit_ref: "master".to_string(),
                        commit_author: "jdoe".to_string(),
                        commit_message: "wip".to_string(),
                    },
                    i as i64 + 1,
                )
                .await
                .unwrap();
            let call = store
                .insert_hook_call(NewHookCall {
                    hook_id: hook.id,
                    build_id: build.id,
                    payload: StoredPayload::github("push", serde_json::json!({})),
                })
                .await
                .unwrap();
            store
                .enqueue(Task::Run {
                    hook_call_id: call.id,
                })
                .await
                .unwrap();
            build_ids.push(build.id);
        }

        let source = Arc::new(FakeSourceHost::new());
        let execution = Arc::new(FakeExecution::new(JobOutcome::new(0, "ok\n")));
        let reconciler = Arc::new(StatusReconciler::new(
            store.clone(),
            source.clone(),
            Arc::new(RecordingNotifier::new()),
            "http://localhost:8080",
        ));
        let work_root = tempfile::tempdir().unwrap();
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            Arc::new(MemoryLogHub::new()),
            source,
            reconciler,
            execution.clone(),
            work_root.path().to_path_buf(),
        ));
        let poller = TaskPoller::new(
            "test-worker".to_string(),
            store.clone(),
            dispatcher,
            Duration::from_millis(20),
            max_parallel_jobs,
        );

        Fixture {
            store,
            execution,
            poller,
            build_ids,
            _work_root: work_root,
        }
    }

    async fn finished_jobs(store: &MemoryStore, build_ids: &[i64]) -> usize {
        let mut finished = 0;
        for id in build_ids {
            finished += store
                .list_jobs(*id)
                .await
                .unwrap()
                .iter()
                .filter(|job| job.is_finished())
                .count();
        }
        finished
    }

    #[tokio::test]
    async fn test_poll_respects_parallelism() {
        let f = fixture(3, 2).await;

        assert_eq!(f.poller.poll_once().await.unwrap(), 2);
        assert_eq!(f.store.pending_tasks(), 1);
    }

    #[tokio::test]
    async fn test_run_drains_queue_and_stops() {
        let f = fixture(3, 2).await;
        let shutdown = CancellationToken::new();

        let poller = f.poller;
        let token = shutdown.clone();
        let handle = tokio::spawn(async move { poller.run(token).await });

        let deadline = time::Instant::now() + Duration::from_secs(10);
        while finished_jobs(&f.store, &f.build_ids).await < 3 {
            assert!(time::Instant::now() < deadline, "jobs did not finish");
            time::sleep(Duration::from_millis(20)).await;
        }

        shutdown.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(f.store.pending_tasks(), 0);
        assert_eq!(f.execution.records().len(), 3);
    }
}
