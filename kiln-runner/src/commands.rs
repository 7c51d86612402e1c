//! Commands module
//!
//! Defines the `kiln` subcommands and their handlers.

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::Subcommand;
use colored::*;
use futures::StreamExt;
use kiln_core::domain::job::Job;
use kiln_core::dto::build::NewBuild;
use kiln_core::dto::hook::NewHookCall;
use kiln_core::dto::log::channel_name;
use kiln_core::dto::payload::StoredPayload;
use kiln_core::dto::task::Task;
use kiln_core::source::SourceHost;
use kiln_github::GitHubClient;
use kiln_store::db::{create_pool, run_migrations};
use kiln_store::{HookRepository, LogHub, PgLogHub, PgStore, TaskQueue};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::dispatcher::{ContainerExecution, Dispatcher};
use crate::podman::{PodmanRuntime, check_podman_available};
use crate::scheduler::TaskPoller;
use crate::service::{BuildService, NoopNotifier, Notifier, SmtpNotifier, StatusReconciler};
use crate::tailer::TailerSettings;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Poll the task queue and execute jobs until interrupted
    Worker,
    /// Queue a fresh run of a hook call
    EnqueueRun { hook_call_id: i64 },
    /// Queue a re-run of a job
    EnqueueRestart { job_id: i64 },
    /// Execute a hook call in this process
    Run { hook_call_id: i64 },
    /// Re-run a job in this process
    Restart { job_id: i64 },
    /// Record a trigger for a commit and queue its run
    Trigger {
        hook_id: i64,
        /// Commit to build
        sha: String,
        /// Branch or pull request ref the commit belongs to
        #[arg(long = "ref", default_value = "master")]
        git_ref: String,
        #[arg(long, default_value = "")]
        author: String,
        #[arg(long, default_value = "")]
        message: String,
    },
    /// Print a hook call's log, then keep printing new lines
    Logs {
        build_id: i64,
        hook_call_id: i64,
        /// Keep waiting for new lines
        #[arg(short, long)]
        follow: bool,
    },
    /// Create the database schema
    InitDb,
}

/// Handle a CLI command
///
/// # Arguments
/// * `command` - The command to execute
/// * `config` - Worker configuration
pub async fn handle_command(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::InitDb => init_db(config).await,
        Commands::Worker => worker(config).await,
        Commands::EnqueueRun { hook_call_id } => enqueue(config, Task::Run { hook_call_id }).await,
        Commands::EnqueueRestart { job_id } => enqueue(config, Task::Restart { job_id }).await,
        Commands::Run { hook_call_id } => {
            let dispatcher = Connection::open(config).await?.dispatcher(config)?;
            let job = dispatcher.run(hook_call_id, Uuid::new_v4()).await?;
            print_job(&job);
            Ok(())
        }
        Commands::Restart { job_id } => {
            let dispatcher = Connection::open(config).await?.dispatcher(config)?;
            let job = dispatcher.restart(job_id, Uuid::new_v4()).await?;
            print_job(&job);
            Ok(())
        }
        Commands::Trigger {
            hook_id,
            sha,
            git_ref,
            author,
            message,
        } => trigger(config, hook_id, sha, git_ref, author, message).await,
        Commands::Logs {
            build_id,
            hook_call_id,
            follow,
        } => logs(config, build_id, hook_call_id, follow).await,
    }
}

/// Database handles shared by the commands
struct Connection {
    store: Arc<PgStore>,
    hub: Arc<PgLogHub>,
}

impl Connection {
    async fn open(config: &Config) -> Result<Self> {
        let pool = create_pool(&config.database_url)
            .await
            .context("Failed to connect to database")?;
        Ok(Self {
            store: Arc::new(PgStore::new(pool.clone())),
            hub: Arc::new(PgLogHub::new(pool)),
        })
    }

    fn dispatcher(&self, config: &Config) -> Result<Dispatcher> {
        let token = config
            .github_token
            .clone()
            .ok_or_else(|| anyhow!("GITHUB_TOKEN must be set to execute jobs"))?;
        let source: Arc<dyn SourceHost> =
            Arc::new(GitHubClient::new(config.github_api_url.as_str(), token));

        let notifier: Arc<dyn Notifier> = match (&config.smtp_url, &config.mail_from) {
            (Some(url), Some(from)) => Arc::new(SmtpNotifier::new(url, from)?),
            _ => {
                info!("No SMTP relay configured, notifications disabled");
                Arc::new(NoopNotifier)
            }
        };

        let reconciler = Arc::new(StatusReconciler::new(
            self.store.clone(),
            source.clone(),
            notifier,
            config.public_url.clone(),
        ));
        let execution = Arc::new(ContainerExecution::new(
            Arc::new(PodmanRuntime::new()),
            self.hub.clone(),
            TailerSettings {
                poll_interval: config.tail_interval,
                stall_timeout: config.stall_timeout,
                handoff_timeout: config.handoff_timeout,
            },
            config.clone_timeout,
        ));

        Ok(Dispatcher::new(
            self.store.clone(),
            self.hub.clone(),
            source,
            reconciler,
            execution,
            config.work_root.clone(),
        ))
    }
}

async fn init_db(config: &Config) -> Result<()> {
    let pool = create_pool(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    run_migrations(&pool)
        .await
        .context("Failed to create schema")?;

    println!("{}", "✓ Database schema is up to date".green().bold());
    Ok(())
}

async fn worker(config: &Config) -> Result<()> {
    check_podman_available().await?;

    let connection = Connection::open(config).await?;
    let dispatcher = Arc::new(connection.dispatcher(config)?);
    let poller = TaskPoller::new(
        config.worker_id.clone(),
        connection.store.clone(),
        dispatcher,
        config.poll_interval,
        config.max_parallel_jobs,
    );

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Interrupt received"),
            Err(e) => warn!("Failed to listen for interrupt: {}", e),
        }
        token.cancel();
    });

    info!(
        "Worker {} ready (work root: {})",
        config.worker_id,
        config.work_root.display()
    );
    poller.run(shutdown).await
}

async fn enqueue(config: &Config, task: Task) -> Result<()> {
    let connection = Connection::open(config).await?;
    let id = connection
        .store
        .enqueue(task)
        .await
        .context("Failed to enqueue task")?;

    println!("{}", "✓ Task queued".green().bold());
    println!("  ID: {}", id.to_string().cyan());
    Ok(())
}

async fn trigger(
    config: &Config,
    hook_id: i64,
    sha: String,
    git_ref: String,
    author: String,
    message: String,
) -> Result<()> {
    let connection = Connection::open(config).await?;
    let store = connection.store.clone();

    let hook = store
        .get_hook(hook_id)
        .await
        .context("Failed to load hook")?
        .ok_or_else(|| anyhow!("Hook {} not found", hook_id))?;

    let build = BuildService::new(store.clone())
        .create_build(NewBuild {
            project_id: hook.project_id,
            commit_sha: sha.clone(),
            commit_ref: git_ref.clone(),
            commit_author: author.clone(),
            commit_message: message.clone(),
        })
        .await?;

    let payload = StoredPayload::github(
        "push",
        json!({
            "ref": format!("refs/heads/{}", git_ref),
            "after": sha,
            "head_commit": {
                "id": sha,
                "message": message,
                "author": { "name": author },
            },
        }),
    );
    let call = store
        .insert_hook_call(NewHookCall {
            hook_id,
            build_id: build.id,
            payload,
        })
        .await
        .context("Failed to record hook call")?;

    let task_id = store
        .enqueue(Task::Run {
            hook_call_id: call.id,
        })
        .await
        .context("Failed to enqueue task")?;

    println!("{}", "✓ Build triggered".green().bold());
    println!("  Build:     #{} ({})", build.number, build.id.to_string().dimmed());
    println!("  Hook call: {}", call.id.to_string().cyan());
    println!("  Task:      {}", task_id.to_string().dimmed());
    Ok(())
}

async fn logs(config: &Config, build_id: i64, hook_call_id: i64, follow: bool) -> Result<()> {
    let connection = Connection::open(config).await?;
    let channel = channel_name(build_id, hook_call_id);

    if !follow {
        for line in connection.hub.history(&channel).await? {
            print!("{}", line);
        }
        return Ok(());
    }

    let subscription = connection
        .hub
        .subscribe(&channel)
        .await
        .context("Failed to subscribe to log channel")?;
    for line in subscription.history {
        print!("{}", line);
    }

    let mut live = subscription.live;
    loop {
        tokio::select! {
            line = live.next() => match line {
                Some(line) => print!("{}", line),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

/// Print a finished job
fn print_job(job: &Job) {
    let result = match job.exit_code {
        Some(0) => "✓ passed".green(),
        Some(code) => format!("✗ failed (exit code {})", code).red(),
        None => "… running".yellow(),
    };

    println!("{}", "Job Details:".bold());
    println!("  ID:        {}", job.id.to_string().cyan());
    println!("  Build:     {}", job.build_id.to_string().dimmed());
    println!("  Result:    {}", result);
    println!(
        "  Started:   {}",
        job.started_at.format("%Y-%m-%d %H:%M:%S")
    );
    if let Some(finished) = job.finished_at {
        let seconds = finished.signed_duration_since(job.started_at).num_seconds();
        println!("  Duration:  {}s", seconds);
    }
    if let Some(cache_id) = &job.cache_id {
        println!("  Cache key: {}", cache_id.dimmed());
    }

    if let Some(output) = job.output.as_deref().filter(|o| !o.is_empty()) {
        println!("\n{}", "Output:".bold());
        print!("{}", output);
        if !output.ends_with('\n') {
            println!();
        }
    }
}
