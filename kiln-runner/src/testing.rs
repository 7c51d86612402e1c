//! Test doubles for the runner's collaborators
//!
//! Each fake records the calls it receives so tests can assert on order
//! and count.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use kiln_core::domain::job::JobOutcome;
use kiln_core::domain::status::CommitStatus;
use kiln_core::source::{DirEntry, EntryKind, RemoteContent, SourceHost, SourceHostError};
use tokio::sync::Notify;

use crate::builder::{INSTALL_MARKER, LOG_FILE, PREPARE_SCRIPT};
use crate::dispatcher::{ExecutionRequest, JobExecution};
use crate::podman::{ContainerRuntime, ContainerSpec};
use crate::service::notifier::{Notification, Notifier};

fn locked<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// =============================================================================
// Source host
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusCall {
    pub repo: String,
    pub sha: String,
    pub status: CommitStatus,
    pub target_url: String,
    pub description: String,
}

/// In-memory repository tree
///
/// Directories exist implicitly as prefixes of file paths.
#[derive(Default)]
pub struct FakeSourceHost {
    files: Mutex<BTreeMap<String, String>>,
    queries: Mutex<Vec<String>>,
    statuses: Mutex<Vec<StatusCall>>,
    keys: Mutex<BTreeMap<i64, String>>,
    removed_keys: Mutex<Vec<i64>>,
    next_key: AtomicI64,
    fail_statuses: AtomicBool,
    fail_contents: AtomicBool,
}

impl FakeSourceHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_file(&self, path: &str, sha: &str) {
        locked(&self.files).insert(path.to_string(), sha.to_string());
    }

    pub fn remove_file(&self, path: &str) {
        locked(&self.files).remove(path);
    }

    pub fn queries(&self) -> Vec<String> {
        locked(&self.queries).clone()
    }

    pub fn clear_queries(&self) {
        locked(&self.queries).clear();
    }

    pub fn statuses(&self) -> Vec<StatusCall> {
        locked(&self.statuses).clone()
    }

    /// Keys currently installed, by id
    pub fn installed_keys(&self) -> BTreeMap<i64, String> {
        locked(&self.keys).clone()
    }

    pub fn removed_keys(&self) -> Vec<i64> {
        locked(&self.removed_keys).clone()
    }

    pub fn fail_statuses(&self, fail: bool) {
        self.fail_statuses.store(fail, Ordering::SeqCst);
    }

    pub fn fail_contents(&self, fail: bool) {
        self.fail_contents.store(fail, Ordering::SeqCst);
    }

    fn unavailable() -> SourceHostError {
        SourceHostError::Api {
            status: 503,
            message: "unavailable".to_string(),
        }
    }
}

#[async_trait]
impl SourceHost for FakeSourceHost {
    async fn get_content(
        &self,
        _repo: &str,
        path: &str,
        _git_ref: &str,
    ) -> Result<Option<RemoteContent>, SourceHostError> {
        locked(&self.queries).push(path.to_string());
        if self.fail_contents.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }

        let files = locked(&self.files);
        if let Some(sha) = files.get(path) {
            return Ok(Some(RemoteContent::File { sha: sha.clone() }));
        }

        let prefix = if path.is_empty() {
            String::new()
        } else {
            format!("{}/", path)
        };
        let mut entries: BTreeMap<String, EntryKind> = BTreeMap::new();
        for (file, sha) in files.range(prefix.clone()..) {
            let Some(rest) = file.strip_prefix(&prefix) else {
                break;
            };
            match rest.split_once('/') {
                Some((dir, _)) => {
                    entries.insert(format!("{}{}", prefix, dir), EntryKind::Dir);
                }
                None => {
                    entries.insert(file.clone(), EntryKind::File { sha: sha.clone() });
                }
            }
        }

        if entries.is_empty() {
            return Ok(None);
        }
        Ok(Some(RemoteContent::Dir(
            entries
                .into_iter()
                .map(|(path, kind)| DirEntry { path, kind })
                .collect(),
        )))
    }

    async fn set_commit_status(
        &self,
        repo: &str,
        sha: &str,
        status: CommitStatus,
        target_url: &str,
        description: &str,
    ) -> Result<(), SourceHostError> {
        if self.fail_statuses.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        locked(&self.statuses).push(StatusCall {
            repo: repo.to_string(),
            sha: sha.to_string(),
            status,
            target_url: target_url.to_string(),
            description: description.to_string(),
        });
        Ok(())
    }

    async fn add_deploy_key(
        &self,
        _repo: &str,
        _title: &str,
        public_key: &str,
    ) -> Result<i64, SourceHostError> {
        let id = self.next_key.fetch_add(1, Ordering::SeqCst) + 1;
        locked(&self.keys).insert(id, public_key.to_string());
        Ok(id)
    }

    async fn remove_deploy_key(&self, _repo: &str, key_id: i64) -> Result<(), SourceHostError> {
        locked(&self.keys).remove(&key_id);
        locked(&self.removed_keys).push(key_id);
        Ok(())
    }
}

// =============================================================================
// Container runtime
// =============================================================================

/// What a fake container does once started
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Writes `output` to the log and exits
    Exit { code: i32, output: String },
    /// Writes `output` to the log and runs until killed
    Hang { output: String },
}

/// Fake runtime that plays out the entry script it was started with
///
/// Install containers (started with `prepare.sh`) follow the install
/// behavior and leave the install marker behind when they exit 0; every
/// other container follows the build behavior.
pub struct FakeRuntime {
    images: Mutex<HashSet<String>>,
    behavior: Mutex<Behavior>,
    install_behavior: Mutex<Behavior>,
    container_output: Mutex<String>,
    calls: Mutex<Vec<String>>,
    containers: Mutex<HashMap<String, ContainerSpec>>,
    entry_scripts: Mutex<Vec<String>>,
    next_id: AtomicUsize,
    kills: AtomicUsize,
    killed: Notify,
    fail_create: AtomicBool,
}

impl FakeRuntime {
    pub fn new(behavior: Behavior) -> Self {
        Self {
            images: Mutex::new(HashSet::new()),
            behavior: Mutex::new(behavior),
            install_behavior: Mutex::new(Behavior::Exit {
                code: 0,
                output: String::new(),
            }),
            container_output: Mutex::new(String::new()),
            calls: Mutex::new(Vec::new()),
            containers: Mutex::new(HashMap::new()),
            entry_scripts: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
            kills: AtomicUsize::new(0),
            killed: Notify::new(),
            fail_create: AtomicBool::new(false),
        }
    }

    pub fn exiting(code: i32, output: &str) -> Self {
        Self::new(Behavior::Exit {
            code,
            output: output.to_string(),
        })
    }

    pub fn set_install_behavior(&self, behavior: Behavior) {
        *locked(&self.install_behavior) = behavior;
    }

    /// Output the container itself printed, outside the log file
    pub fn set_container_output(&self, output: &str) {
        *locked(&self.container_output) = output.to_string();
    }

    pub fn add_image(&self, image: &str) {
        locked(&self.images).insert(image.to_string());
    }

    pub fn has_image(&self, image: &str) -> bool {
        locked(&self.images).contains(image)
    }

    pub fn calls(&self) -> Vec<String> {
        locked(&self.calls).clone()
    }

    pub fn specs(&self) -> Vec<ContainerSpec> {
        let containers = locked(&self.containers);
        let mut ids: Vec<&String> = containers.keys().collect();
        ids.sort();
        ids.into_iter().map(|id| containers[id].clone()).collect()
    }

    /// Entry script of each started container, captured at start
    pub fn entry_scripts(&self) -> Vec<String> {
        locked(&self.entry_scripts).clone()
    }

    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    fn record(&self, call: String) {
        locked(&self.calls).push(call);
    }

    fn work_dir(&self, id: &str) -> Option<PathBuf> {
        locked(&self.containers).get(id).and_then(|spec| {
            spec.mounts
                .iter()
                .find(|m| m.container == "/kiln")
                .map(|m| m.host.clone())
        })
    }

    /// Host path of the script the container was started with
    fn entry_script_path(&self, id: &str) -> Option<PathBuf> {
        let script = locked(&self.containers)
            .get(id)
            .and_then(|spec| spec.command.last().cloned())?;
        let name = script.strip_prefix("/kiln/")?.to_string();
        self.work_dir(id).map(|dir| dir.join(name))
    }

    fn is_install(&self, id: &str) -> bool {
        self.entry_script_path(id)
            .is_some_and(|path| path.ends_with(PREPARE_SCRIPT))
    }

    fn write_output(&self, id: &str, output: &str) -> std::io::Result<()> {
        use std::io::Write;

        if let Some(dir) = self.work_dir(id) {
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(LOG_FILE))?;
            file.write_all(output.as_bytes())?;
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn image_exists(&self, image: &str) -> Result<bool> {
        Ok(self.has_image(image))
    }

    async fn pull(&self, image: &str) -> Result<()> {
        self.record(format!("pull {}", image));
        if image.contains("missing") {
            anyhow::bail!("manifest unknown: {}", image);
        }
        self.add_image(image);
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        self.record(format!("create {}", spec.image));
        if self.fail_create.load(Ordering::SeqCst) {
            anyhow::bail!("cannot create container");
        }
        let id = format!("c{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        locked(&self.containers).insert(id.clone(), spec.clone());
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.record(format!("start {}", id));
        if let Some(path) = self.entry_script_path(id) {
            let script = std::fs::read_to_string(path).unwrap_or_default();
            locked(&self.entry_scripts).push(script);
        }
        Ok(())
    }

    async fn wait(&self, id: &str) -> Result<i32> {
        self.record(format!("wait {}", id));
        let install = self.is_install(id);
        let behavior = if install {
            locked(&self.install_behavior).clone()
        } else {
            locked(&self.behavior).clone()
        };
        match behavior {
            Behavior::Exit { code, output } => {
                self.write_output(id, &output)?;
                if install && code == 0 {
                    if let Some(dir) = self.work_dir(id) {
                        std::fs::write(dir.join(INSTALL_MARKER), "")?;
                    }
                }
                Ok(code)
            }
            Behavior::Hang { output } => {
                self.write_output(id, &output)?;
                self.killed.notified().await;
                Ok(137)
            }
        }
    }

    async fn kill(&self, id: &str) -> Result<()> {
        self.record(format!("kill {}", id));
        self.kills.fetch_add(1, Ordering::SeqCst);
        self.killed.notify_one();
        Ok(())
    }

    async fn commit(&self, id: &str, image: &str) -> Result<()> {
        self.record(format!("commit {} {}", id, image));
        self.add_image(image);
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.record(format!("remove {}", id));
        Ok(())
    }

    async fn logs(&self, _id: &str) -> Result<String> {
        Ok(locked(&self.container_output).clone())
    }
}

// =============================================================================
// Notifier
// =============================================================================

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
    fail: AtomicBool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        locked(&self.sent).clone()
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("relay refused message");
        }
        locked(&self.sent).push(notification.clone());
        Ok(())
    }
}

// =============================================================================
// Job execution
// =============================================================================

/// What the dispatcher handed to an execution
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub job_id: i64,
    pub channel: String,
    pub image: String,
    pub cache_image: Option<String>,
    pub commit_sha: String,
    pub public_key: String,
    pub work_dir: PathBuf,
    pub work_dir_existed: bool,
}

/// Returns a fixed outcome without running anything
pub struct FakeExecution {
    outcome: JobOutcome,
    records: Mutex<Vec<ExecutionRecord>>,
}

impl FakeExecution {
    pub fn new(outcome: JobOutcome) -> Self {
        Self {
            outcome,
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn records(&self) -> Vec<ExecutionRecord> {
        locked(&self.records).clone()
    }
}

#[async_trait]
impl JobExecution for FakeExecution {
    async fn execute(&self, req: ExecutionRequest) -> JobOutcome {
        locked(&self.records).push(ExecutionRecord {
            job_id: req.job_id,
            channel: req.channel.clone(),
            image: req.image.clone(),
            cache_image: req.install.as_ref().map(|i| i.cache_image.clone()),
            commit_sha: req.commit_sha.clone(),
            public_key: req.key.public_key.clone(),
            work_dir_existed: req.work_dir.is_dir(),
            work_dir: req.work_dir,
        });
        self.outcome.clone()
    }
}
