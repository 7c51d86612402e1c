//! Builder
//!
//! Runs one job in containers: prepares the working directory and key
//! material, picks the base or cached image, then starts each container and
//! waits for it. Every container id is handed to the tailer as soon as the
//! container exists.
//!
//! Without an install step, or when its cached image exists, a single
//! container checks out the commit and runs the build. On a cache miss the
//! job takes two containers: the first checks out the commit and runs the
//! install script, and is committed as the cache image only if it exits 0;
//! the second starts from that image and runs the build against the same
//! checkout. Nothing the build does ever reaches the cache.
//!
//! The working directory is mounted at `/kiln`:
//! - `run.sh`: generated entry script of the build container
//! - `prepare.sh`: generated entry script of the install container
//! - `install.sh`, `build.sh`: the hook's scripts
//! - `script.log`: combined output of everything the entry scripts run
//! - `src/`: the checkout
//!
//! Key material lives in a separate directory mounted read-only at
//! `/kiln-keys` and is deleted as soon as the checkout container exits.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use kiln_core::domain::job::JobOutcome;
use tokio::io::AsyncWriteExt;
use tokio::sync::{OwnedMutexGuard, mpsc};
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use crate::podman::{ContainerRuntime, ContainerSpec, Mount};

pub const LOG_FILE: &str = "script.log";
pub const INSTALL_MARKER: &str = ".installed";
pub const PREPARE_SCRIPT: &str = "prepare.sh";
const ENTRY_SCRIPT: &str = "run.sh";
const BUILD_SCRIPT: &str = "build.sh";
const INSTALL_SCRIPT: &str = "install.sh";
const KEY_FILE: &str = "id_ed25519";
const PASSPHRASE_FILE: &str = "passphrase";

/// Upper bound for unlocking the deploy key inside the container
const UNLOCK_TIMEOUT_SECS: u64 = 30;

/// Environment preparation whose result is cached as an image
#[derive(Debug, Clone)]
pub struct InstallStep {
    pub script: String,
    /// Image the install container is committed as
    pub cache_image: String,
}

/// What one container of a job does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Check out the commit, then build
    CheckoutAndBuild,
    /// Check out the commit, then run the install script
    Install,
    /// Build an existing checkout
    Build,
}

impl Stage {
    /// Entry script file under `/kiln`
    pub fn script_name(self) -> &'static str {
        match self {
            Stage::Install => PREPARE_SCRIPT,
            Stage::CheckoutAndBuild | Stage::Build => ENTRY_SCRIPT,
        }
    }

    fn checks_out(self) -> bool {
        !matches!(self, Stage::Build)
    }
}

/// Everything the builder needs for one job
pub struct BuildRequest {
    pub job_id: i64,
    pub image: String,
    pub build_script: String,
    pub install: Option<InstallStep>,
    pub clone_url: String,
    pub commit_sha: String,
    /// Encrypted OpenSSH private key
    pub private_key: Zeroizing<String>,
    pub passphrase: Zeroizing<String>,
    /// Empty directory owned by the caller
    pub work_dir: PathBuf,
}

/// Per-key async locks
///
/// Serializes population of each cache image so two jobs never install and
/// commit the same environment at once.
#[derive(Default)]
pub struct CacheLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl CacheLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            // Entries only referenced by the map are idle
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(key.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

pub struct Builder {
    runtime: Arc<dyn ContainerRuntime>,
    cache_locks: Arc<CacheLocks>,
    clone_timeout: Duration,
}

impl Builder {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        cache_locks: Arc<CacheLocks>,
        clone_timeout: Duration,
    ) -> Self {
        Self {
            runtime,
            cache_locks,
            clone_timeout,
        }
    }

    /// Runs the job and returns its outcome
    ///
    /// Never fails: faults become exit code 1 with the diagnostic appended
    /// to the log. Each container id is sent on `handoff` right after the
    /// container is created; the sender is dropped when the job is done.
    pub async fn run(&self, req: BuildRequest, handoff: mpsc::Sender<String>) -> JobOutcome {
        let log_path = req.work_dir.join(LOG_FILE);

        let result = self.execute(&req, &handoff).await;
        drop(handoff);

        match result {
            Ok(exit_code) => {
                info!(job_id = req.job_id, exit_code, "Build finished");
                JobOutcome::new(exit_code, read_log(&log_path).await)
            }
            Err(e) => {
                error!(job_id = req.job_id, "Build failed: {:#}", e);
                let diagnostic = format!("kiln: {:#}\n", e);
                let mut output = read_log(&log_path).await;
                if let Err(io) = append_log(&log_path, &diagnostic).await {
                    warn!(job_id = req.job_id, "Failed to record diagnostic: {}", io);
                }
                output.push_str(&diagnostic);
                JobOutcome::new(1, output)
            }
        }
    }

    async fn execute(&self, req: &BuildRequest, handoff: &mpsc::Sender<String>) -> Result<i32> {
        let keys = write_key_material(req).await?;

        let mut cache_guard = None;
        let mut install = None;
        let image = match &req.install {
            Some(step) => {
                let guard = self.cache_locks.lock(&step.cache_image).await;
                if self.runtime.image_exists(&step.cache_image).await? {
                    info!(job_id = req.job_id, image = %step.cache_image, "Using cached environment");
                    step.cache_image.clone()
                } else {
                    info!(job_id = req.job_id, image = %step.cache_image, "Cache miss, installing");
                    cache_guard = Some(guard);
                    install = Some(step);
                    req.image.clone()
                }
            }
            None => req.image.clone(),
        };

        write_workspace(req, install.map(|i| i.script.as_str()), self.clone_timeout).await?;

        if !self.runtime.image_exists(&image).await? {
            self.runtime.pull(&image).await?;
        }

        let checkout = if install.is_some() {
            Stage::Install
        } else {
            Stage::CheckoutAndBuild
        };
        let spec = container_spec(req, image, checkout, Some(keys.path()));
        let commit_as = install.map(|i| i.cache_image.as_str());
        let result = self.run_container(req, &spec, handoff, commit_as).await;

        if let Err(e) = keys.close() {
            warn!(job_id = req.job_id, "Failed to delete key material: {}", e);
        }
        let exit_code = result?;

        let Some(install) = install else {
            return Ok(exit_code);
        };
        drop(cache_guard);
        if exit_code != 0 {
            info!(job_id = req.job_id, exit_code, "Install failed, nothing cached");
            return Ok(exit_code);
        }

        let spec = container_spec(req, install.cache_image.clone(), Stage::Build, None);
        self.run_container(req, &spec, handoff, None).await
    }

    /// Creates, runs and removes one container
    ///
    /// With `commit_as`, a container that exits 0 after completing the
    /// install is committed under that image name before removal.
    async fn run_container(
        &self,
        req: &BuildRequest,
        spec: &ContainerSpec,
        handoff: &mpsc::Sender<String>,
        commit_as: Option<&str>,
    ) -> Result<i32> {
        let id = self.runtime.create(spec).await?;
        if handoff.send(id.clone()).await.is_err() {
            debug!(job_id = req.job_id, container = %id, "Nobody is waiting for the container id");
        }

        let result = self.start_and_wait(req, &id, commit_as).await;

        if let Err(e) = self.runtime.remove(&id).await {
            warn!(job_id = req.job_id, container = %id, "Failed to remove container: {:#}", e);
        }
        result
    }

    async fn start_and_wait(&self, req: &BuildRequest, id: &str, commit_as: Option<&str>) -> Result<i32> {
        self.runtime.start(id).await?;
        let exit_code = self.runtime.wait(id).await?;

        if exit_code != 0 {
            self.record_container_output(req, id).await;
        }

        if let Some(cache_image) = commit_as {
            if exit_code == 0 {
                if !req.work_dir.join(INSTALL_MARKER).exists() {
                    anyhow::bail!("install step did not complete");
                }
                self.runtime
                    .commit(id, cache_image)
                    .await
                    .context("cannot cache environment")?;
                info!(job_id = req.job_id, image = %cache_image, "Cached environment");
            }
        }

        Ok(exit_code)
    }

    /// Copies what the container printed outside the log file into it
    ///
    /// The entry script redirects itself into the log first thing, so
    /// anything here means the shell failed before or around that point.
    async fn record_container_output(&self, req: &BuildRequest, id: &str) {
        let output = match self.runtime.logs(id).await {
            Ok(output) => output,
            Err(e) => {
                debug!(job_id = req.job_id, container = %id, "No container output: {:#}", e);
                return;
            }
        };
        if output.trim().is_empty() {
            return;
        }

        let mut text = format!("kiln: container output:\n{}", output);
        if !text.ends_with('\n') {
            text.push('\n');
        }
        if let Err(e) = append_log(&req.work_dir.join(LOG_FILE), &text).await {
            warn!(job_id = req.job_id, "Failed to record container output: {}", e);
        }
    }
}

/// Renders the entry script of one stage
///
/// Output of every step goes to `script.log`. Unlocking the key and
/// cloning run under `timeout` and non-interactively, so a bad passphrase
/// or an unreachable host ends the container with exit code 1.
pub fn entry_script(clone_url: &str, commit_sha: &str, clone_timeout: Duration, stage: Stage) -> String {
    let mut script = format!(
        r#"#!/bin/sh
exec >>/kiln/{log} 2>&1

fail() {{
    echo "kiln: $*"
    exit 1
}}
"#,
        log = LOG_FILE,
    );

    if stage.checks_out() {
        script.push_str(&checkout_commands(clone_url, commit_sha, clone_timeout));
    } else {
        script.push_str("\ncd /kiln/src || fail \"checkout missing\"\n");
    }

    match stage {
        Stage::Install => script.push_str(&format!(
            "sh /kiln/{} || exit $?\ntouch /kiln/{}\n",
            INSTALL_SCRIPT, INSTALL_MARKER
        )),
        Stage::CheckoutAndBuild | Stage::Build => {
            script.push_str(&format!("exec sh /kiln/{}\n", BUILD_SCRIPT))
        }
    }

    script
}

fn checkout_commands(clone_url: &str, commit_sha: &str, clone_timeout: Duration) -> String {
    format!(
        r#"
mkdir -p /tmp/kiln-ssh && chmod 700 /tmp/kiln-ssh || fail "cannot prepare ssh directory"
cp /kiln-keys/{key} /tmp/kiln-ssh/{key} || fail "cannot read deploy key"
chmod 600 /tmp/kiln-ssh/{key}
timeout {unlock} ssh-keygen -q -p -P "$(cat /kiln-keys/{pass})" -N '' -f /tmp/kiln-ssh/{key} </dev/null >/dev/null \
    || fail "cannot unlock deploy key"

export GIT_TERMINAL_PROMPT=0
export GIT_SSH_COMMAND="ssh -i /tmp/kiln-ssh/{key} -o BatchMode=yes -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null"

timeout {clone} git clone --quiet {url} /kiln/src </dev/null || fail "cannot clone repository"
cd /kiln/src || fail "checkout missing"
timeout {clone} git checkout --quiet {sha} </dev/null || fail "cannot check out commit"
rm -f /tmp/kiln-ssh/{key}
"#,
        key = KEY_FILE,
        pass = PASSPHRASE_FILE,
        unlock = UNLOCK_TIMEOUT_SECS,
        clone = clone_timeout.as_secs().max(1),
        url = shell_quote(clone_url),
        sha = shell_quote(commit_sha),
    )
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Quotes a value for POSIX sh
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

fn container_spec(req: &BuildRequest, image: String, stage: Stage, keys: Option<&Path>) -> ContainerSpec {
    let mut mounts = vec![Mount {
        host: req.work_dir.clone(),
        container: "/kiln".to_string(),
        read_only: false,
    }];
    if let Some(keys) = keys {
        mounts.push(Mount {
            host: keys.to_path_buf(),
            container: "/kiln-keys".to_string(),
            read_only: true,
        });
    }

    ContainerSpec {
        name: format!("kiln-job-{}-{}", req.job_id, short_id()),
        image,
        mounts,
        workdir: Some("/kiln".to_string()),
        command: vec!["/bin/sh".to_string(), format!("/kiln/{}", stage.script_name())],
    }
}

async fn write_workspace(
    req: &BuildRequest,
    install_script: Option<&str>,
    clone_timeout: Duration,
) -> Result<()> {
    let dir = &req.work_dir;
    let (url, sha) = (req.clone_url.as_str(), req.commit_sha.as_str());

    match install_script {
        Some(install) => {
            tokio::fs::write(
                dir.join(PREPARE_SCRIPT),
                entry_script(url, sha, clone_timeout, Stage::Install),
            )
            .await
            .context("Failed to write install entry script")?;
            tokio::fs::write(
                dir.join(ENTRY_SCRIPT),
                entry_script(url, sha, clone_timeout, Stage::Build),
            )
            .await
            .context("Failed to write entry script")?;
            tokio::fs::write(dir.join(INSTALL_SCRIPT), install)
                .await
                .context("Failed to write install script")?;
        }
        None => {
            tokio::fs::write(
                dir.join(ENTRY_SCRIPT),
                entry_script(url, sha, clone_timeout, Stage::CheckoutAndBuild),
            )
            .await
            .context("Failed to write entry script")?;
        }
    }
    tokio::fs::write(dir.join(BUILD_SCRIPT), &req.build_script)
        .await
        .context("Failed to write build script")?;
    // Exists up front so the tailer never races its creation
    tokio::fs::File::create(dir.join(LOG_FILE))
        .await
        .context("Failed to create log file")?;

    Ok(())
}

async fn write_key_material(req: &BuildRequest) -> Result<tempfile::TempDir> {
    let keys = tempfile::Builder::new()
        .prefix(&format!("kiln-keys-{}-", req.job_id))
        .tempdir()
        .context("Failed to create key directory")?;

    write_private(&keys.path().join(KEY_FILE), req.private_key.as_bytes()).await?;
    write_private(&keys.path().join(PASSPHRASE_FILE), req.passphrase.as_bytes()).await?;

    Ok(keys)
}

async fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    tokio::fs::write(path, contents)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .await
            .with_context(|| format!("Failed to restrict {}", path.display()))?;
    }

    Ok(())
}

async fn read_log(path: &Path) -> String {
    match tokio::fs::read(path).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            debug!("No log at {}: {}", path.display(), e);
            String::new()
        }
    }
}

async fn append_log(path: &Path, text: &str) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(text.as_bytes()).await?;
    file.flush().await
}
