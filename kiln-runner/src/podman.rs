//! Podman container management
//!
//! Handles the container lifecycle for job execution:
//! - Checking podman availability
//! - Pulling images and checking the local image store
//! - Creating, starting and waiting on the build container
//! - Killing stalled containers
//! - Committing prepared environments as cache images

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Output;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Host directory mounted into a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host: PathBuf,
    pub container: String,
    pub read_only: bool,
}

/// Everything needed to create a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub mounts: Vec<Mount>,
    pub workdir: Option<String>,
    /// Overrides the image entrypoint
    pub command: Vec<String>,
}

/// Operations the builder needs from a container engine
///
/// All calls return once the engine has carried them out. Container ids are
/// the engine's own identifiers.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn image_exists(&self, image: &str) -> Result<bool>;

    async fn pull(&self, image: &str) -> Result<()>;

    /// Creates a stopped container and returns its id
    async fn create(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start(&self, id: &str) -> Result<()>;

    /// Blocks until the container exits and returns its exit code
    async fn wait(&self, id: &str) -> Result<i32>;

    /// Kills a container
    ///
    /// Succeeds if the container is already gone or no longer running.
    async fn kill(&self, id: &str) -> Result<()>;

    /// Saves the container's filesystem as an image
    async fn commit(&self, id: &str, image: &str) -> Result<()>;

    async fn remove(&self, id: &str) -> Result<()>;

    /// Output the engine captured for the container's main process
    async fn logs(&self, id: &str) -> Result<String>;
}

/// Checks if podman is installed and available
pub async fn check_podman_available() -> Result<()> {
    let output = Command::new("podman")
        .arg("--version")
        .output()
        .await
        .context("Failed to execute 'podman --version'. Is podman installed?")?;

    if !output.status.success() {
        anyhow::bail!("Podman is not working correctly");
    }

    let version = String::from_utf8_lossy(&output.stdout);
    info!("Podman is available: {}", version.trim());

    Ok(())
}

/// `ContainerRuntime` backed by the podman CLI
#[derive(Debug, Clone)]
pub struct PodmanRuntime {
    binary: String,
}

impl PodmanRuntime {
    pub fn new() -> Self {
        Self {
            binary: "podman".to_string(),
        }
    }

    /// Runs podman with the given arguments and returns its raw output
    async fn exec(&self, args: &[String]) -> Result<Output> {
        debug!("{} {}", self.binary, args.join(" "));

        let output = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to execute podman {}", subcommand(args)))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            debug!("podman stderr: {}", stderr.trim());
        }

        Ok(output)
    }

    /// Runs podman and fails unless it exits successfully
    ///
    /// # Returns
    /// Trimmed stdout
    async fn exec_checked(&self, args: &[String]) -> Result<String> {
        let output = self.exec(args).await?;
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();

        if !output.status.success() {
            let exit_code = output.status.code().unwrap_or(-1);
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "podman {} failed: exit_code={}, stderr='{}'",
                subcommand(args),
                exit_code,
                stderr.trim()
            );
        }

        Ok(stdout)
    }
}

impl Default for PodmanRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for PodmanRuntime {
    async fn image_exists(&self, image: &str) -> Result<bool> {
        let output = self.exec(&args(["image", "exists", image])).await?;

        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            code => anyhow::bail!("podman image exists {} returned {:?}", image, code),
        }
    }

    async fn pull(&self, image: &str) -> Result<()> {
        info!("Pulling image {}", image);
        self.exec_checked(&args(["pull", "--quiet", image]))
            .await
            .with_context(|| format!("Failed to pull image {}", image))?;
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let mut argv = args(["create", "--name", &spec.name]);

        for mount in &spec.mounts {
            let mut volume = format!("{}:{}", mount.host.display(), mount.container);
            if mount.read_only {
                volume.push_str(":ro");
            }
            argv.push("-v".to_string());
            argv.push(volume);
        }

        if let Some(dir) = &spec.workdir {
            argv.push("-w".to_string());
            argv.push(dir.clone());
        }

        if let Some((entrypoint, rest)) = spec.command.split_first() {
            // Override any image entrypoint
            argv.push("--entrypoint".to_string());
            argv.push(entrypoint.clone());
            argv.push(spec.image.clone());
            argv.extend(rest.iter().cloned());
        } else {
            argv.push(spec.image.clone());
        }

        let id = self
            .exec_checked(&argv)
            .await
            .with_context(|| format!("Failed to create container from {}", spec.image))?;

        info!("Container {} created with ID: {}", spec.name, id);
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.exec_checked(&args(["start", id])).await?;
        Ok(())
    }

    async fn wait(&self, id: &str) -> Result<i32> {
        let stdout = self.exec_checked(&args(["wait", id])).await?;
        stdout
            .lines()
            .last()
            .unwrap_or("")
            .trim()
            .parse::<i32>()
            .with_context(|| format!("Unexpected output from podman wait: '{}'", stdout))
    }

    async fn kill(&self, id: &str) -> Result<()> {
        let output = self.exec(&args(["kill", id])).await?;
        if output.status.success() {
            info!("Container {} killed", id);
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).to_lowercase();
        if stderr.contains("no such container") || stderr.contains("not running") {
            debug!("Container {} was already stopped", id);
            return Ok(());
        }

        anyhow::bail!("Failed to kill container {}: {}", id, stderr.trim())
    }

    async fn commit(&self, id: &str, image: &str) -> Result<()> {
        self.exec_checked(&args(["commit", "--quiet", id, image]))
            .await
            .with_context(|| format!("Failed to commit container {} as {}", id, image))?;
        info!("Container {} committed as {}", id, image);
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let output = self.exec(&args(["rm", "-f", id])).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("Failed to remove container {}: {}", id, stderr.trim());
        }
        Ok(())
    }

    async fn logs(&self, id: &str) -> Result<String> {
        let output = self.exec(&args(["logs", id])).await?;
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(text)
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

fn subcommand(args: &[String]) -> &str {
    args.first().map(String::as_str).unwrap_or("")
}

fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore = "requires podman"]
    async fn test_kill_is_idempotent() {
        let runtime = PodmanRuntime::new();
        runtime.kill("kiln-no-such-container").await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires podman"]
    async fn test_run_and_wait() {
        let runtime = PodmanRuntime::new();
        if !runtime.image_exists("docker.io/library/alpine:latest").await.unwrap() {
            runtime.pull("docker.io/library/alpine:latest").await.unwrap();
        }

        let id = runtime
            .create(&ContainerSpec {
                name: format!("kiln-test-{}", uuid::Uuid::new_v4()),
                image: "docker.io/library/alpine:latest".to_string(),
                mounts: Vec::new(),
                workdir: None,
                command: vec!["/bin/sh".into(), "-c".into(), "echo hi; exit 3".into()],
            })
            .await
            .unwrap();
        runtime.start(&id).await.unwrap();

        assert_eq!(runtime.wait(&id).await.unwrap(), 3);
        assert_eq!(runtime.logs(&id).await.unwrap().trim(), "hi");
        runtime.remove(&id).await.unwrap();
    }
}
