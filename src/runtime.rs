//! Container runtime collaborator.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::RuntimeError;

/// Starts and stops isolated workloads.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Start `template_id` under `name` with `host_port` forwarded to
    /// `internal_port`. Returns the runtime's id for the new instance.
    ///
    /// `name` is chosen by the caller, so a spawn that never answers can
    /// still be stopped by name.
    async fn spawn(
        &self,
        name: &str,
        template_id: &str,
        host_port: u16,
        internal_port: u16,
    ) -> Result<String, RuntimeError>;

    async fn stop(&self, instance_id: &str) -> Result<(), RuntimeError>;
}

/// Drives the `docker` CLI. Containers run with `--rm`, so stopping one also removes it.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    binary: String,
}

impl DockerRuntime {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String, RuntimeError> {
        debug!(binary = %self.binary, ?args, "invoking runtime");
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(RuntimeError::NonZeroExit {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl Default for DockerRuntime {
    fn default() -> Self {
        Self::new("docker")
    }
}

#[async_trait]
impl Runtime for DockerRuntime {
    async fn spawn(
        &self,
        name: &str,
        template_id: &str,
        host_port: u16,
        internal_port: u16,
    ) -> Result<String, RuntimeError> {
        let mapping = format!("{}:{}", host_port, internal_port);
        let stdout = self
            .run(&["run", "--rm", "-d", "--name", name, "-p", &mapping, template_id])
            .await?;
        let instance_id = stdout.lines().last().unwrap_or_default().trim().to_string();
        if instance_id.is_empty() {
            return Err(RuntimeError::MissingId);
        }
        info!(instance_id = %instance_id, template_id, host_port, "container started");
        Ok(instance_id)
    }

    async fn stop(&self, instance_id: &str) -> Result<(), RuntimeError> {
        self.run(&["stop", instance_id]).await?;
        info!(instance_id, "container stopped");
        Ok(())
    }
}
