//! Docker Compose-backed container driver.
//!
//! Project stacks are started with `docker compose -p <slug> up -d`
//! against the project's own `docker-compose.yml`, with port overrides
//! passed through the environment. One-shot agents are run with
//! `docker run --rm`, fed their JSON input on stdin, with stdout captured
//! and parsed as the agent's output.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::trait_def::{AgentLimits, AgentRunOutcome, ContainerDriver, StackSpec};

/// Driver that shells out to the `docker` and `docker compose` CLIs.
#[derive(Debug, Clone)]
pub struct DockerDriver {
    /// Directory under which `docker compose` is invoked, one
    /// subdirectory per project slug (`{base}/{slug}`).
    compose_root: std::path::PathBuf,
}

impl DockerDriver {
    pub fn new(compose_root: impl Into<std::path::PathBuf>) -> Self {
        Self {
            compose_root: compose_root.into(),
        }
    }

    fn project_dir(&self, slug: &str) -> std::path::PathBuf {
        self.compose_root.join(slug)
    }
}

#[async_trait]
impl ContainerDriver for DockerDriver {
    fn name(&self) -> &str {
        "docker-compose"
    }

    async fn start_stack(&self, spec: &StackSpec) -> Result<String> {
        let project_dir = self.project_dir(&spec.project_slug);

        let output = Command::new("docker")
            .args(["compose", "-p", &spec.project_slug, "up", "-d"])
            .current_dir(&project_dir)
            .env("HUB_BACKEND_PORT", spec.backend_port.to_string())
            .env("HUB_FRONTEND_PORT", spec.frontend_port.to_string())
            .env("HUB_DB_PORT", spec.db_port.to_string())
            .env("HUB_CACHE_PORT", spec.cache_port.to_string())
            .env("HUB_FS_PATH", &spec.fs_path)
            .output()
            .await
            .with_context(|| format!("failed to run docker compose up for {}", spec.project_slug))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("docker compose up failed for {}: {stderr}", spec.project_slug);
        }

        // The compose project name doubles as the driver-opaque handle;
        // `stop_stack` looks it back up with `docker compose -p <handle> down`.
        Ok(spec.project_slug.clone())
    }

    async fn stop_stack(&self, handle: &str) -> Result<()> {
        let project_dir = self.project_dir(handle);

        let output = Command::new("docker")
            .args(["compose", "-p", handle, "down"])
            .current_dir(&project_dir)
            .output()
            .await
            .with_context(|| format!("failed to run docker compose down for {handle}"))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("docker compose down failed for {handle}: {stderr}");
        }

        Ok(())
    }

    async fn run_agent(
        &self,
        image: &str,
        input: &serde_json::Value,
        limits: &AgentLimits,
    ) -> Result<AgentRunOutcome> {
        let mut child = Command::new("docker")
            .args(["run", "--rm", "-i", "--network", "none"])
            .args(memory_flags(limits))
            .args(cpu_flags(limits))
            .arg(image)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn docker run for image {image}"))?;

        if let Some(mut stdin) = child.stdin.take() {
            let payload = serde_json::to_vec(input).context("failed to serialize agent input")?;
            stdin
                .write_all(&payload)
                .await
                .context("failed to write agent input to stdin")?;
        }

        let logs_ref = format!("docker-run:{image}:{}", uuid::Uuid::new_v4());

        let timeout = Duration::from_secs(limits.timeout_secs);
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.context("failed to wait for agent container")?,
            Err(_elapsed) => {
                bail!("agent container for image {image} timed out after {timeout:?}");
            }
        };

        let stdout_text = String::from_utf8_lossy(&output.stdout);
        let stdout: serde_json::Value = serde_json::from_str(stdout_text.trim())
            .with_context(|| format!("agent stdout was not valid JSON: {stdout_text}"))?;

        Ok(AgentRunOutcome {
            stdout,
            exit_code: output.status.code().unwrap_or(-1),
            logs_ref,
        })
    }

    async fn cancel_agent(&self, logs_ref: &str) -> Result<()> {
        // `logs_ref` does not carry a real container id in this driver
        // (docker run --rm containers aren't named), so cancellation
        // here is advisory logging; the timeout path in `run_agent`
        // performs the actual termination via child.wait_with_output's
        // drop.
        tracing::warn!(logs_ref, "cancel_agent requested but docker run --rm containers are unnamed; relying on timeout");
        Ok(())
    }
}

fn memory_flags(limits: &AgentLimits) -> Vec<String> {
    match limits.memory_mb {
        Some(mb) => vec!["--memory".to_string(), format!("{mb}m")],
        None => vec![],
    }
}

fn cpu_flags(limits: &AgentLimits) -> Vec<String> {
    match limits.cpus {
        Some(cpus) => vec!["--cpus".to_string(), cpus.to_string()],
        None => vec![],
    }
}

#[allow(dead_code)]
fn env_map(spec: &StackSpec) -> HashMap<&'static str, String> {
    let mut env = HashMap::new();
    env.insert("HUB_BACKEND_PORT", spec.backend_port.to_string());
    env.insert("HUB_FRONTEND_PORT", spec.frontend_port.to_string());
    env.insert("HUB_DB_PORT", spec.db_port.to_string());
    env.insert("HUB_CACHE_PORT", spec.cache_port.to_string());
    env
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_flags_empty_when_unset() {
        let limits = AgentLimits::default();
        assert!(memory_flags(&limits).is_empty());
    }

    #[test]
    fn memory_flags_set_when_configured() {
        let limits = AgentLimits {
            memory_mb: Some(512),
            ..AgentLimits::default()
        };
        assert_eq!(memory_flags(&limits), vec!["--memory", "512m"]);
    }

    #[test]
    fn env_map_contains_all_four_ports() {
        let spec = StackSpec {
            project_slug: "demo".to_string(),
            fs_path: "/tmp/demo".to_string(),
            backend_port: 8001,
            frontend_port: 3001,
            db_port: 5501,
            cache_port: 6401,
        };
        let env = env_map(&spec);
        assert_eq!(env.len(), 4);
        assert_eq!(env["HUB_BACKEND_PORT"], "8001");
    }
}
