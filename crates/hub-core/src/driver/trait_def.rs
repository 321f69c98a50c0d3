//! The `ContainerDriver` trait -- the abstraction over the underlying
//! container orchestrator.
//!
//! Two very different call shapes live behind one trait: starting a
//! long-running project stack, and running a single one-shot agent to
//! completion. Both are expressed here so the project orchestrator and
//! the workflow engine can share one driver implementation and one
//! configured backend per Hub instance.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Resource limits applied to a one-shot agent invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLimits {
    pub timeout_secs: u64,
    pub memory_mb: Option<u64>,
    pub cpus: Option<f64>,
}

impl Default for AgentLimits {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            memory_mb: None,
            cpus: None,
        }
    }
}

/// Everything needed to bring up one project's multi-container stack.
#[derive(Debug, Clone)]
pub struct StackSpec {
    pub project_slug: String,
    pub fs_path: String,
    pub backend_port: i32,
    pub frontend_port: i32,
    pub db_port: i32,
    pub cache_port: i32,
}

/// The outcome of a single `RunAgent` invocation.
#[derive(Debug, Clone)]
pub struct AgentRunOutcome {
    /// Parsed stdout, expected to be one JSON object per the agent contract.
    pub stdout: Value,
    pub exit_code: i32,
    /// Opaque reference the caller can use to fetch full logs later
    /// (e.g. a container id, a log file path, or a blob store key).
    pub logs_ref: String,
}

/// Abstraction over the container orchestrator driving project stacks and
/// one-shot workflow agents.
///
/// Implementors do not retry; callers (the project orchestrator, the
/// workflow engine) decide whether a failure is transient and worth
/// retrying. This trait is object-safe so it can be stored as
/// `Arc<dyn ContainerDriver>`.
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    /// Human-readable name of this driver (e.g. "docker-compose").
    fn name(&self) -> &str;

    /// Start a project's stack. Returns a driver-opaque handle that must
    /// be passed back to [`Self::stop_stack`].
    async fn start_stack(&self, spec: &StackSpec) -> anyhow::Result<String>;

    /// Stop a previously started stack.
    async fn stop_stack(&self, handle: &str) -> anyhow::Result<()>;

    /// Run a single containerized agent to completion with the given
    /// JSON input and resource limits.
    async fn run_agent(
        &self,
        image: &str,
        input: &Value,
        limits: &AgentLimits,
    ) -> anyhow::Result<AgentRunOutcome>;

    /// Best-effort termination of an in-flight `run_agent` invocation,
    /// identified by the `logs_ref` it was last observed with (the
    /// driver is expected to resolve this back to a container id).
    async fn cancel_agent(&self, logs_ref: &str) -> anyhow::Result<()>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn ContainerDriver) {}
};
