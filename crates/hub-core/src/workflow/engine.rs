//! The workflow engine: a DAG scheduler driving one workflow run from
//! PENDING to a terminal status.
//!
//! Readiness is recomputed every tick rather than tracked incrementally
//! (see [`super::state`]); dispatch concurrency is bounded by a
//! `tokio::sync::Semaphore` sized from `WORKER_TOKENS`, mirroring the
//! teacher's fixed worker-token pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tokio::sync::Semaphore;
use uuid::Uuid;

use hub_db::models::{Agent, NodeRun, NodeRunStatus, WorkflowNode, WorkflowRunStatus, WorkflowStatus};
use hub_db::queries::{
    agents as agents_db, node_runs as db, projects as projects_db, workflow_runs as runs_db, workflows as workflows_db,
};

use crate::driver::ContainerDriver;
use crate::events::EventService;

use super::gate;
use super::lifecycle::{self, NodeOutcome};
use super::state::NodeRunStateMachine;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Owns the driver and event service handles shared by every in-flight run.
pub struct WorkflowEngine {
    pool: PgPool,
    driver: Arc<dyn ContainerDriver>,
    events: Arc<EventService>,
    worker_tokens: Arc<Semaphore>,
}

impl WorkflowEngine {
    pub fn new(pool: PgPool, driver: Arc<dyn ContainerDriver>, events: Arc<EventService>, worker_tokens: usize) -> Arc<Self> {
        Arc::new(Self {
            pool,
            driver,
            events,
            worker_tokens: Arc::new(Semaphore::new(worker_tokens.max(1))),
        })
    }

    /// `Trigger(workflowId, context)`. Only ACTIVE workflows may be
    /// triggered. Creates the run and every node run in PENDING, then
    /// spawns the scheduling loop and returns immediately with the run id.
    pub async fn trigger(
        self: &Arc<Self>,
        workflow_id: Uuid,
        trigger_context: serde_json::Value,
        correlation_id: Option<Uuid>,
    ) -> Result<Uuid> {
        let workflow = workflows_db::get_workflow(&self.pool, workflow_id)
            .await?
            .with_context(|| format!("workflow {workflow_id} not found"))?;

        if workflow.status != WorkflowStatus::Active {
            anyhow::bail!("workflow {workflow_id} is not ACTIVE (status: {})", workflow.status);
        }

        let nodes = workflows_db::list_workflow_nodes(&self.pool, workflow_id).await?;
        let run = runs_db::insert_workflow_run(&self.pool, workflow_id, &trigger_context, correlation_id).await?;

        let project = projects_db::get_project(&self.pool, workflow.project_id)
            .await?
            .with_context(|| format!("project {} not found", workflow.project_id))?;

        self.publish_run_event(&project.slug, run.id, "pending").await;

        let node_ids: Vec<Uuid> = nodes.iter().map(|n| n.id).collect();
        db::create_node_runs_for_workflow(&self.pool, run.id, &node_ids).await?;

        runs_db::transition_run_status(&self.pool, run.id, WorkflowRunStatus::Pending, WorkflowRunStatus::Running)
            .await
            .context("failed to transition run to running")?;

        self.publish_run_event(&project.slug, run.id, "running").await;

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.drive(run.id, project.slug).await;
        });

        Ok(run.id)
    }

    /// `Cancel(runId)`. Cancels every non-terminal node run; a RUNNING
    /// node run is left for the driver to confirm termination (best
    /// effort, see [`crate::driver::ContainerDriver::cancel_agent`]).
    pub async fn cancel(&self, run_id: Uuid) -> Result<()> {
        let node_runs = db::list_node_runs_for_run(&self.pool, run_id).await?;
        for nr in &node_runs {
            if nr.status == NodeRunStatus::WaitingApproval {
                gate::auto_reject_for_cancel(&self.pool, nr.id).await?;
            }
            if nr.status == NodeRunStatus::Running {
                if let Some(logs_ref) = &nr.logs_ref {
                    if let Err(e) = self.driver.cancel_agent(logs_ref).await {
                        tracing::warn!(node_run_id = %nr.id, error = %e, "cancel_agent failed");
                    }
                }
                db::mark_running_node_run_cancelled(&self.pool, nr.id).await?;
            }
        }
        db::cancel_non_running_node_runs(&self.pool, run_id).await?;

        let mut transitioned = false;
        for status in [WorkflowRunStatus::Pending, WorkflowRunStatus::Running, WorkflowRunStatus::WaitingApproval] {
            if runs_db::transition_run_status(&self.pool, run_id, status, WorkflowRunStatus::Cancelled)
                .await
                .is_ok()
            {
                transitioned = true;
            }
        }

        if transitioned {
            if let Ok(slug) = self.project_slug_for_run(run_id).await {
                self.publish_run_event(&slug, run_id, "cancelled").await;
            }
        }

        Ok(())
    }

    /// Walk run -> workflow -> project to find the slug a
    /// `hub.<slug>.workflow.*` event should be published under.
    async fn project_slug_for_run(&self, run_id: Uuid) -> Result<String> {
        let run = runs_db::get_workflow_run(&self.pool, run_id)
            .await?
            .with_context(|| format!("workflow run {run_id} not found"))?;
        let workflow = workflows_db::get_workflow(&self.pool, run.workflow_id)
            .await?
            .with_context(|| format!("workflow {} not found", run.workflow_id))?;
        let project = projects_db::get_project(&self.pool, workflow.project_id)
            .await?
            .with_context(|| format!("project {} not found", workflow.project_id))?;
        Ok(project.slug)
    }

    async fn drive(self: Arc<Self>, run_id: Uuid, slug: String) {
        loop {
            match runs_db::get_workflow_run(&self.pool, run_id).await {
                Ok(Some(run)) if run.status.is_terminal() => return,
                Ok(Some(_)) => {}
                Ok(None) => return,
                Err(e) => {
                    tracing::error!(run_id = %run_id, error = %e, "failed to load workflow run");
                    tokio::time::sleep(POLL_INTERVAL).await;
                    continue;
                }
            }

            let ready = match db::get_ready_node_runs(&self.pool, run_id).await {
                Ok(r) => r,
                Err(e) => {
                    tracing::error!(run_id = %run_id, error = %e, "failed to get ready node runs");
                    tokio::time::sleep(POLL_INTERVAL).await;
                    continue;
                }
            };

            if ready.is_empty() {
                if self.maybe_finish(run_id, &slug).await {
                    return;
                }
                tokio::time::sleep(POLL_INTERVAL).await;
                continue;
            }

            for node_run in ready {
                let permit = match Arc::clone(&self.worker_tokens).acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => return,
                };
                let this = Arc::clone(&self);
                let slug = slug.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    this.dispatch(node_run, slug).await;
                });
            }
        }
    }

    /// Promote a single PENDING node run (already ready) through READY and
    /// either the approval gate or direct dispatch.
    async fn dispatch(self: Arc<Self>, node_run: NodeRun, slug: String) {
        if let Err(e) = NodeRunStateMachine::transition(
            &self.pool,
            node_run.id,
            NodeRunStatus::Pending,
            NodeRunStatus::Ready,
            None,
            None,
            None,
            None,
            None,
        )
        .await
        {
            tracing::error!(node_run_id = %node_run.id, error = %e, "failed to promote node run to ready");
            return;
        }

        let node = match self.load_node(node_run.node_id).await {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(node_run_id = %node_run.id, error = %e, "failed to load workflow node");
                return;
            }
        };
        let agent = match agents_db::get_agent(&self.pool, node.agent_id).await {
            Ok(Some(a)) => a,
            Ok(None) => {
                tracing::error!(node_run_id = %node_run.id, agent_id = %node.agent_id, "referenced agent missing");
                return;
            }
            Err(e) => {
                tracing::error!(node_run_id = %node_run.id, error = %e, "failed to load agent");
                return;
            }
        };

        if gate::requires_approval(&node, &agent) {
            if let Err(e) = gate::request_approval(&self.pool, &self.events, &slug, node_run.id).await {
                tracing::error!(node_run_id = %node_run.id, error = %e, "failed to request approval");
            }
            return;
        }

        self.run_and_settle(node_run, node, agent, &slug).await;
    }

    async fn run_and_settle(&self, node_run: NodeRun, node: WorkflowNode, agent: Agent, slug: &str) {
        let upstream_outputs = match self.collect_upstream_outputs(node_run.workflow_run_id).await {
            Ok(o) => o,
            Err(e) => {
                tracing::error!(node_run_id = %node_run.id, error = %e, "failed to collect upstream outputs");
                return;
            }
        };

        match lifecycle::execute(&self.pool, &self.driver, &node, &agent, &node_run, &upstream_outputs).await {
            Ok(NodeOutcome::Succeeded) => {
                self.publish_node_event(slug, node_run.workflow_run_id, node.id, "succeeded").await;
            }
            Ok(NodeOutcome::Failed) => {
                self.publish_node_event(slug, node_run.workflow_run_id, node.id, "failed").await;
                self.maybe_retry(&node_run, &node).await;
            }
            Err(e) => {
                tracing::error!(node_run_id = %node_run.id, error = %e, "node run execution failed with an infrastructure error");
            }
        }
    }

    async fn maybe_retry(&self, node_run: &NodeRun, node: &WorkflowNode) {
        if node_run.attempt + 1 >= node.retry_max_attempts {
            return;
        }

        let delay_ms = (node.retry_backoff_base_ms as u64)
            .saturating_mul(1u64 << node_run.attempt.max(0) as u32)
            .min(node.retry_backoff_cap_ms as u64);

        tracing::info!(node_run_id = %node_run.id, attempt = node_run.attempt, delay_ms, "scheduling retry");
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;

        if let Err(e) = db::retry_node_run_to_pending(&self.pool, node_run.id, node_run.attempt).await {
            tracing::error!(node_run_id = %node_run.id, error = %e, "failed to retry node run");
        }
    }

    async fn collect_upstream_outputs(&self, workflow_run_id: Uuid) -> Result<HashMap<String, serde_json::Value>> {
        let run = runs_db::get_workflow_run(&self.pool, workflow_run_id)
            .await?
            .context("workflow run disappeared mid-execution")?;
        let nodes = workflows_db::list_workflow_nodes(&self.pool, run.workflow_id).await?;
        let node_key_by_id: HashMap<Uuid, String> = nodes.into_iter().map(|n| (n.id, n.node_key)).collect();

        let node_runs = db::list_node_runs_for_run(&self.pool, workflow_run_id).await?;
        let mut outputs = HashMap::new();
        for nr in node_runs {
            if !matches!(nr.status, NodeRunStatus::Succeeded | NodeRunStatus::Skipped) {
                continue;
            }
            if let (Some(key), Some(output)) = (node_key_by_id.get(&nr.node_id), nr.output_snapshot) {
                outputs.insert(key.clone(), output);
            }
        }
        Ok(outputs)
    }

    async fn load_node(&self, node_id: Uuid) -> Result<WorkflowNode> {
        sqlx::query_as::<_, WorkflowNode>("SELECT * FROM workflow_nodes WHERE id = $1")
            .bind(node_id)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("failed to load workflow node {node_id}"))
    }

    /// Check run-level termination: SUCCEEDED when every node run is
    /// SUCCEEDED or SKIPPED, FAILED when any node run is FAILED and none
    /// are left runnable. Returns `true` if the run reached a terminal
    /// status this call.
    async fn maybe_finish(&self, run_id: Uuid, slug: &str) -> bool {
        let progress = match db::get_run_progress(&self.pool, run_id).await {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(run_id = %run_id, error = %e, "failed to get run progress");
                return false;
            }
        };

        let runnable = progress.pending + progress.ready + progress.running + progress.waiting_approval;
        if runnable > 0 {
            return false;
        }

        let (to, state) = if progress.failed > 0 {
            (WorkflowRunStatus::Failed, "failed")
        } else {
            (WorkflowRunStatus::Succeeded, "succeeded")
        };

        match runs_db::transition_run_status(&self.pool, run_id, WorkflowRunStatus::Running, to).await {
            Ok(_) => {
                self.publish_run_event(slug, run_id, state).await;
                true
            }
            Err(e) => {
                tracing::error!(run_id = %run_id, error = %e, "failed to transition run to terminal status");
                false
            }
        }
    }

    async fn publish_run_event(&self, slug: &str, run_id: Uuid, state: &str) {
        let subject = format!("hub.{slug}.workflow.{run_id}.{state}");
        if let Err(e) = self
            .events
            .publish(&subject, &serde_json::json!({"run_id": run_id, "state": state}), "workflow-engine", None)
            .await
        {
            tracing::warn!(subject, error = %e, "failed to publish run event");
        }
    }

    async fn publish_node_event(&self, slug: &str, run_id: Uuid, node_id: Uuid, state: &str) {
        let subject = format!("hub.{slug}.workflow.{run_id}.{node_id}.{state}");
        if let Err(e) = self
            .events
            .publish(&subject, &serde_json::json!({"node_id": node_id, "state": state}), "workflow-engine", None)
            .await
        {
            tracing::warn!(subject, error = %e, "failed to publish node event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_run(attempt: i32) -> NodeRun {
        NodeRun {
            id: Uuid::new_v4(),
            workflow_run_id: Uuid::new_v4(),
            node_id: Uuid::new_v4(),
            status: NodeRunStatus::Failed,
            attempt,
            input_snapshot: None,
            output_snapshot: None,
            logs_ref: None,
            exit_code: None,
            last_error: None,
            created_at: chrono::Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    fn node(max_attempts: i32, base_ms: i32, cap_ms: i32) -> WorkflowNode {
        WorkflowNode {
            id: Uuid::new_v4(),
            workflow_id: Uuid::new_v4(),
            node_key: "n".to_string(),
            agent_id: Uuid::new_v4(),
            action: "run".to_string(),
            static_input_template: serde_json::json!({}),
            approval_required: false,
            retry_max_attempts: max_attempts,
            retry_backoff_base_ms: base_ms,
            retry_backoff_cap_ms: cap_ms,
            on_failure: None,
        }
    }

    #[test]
    fn backoff_doubles_per_attempt_and_caps() {
        let n = node(10, 1000, 5000);
        let nr0 = node_run(0);
        let delay0 = (n.retry_backoff_base_ms as u64).saturating_mul(1u64 << nr0.attempt.max(0) as u32).min(n.retry_backoff_cap_ms as u64);
        assert_eq!(delay0, 1000);

        let nr2 = node_run(2);
        let delay2 = (n.retry_backoff_base_ms as u64).saturating_mul(1u64 << nr2.attempt.max(0) as u32).min(n.retry_backoff_cap_ms as u64);
        assert_eq!(delay2, 4000);

        let nr5 = node_run(5);
        let delay5 = (n.retry_backoff_base_ms as u64).saturating_mul(1u64 << nr5.attempt.max(0) as u32).min(n.retry_backoff_cap_ms as u64);
        assert_eq!(delay5, 5000);
    }

    #[test]
    fn default_max_attempts_means_no_retry() {
        let n = node(1, 1000, 60_000);
        let nr = node_run(0);
        assert!(nr.attempt + 1 >= n.retry_max_attempts);
    }
}
