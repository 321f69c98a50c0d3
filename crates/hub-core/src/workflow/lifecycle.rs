//! Single node run execution: resolve input, validate, dispatch to the
//! container driver, validate output, persist.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use sqlx::PgPool;

use hub_db::models::{Agent, NodeRun, NodeRunStatus, WorkflowNode};
use hub_db::queries::node_runs as db;

use crate::driver::{AgentLimits, ContainerDriver};

use super::state::NodeRunStateMachine;

/// Resolve `$nodes.<node_key>.output.<path>` references inside
/// `template` against `upstream_outputs` (keyed by node_key), recursively
/// walking objects and arrays. Any other value is copied as-is.
pub fn resolve_input(template: &Value, upstream_outputs: &HashMap<String, Value>) -> Result<Value, String> {
    match template {
        Value::String(s) if s.starts_with("$nodes.") => resolve_reference(s, upstream_outputs),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), resolve_input(v, upstream_outputs)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(resolve_input(item, upstream_outputs)?);
            }
            Ok(Value::Array(out))
        }
        other => Ok(other.clone()),
    }
}

fn resolve_reference(expr: &str, upstream_outputs: &HashMap<String, Value>) -> Result<Value, String> {
    let rest = expr.strip_prefix("$nodes.").ok_or_else(|| format!("malformed reference {expr:?}"))?;
    let mut parts = rest.splitn(2, '.');
    let node_key = parts.next().ok_or_else(|| format!("malformed reference {expr:?}"))?;
    let tail = parts.next().ok_or_else(|| format!("reference {expr:?} is missing a path"))?;

    let path = tail
        .strip_prefix("output")
        .ok_or_else(|| format!("reference {expr:?} must address .output"))?;

    let output = upstream_outputs
        .get(node_key)
        .ok_or_else(|| format!("reference {expr:?} addresses unknown or not-yet-succeeded node {node_key:?}"))?;

    let path = path.strip_prefix('.').unwrap_or(path);
    if path.is_empty() {
        return Ok(output.clone());
    }

    navigate(output, path).ok_or_else(|| format!("reference {expr:?} does not resolve against node {node_key:?}'s output"))
}

fn navigate(value: &Value, path: &str) -> Option<Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = match (current, segment.parse::<usize>()) {
            (Value::Array(items), Ok(idx)) => items.get(idx)?,
            (Value::Object(map), _) => map.get(segment)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

/// Outcome of executing one node run, for the engine's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeOutcome {
    Succeeded,
    Failed,
}

/// Execute a single READY node run to completion (success or failure).
/// Returns `Err` only for infrastructure failures (DB errors); business
/// failures -- bad input references, schema mismatches, a nonzero agent
/// exit code, a driver error -- are persisted as a FAILED node run and
/// reported back as `Ok(NodeOutcome::Failed)`.
pub async fn execute(
    pool: &PgPool,
    driver: &Arc<dyn ContainerDriver>,
    node: &WorkflowNode,
    agent: &Agent,
    node_run: &NodeRun,
    upstream_outputs: &HashMap<String, Value>,
) -> Result<NodeOutcome> {
    let input = match resolve_input(&node.static_input_template, upstream_outputs) {
        Ok(v) => v,
        Err(msg) => return fail_before_dispatch(pool, node_run, &msg).await,
    };

    if let Err(msg) = super::schema::validate(&input, &agent.input_schema) {
        return fail_before_dispatch(pool, node_run, &format!("input schema validation failed: {msg}")).await;
    }

    db::set_input_snapshot(pool, node_run.id, &input)
        .await
        .context("failed to persist input snapshot")?;

    NodeRunStateMachine::transition(
        pool,
        node_run.id,
        NodeRunStatus::Ready,
        NodeRunStatus::Running,
        Some(Utc::now()),
        None,
        None,
        None,
        None,
    )
    .await
    .context("failed to transition node run to running")?;

    let outcome = driver.run_agent(&agent.image, &input, &AgentLimits::default()).await;

    match outcome {
        Ok(run) => {
            db::set_logs_ref(pool, node_run.id, &run.logs_ref)
                .await
                .context("failed to persist logs_ref")?;

            if run.exit_code != 0 {
                return fail_after_dispatch(
                    pool,
                    node_run,
                    &format!("agent exited with code {}", run.exit_code),
                    Some(run.exit_code),
                )
                .await;
            }

            if let Err(msg) = super::schema::validate(&run.stdout, &agent.output_schema) {
                return fail_after_dispatch(
                    pool,
                    node_run,
                    &format!("output schema validation failed: {msg}"),
                    Some(run.exit_code),
                )
                .await;
            }

            NodeRunStateMachine::transition(
                pool,
                node_run.id,
                NodeRunStatus::Running,
                NodeRunStatus::Succeeded,
                None,
                Some(Utc::now()),
                Some(&run.stdout),
                Some(run.exit_code),
                None,
            )
            .await
            .context("failed to transition node run to succeeded")?;

            Ok(NodeOutcome::Succeeded)
        }
        Err(e) => {
            tracing::warn!(node_run_id = %node_run.id, error = %e, "run_agent failed");
            fail_after_dispatch(pool, node_run, &e.to_string(), None).await
        }
    }
}

async fn fail_before_dispatch(pool: &PgPool, node_run: &NodeRun, message: &str) -> Result<NodeOutcome> {
    NodeRunStateMachine::transition(
        pool,
        node_run.id,
        NodeRunStatus::Ready,
        NodeRunStatus::Failed,
        None,
        Some(Utc::now()),
        None,
        None,
        Some(message),
    )
    .await
    .context("failed to transition node run to failed")?;
    Ok(NodeOutcome::Failed)
}

async fn fail_after_dispatch(pool: &PgPool, node_run: &NodeRun, message: &str, exit_code: Option<i32>) -> Result<NodeOutcome> {
    NodeRunStateMachine::transition(
        pool,
        node_run.id,
        NodeRunStatus::Running,
        NodeRunStatus::Failed,
        None,
        Some(Utc::now()),
        None,
        exit_code,
        Some(message),
    )
    .await
    .context("failed to transition node run to failed")?;
    Ok(NodeOutcome::Failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolves_top_level_output_reference() {
        let mut outputs = HashMap::new();
        outputs.insert("scan".to_string(), json!({"findings": 3}));
        let template = json!({"count": "$nodes.scan.output.findings"});
        let resolved = resolve_input(&template, &outputs).unwrap();
        assert_eq!(resolved, json!({"count": 3}));
    }

    #[test]
    fn resolves_nested_and_array_paths() {
        let mut outputs = HashMap::new();
        outputs.insert("scan".to_string(), json!({"items": [{"id": "a"}, {"id": "b"}]}));
        let template = json!("$nodes.scan.output.items.1.id");
        let resolved = resolve_input(&template, &outputs).unwrap();
        assert_eq!(resolved, json!("b"));
    }

    #[test]
    fn unresolvable_reference_is_an_error() {
        let outputs = HashMap::new();
        let template = json!("$nodes.missing.output.x");
        assert!(resolve_input(&template, &outputs).is_err());
    }

    #[test]
    fn bare_output_reference_returns_whole_output() {
        let mut outputs = HashMap::new();
        outputs.insert("scan".to_string(), json!({"a": 1}));
        let template = json!("$nodes.scan.output");
        let resolved = resolve_input(&template, &outputs).unwrap();
        assert_eq!(resolved, json!({"a": 1}));
    }

    #[test]
    fn non_reference_strings_pass_through() {
        let outputs = HashMap::new();
        let template = json!({"literal": "plain-value"});
        assert_eq!(resolve_input(&template, &outputs).unwrap(), template);
    }
}
