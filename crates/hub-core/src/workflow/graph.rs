//! DAG validation for workflow definitions.
//!
//! Run once when a workflow transitions DRAFT -> ACTIVE (workflows are
//! immutable once active; a new version is a new workflow row). Checks
//! the three structural invariants from the data model: edges only
//! connect nodes within the workflow, every node's `agent_id` resolves
//! to a known agent, and the graph is acyclic.

use std::collections::HashSet;

use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use uuid::Uuid;

use hub_db::models::{WorkflowEdge, WorkflowNode};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("edge references node {0} which is not part of this workflow")]
    DanglingEdge(Uuid),
    #[error("node {0} references unknown agent {1}")]
    UnknownAgent(Uuid, Uuid),
    #[error("workflow graph contains a cycle")]
    Cycle,
}

/// Validate that `nodes`/`edges` form an acyclic graph where every edge
/// endpoint is a node in `nodes` and every node's `agent_id` is present
/// in `known_agent_ids`.
pub fn validate(
    nodes: &[WorkflowNode],
    edges: &[WorkflowEdge],
    known_agent_ids: &HashSet<Uuid>,
) -> Result<(), GraphError> {
    for node in nodes {
        if !known_agent_ids.contains(&node.agent_id) {
            return Err(GraphError::UnknownAgent(node.id, node.agent_id));
        }
    }

    let node_ids: HashSet<Uuid> = nodes.iter().map(|n| n.id).collect();
    let mut graph = DiGraph::<Uuid, ()>::new();
    let mut index_of: std::collections::HashMap<Uuid, NodeIndex> = std::collections::HashMap::new();

    for node in nodes {
        let idx = graph.add_node(node.id);
        index_of.insert(node.id, idx);
    }

    for edge in edges {
        if !node_ids.contains(&edge.from_node_id) {
            return Err(GraphError::DanglingEdge(edge.from_node_id));
        }
        if !node_ids.contains(&edge.to_node_id) {
            return Err(GraphError::DanglingEdge(edge.to_node_id));
        }
        let from = index_of[&edge.from_node_id];
        let to = index_of[&edge.to_node_id];
        graph.add_edge(from, to, ());
    }

    if is_cyclic_directed(&graph) {
        return Err(GraphError::Cycle);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: Uuid, agent_id: Uuid, key: &str) -> WorkflowNode {
        WorkflowNode {
            id,
            workflow_id: Uuid::new_v4(),
            node_key: key.to_string(),
            agent_id,
            action: "run".to_string(),
            static_input_template: serde_json::json!({}),
            approval_required: false,
            retry_max_attempts: 1,
            retry_backoff_base_ms: 1000,
            retry_backoff_cap_ms: 60_000,
            on_failure: None,
        }
    }

    #[test]
    fn acyclic_two_node_chain_is_valid() {
        let agent = Uuid::new_v4();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let nodes = vec![node(a, agent, "a"), node(b, agent, "b")];
        let edges = vec![WorkflowEdge {
            workflow_id: Uuid::new_v4(),
            from_node_id: a,
            to_node_id: b,
        }];
        let known = HashSet::from([agent]);
        assert!(validate(&nodes, &edges, &known).is_ok());
    }

    #[test]
    fn cycle_is_rejected() {
        let agent = Uuid::new_v4();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let nodes = vec![node(a, agent, "a"), node(b, agent, "b")];
        let edges = vec![
            WorkflowEdge {
                workflow_id: Uuid::new_v4(),
                from_node_id: a,
                to_node_id: b,
            },
            WorkflowEdge {
                workflow_id: Uuid::new_v4(),
                from_node_id: b,
                to_node_id: a,
            },
        ];
        let known = HashSet::from([agent]);
        assert_eq!(validate(&nodes, &edges, &known), Err(GraphError::Cycle));
    }

    #[test]
    fn unknown_agent_rejected() {
        let agent = Uuid::new_v4();
        let other_agent = Uuid::new_v4();
        let a = Uuid::new_v4();
        let nodes = vec![node(a, other_agent, "a")];
        let known = HashSet::from([agent]);
        assert!(validate(&nodes, &[], &known).is_err());
    }

    #[test]
    fn dangling_edge_rejected() {
        let agent = Uuid::new_v4();
        let a = Uuid::new_v4();
        let missing = Uuid::new_v4();
        let nodes = vec![node(a, agent, "a")];
        let edges = vec![WorkflowEdge {
            workflow_id: Uuid::new_v4(),
            from_node_id: a,
            to_node_id: missing,
        }];
        let known = HashSet::from([agent]);
        assert_eq!(validate(&nodes, &edges, &known), Err(GraphError::DanglingEdge(missing)));
    }
}
