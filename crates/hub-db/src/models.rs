use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle status of a project stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

impl FromStr for ProjectStatus {
    type Err = ProjectStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stopped" => Ok(Self::Stopped),
            "starting" => Ok(Self::Starting),
            "running" => Ok(Self::Running),
            "stopping" => Ok(Self::Stopping),
            "error" => Ok(Self::Error),
            other => Err(ProjectStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ProjectStatus`] string.
#[derive(Debug, Clone)]
pub struct ProjectStatusParseError(pub String);

impl fmt::Display for ProjectStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid project status: {:?}", self.0)
    }
}

impl std::error::Error for ProjectStatusParseError {}

// ---------------------------------------------------------------------------

/// The kind of work an agent performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Analysis,
    Action,
    Notifier,
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Analysis => "analysis",
            Self::Action => "action",
            Self::Notifier => "notifier",
        };
        f.write_str(s)
    }
}

impl FromStr for AgentType {
    type Err = AgentTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "analysis" => Ok(Self::Analysis),
            "action" => Ok(Self::Action),
            "notifier" => Ok(Self::Notifier),
            other => Err(AgentTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`AgentType`] string.
#[derive(Debug, Clone)]
pub struct AgentTypeParseError(pub String);

impl fmt::Display for AgentTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid agent type: {:?}", self.0)
    }
}

impl std::error::Error for AgentTypeParseError {}

// ---------------------------------------------------------------------------

/// How much human oversight an agent's invocation requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AgentRisk {
    Auto,
    ApprovalRequired,
    HumanOnly,
}

impl fmt::Display for AgentRisk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Auto => "auto",
            Self::ApprovalRequired => "approval_required",
            Self::HumanOnly => "human_only",
        };
        f.write_str(s)
    }
}

impl FromStr for AgentRisk {
    type Err = AgentRiskParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "approval_required" => Ok(Self::ApprovalRequired),
            "human_only" => Ok(Self::HumanOnly),
            other => Err(AgentRiskParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`AgentRisk`] string.
#[derive(Debug, Clone)]
pub struct AgentRiskParseError(pub String);

impl fmt::Display for AgentRiskParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid agent risk: {:?}", self.0)
    }
}

impl std::error::Error for AgentRiskParseError {}

// ---------------------------------------------------------------------------

/// What triggers a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkflowTrigger {
    Manual,
    Event,
    Webhook,
    Schedule,
}

impl fmt::Display for WorkflowTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Manual => "manual",
            Self::Event => "event",
            Self::Webhook => "webhook",
            Self::Schedule => "schedule",
        };
        f.write_str(s)
    }
}

impl FromStr for WorkflowTrigger {
    type Err = WorkflowTriggerParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "event" => Ok(Self::Event),
            "webhook" => Ok(Self::Webhook),
            "schedule" => Ok(Self::Schedule),
            other => Err(WorkflowTriggerParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`WorkflowTrigger`] string.
#[derive(Debug, Clone)]
pub struct WorkflowTriggerParseError(pub String);

impl fmt::Display for WorkflowTriggerParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid workflow trigger: {:?}", self.0)
    }
}

impl std::error::Error for WorkflowTriggerParseError {}

// ---------------------------------------------------------------------------

/// Editing status of a workflow definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Draft,
    Active,
    Disabled,
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Disabled => "disabled",
        };
        f.write_str(s)
    }
}

impl FromStr for WorkflowStatus {
    type Err = WorkflowStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "active" => Ok(Self::Active),
            "disabled" => Ok(Self::Disabled),
            other => Err(WorkflowStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`WorkflowStatus`] string.
#[derive(Debug, Clone)]
pub struct WorkflowStatusParseError(pub String);

impl fmt::Display for WorkflowStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid workflow status: {:?}", self.0)
    }
}

impl std::error::Error for WorkflowStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of one triggered execution of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkflowRunStatus {
    Pending,
    Running,
    WaitingApproval,
    Succeeded,
    Failed,
    Cancelled,
}

impl WorkflowRunStatus {
    /// Terminal statuses are absorbing: once reached, a run never transitions again.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for WorkflowRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::WaitingApproval => "waiting_approval",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for WorkflowRunStatus {
    type Err = WorkflowRunStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "waiting_approval" => Ok(Self::WaitingApproval),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(WorkflowRunStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`WorkflowRunStatus`] string.
#[derive(Debug, Clone)]
pub struct WorkflowRunStatusParseError(pub String);

impl fmt::Display for WorkflowRunStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid workflow run status: {:?}", self.0)
    }
}

impl std::error::Error for WorkflowRunStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a single node's execution attempt(s) within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NodeRunStatus {
    Pending,
    Blocked,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
    WaitingApproval,
    Cancelled,
}

impl NodeRunStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }
}

impl fmt::Display for NodeRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Blocked => "blocked",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::WaitingApproval => "waiting_approval",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for NodeRunStatus {
    type Err = NodeRunStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "blocked" => Ok(Self::Blocked),
            "ready" => Ok(Self::Ready),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            "waiting_approval" => Ok(Self::WaitingApproval),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(NodeRunStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`NodeRunStatus`] string.
#[derive(Debug, Clone)]
pub struct NodeRunStatusParseError(pub String);

impl fmt::Display for NodeRunStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid node run status: {:?}", self.0)
    }
}

impl std::error::Error for NodeRunStatusParseError {}

// ---------------------------------------------------------------------------

/// Decision recorded against an approval gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Pending,
    Approved,
    Rejected,
}

impl fmt::Display for ApprovalDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

impl FromStr for ApprovalDecision {
    type Err = ApprovalDecisionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            other => Err(ApprovalDecisionParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ApprovalDecision`] string.
#[derive(Debug, Clone)]
pub struct ApprovalDecisionParseError(pub String);

impl fmt::Display for ApprovalDecisionParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid approval decision: {:?}", self.0)
    }
}

impl std::error::Error for ApprovalDecisionParseError {}

// ---------------------------------------------------------------------------

/// Derived presence status of a federated child Hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FederationStatus {
    Online,
    Offline,
    Degraded,
}

impl fmt::Display for FederationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Degraded => "degraded",
        };
        f.write_str(s)
    }
}

impl FromStr for FederationStatus {
    type Err = FederationStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(Self::Online),
            "offline" => Ok(Self::Offline),
            "degraded" => Ok(Self::Degraded),
            other => Err(FederationStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`FederationStatus`] string.
#[derive(Debug, Clone)]
pub struct FederationStatusParseError(pub String);

impl fmt::Display for FederationStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid federation status: {:?}", self.0)
    }
}

impl std::error::Error for FederationStatusParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A project stack -- the Hub's unit of isolated, port-bound containers.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Project {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub fs_path: String,
    pub status: ProjectStatus,
    pub backend_port: Option<i32>,
    pub frontend_port: Option<i32>,
    pub db_port: Option<i32>,
    pub cache_port: Option<i32>,
    /// Ports requested at creation time, if any. Unlike the bound-port
    /// columns above, these survive stop/start cycles; `Start` reserves
    /// them exactly instead of auto-allocating when all four are set.
    pub designated_backend_port: Option<i32>,
    pub designated_frontend_port: Option<i32>,
    pub designated_db_port: Option<i32>,
    pub designated_cache_port: Option<i32>,
    /// Driver-opaque stack handle, set while STARTING/RUNNING/STOPPING.
    pub driver_handle: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A registered agent -- a one-shot containerized program with typed I/O.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Agent {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub agent_type: AgentType,
    pub risk: AgentRisk,
    pub image: String,
    pub input_schema: serde_json::Value,
    pub output_schema: serde_json::Value,
    pub capabilities: Vec<String>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A workflow definition -- a DAG of agent invocations.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Workflow {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub trigger: WorkflowTrigger,
    pub status: WorkflowStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A single node within a workflow's DAG.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowNode {
    pub id: Uuid,
    pub workflow_id: Uuid,
    /// Caller-facing node identifier, unique within the workflow, used in
    /// `$nodes.<node_key>.output.<path>` references.
    pub node_key: String,
    pub agent_id: Uuid,
    pub action: String,
    pub static_input_template: serde_json::Value,
    pub approval_required: bool,
    pub retry_max_attempts: i32,
    pub retry_backoff_base_ms: i32,
    pub retry_backoff_cap_ms: i32,
    /// Reserved for future fan-around semantics; unused in v1 fail-fast.
    pub on_failure: Option<String>,
}

/// A directed edge `from_node -> to_node` within a workflow's DAG.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowEdge {
    pub workflow_id: Uuid,
    pub from_node_id: Uuid,
    pub to_node_id: Uuid,
}

/// One triggered execution of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowRun {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub trigger_context: serde_json::Value,
    pub status: WorkflowRunStatus,
    pub correlation_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// One node's execution record within a workflow run.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct NodeRun {
    pub id: Uuid,
    pub workflow_run_id: Uuid,
    pub node_id: Uuid,
    pub status: NodeRunStatus,
    pub attempt: i32,
    pub input_snapshot: Option<serde_json::Value>,
    /// Present iff `status` is SUCCEEDED; failure diagnostics live in
    /// `last_error`/`logs_ref` instead.
    pub output_snapshot: Option<serde_json::Value>,
    pub logs_ref: Option<String>,
    pub exit_code: Option<i32>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// A human approval gate attached to a node run.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Approval {
    pub id: Uuid,
    pub node_run_id: Uuid,
    pub requested_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
    pub decision: ApprovalDecision,
    pub approver: Option<String>,
}

/// An append-only event recorded by the Event Service.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Event {
    pub id: Uuid,
    pub subject: String,
    pub origin: String,
    pub correlation_id: Option<Uuid>,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    /// Set once the bus publish for this row has been acknowledged.
    pub published_at: Option<DateTime<Utc>>,
}

/// A child Hub tracked by the federation catalog.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FederationProject {
    pub slug: String,
    pub name: String,
    pub hub_url: String,
    pub mesh_namespace: String,
    pub tags: Vec<String>,
    pub status: FederationStatus,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A recorded idempotency key for a write endpoint, used to short-circuit
/// repeated writes with the same key and payload to the first response.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct IdempotencyRecord {
    pub idempotency_key: String,
    pub request_hash: String,
    pub response_body: serde_json::Value,
    pub response_status: i32,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_status_display_roundtrip() {
        let variants = [
            ProjectStatus::Stopped,
            ProjectStatus::Starting,
            ProjectStatus::Running,
            ProjectStatus::Stopping,
            ProjectStatus::Error,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: ProjectStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn project_status_invalid() {
        assert!("bogus".parse::<ProjectStatus>().is_err());
    }

    #[test]
    fn agent_type_display_roundtrip() {
        let variants = [AgentType::Analysis, AgentType::Action, AgentType::Notifier];
        for v in &variants {
            let s = v.to_string();
            assert_eq!(*v, s.parse::<AgentType>().expect("should parse"));
        }
    }

    #[test]
    fn agent_risk_display_roundtrip() {
        let variants = [
            AgentRisk::Auto,
            AgentRisk::ApprovalRequired,
            AgentRisk::HumanOnly,
        ];
        for v in &variants {
            let s = v.to_string();
            assert_eq!(*v, s.parse::<AgentRisk>().expect("should parse"));
        }
    }

    #[test]
    fn workflow_trigger_display_roundtrip() {
        let variants = [
            WorkflowTrigger::Manual,
            WorkflowTrigger::Event,
            WorkflowTrigger::Webhook,
            WorkflowTrigger::Schedule,
        ];
        for v in &variants {
            let s = v.to_string();
            assert_eq!(*v, s.parse::<WorkflowTrigger>().expect("should parse"));
        }
    }

    #[test]
    fn workflow_status_display_roundtrip() {
        let variants = [
            WorkflowStatus::Draft,
            WorkflowStatus::Active,
            WorkflowStatus::Disabled,
        ];
        for v in &variants {
            let s = v.to_string();
            assert_eq!(*v, s.parse::<WorkflowStatus>().expect("should parse"));
        }
    }

    #[test]
    fn workflow_run_status_terminal() {
        assert!(WorkflowRunStatus::Succeeded.is_terminal());
        assert!(WorkflowRunStatus::Failed.is_terminal());
        assert!(WorkflowRunStatus::Cancelled.is_terminal());
        assert!(!WorkflowRunStatus::Pending.is_terminal());
        assert!(!WorkflowRunStatus::Running.is_terminal());
        assert!(!WorkflowRunStatus::WaitingApproval.is_terminal());
    }

    #[test]
    fn workflow_run_status_display_roundtrip() {
        let variants = [
            WorkflowRunStatus::Pending,
            WorkflowRunStatus::Running,
            WorkflowRunStatus::WaitingApproval,
            WorkflowRunStatus::Succeeded,
            WorkflowRunStatus::Failed,
            WorkflowRunStatus::Cancelled,
        ];
        for v in &variants {
            let s = v.to_string();
            assert_eq!(*v, s.parse::<WorkflowRunStatus>().expect("should parse"));
        }
    }

    #[test]
    fn node_run_status_terminal() {
        assert!(NodeRunStatus::Succeeded.is_terminal());
        assert!(NodeRunStatus::Skipped.is_terminal());
        assert!(NodeRunStatus::Cancelled.is_terminal());
        assert!(!NodeRunStatus::Ready.is_terminal());
        assert!(!NodeRunStatus::WaitingApproval.is_terminal());
    }

    #[test]
    fn node_run_status_display_roundtrip() {
        let variants = [
            NodeRunStatus::Pending,
            NodeRunStatus::Blocked,
            NodeRunStatus::Ready,
            NodeRunStatus::Running,
            NodeRunStatus::Succeeded,
            NodeRunStatus::Failed,
            NodeRunStatus::Skipped,
            NodeRunStatus::WaitingApproval,
            NodeRunStatus::Cancelled,
        ];
        for v in &variants {
            let s = v.to_string();
            assert_eq!(*v, s.parse::<NodeRunStatus>().expect("should parse"));
        }
    }

    #[test]
    fn approval_decision_display_roundtrip() {
        let variants = [
            ApprovalDecision::Pending,
            ApprovalDecision::Approved,
            ApprovalDecision::Rejected,
        ];
        for v in &variants {
            let s = v.to_string();
            assert_eq!(*v, s.parse::<ApprovalDecision>().expect("should parse"));
        }
    }

    #[test]
    fn federation_status_display_roundtrip() {
        let variants = [
            FederationStatus::Online,
            FederationStatus::Offline,
            FederationStatus::Degraded,
        ];
        for v in &variants {
            let s = v.to_string();
            assert_eq!(*v, s.parse::<FederationStatus>().expect("should parse"));
        }
    }

    #[test]
    fn federation_status_invalid() {
        assert!("unknown".parse::<FederationStatus>().is_err());
    }
}
