use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use hub_core::driver::ContainerDriver;
use hub_core::events::EventService;
use hub_core::federation;
use hub_core::project::ProjectOrchestrator;
use hub_core::workflow::{gate, graph, WorkflowEngine};
use hub_db::models::{
    Agent, AgentRisk, AgentType, ApprovalDecision, FederationStatus, NodeRun, Project, Workflow, WorkflowEdge,
    WorkflowNode, WorkflowRun, WorkflowTrigger,
};
use hub_db::queries::node_runs::RunProgress;
use hub_db::queries::{
    agents as agents_db, approvals as approvals_db, idempotency as idempotency_db, node_runs as node_runs_db,
    projects as projects_db, workflow_runs as runs_db, workflows as workflows_db,
};

use crate::config::HubConfig;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub driver: Arc<dyn ContainerDriver>,
    pub events: Arc<EventService>,
    pub orchestrator: Arc<ProjectOrchestrator>,
    pub engine: Arc<WorkflowEngine>,
    pub config: Arc<HubConfig>,
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl AppError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self { status: StatusCode::BAD_REQUEST, code: "VALIDATION", message: msg.into() }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self { status: StatusCode::NOT_FOUND, code: "NOT_FOUND", message: msg.into() }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self { status: StatusCode::CONFLICT, code: "CONFLICT", message: msg.into() }
    }

    pub fn dependency_unavailable(msg: impl Into<String>) -> Self {
        Self { status: StatusCode::SERVICE_UNAVAILABLE, code: "DEPENDENCY_UNAVAILABLE", message: msg.into() }
    }

    pub fn internal(err: anyhow::Error) -> Self {
        Self { status: StatusCode::INTERNAL_SERVER_ERROR, code: "DRIVER_FAILURE", message: format!("{err:#}") }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message, "code": self.code });
        (self.status, Json(body)).into_response()
    }
}

impl From<hub_core::project::orchestrator::OrchestratorError> for AppError {
    fn from(e: hub_core::project::orchestrator::OrchestratorError) -> Self {
        use hub_core::project::orchestrator::OrchestratorError as E;
        match e {
            E::NotFound(id) => AppError::not_found(format!("project {id} not found")),
            E::AlreadyInProgress(id) => AppError::conflict(format!("project {id} has a lifecycle operation already in progress")),
            E::Conflict { .. } => AppError::conflict(e.to_string()),
            E::PortsInUse => AppError::conflict(e.to_string()),
            E::DriverFailure(err) => AppError::internal(err),
        }
    }
}

impl From<gate::GateError> for AppError {
    fn from(e: gate::GateError) -> Self {
        use gate::GateError as E;
        match e {
            E::NotFound(id) => AppError::not_found(format!("approval {id} not found")),
            E::AlreadyDecided(id) => AppError::conflict(format!("approval {id} has already been decided")),
            E::Other(err) => AppError::internal(err),
        }
    }
}

impl From<federation::FederationError> for AppError {
    fn from(e: federation::FederationError) -> Self {
        use federation::FederationError as E;
        match e {
            E::UnknownSlug(slug) => AppError::not_found(format!("federation project {slug:?} not registered")),
            E::NamespaceMismatch(slug) => AppError::validation(format!("mesh_namespace mismatch for {slug:?}")),
            E::Other(err) => AppError::internal(err),
        }
    }
}

impl From<graph::GraphError> for AppError {
    fn from(e: graph::GraphError) -> Self {
        AppError::validation(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Shared DTOs
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct AcceptedResponse {
    accepted: bool,
}

#[derive(Debug, Serialize)]
struct IdResponse {
    id: Uuid,
}

#[derive(Debug, Serialize)]
struct ProgressResponse {
    pending: i64,
    blocked: i64,
    ready: i64,
    running: i64,
    succeeded: i64,
    failed: i64,
    skipped: i64,
    waiting_approval: i64,
    cancelled: i64,
    total: i64,
}

impl From<RunProgress> for ProgressResponse {
    fn from(p: RunProgress) -> Self {
        Self {
            pending: p.pending,
            blocked: p.blocked,
            ready: p.ready,
            running: p.running,
            succeeded: p.succeeded,
            failed: p.failed,
            skipped: p.skipped,
            waiting_approval: p.waiting_approval,
            cancelled: p.cancelled,
            total: p.total,
        }
    }
}

#[derive(Debug, Serialize)]
struct WorkflowDetailResponse {
    #[serde(flatten)]
    workflow: Workflow,
    nodes: Vec<WorkflowNode>,
    edges: Vec<WorkflowEdge>,
}

#[derive(Debug, Serialize)]
struct RunDetailResponse {
    #[serde(flatten)]
    run: WorkflowRun,
    progress: ProgressResponse,
}

#[derive(Debug, Serialize)]
struct NodeRunsResponse {
    progress: ProgressResponse,
    node_runs: Vec<NodeRun>,
}

fn slugify(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

// ---------------------------------------------------------------------------
// Idempotency
// ---------------------------------------------------------------------------

fn idempotency_key_header(headers: &HeaderMap) -> Option<String> {
    headers.get("idempotency-key").and_then(|v| v.to_str().ok()).map(str::to_string)
}

fn hash_body(body: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Run `op` to produce the write's response body, short-circuiting to a
/// previously recorded response when `idempotency_key` has already been
/// used with an identical request body. A reused key with a different
/// body is rejected as a conflict rather than silently re-executed.
async fn idempotent_write<F, Fut>(
    pool: &PgPool,
    idempotency_key: Option<String>,
    request_body: &Value,
    status: StatusCode,
    op: F,
) -> Result<Response, AppError>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<Value, AppError>>,
{
    let request_hash = hash_body(request_body);

    if let Some(key) = &idempotency_key {
        if let Some(record) = idempotency_db::get_record(pool, key).await.map_err(AppError::internal)? {
            if record.request_hash != request_hash {
                return Err(AppError::conflict(format!("idempotency key {key:?} was already used with a different request body")));
            }
            let replay_status = StatusCode::from_u16(record.response_status as u16).unwrap_or(status);
            return Ok((replay_status, Json(record.response_body)).into_response());
        }
    }

    let body = op().await?;

    if let Some(key) = &idempotency_key {
        idempotency_db::insert_record(pool, key, &request_hash, &body, status.as_u16() as i32)
            .await
            .map_err(AppError::internal)?;
    }

    Ok((status, Json(body)).into_response())
}

// ---------------------------------------------------------------------------
// API key auth
// ---------------------------------------------------------------------------

/// Gate `/api/*` behind `API_KEYS` when configured (bearer token or
/// `X-API-Key` header, either accepted). An empty `api_keys` list leaves
/// the API open, matching the corpus's dev-mode default.
async fn require_api_key(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if state.config.api_keys.is_empty() {
        return next.run(req).await;
    }

    let provided = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or_else(|| req.headers().get("x-api-key").and_then(|v| v.to_str().ok()));

    match provided {
        Some(key) if state.config.api_keys.iter().any(|k| k == key) => next.run(req).await,
        _ => AppError { status: StatusCode::UNAUTHORIZED, code: "VALIDATION", message: "missing or invalid API key".to_string() }.into_response(),
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: AppState) -> Router {
    let api = api_router().route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/health/bus", get(health_bus))
        .merge(api)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn api_router() -> Router<AppState> {
    Router::new()
        .route("/api/projects", post(create_project).get(list_projects))
        .route("/api/projects/{id}", get(get_project))
        .route("/api/projects/{id}", delete(delete_project))
        .route("/api/projects/{id}/start", post(start_project))
        .route("/api/projects/{id}/stop", post(stop_project))
        .route("/api/projects/{id}/restart", post(restart_project))
        .route("/api/workflows", post(create_workflow).get(list_workflows))
        .route("/api/workflows/{id}", get(get_workflow))
        .route("/api/workflows/{id}/nodes", post(add_node))
        .route("/api/workflows/{id}/edges", post(add_edge))
        .route("/api/workflows/{id}/activate", post(activate_workflow))
        .route("/api/workflows/{id}/trigger", post(trigger_workflow))
        .route("/api/workflows/runs", get(list_runs))
        .route("/api/workflows/runs/{id}", get(get_run))
        .route("/api/workflows/runs/{id}/cancel", post(cancel_run))
        .route("/api/workflows/runs/{id}/node-runs", get(list_node_runs))
        .route("/api/agents", post(register_agent).get(list_agents))
        .route("/api/agents/{id}", get(get_agent))
        .route("/api/agents/{id}", delete(delete_agent))
        .route("/api/approvals/{id}", get(get_approval))
        .route("/api/approvals/{id}/decide", post(decide_approval))
        .route("/api/events", post(publish_event).get(query_events))
        .route("/api/events/stream", get(stream_events))
        .route("/api/fed/projects", post(register_federation).get(list_federation))
        .route("/api/fed/projects/{slug}", get(get_federation))
        .route("/api/webhooks/alertmanager", post(alertmanager_webhook))
        .route("/api/webhooks/grafana", post(grafana_webhook))
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(state: AppState, bind: &str, port: u16) -> Result<()> {
    let app = build_router(state);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("hub serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;
    tracing::info!("hub serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

async fn index() -> Response {
    Html(
        "<!DOCTYPE html>\
<html><head><title>hub</title></head><body>\
<h1>hub</h1>\
<p><a href=\"/api/projects\">/api/projects</a> | <a href=\"/api/workflows\">/api/workflows</a> | \
<a href=\"/api/fed/projects\">/api/fed/projects</a> | <a href=\"/health\">/health</a></p>\
</body></html>",
    )
    .into_response()
}

async fn health() -> Response {
    Json(serde_json::json!({"status": "ok"})).into_response()
}

async fn health_bus(State(state): State<AppState>) -> Response {
    match state.events.ping().await {
        Ok(()) => Json(serde_json::json!({"status": "ok"})).into_response(),
        Err(e) => {
            (StatusCode::SERVICE_UNAVAILABLE, Json(serde_json::json!({"status": "unreachable", "error": e.to_string()})))
                .into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Projects
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Serialize)]
struct PortsRequest {
    backend: i32,
    frontend: i32,
    db: i32,
    cache: i32,
}

#[derive(Debug, Deserialize, Serialize)]
struct CreateProjectRequest {
    name: String,
    path: String,
    #[serde(default)]
    slug: Option<String>,
    #[serde(default)]
    ports: Option<PortsRequest>,
}

#[derive(Debug, Deserialize)]
struct DeleteProjectQuery {
    #[serde(rename = "deleteFiles", default)]
    delete_files: bool,
}

async fn create_project(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateProjectRequest>,
) -> Result<Response, AppError> {
    if req.name.trim().is_empty() {
        return Err(AppError::validation("name must not be empty"));
    }
    if req.path.trim().is_empty() {
        return Err(AppError::validation("path must not be empty"));
    }

    let body = serde_json::to_value(&req).unwrap_or(Value::Null);
    let key = idempotency_key_header(&headers);

    idempotent_write(&state.pool, key, &body, StatusCode::CREATED, || async {
        let slug = req.slug.clone().unwrap_or_else(|| slugify(&req.name));
        let designated_ports = req.ports.as_ref().map(|p| (p.backend, p.frontend, p.db, p.cache));
        let project = projects_db::insert_project(&state.pool, &slug, &req.name, &req.path, designated_ports)
            .await
            .map_err(AppError::internal)?;
        serde_json::to_value(project).map_err(|e| AppError::internal(e.into()))
    })
    .await
}

async fn list_projects(State(state): State<AppState>) -> Result<Json<Vec<Project>>, AppError> {
    let projects = projects_db::list_projects(&state.pool).await.map_err(AppError::internal)?;
    Ok(Json(projects))
}

async fn get_project(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Project>, AppError> {
    let project = projects_db::get_project(&state.pool, id).await.map_err(AppError::internal)?.ok_or_else(|| AppError::not_found(format!("project {id} not found")))?;
    Ok(Json(project))
}

async fn start_project(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Response, AppError> {
    state.orchestrator.start(state.pool.clone(), id).await?;
    Ok((StatusCode::ACCEPTED, Json(AcceptedResponse { accepted: true })).into_response())
}

async fn stop_project(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Response, AppError> {
    state.orchestrator.stop(state.pool.clone(), id).await?;
    Ok((StatusCode::ACCEPTED, Json(AcceptedResponse { accepted: true })).into_response())
}

async fn restart_project(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Response, AppError> {
    state.orchestrator.restart(state.pool.clone(), id).await?;
    Ok((StatusCode::ACCEPTED, Json(AcceptedResponse { accepted: true })).into_response())
}

async fn delete_project(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(q): Query<DeleteProjectQuery>,
) -> Result<StatusCode, AppError> {
    state.orchestrator.delete(&state.pool, id, q.delete_files).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Workflows
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Serialize)]
struct CreateWorkflowRequest {
    project_id: Uuid,
    name: String,
    trigger: String,
}

#[derive(Debug, Deserialize)]
struct ListWorkflowsQuery {
    project_id: Uuid,
}

fn default_retry_max() -> i32 {
    3
}
fn default_backoff_base() -> i32 {
    1000
}
fn default_backoff_cap() -> i32 {
    60_000
}

#[derive(Debug, Deserialize, Serialize)]
struct AddNodeRequest {
    node_key: String,
    agent_id: Uuid,
    action: String,
    #[serde(default)]
    static_input_template: Value,
    #[serde(default)]
    approval_required: bool,
    #[serde(default = "default_retry_max")]
    retry_max_attempts: i32,
    #[serde(default = "default_backoff_base")]
    retry_backoff_base_ms: i32,
    #[serde(default = "default_backoff_cap")]
    retry_backoff_cap_ms: i32,
}

#[derive(Debug, Deserialize, Serialize)]
struct AddEdgeRequest {
    from_node_id: Uuid,
    to_node_id: Uuid,
}

#[derive(Debug, Deserialize, Serialize)]
struct TriggerRequest {
    #[serde(default)]
    context: Value,
    #[serde(default)]
    correlation_id: Option<Uuid>,
}

async fn create_workflow(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateWorkflowRequest>,
) -> Result<Response, AppError> {
    let trigger: WorkflowTrigger = req.trigger.parse().map_err(|_| AppError::validation(format!("invalid trigger: {:?}", req.trigger)))?;
    let body = serde_json::to_value(&req).unwrap_or(Value::Null);
    let key = idempotency_key_header(&headers);

    idempotent_write(&state.pool, key, &body, StatusCode::CREATED, || async {
        let workflow = workflows_db::insert_workflow(&state.pool, req.project_id, &req.name, trigger).await.map_err(AppError::internal)?;
        serde_json::to_value(workflow).map_err(|e| AppError::internal(e.into()))
    })
    .await
}

async fn list_workflows(State(state): State<AppState>, Query(q): Query<ListWorkflowsQuery>) -> Result<Json<Vec<Workflow>>, AppError> {
    let workflows = workflows_db::list_workflows_for_project(&state.pool, q.project_id).await.map_err(AppError::internal)?;
    Ok(Json(workflows))
}

async fn get_workflow(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<WorkflowDetailResponse>, AppError> {
    let workflow = workflows_db::get_workflow(&state.pool, id).await.map_err(AppError::internal)?.ok_or_else(|| AppError::not_found(format!("workflow {id} not found")))?;
    let nodes = workflows_db::list_workflow_nodes(&state.pool, id).await.map_err(AppError::internal)?;
    let edges = workflows_db::list_workflow_edges(&state.pool, id).await.map_err(AppError::internal)?;
    Ok(Json(WorkflowDetailResponse { workflow, nodes, edges }))
}

async fn add_node(
    State(state): State<AppState>,
    Path(workflow_id): Path<Uuid>,
    headers: HeaderMap,
    Json(req): Json<AddNodeRequest>,
) -> Result<Response, AppError> {
    let body = serde_json::to_value(&req).unwrap_or(Value::Null);
    let key = idempotency_key_header(&headers);

    idempotent_write(&state.pool, key, &body, StatusCode::CREATED, || async {
        let new = workflows_db::NewWorkflowNode {
            workflow_id,
            node_key: req.node_key.clone(),
            agent_id: req.agent_id,
            action: req.action.clone(),
            static_input_template: req.static_input_template.clone(),
            approval_required: req.approval_required,
            retry_max_attempts: req.retry_max_attempts,
            retry_backoff_base_ms: req.retry_backoff_base_ms,
            retry_backoff_cap_ms: req.retry_backoff_cap_ms,
        };
        let node = workflows_db::insert_workflow_node(&state.pool, &new).await.map_err(AppError::internal)?;
        serde_json::to_value(node).map_err(|e| AppError::internal(e.into()))
    })
    .await
}

async fn add_edge(
    State(state): State<AppState>,
    Path(workflow_id): Path<Uuid>,
    Json(req): Json<AddEdgeRequest>,
) -> Result<StatusCode, AppError> {
    workflows_db::insert_workflow_edge(&state.pool, workflow_id, req.from_node_id, req.to_node_id).await.map_err(AppError::internal)?;
    Ok(StatusCode::CREATED)
}

async fn activate_workflow(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<StatusCode, AppError> {
    let workflow = workflows_db::get_workflow(&state.pool, id).await.map_err(AppError::internal)?.ok_or_else(|| AppError::not_found(format!("workflow {id} not found")))?;
    let nodes = workflows_db::list_workflow_nodes(&state.pool, id).await.map_err(AppError::internal)?;
    let edges = workflows_db::list_workflow_edges(&state.pool, id).await.map_err(AppError::internal)?;

    let known_agent_ids: std::collections::HashSet<Uuid> = agents_db::list_agents_for_project(&state.pool, workflow.project_id)
        .await
        .map_err(AppError::internal)?
        .into_iter()
        .map(|a| a.id)
        .collect();

    graph::validate(&nodes, &edges, &known_agent_ids)?;

    workflows_db::update_workflow_status(&state.pool, workflow.id, hub_db::models::WorkflowStatus::Active)
        .await
        .map_err(AppError::internal)?;

    Ok(StatusCode::OK)
}

async fn trigger_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<TriggerRequest>,
) -> Result<Response, AppError> {
    let run_id = state.engine.trigger(id, req.context, req.correlation_id).await.map_err(AppError::internal)?;
    Ok((StatusCode::ACCEPTED, Json(IdResponse { id: run_id })).into_response())
}

#[derive(Debug, Deserialize)]
struct ListRunsQuery {
    workflow_id: Uuid,
}

async fn list_runs(State(state): State<AppState>, Query(q): Query<ListRunsQuery>) -> Result<Json<Vec<WorkflowRun>>, AppError> {
    let runs = runs_db::list_runs_for_workflow(&state.pool, q.workflow_id).await.map_err(AppError::internal)?;
    Ok(Json(runs))
}

async fn get_run(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<RunDetailResponse>, AppError> {
    let run = runs_db::get_workflow_run(&state.pool, id).await.map_err(AppError::internal)?.ok_or_else(|| AppError::not_found(format!("workflow run {id} not found")))?;
    let progress = node_runs_db::get_run_progress(&state.pool, id).await.map_err(AppError::internal)?;
    Ok(Json(RunDetailResponse { run, progress: progress.into() }))
}

async fn cancel_run(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Response, AppError> {
    state.engine.cancel(id).await.map_err(AppError::internal)?;
    Ok((StatusCode::ACCEPTED, Json(AcceptedResponse { accepted: true })).into_response())
}

async fn list_node_runs(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<NodeRunsResponse>, AppError> {
    let node_runs = node_runs_db::list_node_runs_for_run(&state.pool, id).await.map_err(AppError::internal)?;
    let progress = node_runs_db::get_run_progress(&state.pool, id).await.map_err(AppError::internal)?;
    Ok(Json(NodeRunsResponse { progress: progress.into(), node_runs }))
}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Serialize)]
struct RegisterAgentRequest {
    project_id: Uuid,
    name: String,
    agent_type: String,
    risk: String,
    image: String,
    #[serde(default)]
    input_schema: Value,
    #[serde(default)]
    output_schema: Value,
    #[serde(default)]
    capabilities: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ListAgentsQuery {
    project_id: Uuid,
}

async fn register_agent(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RegisterAgentRequest>,
) -> Result<Response, AppError> {
    let agent_type: AgentType = req.agent_type.parse().map_err(|_| AppError::validation(format!("invalid agent_type: {:?}", req.agent_type)))?;
    let risk: AgentRisk = req.risk.parse().map_err(|_| AppError::validation(format!("invalid risk: {:?}", req.risk)))?;

    let body = serde_json::to_value(&req).unwrap_or(Value::Null);
    let key = idempotency_key_header(&headers);

    idempotent_write(&state.pool, key, &body, StatusCode::CREATED, || async {
        let new = agents_db::NewAgent {
            project_id: req.project_id,
            name: req.name.clone(),
            agent_type,
            risk,
            image: req.image.clone(),
            input_schema: req.input_schema.clone(),
            output_schema: req.output_schema.clone(),
            capabilities: req.capabilities.clone(),
        };
        let agent = agents_db::insert_agent(&state.pool, &new).await.map_err(AppError::internal)?;
        serde_json::to_value(agent).map_err(|e| AppError::internal(e.into()))
    })
    .await
}

async fn list_agents(State(state): State<AppState>, Query(q): Query<ListAgentsQuery>) -> Result<Json<Vec<Agent>>, AppError> {
    let agents = agents_db::list_agents_for_project(&state.pool, q.project_id).await.map_err(AppError::internal)?;
    Ok(Json(agents))
}

async fn get_agent(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Agent>, AppError> {
    let agent = agents_db::get_agent(&state.pool, id).await.map_err(AppError::internal)?.ok_or_else(|| AppError::not_found(format!("agent {id} not found")))?;
    Ok(Json(agent))
}

async fn delete_agent(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<StatusCode, AppError> {
    let rows = agents_db::soft_delete_agent(&state.pool, id).await.map_err(AppError::internal)?;
    if rows == 0 {
        return Err(AppError::conflict(format!("agent {id} not found, already deleted, or referenced by an in-flight run")));
    }
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Approvals
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Serialize)]
struct DecideApprovalRequest {
    decision: String,
    approver: String,
}

async fn get_approval(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Response, AppError> {
    let approval = approvals_db::get_approval(&state.pool, id).await.map_err(AppError::internal)?.ok_or_else(|| AppError::not_found(format!("approval {id} not found")))?;
    Ok(Json(approval).into_response())
}

async fn decide_approval(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<DecideApprovalRequest>,
) -> Result<Response, AppError> {
    let decision: ApprovalDecision = req.decision.parse().map_err(|_| AppError::validation(format!("invalid decision: {:?}", req.decision)))?;
    let approval = approvals_db::get_approval(&state.pool, id).await.map_err(AppError::internal)?.ok_or_else(|| AppError::not_found(format!("approval {id} not found")))?;
    let slug = gate::project_slug_for_node_run(&state.pool, approval.node_run_id).await.map_err(AppError::internal)?;

    gate::decide(&state.pool, &state.events, &slug, id, decision, &req.approver).await?;

    Ok(Json(AcceptedResponse { accepted: true }).into_response())
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Serialize)]
struct PublishEventRequest {
    subject: String,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    correlation_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    subject: Option<String>,
    correlation_id: Option<Uuid>,
    since: Option<DateTime<Utc>>,
    limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct StreamQuery {
    subject: String,
}

const DEFAULT_QUERY_LIMIT: i64 = 100;

async fn publish_event(State(state): State<AppState>, Json(req): Json<PublishEventRequest>) -> Result<Response, AppError> {
    if req.subject.trim().is_empty() {
        return Err(AppError::validation("subject must not be empty"));
    }
    let id = state.events.publish(&req.subject, &req.payload, "api", req.correlation_id).await.map_err(AppError::internal)?;
    Ok((StatusCode::CREATED, Json(IdResponse { id })).into_response())
}

async fn query_events(State(state): State<AppState>, Query(q): Query<EventsQuery>) -> Result<Response, AppError> {
    let filter = hub_db::queries::events::EventFilter {
        subject_like: q.subject.as_deref().map(hub_core::events::pattern_to_like),
        correlation_id: q.correlation_id,
        since: q.since,
        until: None,
        after: None,
        limit: q.limit.unwrap_or(DEFAULT_QUERY_LIMIT),
    };

    let events = state.events.query(&filter).await.map_err(AppError::internal)?;
    Ok(Json(events).into_response())
}

async fn stream_events(State(state): State<AppState>, Query(q): Query<StreamQuery>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_event_stream(socket, state, q.subject))
}

async fn handle_event_stream(mut socket: WebSocket, state: AppState, subject: String) {
    let consumer = match state.events.subscribe(&subject).await {
        Ok(c) => c,
        Err(e) => {
            let _ = socket.send(Message::Text(format!("{{\"error\":{:?}}}", e.to_string()).into())).await;
            return;
        }
    };

    let mut messages = match consumer.messages().await {
        Ok(m) => m,
        Err(e) => {
            let _ = socket.send(Message::Text(format!("{{\"error\":{:?}}}", e.to_string()).into())).await;
            return;
        }
    };

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(_)) => continue,
                    _ => return,
                }
            }
            next = messages.next() => {
                match next {
                    Some(Ok(msg)) => {
                        let payload = String::from_utf8_lossy(&msg.payload).into_owned();
                        let _ = msg.ack().await;
                        if socket.send(Message::Text(payload.into())).await.is_err() {
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "event stream consumer error");
                        return;
                    }
                    None => return,
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Federation
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Serialize)]
struct RegisterFederationRequest {
    slug: String,
    name: String,
    hub_url: String,
    mesh_namespace: String,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct FederationQuery {
    status: Option<String>,
}

async fn register_federation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RegisterFederationRequest>,
) -> Result<Response, AppError> {
    let body = serde_json::to_value(&req).unwrap_or(Value::Null);
    let key = idempotency_key_header(&headers);

    idempotent_write(&state.pool, key, &body, StatusCode::CREATED, || async {
        let project = federation::register(&state.pool, &req.slug, &req.name, &req.hub_url, &req.mesh_namespace, &req.tags)
            .await
            .map_err(AppError::internal)?;
        serde_json::to_value(project).map_err(|e| AppError::internal(e.into()))
    })
    .await
}

async fn list_federation(State(state): State<AppState>, Query(q): Query<FederationQuery>) -> Result<Response, AppError> {
    let status: Option<FederationStatus> = q.status.map(|s| s.parse()).transpose().map_err(|_| AppError::validation("invalid status filter"))?;
    let projects = federation::list(&state.pool, status).await.map_err(AppError::internal)?;
    Ok(Json(projects).into_response())
}

async fn get_federation(State(state): State<AppState>, Path(slug): Path<String>) -> Result<Response, AppError> {
    let project = federation::get(&state.pool, &slug).await.map_err(AppError::internal)?.ok_or_else(|| AppError::not_found(format!("federation project {slug:?} not found")))?;
    Ok(Json(project).into_response())
}

// ---------------------------------------------------------------------------
// Webhooks: translate alert payloads into workflow triggers
// ---------------------------------------------------------------------------

/// Pull a `workflow_id` out of either the payload's top level or its
/// `commonLabels` object (Alertmanager's grouped-webhook shape), so the
/// same extraction works for a hand-rolled trigger as well as a real
/// Alertmanager/Grafana webhook config pointed at this endpoint.
fn extract_workflow_id(payload: &Value) -> Option<Uuid> {
    payload
        .get("workflow_id")
        .or_else(|| payload.get("commonLabels").and_then(|l| l.get("workflow_id")))
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
}

async fn webhook_trigger(state: &AppState, payload: Value) -> Result<Response, AppError> {
    let workflow_id = extract_workflow_id(&payload).ok_or_else(|| AppError::validation("payload has no workflow_id label or field"))?;
    let run_id = state.engine.trigger(workflow_id, payload, None).await.map_err(AppError::internal)?;
    Ok((StatusCode::ACCEPTED, Json(IdResponse { id: run_id })).into_response())
}

async fn alertmanager_webhook(State(state): State<AppState>, Json(payload): Json<Value>) -> Result<Response, AppError> {
    webhook_trigger(&state, payload).await
}

async fn grafana_webhook(State(state): State<AppState>, Json(payload): Json<Value>) -> Result<Response, AppError> {
    webhook_trigger(&state, payload).await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use hub_core::driver::create_driver;
    use hub_core::project::{ProjectLocks, ProjectOrchestrator};
    use hub_test_utils::{create_test_db, drop_test_db};

    use super::*;

    async fn test_state(pool: PgPool) -> AppState {
        let driver = create_driver("docker-compose", std::path::Path::new(".")).unwrap();
        let events = Arc::new(EventService::connect(pool.clone(), "nats://127.0.0.1:4222").await.expect("nats must be reachable for serve_cmd tests"));
        let locks = Arc::new(ProjectLocks::new());
        let orchestrator = Arc::new(ProjectOrchestrator::new(Arc::clone(&driver), locks, Default::default(), Arc::clone(&events)));
        let engine = WorkflowEngine::new(pool.clone(), Arc::clone(&driver), Arc::clone(&events), 4);
        let config = HubConfig::resolve(None).expect("config should resolve");
        AppState { pool, driver, events, orchestrator, engine, config: Arc::new(config) }
    }

    async fn send_json(state: AppState, method: &str, uri: &str, body: Value) -> Response {
        let app = super::build_router(state);
        app.oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap()
    }

    async fn send_get(state: AppState, uri: &str) -> Response {
        let app = super::build_router(state);
        app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap()).await.unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_ok() {
        let (pool, db_name) = create_test_db().await;
        let state = test_state(pool.clone()).await;

        let resp = send_get(state, "/health").await;
        assert_eq!(resp.status(), StatusCode::OK);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_create_and_get_project() {
        let (pool, db_name) = create_test_db().await;
        let state = test_state(pool.clone()).await;

        let resp = send_json(
            state.clone(),
            "POST",
            "/api/projects",
            serde_json::json!({"name": "Demo Project", "path": "/tmp/demo"}),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let created = body_json(resp).await;
        assert_eq!(created["slug"], "demo-project");
        let id = created["id"].as_str().unwrap();

        let resp = send_get(state.clone(), &format!("/api/projects/{id}")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let fetched = body_json(resp).await;
        assert_eq!(fetched["status"], "stopped");

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_create_project_persists_designated_ports() {
        let (pool, db_name) = create_test_db().await;
        let state = test_state(pool.clone()).await;

        let resp = send_json(
            state.clone(),
            "POST",
            "/api/projects",
            serde_json::json!({
                "name": "Ported Project",
                "path": "/tmp/ported",
                "ports": {"backend": 8010, "frontend": 3010, "db": 5442, "cache": 6389},
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let created = body_json(resp).await;
        assert_eq!(created["designated_backend_port"], 8010);
        assert_eq!(created["designated_frontend_port"], 3010);
        assert_eq!(created["designated_db_port"], 5442);
        assert_eq!(created["designated_cache_port"], 6389);
        // Bound ports stay unset until Start actually reserves them.
        assert!(created["backend_port"].is_null());

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_create_project_rejects_empty_name() {
        let (pool, db_name) = create_test_db().await;
        let state = test_state(pool.clone()).await;

        let resp = send_json(state, "POST", "/api/projects", serde_json::json!({"name": "", "path": "/tmp/demo"})).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_get_project_not_found() {
        let (pool, db_name) = create_test_db().await;
        let state = test_state(pool.clone()).await;

        let resp = send_get(state, &format!("/api/projects/{}", Uuid::new_v4())).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_idempotent_create_project_replays_response() {
        let (pool, db_name) = create_test_db().await;
        let state = test_state(pool.clone()).await;

        let app = super::build_router(state);
        let body = serde_json::json!({"name": "Idem Project", "path": "/tmp/idem"});

        let req = |body: Value| {
            Request::builder()
                .method("POST")
                .uri("/api/projects")
                .header("content-type", "application/json")
                .header("idempotency-key", "fixed-key")
                .body(Body::from(body.to_string()))
                .unwrap()
        };

        let first = app.clone().oneshot(req(body.clone())).await.unwrap();
        assert_eq!(first.status(), StatusCode::CREATED);
        let first_json = body_json(first).await;

        let second = app.clone().oneshot(req(body)).await.unwrap();
        assert_eq!(second.status(), StatusCode::CREATED);
        let second_json = body_json(second).await;

        assert_eq!(first_json["id"], second_json["id"]);

        let all = projects_db::list_projects(&pool).await.unwrap();
        assert_eq!(all.iter().filter(|p| p.name == "Idem Project").count(), 1);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_list_agents_requires_project_id() {
        let (pool, db_name) = create_test_db().await;
        let state = test_state(pool.clone()).await;

        let resp = send_get(state, "/api/agents").await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_register_and_list_agent() {
        let (pool, db_name) = create_test_db().await;
        let state = test_state(pool.clone()).await;

        let project = projects_db::insert_project(&pool, "agent-proj", "Agent Proj", "/tmp/agent-proj", None).await.unwrap();

        let resp = send_json(
            state.clone(),
            "POST",
            "/api/agents",
            serde_json::json!({
                "project_id": project.id,
                "name": "reviewer",
                "agent_type": "analysis",
                "risk": "auto",
                "image": "hub/reviewer:latest",
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);

        let resp = send_get(state, &format!("/api/agents?project_id={}", project.id)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let agents = body_json(resp).await;
        assert_eq!(agents.as_array().unwrap().len(), 1);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_create_workflow_rejects_unknown_trigger() {
        let (pool, db_name) = create_test_db().await;
        let state = test_state(pool.clone()).await;

        let project = projects_db::insert_project(&pool, "wf-proj", "Wf Proj", "/tmp/wf-proj", None).await.unwrap();

        let resp = send_json(
            state,
            "POST",
            "/api/workflows",
            serde_json::json!({"project_id": project.id, "name": "demo", "trigger": "bogus"}),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_activate_workflow_rejects_cycle() {
        let (pool, db_name) = create_test_db().await;
        let state = test_state(pool.clone()).await;

        let project = projects_db::insert_project(&pool, "cyc-proj", "Cyc Proj", "/tmp/cyc-proj", None).await.unwrap();
        let agent = agents_db::insert_agent(
            &pool,
            &agents_db::NewAgent {
                project_id: project.id,
                name: "a".to_string(),
                agent_type: AgentType::Action,
                risk: AgentRisk::Auto,
                image: "img".to_string(),
                input_schema: serde_json::json!({}),
                output_schema: serde_json::json!({}),
                capabilities: vec![],
            },
        )
        .await
        .unwrap();
        let workflow = workflows_db::insert_workflow(&pool, project.id, "cyclic", WorkflowTrigger::Manual).await.unwrap();
        let n1 = workflows_db::insert_workflow_node(
            &pool,
            &workflows_db::NewWorkflowNode {
                workflow_id: workflow.id,
                node_key: "a".to_string(),
                agent_id: agent.id,
                action: "run".to_string(),
                static_input_template: serde_json::json!({}),
                approval_required: false,
                retry_max_attempts: 1,
                retry_backoff_base_ms: 1000,
                retry_backoff_cap_ms: 60_000,
            },
        )
        .await
        .unwrap();
        let n2 = workflows_db::insert_workflow_node(
            &pool,
            &workflows_db::NewWorkflowNode {
                workflow_id: workflow.id,
                node_key: "b".to_string(),
                agent_id: agent.id,
                action: "run".to_string(),
                static_input_template: serde_json::json!({}),
                approval_required: false,
                retry_max_attempts: 1,
                retry_backoff_base_ms: 1000,
                retry_backoff_cap_ms: 60_000,
            },
        )
        .await
        .unwrap();
        workflows_db::insert_workflow_edge(&pool, workflow.id, n1.id, n2.id).await.unwrap();
        workflows_db::insert_workflow_edge(&pool, workflow.id, n2.id, n1.id).await.unwrap();

        let resp = send_json(state, "POST", &format!("/api/workflows/{}/activate", workflow.id), serde_json::json!({})).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_federation_register_and_get() {
        let (pool, db_name) = create_test_db().await;
        let state = test_state(pool.clone()).await;

        let resp = send_json(
            state.clone(),
            "POST",
            "/api/fed/projects",
            serde_json::json!({"slug": "child-1", "name": "Child One", "hub_url": "https://child-1.example", "mesh_namespace": "ns-a"}),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);

        let resp = send_get(state, "/api/fed/projects/child-1").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["status"], "online");

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_webhook_requires_workflow_id() {
        let (pool, db_name) = create_test_db().await;
        let state = test_state(pool.clone()).await;

        let resp = send_json(state, "POST", "/api/webhooks/alertmanager", serde_json::json!({"status": "firing"})).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_api_key_gating() {
        let (pool, db_name) = create_test_db().await;
        let mut state = test_state(pool.clone()).await;
        state.config = Arc::new(HubConfig { api_keys: vec!["secret-key".to_string()], ..(*state.config).clone() });

        let app = super::build_router(state);

        let unauthenticated = app
            .clone()
            .oneshot(Request::builder().uri("/api/projects").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(unauthenticated.status(), StatusCode::UNAUTHORIZED);

        let authenticated = app
            .oneshot(
                Request::builder()
                    .uri("/api/projects")
                    .header("authorization", "Bearer secret-key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(authenticated.status(), StatusCode::OK);

        pool.close().await;
        drop_test_db(&db_name).await;
    }
}
