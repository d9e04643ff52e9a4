use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::PgPool;
use taskbroker_core::broker::{AgentCandidate, AgentSource, Broker, BrokerTuning};
use taskbroker_core::directories::{AgentRuntime, HttpAgentRuntime, HttpPersonaDirectory, PersonaDirectory, RuntimeStatus};
use taskbroker_core::eventbus::EventBus;
use taskbroker_core::scoring::Availability;
use taskbroker_core::stage::{self, CriterionState, StageAction};
use taskbroker_core::BrokerConfig;
use taskbroker_db::models::{BacklogItem, GatePolicy, StageGateCriterion, Task};
use taskbroker_db::queries::backlog::NewBacklogItem;
use taskbroker_db::queries::tasks::NewTask;
use taskbroker_db::{PgStore, Store};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;
use uuid::Uuid;

/// Wraps `BrokerError` for the HTTP boundary: internal failures are
/// logged here and returned as an opaque 500, everything else carries
/// its own status and message straight through.
struct AppError(taskbroker_core::BrokerError);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "internal error handling request");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        Self(taskbroker_core::BrokerError::Internal(e))
    }
}

impl From<taskbroker_core::BrokerError> for AppError {
    fn from(e: taskbroker_core::BrokerError) -> Self {
        Self(e)
    }
}

#[derive(Clone)]
struct AppState {
    store: Arc<dyn Store>,
    config: Arc<BrokerConfig>,
    bus: Arc<dyn EventBus>,
}

/// The task/backlog surface agents use, authenticated by `X-Agent-ID`
/// rather than the admin bearer token.
fn agent_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/tasks", post(create_task).get(list_tasks))
        .route("/api/v1/tasks/{id}", get(get_task))
        .route("/api/v1/tasks/{id}/events", get(task_events))
        .route("/api/v1/tasks/{id}/complete", post(complete_task))
        .route("/api/v1/tasks/{id}/fail", post(fail_task))
        .route("/api/v1/tasks/{id}/progress", post(progress_task))
        .route("/api/v1/backlog", post(create_backlog_item).get(ready_backlog_items))
        .route("/api/v1/backlog/{id}", get(get_backlog_item))
        .route(
            "/api/v1/backlog/{id}/dependencies",
            post(add_dependency).get(list_dependencies),
        )
        .route(
            "/api/v1/backlog/{id}/gates/{stage}",
            post(add_gate_criterion).get(list_gate_criteria),
        )
        .route(
            "/api/v1/backlog/{id}/gates/{stage}/request-changes",
            post(request_gate_changes),
        )
        .route("/api/v1/gates/{id}/satisfy", post(satisfy_gate_criterion))
        .route("/api/v1/backlog/{id}/discovery-complete", post(complete_discovery))
        .with_state(state)
        .layer(axum::middleware::from_fn(crate::auth::require_agent_id))
}

/// `/health` plus the agent-facing surface, with no admin token required.
/// Used directly by tests that don't want to exercise admin auth.
fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(agent_router(state))
}

async fn health() -> StatusCode {
    StatusCode::OK
}

/// Routes that require `Authorization: Bearer <admin_token>` (and, per
/// the same rule agents follow, `X-Agent-ID`), kept on a separate
/// sub-router so neither middleware wraps `/health` or the plain agent
/// surface.
fn admin_router(state: AppState, admin_token: Arc<String>) -> Router {
    Router::new()
        .route("/api/v1/admin/drain/{agent_id}", post(drain_agent))
        .route("/api/v1/admin/undrain/{agent_id}", post(undrain_agent))
        .route("/api/v1/admin/stats", get(stats))
        .route(
            "/api/v1/admin/autonomy",
            get(get_autonomy_config).put(set_autonomy_config),
        )
        .with_state(state)
        .layer(axum::middleware::from_fn_with_state(
            admin_token,
            crate::auth::require_admin_token,
        ))
        .layer(axum::middleware::from_fn(crate::auth::require_agent_id))
}

/// Build the full router: `/health`, the agent surface behind
/// `X-Agent-ID`, and the admin surface behind both the bearer token and
/// `X-Agent-ID`.
fn router_with_auth(state: AppState, admin_token: Arc<String>) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(agent_router(state.clone()))
        .merge(admin_router(state, admin_token))
}

/// An `AgentRuntime` for deployments with no separate runtime watcher:
/// every known persona is treated as reachable.
struct AlwaysReachable;

#[async_trait::async_trait]
impl AgentRuntime for AlwaysReachable {
    async fn status(&self, agent_slug: &str) -> Result<RuntimeStatus> {
        Ok(RuntimeStatus {
            agent_slug: agent_slug.to_owned(),
            reachable: true,
        })
    }
}

/// Resolves candidates from the persona directory and the agent runtime,
/// enriching each with the store's per-agent activity/trust/cost stats
/// the scoring engine needs.
struct StoreBackedAgents {
    store: Arc<dyn Store>,
    personas: Arc<dyn PersonaDirectory>,
    runtime: Arc<dyn AgentRuntime>,
    max_concurrent_per_agent: i64,
    history_sample: i64,
}

#[async_trait::async_trait]
impl AgentSource for StoreBackedAgents {
    async fn candidates(&self) -> Result<Vec<AgentCandidate>> {
        let personas = self.personas.list_personas().await?;
        let mut candidates = Vec::with_capacity(personas.len());
        for persona in personas.into_iter().filter(|p| p.active) {
            let status = self.runtime.status(&persona.agent_slug).await?;
            let active_tasks = self.store.agent_active_task_count(&persona.agent_slug).await?;
            let availability = if !status.reachable {
                Availability::Sleeping
            } else if active_tasks >= self.max_concurrent_per_agent {
                Availability::Busy
            } else {
                Availability::Ready
            };
            let trust = self.store.agent_trust_overall(&persona.agent_slug).await?;
            let avg_cost_usd = self.store.agent_avg_cost_usd(&persona.agent_slug, self.history_sample).await?;
            let avg_duration_seconds =
                self.store.agent_avg_duration_seconds(&persona.agent_slug, self.history_sample).await?;
            candidates.push(AgentCandidate {
                agent_id: persona.agent_slug,
                capabilities: persona.capabilities,
                availability,
                active_tasks,
                max_concurrent: self.max_concurrent_per_agent,
                trust,
                avg_cost_usd,
                avg_duration_seconds,
            });
        }
        Ok(candidates)
    }
}

pub async fn run(config: BrokerConfig, pool: PgPool) -> Result<()> {
    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool));
    let bus = Arc::new(taskbroker_core::eventbus::InMemoryEventBus::new());

    let personas: Arc<dyn PersonaDirectory> = match &config.persona_directory_url {
        Some(url) => Arc::new(HttpPersonaDirectory::new(url.clone())),
        None => Arc::new(taskbroker_core::directories::testing::InMemoryPersonaDirectory::default()),
    };
    let runtime: Arc<dyn AgentRuntime> = match &config.agent_runtime_url {
        Some(url) => Arc::new(HttpAgentRuntime::new(url.clone())),
        None => Arc::new(AlwaysReachable),
    };
    let agents = Arc::new(StoreBackedAgents {
        store: store.clone(),
        personas,
        runtime,
        max_concurrent_per_agent: config.max_concurrent_per_agent,
        history_sample: 20,
    });

    let tuning = BrokerTuning {
        weights: config.weights,
        owner_filter_enabled: config.owner_filter_enabled,
        assignment_batch_size: config.assignment_batch_size,
    };

    let bus_for_handlers: Arc<dyn EventBus> = bus.clone();

    let broker = Arc::new(Broker::with_tuning(
        store.clone(),
        agents,
        bus,
        Duration::from_millis(config.tick_interval_ms),
        Duration::from_millis(config.timeout_check_interval_ms),
        Duration::from_secs(config.drain_deadline_secs),
        tuning,
    ));

    let cancel = CancellationToken::new();
    let broker_for_loop = broker.clone();
    let loop_cancel = cancel.clone();
    let loop_handle = tokio::spawn(async move { broker_for_loop.run(loop_cancel).await });

    let admin_token = Arc::new(config.admin_token.clone());
    let app_state = AppState {
        store,
        config: Arc::new(config),
        bus: bus_for_handlers,
    };

    let app = router_with_auth(app_state, admin_token).layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            cancel.cancel();
        })
        .await?;

    loop_handle.await??;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct CreateTaskRequest {
    title: String,
    #[serde(default)]
    description: String,
    owner: String,
    #[serde(default)]
    required_capabilities: Vec<String>,
    #[serde(default = "default_priority")]
    priority: i16,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    file_patterns: Vec<String>,
    #[serde(default)]
    one_way_door: bool,
    #[serde(default = "default_max_retries")]
    max_retries: i32,
    #[serde(default = "default_timeout_seconds")]
    timeout_seconds: i32,
    #[serde(default)]
    metadata: Value,
}

fn default_priority() -> i16 {
    5
}
fn default_max_retries() -> i32 {
    3
}
fn default_timeout_seconds() -> i32 {
    300
}

async fn create_task(
    State(state): State<AppState>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<Json<Task>, AppError> {
    let new_task = NewTask {
        title: req.title,
        description: req.description,
        owner: req.owner,
        required_capabilities: req.required_capabilities,
        priority: req.priority,
        source: "manual".to_owned(),
        parent_task_id: None,
        max_retries: req.max_retries,
        timeout_seconds: req.timeout_seconds,
        labels: req.labels,
        file_patterns: req.file_patterns,
        one_way_door: req.one_way_door,
        metadata: if req.metadata.is_null() { json!({}) } else { req.metadata },
    };
    let task = state.store.create_task(&new_task).await?;
    Ok(Json(task))
}

async fn get_task(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Task>, AppError> {
    let task = state
        .store
        .get_task(id)
        .await?
        .ok_or(taskbroker_core::BrokerError::TaskNotFound(id))?;
    Ok(Json(task))
}

#[derive(Debug, Deserialize)]
struct CompleteTaskRequest {
    #[serde(default)]
    result: Value,
}

async fn complete_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<CompleteTaskRequest>,
) -> Result<StatusCode, AppError> {
    let ok = state.store.mark_completed(id, &req.result).await?;
    if ok {
        state.store.record_event(id, "completed", None, &req.result).await.ok();
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(taskbroker_core::BrokerError::InvalidTransition(format!("task {id} is not in progress")).into())
    }
}

#[derive(Debug, Deserialize)]
struct FailTaskRequest {
    error: String,
}

async fn fail_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<FailTaskRequest>,
) -> Result<StatusCode, AppError> {
    let ok = state.store.mark_failed(id, &req.error).await?;
    if ok {
        state
            .store
            .record_event(id, "failed", None, &json!({"error": req.error}))
            .await
            .ok();
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(
            taskbroker_core::BrokerError::InvalidTransition(format!("task {id} is not assigned or in progress"))
                .into(),
        )
    }
}

#[derive(Debug, Deserialize)]
struct ProgressTaskRequest {
    agent_id: String,
}

async fn progress_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ProgressTaskRequest>,
) -> Result<StatusCode, AppError> {
    let ok = state.store.mark_started(id, &req.agent_id).await?;
    if ok {
        state.store.record_event(id, "started", Some(&req.agent_id), &json!({})).await.ok();
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(taskbroker_core::BrokerError::InvalidTransition(format!("task {id} is not assigned to {}", req.agent_id)).into())
    }
}

#[derive(Debug, Deserialize)]
struct ListTasksQuery {
    #[serde(default = "default_list_limit")]
    limit: i64,
}

fn default_list_limit() -> i64 {
    50
}

/// Lists pending tasks, unfiltered by capability. Agents poll this with
/// their own capability set via `GET /tasks?capability=...`; the broker's
/// tick loop uses `Store::next_pending_for_agent` directly rather than
/// going through HTTP.
async fn list_tasks(
    State(state): State<AppState>,
    axum::extract::Query(q): axum::extract::Query<ListTasksQuery>,
) -> Result<Json<Vec<Task>>, AppError> {
    let tasks = state.store.list_pending(q.limit).await?;
    Ok(Json(tasks))
}

async fn task_events(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    state
        .store
        .get_task(id)
        .await?
        .ok_or(taskbroker_core::BrokerError::TaskNotFound(id))?;
    let history = state.store.history_for_task(id).await?;
    Ok(Json(json!(history)))
}

#[derive(Debug, Deserialize)]
struct CreateBacklogItemRequest {
    title: String,
    #[serde(default)]
    description: String,
    item_type: String,
    #[serde(default = "default_domain")]
    domain: String,
    #[serde(default)]
    assigned_to: Option<String>,
    #[serde(default)]
    parent_id: Option<Uuid>,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    one_way_door: bool,
    #[serde(default)]
    metadata: Value,
}

fn default_domain() -> String {
    "core".to_owned()
}

async fn create_backlog_item(
    State(state): State<AppState>,
    Json(req): Json<CreateBacklogItemRequest>,
) -> Result<Json<BacklogItem>, AppError> {
    let new_item = NewBacklogItem {
        title: req.title,
        description: req.description,
        item_type: req.item_type,
        domain: req.domain,
        assigned_to: req.assigned_to,
        parent_id: req.parent_id,
        labels: req.labels,
        one_way_door: req.one_way_door,
        metadata: if req.metadata.is_null() { json!({}) } else { req.metadata },
    };
    let item = state.store.create_backlog_item(&new_item).await?;
    Ok(Json(item))
}

async fn get_backlog_item(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<BacklogItem>, AppError> {
    let item = state
        .store
        .get_backlog_item(id)
        .await?
        .ok_or(taskbroker_core::BrokerError::BacklogItemNotFound(id))?;
    Ok(Json(item))
}

#[derive(Debug, Deserialize)]
struct ReadyBacklogQuery {
    #[serde(default = "default_list_limit")]
    limit: i64,
}

async fn ready_backlog_items(
    State(state): State<AppState>,
    axum::extract::Query(q): axum::extract::Query<ReadyBacklogQuery>,
) -> Result<Json<Vec<BacklogItem>>, AppError> {
    let items = state.store.ready_backlog_items(q.limit).await?;
    Ok(Json(items))
}

#[derive(Debug, Deserialize)]
struct AddDependencyRequest {
    blocker_id: Uuid,
}

async fn add_dependency(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<AddDependencyRequest>,
) -> Result<StatusCode, AppError> {
    state
        .store
        .add_dependency(id, req.blocker_id)
        .await
        .map_err(|e| taskbroker_core::BrokerError::Validation(e.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_dependencies(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let deps = state.store.dependencies_of(id).await?;
    Ok(Json(json!(deps)))
}

#[derive(Debug, Deserialize)]
struct AddGateCriterionRequest {
    criterion: String,
    policy: String,
}

async fn add_gate_criterion(
    State(state): State<AppState>,
    Path((id, stage)): Path<(Uuid, String)>,
    Json(req): Json<AddGateCriterionRequest>,
) -> Result<Json<StageGateCriterion>, AppError> {
    let criterion = state
        .store
        .add_gate_criterion(id, &stage, &req.criterion, &req.policy)
        .await?;
    Ok(Json(criterion))
}

async fn list_gate_criteria(
    State(state): State<AppState>,
    Path((id, stage)): Path<(Uuid, String)>,
) -> Result<Json<Vec<StageGateCriterion>>, AppError> {
    let criteria = state.store.criteria_for_stage(id, &stage).await?;
    Ok(Json(criteria))
}

#[derive(Debug, Deserialize)]
struct SatisfyGateRequest {
    satisfied_by: String,
}

async fn satisfy_gate_criterion(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<SatisfyGateRequest>,
) -> Result<StatusCode, AppError> {
    let satisfied = state.store.satisfy_gate_criterion(id, &req.satisfied_by).await?;
    if !satisfied {
        return Ok(StatusCode::CONFLICT);
    }
    let criterion = state
        .store
        .get_gate_criterion(id)
        .await?
        .ok_or(taskbroker_core::BrokerError::GateCriterionNotFound(id))?;
    if matches!(criterion.policy, GatePolicy::HumanReview | GatePolicy::HumanApprove) {
        state.store.apply_autonomy_feedback(true).await?;
    }
    advance_stage_if_ready(&state, criterion.item_id, &criterion.stage).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct RequestGateChangesRequest {
    requested_by: String,
}

/// An admin decision that the current stage's work isn't acceptable yet:
/// unsatisfies every criterion in the stage and records it as an autonomy
/// correction.
async fn request_gate_changes(
    State(state): State<AppState>,
    Path((id, stage)): Path<(Uuid, String)>,
    Json(req): Json<RequestGateChangesRequest>,
) -> Result<StatusCode, AppError> {
    let reset = state.store.reset_stage_to_active(id, &stage).await?;
    if reset == 0 {
        return Ok(StatusCode::CONFLICT);
    }
    state.store.apply_autonomy_feedback(false).await?;
    state
        .bus
        .publish(
            &format!("backlog.{id}.stage_reset"),
            &json!({"stage": stage, "requested_by": req.requested_by}),
        )
        .await
        .ok();
    Ok(StatusCode::NO_CONTENT)
}

/// Check whether every criterion in `stage` is now satisfied and, if so,
/// move the item to the next stage (or mark it done on the last one).
async fn advance_stage_if_ready(state: &AppState, item_id: Uuid, stage: &str) -> Result<(), AppError> {
    let item = state
        .store
        .get_backlog_item(item_id)
        .await?
        .ok_or(taskbroker_core::BrokerError::BacklogItemNotFound(item_id))?;
    if item.stage_template.is_empty() || item.current_stage.as_deref() != Some(stage) {
        return Ok(());
    }

    let criteria = state.store.criteria_for_stage(item_id, stage).await?;
    let states: Vec<CriterionState> = criteria
        .iter()
        .map(|c| CriterionState {
            policy: c.policy,
            satisfied: c.satisfied,
        })
        .collect();
    let is_terminal = item.stage_index as usize + 1 >= item.stage_template.len();

    match stage::evaluate_stage(&states, is_terminal) {
        StageAction::Advance => {
            let next_index = item.stage_index + 1;
            let next_stage = item.stage_template[next_index as usize].clone();
            state
                .store
                .set_stage(item_id, &item.stage_template, Some(&next_stage), next_index)
                .await?;
            state
                .bus
                .publish(
                    &format!("backlog.{item_id}.stage_advanced"),
                    &json!({"from": stage, "to": next_stage}),
                )
                .await
                .ok();
        }
        StageAction::Complete => {
            state.store.set_backlog_status(item_id, "done").await?;
            state
                .bus
                .publish(
                    &format!("backlog.{item_id}.item_completed"),
                    &json!({"stage": stage}),
                )
                .await
                .ok();
        }
        StageAction::HumanRequired | StageAction::Hold => {}
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct CompleteDiscoveryRequest {
    assessment: Value,
    impact: f32,
    urgency: f32,
    estimated_tokens: f64,
    effort_estimate: f64,
    #[serde(default)]
    subtasks: Vec<DiscoverySubtask>,
}

#[derive(Debug, Deserialize)]
struct DiscoverySubtask {
    title: String,
    #[serde(default)]
    description: String,
    owner: String,
    #[serde(default)]
    required_capabilities: Vec<String>,
    #[serde(default = "default_priority")]
    priority: i16,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    file_patterns: Vec<String>,
    #[serde(default)]
    one_way_door: bool,
    #[serde(default = "default_max_retries")]
    max_retries: i32,
    #[serde(default = "default_timeout_seconds")]
    timeout_seconds: i32,
}

#[derive(Debug, Serialize)]
struct CompleteDiscoveryResponse {
    item: BacklogItem,
    subtasks: Vec<Task>,
}

async fn complete_discovery(
    State(state): State<AppState>,
    Path(item_id): Path<Uuid>,
    Json(req): Json<CompleteDiscoveryRequest>,
) -> Result<Json<CompleteDiscoveryResponse>, AppError> {
    let outcome = taskbroker_db::queries::discovery::DiscoveryOutcome {
        item_id,
        assessment: req.assessment,
        impact: req.impact,
        urgency: req.urgency,
        estimated_tokens: req.estimated_tokens,
        effort_estimate: req.effort_estimate,
        subtasks: req
            .subtasks
            .into_iter()
            .map(|s| NewTask {
                title: s.title,
                description: s.description,
                owner: s.owner,
                required_capabilities: s.required_capabilities,
                priority: s.priority,
                source: "discovery".to_owned(),
                parent_task_id: None,
                max_retries: s.max_retries,
                timeout_seconds: s.timeout_seconds,
                labels: s.labels,
                file_patterns: s.file_patterns,
                one_way_door: s.one_way_door,
                metadata: json!({}),
            })
            .collect(),
    };

    let score_fn: &taskbroker_db::queries::discovery::ScoreFn =
        &|impact, urgency, has_unresolved_blockers, estimated_tokens, median_tokens| {
            taskbroker_core::backlog_scorer::score(&taskbroker_core::backlog_scorer::BacklogScoringInput {
                impact: Some(impact),
                urgency: Some(urgency),
                has_unresolved_blockers,
                estimated_tokens: Some(estimated_tokens),
                median_tokens,
            })
        };

    let routing = &state.config.model_routing;
    let tier_fn: &taskbroker_db::queries::discovery::TierFn = &|new_task| {
        let input = taskbroker_core::model_tier::RoutingInput {
            file_patterns: &new_task.file_patterns,
            labels: &new_task.labels,
            one_way_door: new_task.one_way_door,
            risk_score: None,
            complexity_score: None,
            reversibility_score: None,
        };
        let decision = taskbroker_core::model_tier::resolve_tier(
            &input,
            routing.enabled,
            &routing.cold_start_rules,
            routing.default_tier,
        );
        (
            decision.tier.to_string(),
            decision.recommended_model,
            decision.method.to_string(),
            decision.runtime.to_string(),
        )
    };

    let (item, subtasks) = state
        .store
        .apply_discovery_outcome(&outcome, score_fn, tier_fn)
        .await?;
    Ok(Json(CompleteDiscoveryResponse { item, subtasks }))
}

#[derive(Debug, Serialize)]
struct AutonomyConfigResponse {
    default_oversight_level: String,
    thresholds: Value,
}

async fn get_autonomy_config(State(state): State<AppState>) -> Result<Json<AutonomyConfigResponse>, AppError> {
    let config = state.store.autonomy_config().await?;
    Ok(Json(AutonomyConfigResponse {
        default_oversight_level: config.default_oversight_level.to_string(),
        thresholds: config.thresholds,
    }))
}

#[derive(Debug, Deserialize)]
struct SetAutonomyConfigRequest {
    default_oversight_level: String,
    actor: String,
}

async fn set_autonomy_config(
    State(state): State<AppState>,
    Json(req): Json<SetAutonomyConfigRequest>,
) -> Result<StatusCode, AppError> {
    state
        .store
        .set_default_oversight(&req.default_oversight_level, &req.actor)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct DrainRequest {
    #[serde(default)]
    reason: String,
    actor: String,
}

async fn drain_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Json(req): Json<DrainRequest>,
) -> Result<StatusCode, AppError> {
    state.store.set_drained(&agent_id, &req.reason, &req.actor).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn undrain_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Json(req): Json<DrainRequest>,
) -> Result<StatusCode, AppError> {
    state.store.clear_drained(&agent_id, &req.actor).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    tasks_by_status: Vec<(String, i64)>,
    backlog_by_status: Vec<(String, i64)>,
    drained_agent_count: i64,
}

async fn stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, AppError> {
    let stats = state.store.stats().await?;
    Ok(Json(StatsResponse {
        tasks_by_status: stats.tasks_by_status,
        backlog_by_status: stats.backlog_by_status,
        drained_agent_count: stats.drained_agent_count,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use taskbroker_db::MemStore;
    use tower::ServiceExt;

    fn test_app() -> Router {
        let state = AppState {
            store: Arc::new(MemStore::default()),
            config: Arc::new(BrokerConfig::default()),
            bus: Arc::new(taskbroker_core::eventbus::InMemoryEventBus::new()),
        };
        router(state)
    }

    #[tokio::test]
    async fn get_unknown_task_returns_404() {
        let app = test_app();
        let request = Request::builder()
            .uri(format!("/api/v1/tasks/{}", Uuid::new_v4()))
            .header("X-Agent-ID", "agent-1")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn create_then_get_task_round_trips() {
        let app = test_app();

        let create_request = Request::builder()
            .method("POST")
            .uri("/api/v1/tasks")
            .header("content-type", "application/json")
            .header("X-Agent-ID", "agent-1")
            .body(Body::from(
                json!({"title": "ship it", "owner": "team-a"}).to_string(),
            ))
            .unwrap();
        let create_response = app.clone().oneshot(create_request).await.unwrap();
        assert_eq!(create_response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(create_response.into_body(), usize::MAX)
            .await
            .unwrap();
        let created: Task = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(created.title, "ship it");

        let get_request = Request::builder()
            .uri(format!("/api/v1/tasks/{}", created.id))
            .header("X-Agent-ID", "agent-1")
            .body(Body::empty())
            .unwrap();
        let get_response = app.oneshot(get_request).await.unwrap();
        assert_eq!(get_response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn admin_endpoints_reject_missing_token() {
        let state = AppState {
            store: Arc::new(MemStore::default()),
            config: Arc::new(BrokerConfig::default()),
            bus: Arc::new(taskbroker_core::eventbus::InMemoryEventBus::new()),
        };
        let app = router_with_auth(state, Arc::new("secret".to_owned()));

        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/admin/drain/agent-1")
            .header("content-type", "application/json")
            .header("X-Agent-ID", "agent-1")
            .body(Body::from(json!({"actor": "op"}).to_string()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn backlog_item_round_trips_and_lists_when_ready() {
        let app = test_app();

        let create_request = Request::builder()
            .method("POST")
            .uri("/api/v1/backlog")
            .header("content-type", "application/json")
            .header("X-Agent-ID", "agent-1")
            .body(Body::from(
                json!({"title": "explore caching", "item_type": "chore"}).to_string(),
            ))
            .unwrap();
        let create_response = app.clone().oneshot(create_request).await.unwrap();
        assert_eq!(create_response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(create_response.into_body(), usize::MAX)
            .await
            .unwrap();
        let created: BacklogItem = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(created.title, "explore caching");

        let get_request = Request::builder()
            .uri(format!("/api/v1/backlog/{}", created.id))
            .header("X-Agent-ID", "agent-1")
            .body(Body::empty())
            .unwrap();
        let get_response = app.oneshot(get_request).await.unwrap();
        assert_eq!(get_response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn self_dependency_is_rejected() {
        let app = test_app();

        let create_request = Request::builder()
            .method("POST")
            .uri("/api/v1/backlog")
            .header("content-type", "application/json")
            .header("X-Agent-ID", "agent-1")
            .body(Body::from(json!({"title": "a", "item_type": "story"}).to_string()))
            .unwrap();
        let create_response = app.clone().oneshot(create_request).await.unwrap();
        let bytes = axum::body::to_bytes(create_response.into_body(), usize::MAX)
            .await
            .unwrap();
        let item: BacklogItem = serde_json::from_slice(&bytes).unwrap();

        let dep_request = Request::builder()
            .method("POST")
            .uri(format!("/api/v1/backlog/{}/dependencies", item.id))
            .header("content-type", "application/json")
            .header("X-Agent-ID", "agent-1")
            .body(Body::from(json!({"blocker_id": item.id}).to_string()))
            .unwrap();
        let dep_response = app.oneshot(dep_request).await.unwrap();
        assert_eq!(dep_response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn discovery_complete_creates_subtasks() {
        let app = test_app();

        let create_request = Request::builder()
            .method("POST")
            .uri("/api/v1/backlog")
            .header("content-type", "application/json")
            .header("X-Agent-ID", "agent-1")
            .body(Body::from(json!({"title": "a", "item_type": "story"}).to_string()))
            .unwrap();
        let create_response = app.clone().oneshot(create_request).await.unwrap();
        let bytes = axum::body::to_bytes(create_response.into_body(), usize::MAX)
            .await
            .unwrap();
        let item: BacklogItem = serde_json::from_slice(&bytes).unwrap();

        let discovery_request = Request::builder()
            .method("POST")
            .uri(format!("/api/v1/backlog/{}/discovery-complete", item.id))
            .header("content-type", "application/json")
            .header("X-Agent-ID", "agent-1")
            .body(Body::from(
                json!({
                    "assessment": {"notes": "looks tractable"},
                    "impact": 0.8,
                    "urgency": 0.5,
                    "estimated_tokens": 4000.0,
                    "effort_estimate": 0.3,
                    "subtasks": [{"title": "spike it", "owner": "team-a"}],
                })
                .to_string(),
            ))
            .unwrap();
        let discovery_response = app.oneshot(discovery_request).await.unwrap();
        assert_eq!(discovery_response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(discovery_response.into_body(), usize::MAX)
            .await
            .unwrap();
        let parsed: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed["subtasks"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn completing_a_task_that_never_started_is_a_conflict() {
        let app = test_app();

        let create_request = Request::builder()
            .method("POST")
            .uri("/api/v1/tasks")
            .header("content-type", "application/json")
            .header("X-Agent-ID", "agent-1")
            .body(Body::from(json!({"title": "ship it", "owner": "team-a"}).to_string()))
            .unwrap();
        let create_response = app.clone().oneshot(create_request).await.unwrap();
        let bytes = axum::body::to_bytes(create_response.into_body(), usize::MAX)
            .await
            .unwrap();
        let task: Task = serde_json::from_slice(&bytes).unwrap();

        let complete_request = Request::builder()
            .method("POST")
            .uri(format!("/api/v1/tasks/{}/complete", task.id))
            .header("content-type", "application/json")
            .header("X-Agent-ID", "agent-1")
            .body(Body::from(json!({}).to_string()))
            .unwrap();
        let response = app.oneshot(complete_request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn progressing_an_unassigned_task_is_a_conflict() {
        let app = test_app();

        let create_request = Request::builder()
            .method("POST")
            .uri("/api/v1/tasks")
            .header("content-type", "application/json")
            .header("X-Agent-ID", "agent-1")
            .body(Body::from(json!({"title": "ship it", "owner": "team-a"}).to_string()))
            .unwrap();
        let create_response = app.clone().oneshot(create_request).await.unwrap();
        let bytes = axum::body::to_bytes(create_response.into_body(), usize::MAX)
            .await
            .unwrap();
        let task: Task = serde_json::from_slice(&bytes).unwrap();

        // The HTTP surface has no assign endpoint: assignment is the
        // broker's job, driven by its tick loop, not a caller action.
        let progress_request = Request::builder()
            .method("POST")
            .uri(format!("/api/v1/tasks/{}/progress", task.id))
            .header("content-type", "application/json")
            .header("X-Agent-ID", "agent-1")
            .body(Body::from(json!({"agent_id": "agent-1"}).to_string()))
            .unwrap();
        let response = app.oneshot(progress_request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn satisfying_a_non_terminal_gate_advances_the_stage() {
        let store = Arc::new(MemStore::default());
        let state = AppState {
            store: store.clone(),
            config: Arc::new(BrokerConfig::default()),
            bus: Arc::new(taskbroker_core::eventbus::InMemoryEventBus::new()),
        };
        let app = router(state);

        let create_request = Request::builder()
            .method("POST")
            .uri("/api/v1/backlog")
            .header("content-type", "application/json")
            .header("X-Agent-ID", "agent-1")
            .body(Body::from(json!({"title": "ship", "item_type": "story"}).to_string()))
            .unwrap();
        let create_response = app.clone().oneshot(create_request).await.unwrap();
        let bytes = axum::body::to_bytes(create_response.into_body(), usize::MAX)
            .await
            .unwrap();
        let item: BacklogItem = serde_json::from_slice(&bytes).unwrap();

        store
            .init_stages(item.id, &["build".to_owned(), "review".to_owned()])
            .await
            .unwrap();
        let criterion = store
            .add_gate_criterion(item.id, "build", "tests pass", "auto")
            .await
            .unwrap();

        let satisfy_request = Request::builder()
            .method("POST")
            .uri(format!("/api/v1/gates/{}/satisfy", criterion.id))
            .header("content-type", "application/json")
            .header("X-Agent-ID", "agent-1")
            .body(Body::from(json!({"satisfied_by": "agent-1"}).to_string()))
            .unwrap();
        let satisfy_response = app.oneshot(satisfy_request).await.unwrap();
        assert_eq!(satisfy_response.status(), StatusCode::NO_CONTENT);

        let advanced = store.get_backlog_item(item.id).await.unwrap().unwrap();
        assert_eq!(advanced.current_stage.as_deref(), Some("review"));
        assert_eq!(advanced.stage_index, 1);
    }

    #[tokio::test]
    async fn satisfying_the_terminal_gate_completes_the_item_and_counts_as_approval() {
        let store = Arc::new(MemStore::default());
        let state = AppState {
            store: store.clone(),
            config: Arc::new(BrokerConfig::default()),
            bus: Arc::new(taskbroker_core::eventbus::InMemoryEventBus::new()),
        };
        let app = router(state);

        let create_request = Request::builder()
            .method("POST")
            .uri("/api/v1/backlog")
            .header("content-type", "application/json")
            .header("X-Agent-ID", "agent-1")
            .body(Body::from(json!({"title": "ship", "item_type": "story"}).to_string()))
            .unwrap();
        let create_response = app.clone().oneshot(create_request).await.unwrap();
        let bytes = axum::body::to_bytes(create_response.into_body(), usize::MAX)
            .await
            .unwrap();
        let item: BacklogItem = serde_json::from_slice(&bytes).unwrap();

        store.init_stages(item.id, &["review".to_owned()]).await.unwrap();
        let criterion = store
            .add_gate_criterion(item.id, "review", "human sign-off", "human_approve")
            .await
            .unwrap();

        let satisfy_request = Request::builder()
            .method("POST")
            .uri(format!("/api/v1/gates/{}/satisfy", criterion.id))
            .header("content-type", "application/json")
            .header("X-Agent-ID", "agent-1")
            .body(Body::from(json!({"satisfied_by": "reviewer-1"}).to_string()))
            .unwrap();
        let satisfy_response = app.oneshot(satisfy_request).await.unwrap();
        assert_eq!(satisfy_response.status(), StatusCode::NO_CONTENT);

        let completed = store.get_backlog_item(item.id).await.unwrap().unwrap();
        assert_eq!(completed.status, taskbroker_db::models::BacklogStatus::Done);

        let autonomy = store.autonomy_config().await.unwrap();
        assert_eq!(autonomy.consecutive_approvals, 1);
    }

    #[tokio::test]
    async fn requesting_gate_changes_resets_criteria_and_records_a_correction() {
        let store = Arc::new(MemStore::default());
        let state = AppState {
            store: store.clone(),
            config: Arc::new(BrokerConfig::default()),
            bus: Arc::new(taskbroker_core::eventbus::InMemoryEventBus::new()),
        };
        let app = router(state);

        let create_request = Request::builder()
            .method("POST")
            .uri("/api/v1/backlog")
            .header("content-type", "application/json")
            .header("X-Agent-ID", "agent-1")
            .body(Body::from(json!({"title": "ship", "item_type": "story"}).to_string()))
            .unwrap();
        let create_response = app.clone().oneshot(create_request).await.unwrap();
        let bytes = axum::body::to_bytes(create_response.into_body(), usize::MAX)
            .await
            .unwrap();
        let item: BacklogItem = serde_json::from_slice(&bytes).unwrap();

        store.init_stages(item.id, &["review".to_owned()]).await.unwrap();
        let criterion = store
            .add_gate_criterion(item.id, "review", "human sign-off", "human_approve")
            .await
            .unwrap();
        store.satisfy_gate_criterion(criterion.id, "reviewer-1").await.unwrap();

        let request = Request::builder()
            .method("POST")
            .uri(format!("/api/v1/backlog/{}/gates/review/request-changes", item.id))
            .header("content-type", "application/json")
            .header("X-Agent-ID", "agent-1")
            .body(Body::from(json!({"requested_by": "reviewer-1"}).to_string()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let criteria = store.criteria_for_stage(item.id, "review").await.unwrap();
        assert!(!criteria[0].satisfied);

        let autonomy = store.autonomy_config().await.unwrap();
        assert_eq!(autonomy.consecutive_corrections, 1);
    }
}
