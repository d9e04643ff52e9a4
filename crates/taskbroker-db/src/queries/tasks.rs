use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value as Json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Task, TaskStatus};

/// Fields needed to create a task. Scoring/routing fields are left unset
/// here; they are populated separately by the scoring and routing passes.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub title: String,
    pub description: String,
    pub owner: String,
    pub required_capabilities: Vec<String>,
    pub priority: i16,
    pub source: String,
    pub parent_task_id: Option<Uuid>,
    pub max_retries: i32,
    pub timeout_seconds: i32,
    pub labels: Vec<String>,
    pub file_patterns: Vec<String>,
    pub one_way_door: bool,
    pub metadata: Json,
}

pub async fn create_task(pool: &PgPool, new: &NewTask) -> Result<Task> {
    sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (
            title, description, owner, required_capabilities, priority,
            source, parent_task_id, max_retries, timeout_seconds, labels,
            file_patterns, one_way_door, metadata
         ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
         RETURNING *",
    )
    .bind(&new.title)
    .bind(&new.description)
    .bind(&new.owner)
    .bind(&new.required_capabilities)
    .bind(new.priority)
    .bind(&new.source)
    .bind(new.parent_task_id)
    .bind(new.max_retries)
    .bind(new.timeout_seconds)
    .bind(&new.labels)
    .bind(&new.file_patterns)
    .bind(new.one_way_door)
    .bind(&new.metadata)
    .fetch_one(pool)
    .await
    .context("failed to create task")
}

pub async fn get_task(pool: &PgPool, id: Uuid) -> Result<Option<Task>> {
    sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .with_context(|| format!("failed to fetch task {id}"))
}

/// The next `limit` pending tasks whose required capabilities are a subset
/// of `capabilities`, ordered by priority then age, skipping any agent in
/// `excluded_agents` (the admin drain set).
pub async fn next_pending_for_agent(
    pool: &PgPool,
    capabilities: &[String],
    limit: i64,
) -> Result<Vec<Task>> {
    sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks
         WHERE status = 'pending'
           AND required_capabilities <@ $1::text[]
         ORDER BY priority DESC, created_at ASC
         LIMIT $2",
    )
    .bind(capabilities)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list pending tasks")
}

/// Every pending task ordered by priority then age, with no capability
/// filter. Used by callers that score capability fit themselves.
pub async fn list_pending(pool: &PgPool, limit: i64) -> Result<Vec<Task>> {
    sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks
         WHERE status = 'pending'
         ORDER BY priority DESC, created_at ASC
         LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list pending tasks")
}

/// Conditionally move a task from one status to another, only succeeding
/// if the row is still in `from` (optimistic concurrency). Returns `true`
/// if the transition was applied.
pub async fn transition_status(
    pool: &PgPool,
    id: Uuid,
    from: TaskStatus,
    to: TaskStatus,
) -> Result<bool> {
    let now = Utc::now();
    let result = sqlx::query(
        "UPDATE tasks SET status = $1, updated_at = $2 WHERE id = $3 AND status = $4",
    )
    .bind(to.to_string())
    .bind(now)
    .bind(id)
    .bind(from.to_string())
    .execute(pool)
    .await
    .with_context(|| format!("failed to transition task {id} from {from} to {to}"))?;
    Ok(result.rows_affected() == 1)
}

pub async fn assign_task(pool: &PgPool, id: Uuid, agent_id: &str) -> Result<bool> {
    let now = Utc::now();
    let result = sqlx::query(
        "UPDATE tasks SET status = 'assigned', assigned_agent = $1, assigned_at = $2,
            updated_at = $2
         WHERE id = $3 AND status = 'pending'",
    )
    .bind(agent_id)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await
    .with_context(|| format!("failed to assign task {id} to {agent_id}"))?;
    Ok(result.rows_affected() == 1)
}

pub async fn mark_started(pool: &PgPool, id: Uuid, agent_id: &str) -> Result<bool> {
    let now = Utc::now();
    let result = sqlx::query(
        "UPDATE tasks SET status = 'in_progress', started_at = $1, updated_at = $1
         WHERE id = $2 AND status = 'assigned' AND assigned_agent = $3",
    )
    .bind(now)
    .bind(id)
    .bind(agent_id)
    .execute(pool)
    .await
    .with_context(|| format!("failed to start task {id}"))?;
    Ok(result.rows_affected() == 1)
}

pub async fn mark_completed(pool: &PgPool, id: Uuid, result_payload: &Json) -> Result<bool> {
    let now = Utc::now();
    let updated = sqlx::query(
        "UPDATE tasks SET status = 'completed', result = $1, completed_at = $2, updated_at = $2
         WHERE id = $3 AND status = 'in_progress'",
    )
    .bind(result_payload)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await
    .with_context(|| format!("failed to complete task {id}"))?;
    Ok(updated.rows_affected() == 1)
}

pub async fn mark_failed(pool: &PgPool, id: Uuid, error: &str) -> Result<bool> {
    let now = Utc::now();
    let updated = sqlx::query(
        "UPDATE tasks SET status = 'failed', error = $1, completed_at = $2, updated_at = $2,
            retry_count = retry_count + 1
         WHERE id = $3 AND status IN ('in_progress', 'assigned')",
    )
    .bind(error)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await
    .with_context(|| format!("failed to mark task {id} failed"))?;
    Ok(updated.rows_affected() == 1)
}

/// Tasks assigned or in progress whose elapsed time now exceeds their
/// own `timeout_seconds`.
pub async fn find_timed_out(pool: &PgPool) -> Result<Vec<Task>> {
    sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks
         WHERE status IN ('assigned', 'in_progress')
           AND EXTRACT(EPOCH FROM (now() - COALESCE(started_at, assigned_at))) > timeout_seconds",
    )
    .fetch_all(pool)
    .await
    .context("failed to list timed-out tasks")
}

pub async fn requeue_for_retry(pool: &PgPool, id: Uuid) -> Result<bool> {
    let now = Utc::now();
    let updated = sqlx::query(
        "UPDATE tasks SET status = 'pending', assigned_agent = '', assigned_at = NULL,
            started_at = NULL, error = NULL, retry_count = retry_count + 1, updated_at = $1
         WHERE id = $2 AND retry_eligible AND retry_count < max_retries
           AND status IN ('assigned', 'in_progress')",
    )
    .bind(now)
    .bind(id)
    .execute(pool)
    .await
    .with_context(|| format!("failed to requeue task {id}"))?;
    Ok(updated.rows_affected() == 1)
}

pub async fn mark_timed_out(pool: &PgPool, id: Uuid) -> Result<bool> {
    let now = Utc::now();
    let updated = sqlx::query(
        "UPDATE tasks SET status = 'timed_out', updated_at = $1
         WHERE id = $2 AND status IN ('assigned', 'in_progress')",
    )
    .bind(now)
    .bind(id)
    .execute(pool)
    .await
    .with_context(|| format!("failed to mark task {id} timed out"))?;
    Ok(updated.rows_affected() == 1)
}

pub async fn set_scoring(
    pool: &PgPool,
    id: Uuid,
    oversight_level: &str,
    risk: f32,
    complexity: f32,
    verifiability: f32,
    reversibility: f32,
    uncertainty: f32,
    contextuality: f32,
    subjectivity: f32,
    cost_tokens: i64,
    cost_usd: f64,
    fast_path: bool,
    factors: &Json,
) -> Result<()> {
    sqlx::query(
        "UPDATE tasks SET
            oversight_level = $1, risk_score = $2, complexity_score = $3,
            verifiability_score = $4, reversibility_score = $5, uncertainty_score = $6,
            contextuality_score = $7, subjectivity_score = $8, cost_estimate_tokens = $9,
            cost_estimate_usd = $10, fast_path = $11, scoring_factors = $12,
            updated_at = now()
         WHERE id = $13",
    )
    .bind(oversight_level)
    .bind(risk)
    .bind(complexity)
    .bind(verifiability)
    .bind(reversibility)
    .bind(uncertainty)
    .bind(contextuality)
    .bind(subjectivity)
    .bind(cost_tokens)
    .bind(cost_usd)
    .bind(fast_path)
    .bind(factors)
    .bind(id)
    .execute(pool)
    .await
    .with_context(|| format!("failed to record scoring for task {id}"))?;
    Ok(())
}

pub async fn set_routing(
    pool: &PgPool,
    id: Uuid,
    model_tier: &str,
    recommended_model: &str,
    routing_method: &str,
    runtime: &str,
) -> Result<()> {
    sqlx::query(
        "UPDATE tasks SET model_tier = $1, recommended_model = $2, routing_method = $3,
            runtime = $4, updated_at = now()
         WHERE id = $5",
    )
    .bind(model_tier)
    .bind(recommended_model)
    .bind(routing_method)
    .bind(runtime)
    .bind(id)
    .execute(pool)
    .await
    .with_context(|| format!("failed to record routing for task {id}"))?;
    Ok(())
}

/// How many tasks `agent_slug` currently has assigned or in progress, for
/// the scoring engine's availability factor.
pub async fn active_count_for_agent(pool: &PgPool, agent_slug: &str) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM tasks WHERE assigned_agent = $1 AND status IN ('assigned', 'in_progress')",
    )
    .bind(agent_slug)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to count active tasks for {agent_slug}"))?;
    Ok(count)
}

pub async fn count_by_status(pool: &PgPool) -> Result<Vec<(String, i64)>> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT status, COUNT(*) FROM tasks GROUP BY status")
            .fetch_all(pool)
            .await
            .context("failed to count tasks by status")?;
    Ok(rows)
}
