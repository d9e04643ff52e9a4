use anyhow::{Context, Result};
use serde_json::Value as Json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{BacklogItem, BacklogStatus, Task};
use crate::queries::tasks::NewTask;

/// Inputs a discovery run contributes about a single backlog item, plus
/// the subtasks it wants created underneath it.
#[derive(Debug, Clone)]
pub struct DiscoveryOutcome {
    pub item_id: Uuid,
    pub assessment: Json,
    pub impact: f32,
    pub urgency: f32,
    pub estimated_tokens: f64,
    pub effort_estimate: f64,
    pub subtasks: Vec<NewTask>,
}

/// A backlog item's priority score, computed by the caller-supplied
/// `score_fn` from `(impact, urgency, has_unresolved_blockers,
/// estimated_tokens, median_estimated_tokens)` before the row is written.
pub type ScoreFn = dyn Fn(f32, f32, bool, f64, Option<f64>) -> f32 + Send + Sync;

/// A subtask's recommended model tier, computed by the caller-supplied
/// `tier_fn` before the row is written. Returns
/// `(model_tier, recommended_model, routing_method, runtime)`.
pub type TierFn = dyn Fn(&NewTask) -> (String, String, String, String) + Send + Sync;

/// Atomically apply a discovery run's findings to one backlog item: lock
/// the row, overlay the assessment and priority score, and create its
/// subtasks.
///
/// `score_fn` and `tier_fn` are passed in rather than imported directly so
/// that this crate does not need to depend on the scoring/routing crate.
pub async fn apply_discovery_outcome(
    pool: &PgPool,
    outcome: &DiscoveryOutcome,
    score_fn: &ScoreFn,
    tier_fn: &TierFn,
) -> Result<(BacklogItem, Vec<Task>)> {
    let mut tx = pool.begin().await.context("failed to start discovery transaction")?;

    let item: BacklogItem = sqlx::query_as("SELECT * FROM backlog_items WHERE id = $1 FOR UPDATE")
        .bind(outcome.item_id)
        .fetch_one(&mut *tx)
        .await
        .with_context(|| format!("failed to lock backlog item {}", outcome.item_id))?;

    if item.status != BacklogStatus::InDiscovery {
        anyhow::bail!(
            "backlog item {} is not in discovery (status is {})",
            item.id,
            item.status
        );
    }

    let (has_unresolved_blockers,): (bool,) = sqlx::query_as(
        "SELECT EXISTS(
            SELECT 1 FROM backlog_dependencies WHERE blocked_id = $1 AND resolved_at IS NULL
         )",
    )
    .bind(item.id)
    .fetch_one(&mut *tx)
    .await
    .with_context(|| format!("failed to check unresolved blockers for item {}", item.id))?;

    let (median_estimated_tokens,): (Option<f64>,) = sqlx::query_as(
        "SELECT percentile_cont(0.5) WITHIN GROUP (ORDER BY estimated_tokens)
         FROM backlog_items WHERE estimated_tokens > 0",
    )
    .fetch_one(&mut *tx)
    .await
    .context("failed to compute median estimated tokens")?;

    let priority_score = score_fn(
        outcome.impact,
        outcome.urgency,
        has_unresolved_blockers,
        outcome.estimated_tokens,
        median_estimated_tokens,
    );

    let updated: BacklogItem = sqlx::query_as(
        "UPDATE backlog_items SET
            scores_source = 'discovery', discovery_assessment = $1,
            impact = $2, urgency = $3, estimated_tokens = $4,
            effort_estimate = $5, priority_score = $6, status = 'planned',
            updated_at = now()
         WHERE id = $7
         RETURNING *",
    )
    .bind(&outcome.assessment)
    .bind(outcome.impact)
    .bind(outcome.urgency)
    .bind(outcome.estimated_tokens)
    .bind(outcome.effort_estimate)
    .bind(priority_score)
    .bind(item.id)
    .fetch_one(&mut *tx)
    .await
    .with_context(|| format!("failed to overlay discovery assessment for item {}", item.id))?;

    let mut created = Vec::with_capacity(outcome.subtasks.len());
    for new_task in &outcome.subtasks {
        let (model_tier, recommended_model, routing_method, runtime) = tier_fn(new_task);

        let task: Task = sqlx::query_as(
            "INSERT INTO tasks (
                title, description, owner, required_capabilities, priority,
                source, parent_task_id, max_retries, timeout_seconds, labels,
                file_patterns, one_way_door, metadata, model_tier,
                recommended_model, routing_method, runtime
             ) VALUES ($1, $2, $3, $4, $5, 'discovery', $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
             RETURNING *",
        )
        .bind(&new_task.title)
        .bind(&new_task.description)
        .bind(&new_task.owner)
        .bind(&new_task.required_capabilities)
        .bind(new_task.priority)
        .bind(new_task.parent_task_id)
        .bind(new_task.max_retries)
        .bind(new_task.timeout_seconds)
        .bind(&new_task.labels)
        .bind(&new_task.file_patterns)
        .bind(new_task.one_way_door)
        .bind(&new_task.metadata)
        .bind(&model_tier)
        .bind(&recommended_model)
        .bind(&routing_method)
        .bind(&runtime)
        .fetch_one(&mut *tx)
        .await
        .with_context(|| format!("failed to create discovery subtask for item {}", item.id))?;
        created.push(task);
    }

    tx.commit().await.context("failed to commit discovery transaction")?;

    Ok((updated, created))
}
