use anyhow::{Context, Result};
use serde_json::Value as Json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::BacklogItem;

#[derive(Debug, Clone)]
pub struct NewBacklogItem {
    pub title: String,
    pub description: String,
    pub item_type: String,
    pub domain: String,
    pub assigned_to: Option<String>,
    pub parent_id: Option<Uuid>,
    pub labels: Vec<String>,
    pub one_way_door: bool,
    pub metadata: Json,
}

pub async fn create_item(pool: &PgPool, new: &NewBacklogItem) -> Result<BacklogItem> {
    sqlx::query_as::<_, BacklogItem>(
        "INSERT INTO backlog_items (
            title, description, item_type, domain, assigned_to, parent_id,
            labels, one_way_door, metadata
         ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
         RETURNING *",
    )
    .bind(&new.title)
    .bind(&new.description)
    .bind(&new.item_type)
    .bind(&new.domain)
    .bind(&new.assigned_to)
    .bind(new.parent_id)
    .bind(&new.labels)
    .bind(new.one_way_door)
    .bind(&new.metadata)
    .fetch_one(pool)
    .await
    .context("failed to create backlog item")
}

pub async fn get_item(pool: &PgPool, id: Uuid) -> Result<Option<BacklogItem>> {
    sqlx::query_as::<_, BacklogItem>("SELECT * FROM backlog_items WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .with_context(|| format!("failed to fetch backlog item {id}"))
}

/// Manually-entered priority inputs, as opposed to scores derived from a
/// discovery run (see `queries::discovery::apply_discovery_outcome`).
pub async fn set_manual_scores(
    pool: &PgPool,
    id: Uuid,
    impact: f32,
    urgency: f32,
    priority_score: f32,
) -> Result<()> {
    sqlx::query(
        "UPDATE backlog_items SET
            scores_source = 'manual', impact = $1, urgency = $2,
            priority_score = $3, updated_at = now()
         WHERE id = $4",
    )
    .bind(impact)
    .bind(urgency)
    .bind(priority_score)
    .bind(id)
    .execute(pool)
    .await
    .with_context(|| format!("failed to set scores for backlog item {id}"))?;
    Ok(())
}

/// Items in `ready` status with no unresolved blocker, ordered by
/// priority score. The dependency check is a row existence test rather
/// than an in-memory graph walk.
pub async fn ready_items(pool: &PgPool, limit: i64) -> Result<Vec<BacklogItem>> {
    sqlx::query_as::<_, BacklogItem>(
        "SELECT b.* FROM backlog_items b
         WHERE b.status = 'ready'
           AND NOT EXISTS (
               SELECT 1 FROM backlog_dependencies d
               WHERE d.blocked_id = b.id AND d.resolved_at IS NULL
           )
         ORDER BY b.priority_score DESC NULLS LAST, b.created_at ASC
         LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list ready backlog items")
}

pub async fn set_status(pool: &PgPool, id: Uuid, status: &str) -> Result<bool> {
    let updated = sqlx::query("UPDATE backlog_items SET status = $1, updated_at = now() WHERE id = $2")
        .bind(status)
        .bind(id)
        .execute(pool)
        .await
        .with_context(|| format!("failed to set status for backlog item {id}"))?;
    Ok(updated.rows_affected() == 1)
}

pub async fn link_task(pool: &PgPool, id: Uuid, task_id: Uuid) -> Result<()> {
    sqlx::query("UPDATE backlog_items SET task_id = $1, updated_at = now() WHERE id = $2")
        .bind(task_id)
        .bind(id)
        .execute(pool)
        .await
        .with_context(|| format!("failed to link task {task_id} to backlog item {id}"))?;
    Ok(())
}

pub async fn set_stage(
    pool: &PgPool,
    id: Uuid,
    stage_template: &[String],
    current_stage: Option<&str>,
    stage_index: i32,
) -> Result<BacklogItem> {
    sqlx::query_as::<_, BacklogItem>(
        "UPDATE backlog_items SET
            stage_template = $1, current_stage = $2, stage_index = $3, updated_at = now()
         WHERE id = $4
         RETURNING *",
    )
    .bind(stage_template)
    .bind(current_stage)
    .bind(stage_index)
    .bind(id)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to set stage for backlog item {id}"))
}

/// The continuous-percentile median of `estimated_tokens` over positive
/// values, or `None` when there is no data yet.
pub async fn median_estimated_tokens(pool: &PgPool) -> Result<Option<f64>> {
    let (median,): (Option<f64>,) = sqlx::query_as(
        "SELECT percentile_cont(0.5) WITHIN GROUP (ORDER BY estimated_tokens)
         FROM backlog_items WHERE estimated_tokens > 0",
    )
    .fetch_one(pool)
    .await
    .context("failed to compute median estimated tokens")?;
    Ok(median)
}
