use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::AgentTaskHistory;

#[allow(clippy::too_many_arguments)]
pub async fn record_history(
    pool: &PgPool,
    agent_slug: &str,
    task_id: Uuid,
    started_at: DateTime<Utc>,
    completed_at: DateTime<Utc>,
    duration_seconds: f64,
    tokens_used: i64,
    cost_usd: f64,
    success: bool,
) -> Result<AgentTaskHistory> {
    sqlx::query_as::<_, AgentTaskHistory>(
        "INSERT INTO agent_task_history (
            agent_slug, task_id, started_at, completed_at, duration_seconds,
            tokens_used, cost_usd, success
         ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
         RETURNING *",
    )
    .bind(agent_slug)
    .bind(task_id)
    .bind(started_at)
    .bind(completed_at)
    .bind(duration_seconds)
    .bind(tokens_used)
    .bind(cost_usd)
    .bind(success)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to record task history for {agent_slug}"))
}

pub async fn recent_for_agent(
    pool: &PgPool,
    agent_slug: &str,
    limit: i64,
) -> Result<Vec<AgentTaskHistory>> {
    sqlx::query_as::<_, AgentTaskHistory>(
        "SELECT * FROM agent_task_history WHERE agent_slug = $1
         ORDER BY completed_at DESC LIMIT $2",
    )
    .bind(agent_slug)
    .bind(limit)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to fetch history for {agent_slug}"))
}

/// Mean cost in USD over an agent's last `sample` completed tasks, used
/// by the scoring engine's cost-efficiency factor.
pub async fn avg_cost_usd(pool: &PgPool, agent_slug: &str, sample: i64) -> Result<Option<f64>> {
    let row: (Option<f64>,) = sqlx::query_as(
        "SELECT AVG(cost_usd) FROM (
             SELECT cost_usd FROM agent_task_history
             WHERE agent_slug = $1
             ORDER BY completed_at DESC
             LIMIT $2
         ) recent",
    )
    .bind(agent_slug)
    .bind(sample)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to compute average cost for {agent_slug}"))?;
    Ok(row.0)
}

/// Median wall-clock duration over an agent's last `sample` completed
/// tasks, used as an input to the model-tier router's learned mode.
pub async fn median_duration_seconds(
    pool: &PgPool,
    agent_slug: &str,
    sample: i64,
) -> Result<Option<f64>> {
    let row: (Option<f64>,) = sqlx::query_as(
        "SELECT percentile_cont(0.5) WITHIN GROUP (ORDER BY duration_seconds)
         FROM (
             SELECT duration_seconds FROM agent_task_history
             WHERE agent_slug = $1
             ORDER BY completed_at DESC
             LIMIT $2
         ) recent",
    )
    .bind(agent_slug)
    .bind(sample)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to compute median duration for {agent_slug}"))?;
    Ok(row.0)
}
