use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::AgentTrust;

pub async fn get_score(pool: &PgPool, agent_slug: &str, category: &str, severity: &str) -> Result<f32> {
    let row: Option<(f32,)> = sqlx::query_as(
        "SELECT score FROM agent_trust WHERE agent_slug = $1 AND category = $2 AND severity = $3",
    )
    .bind(agent_slug)
    .bind(category)
    .bind(severity)
    .fetch_optional(pool)
    .await
    .with_context(|| format!("failed to fetch trust score for {agent_slug}"))?;
    Ok(row.map(|(s,)| s).unwrap_or(0.0))
}

pub async fn adjust_score(
    pool: &PgPool,
    agent_slug: &str,
    category: &str,
    severity: &str,
    delta: f32,
) -> Result<f32> {
    let row: (f32,) = sqlx::query_as(
        "INSERT INTO agent_trust (agent_slug, category, severity, score)
         VALUES ($1, $2, $3, $4)
         ON CONFLICT (agent_slug, category, severity) DO UPDATE SET
             score = agent_trust.score + $4
         RETURNING score",
    )
    .bind(agent_slug)
    .bind(category)
    .bind(severity)
    .bind(delta)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to adjust trust score for {agent_slug}"))?;
    Ok(row.0)
}

/// An agent's trust averaged across every category/severity bucket, or
/// `None` when it has no trust history at all (as opposed to a score of 0).
pub async fn overall_score(pool: &PgPool, agent_slug: &str) -> Result<Option<f32>> {
    let row: (Option<f64>,) = sqlx::query_as("SELECT AVG(score) FROM agent_trust WHERE agent_slug = $1")
        .bind(agent_slug)
        .fetch_one(pool)
        .await
        .with_context(|| format!("failed to average trust scores for {agent_slug}"))?;
    Ok(row.0.map(|v| v as f32))
}

pub async fn all_for_agent(pool: &PgPool, agent_slug: &str) -> Result<Vec<AgentTrust>> {
    sqlx::query_as::<_, AgentTrust>("SELECT * FROM agent_trust WHERE agent_slug = $1")
        .bind(agent_slug)
        .fetch_all(pool)
        .await
        .with_context(|| format!("failed to fetch trust rows for {agent_slug}"))
}
