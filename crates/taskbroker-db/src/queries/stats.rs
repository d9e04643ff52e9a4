use anyhow::{Context, Result};
use sqlx::PgPool;

/// Broker-wide operational summary used by the `stats` CLI subcommand and
/// the admin HTTP surface.
#[derive(Debug, Clone)]
pub struct BrokerStats {
    pub tasks_by_status: Vec<(String, i64)>,
    pub backlog_by_status: Vec<(String, i64)>,
    pub drained_agent_count: i64,
}

pub async fn summarize(pool: &PgPool) -> Result<BrokerStats> {
    let tasks_by_status = super::tasks::count_by_status(pool).await?;

    let backlog_by_status: Vec<(String, i64)> =
        sqlx::query_as("SELECT status, COUNT(*) FROM backlog_items GROUP BY status")
            .fetch_all(pool)
            .await
            .context("failed to count backlog items by status")?;

    let (drained_agent_count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM dispatch_overrides WHERE drained")
            .fetch_one(pool)
            .await
            .context("failed to count drained agents")?;

    Ok(BrokerStats {
        tasks_by_status,
        backlog_by_status,
        drained_agent_count,
    })
}
