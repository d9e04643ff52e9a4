use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{AutonomyConfig, AutonomyEvent, DispatchOverride};

pub async fn get_config(pool: &PgPool) -> Result<AutonomyConfig> {
    sqlx::query_as::<_, AutonomyConfig>("SELECT * FROM autonomy_config WHERE id = 1")
        .fetch_one(pool)
        .await
        .context("failed to fetch autonomy config")
}

pub async fn set_default_oversight(pool: &PgPool, level: &str, actor: &str) -> Result<()> {
    sqlx::query(
        "UPDATE autonomy_config SET default_oversight_level = $1, updated_at = now(),
            updated_by = $2
         WHERE id = 1",
    )
    .bind(level)
    .bind(actor)
    .execute(pool)
    .await
    .context("failed to update autonomy config")?;
    Ok(())
}

/// Apply one stage-gate decision to the economy-tier autonomy counters:
/// an approval increments `consecutive_approvals` and resets
/// `consecutive_corrections`, a correction does the reverse. Crossing 20
/// consecutive approvals flips `auto_approve_economy` on; any correction
/// turns it back off.
pub async fn apply_autonomy_feedback(pool: &PgPool, approved: bool) -> Result<AutonomyConfig> {
    let config = if approved {
        sqlx::query_as::<_, AutonomyConfig>(
            "UPDATE autonomy_config SET
                consecutive_approvals = consecutive_approvals + 1,
                consecutive_corrections = 0,
                auto_approve_economy = (consecutive_approvals + 1) >= 20,
                updated_at = now()
             WHERE id = 1
             RETURNING *",
        )
        .fetch_one(pool)
        .await
    } else {
        sqlx::query_as::<_, AutonomyConfig>(
            "UPDATE autonomy_config SET
                consecutive_corrections = consecutive_corrections + 1,
                consecutive_approvals = 0,
                auto_approve_economy = false,
                updated_at = now()
             WHERE id = 1
             RETURNING *",
        )
        .fetch_one(pool)
        .await
    };
    config.context("failed to apply autonomy feedback")
}

pub async fn record_autonomy_event(
    pool: &PgPool,
    task_id: Option<Uuid>,
    previous_level: Option<&str>,
    new_level: &str,
    reason: &str,
    actor: Option<&str>,
) -> Result<AutonomyEvent> {
    sqlx::query_as::<_, AutonomyEvent>(
        "INSERT INTO autonomy_events (task_id, previous_level, new_level, reason, actor)
         VALUES ($1, $2, $3, $4, $5)
         RETURNING *",
    )
    .bind(task_id)
    .bind(previous_level)
    .bind(new_level)
    .bind(reason)
    .bind(actor)
    .fetch_one(pool)
    .await
    .context("failed to record autonomy event")
}

pub async fn set_drained(pool: &PgPool, agent_id: &str, reason: &str, actor: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO dispatch_overrides (agent_id, drained, reason, updated_by)
         VALUES ($1, true, $2, $3)
         ON CONFLICT (agent_id) DO UPDATE SET
             drained = true, reason = $2, updated_at = now(), updated_by = $3",
    )
    .bind(agent_id)
    .bind(reason)
    .bind(actor)
    .execute(pool)
    .await
    .with_context(|| format!("failed to drain agent {agent_id}"))?;
    Ok(())
}

pub async fn clear_drained(pool: &PgPool, agent_id: &str, actor: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO dispatch_overrides (agent_id, drained, reason, updated_by)
         VALUES ($1, false, '', $2)
         ON CONFLICT (agent_id) DO UPDATE SET
             drained = false, reason = '', updated_at = now(), updated_by = $2",
    )
    .bind(agent_id)
    .bind(actor)
    .execute(pool)
    .await
    .with_context(|| format!("failed to undrain agent {agent_id}"))?;
    Ok(())
}

pub async fn drained_agents(pool: &PgPool) -> Result<Vec<DispatchOverride>> {
    sqlx::query_as::<_, DispatchOverride>("SELECT * FROM dispatch_overrides WHERE drained")
        .fetch_all(pool)
        .await
        .context("failed to list drained agents")
}
