use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{BacklogItem, StageGateCriterion};

/// Install a stage template on a backlog item, resetting it to the
/// template's first stage.
pub async fn init_stages(pool: &PgPool, item_id: Uuid, template: &[String]) -> Result<BacklogItem> {
    sqlx::query_as::<_, BacklogItem>(
        "UPDATE backlog_items SET
            stage_template = $1, current_stage = $2, stage_index = 0, updated_at = now()
         WHERE id = $3
         RETURNING *",
    )
    .bind(template)
    .bind(template.first())
    .bind(item_id)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to init stages for item {item_id}"))
}

pub async fn get_criterion(pool: &PgPool, id: Uuid) -> Result<Option<StageGateCriterion>> {
    sqlx::query_as::<_, StageGateCriterion>("SELECT * FROM stage_gate_criteria WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .with_context(|| format!("failed to fetch gate criterion {id}"))
}

pub async fn criteria_for_stage(pool: &PgPool, item_id: Uuid, stage: &str) -> Result<Vec<StageGateCriterion>> {
    sqlx::query_as::<_, StageGateCriterion>("SELECT * FROM stage_gate_criteria WHERE item_id = $1 AND stage = $2")
        .bind(item_id)
        .bind(stage)
        .fetch_all(pool)
        .await
        .with_context(|| format!("failed to fetch gate criteria for item {item_id} stage {stage}"))
}

pub async fn add_criterion(
    pool: &PgPool,
    item_id: Uuid,
    stage: &str,
    criterion: &str,
    policy: &str,
) -> Result<StageGateCriterion> {
    sqlx::query_as::<_, StageGateCriterion>(
        "INSERT INTO stage_gate_criteria (item_id, stage, criterion, policy)
         VALUES ($1, $2, $3, $4)
         RETURNING *",
    )
    .bind(item_id)
    .bind(stage)
    .bind(criterion)
    .bind(policy)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to add gate criterion for item {item_id}"))
}

/// Insert each `(criterion, policy)` pair for `stage` unless a criterion
/// with that exact name already exists there.
pub async fn create_criteria_if_absent(
    pool: &PgPool,
    item_id: Uuid,
    stage: &str,
    criteria: &[(String, String)],
) -> Result<Vec<StageGateCriterion>> {
    let mut created = Vec::with_capacity(criteria.len());
    for (criterion, policy) in criteria {
        let existing: Option<StageGateCriterion> = sqlx::query_as(
            "SELECT * FROM stage_gate_criteria WHERE item_id = $1 AND stage = $2 AND criterion = $3",
        )
        .bind(item_id)
        .bind(stage)
        .bind(criterion)
        .fetch_optional(pool)
        .await
        .with_context(|| format!("failed to check existing criterion for item {item_id}"))?;

        if let Some(row) = existing {
            created.push(row);
        } else {
            created.push(add_criterion(pool, item_id, stage, criterion, policy).await?);
        }
    }
    Ok(created)
}

pub async fn satisfy_criterion(pool: &PgPool, id: Uuid, satisfied_by: &str) -> Result<bool> {
    let updated = sqlx::query(
        "UPDATE stage_gate_criteria SET satisfied = true, satisfied_at = now(), satisfied_by = $1
         WHERE id = $2 AND NOT satisfied",
    )
    .bind(satisfied_by)
    .bind(id)
    .execute(pool)
    .await
    .with_context(|| format!("failed to satisfy gate criterion {id}"))?;
    Ok(updated.rows_affected() == 1)
}

/// Satisfy the criterion in `stage` whose name contains `name_fragment`,
/// per the store's substring-match contract.
pub async fn satisfy_by_name(pool: &PgPool, item_id: Uuid, stage: &str, name_fragment: &str, satisfied_by: &str) -> Result<bool> {
    let pattern = format!("%{name_fragment}%");
    let updated = sqlx::query(
        "UPDATE stage_gate_criteria SET satisfied = true, satisfied_at = now(), satisfied_by = $1
         WHERE item_id = $2 AND stage = $3 AND criterion ILIKE $4 AND NOT satisfied",
    )
    .bind(satisfied_by)
    .bind(item_id)
    .bind(stage)
    .bind(&pattern)
    .execute(pool)
    .await
    .with_context(|| format!("failed to satisfy gate criterion matching {name_fragment:?} for item {item_id}"))?;
    Ok(updated.rows_affected() >= 1)
}

/// Satisfy every unsatisfied criterion in a stage at once (an admin
/// all-of-stage decision).
pub async fn satisfy_all(pool: &PgPool, item_id: Uuid, stage: &str, satisfied_by: &str) -> Result<u64> {
    let updated = sqlx::query(
        "UPDATE stage_gate_criteria SET satisfied = true, satisfied_at = now(), satisfied_by = $1
         WHERE item_id = $2 AND stage = $3 AND NOT satisfied",
    )
    .bind(satisfied_by)
    .bind(item_id)
    .bind(stage)
    .execute(pool)
    .await
    .with_context(|| format!("failed to satisfy all criteria for item {item_id} stage {stage}"))?;
    Ok(updated.rows_affected())
}

pub async fn get_gate_status(pool: &PgPool, item_id: Uuid, stage: &str) -> Result<Vec<StageGateCriterion>> {
    criteria_for_stage(pool, item_id, stage).await
}

pub async fn all_criteria_met(pool: &PgPool, item_id: Uuid, stage: &str) -> Result<bool> {
    let criteria = criteria_for_stage(pool, item_id, stage).await?;
    Ok(!criteria.is_empty() && criteria.iter().all(|c| c.satisfied))
}

pub async fn submit_evidence(pool: &PgPool, id: Uuid, evidence: &str, submitted_by: &str) -> Result<bool> {
    let updated = sqlx::query(
        "UPDATE stage_gate_criteria SET
            evidence = $1, evidence_submitted_by = $2, evidence_submitted_at = now()
         WHERE id = $3",
    )
    .bind(evidence)
    .bind(submitted_by)
    .bind(id)
    .execute(pool)
    .await
    .with_context(|| format!("failed to submit evidence for gate criterion {id}"))?;
    Ok(updated.rows_affected() == 1)
}

/// Reset every criterion in a stage back to unsatisfied, clearing
/// satisfaction and evidence metadata (an admin request-changes decision).
pub async fn reset_stage_to_active(pool: &PgPool, item_id: Uuid, stage: &str) -> Result<u64> {
    let updated = sqlx::query(
        "UPDATE stage_gate_criteria SET
            satisfied = false, satisfied_at = NULL, satisfied_by = NULL
         WHERE item_id = $1 AND stage = $2",
    )
    .bind(item_id)
    .bind(stage)
    .execute(pool)
    .await
    .with_context(|| format!("failed to reset stage {stage} for item {item_id}"))?;
    Ok(updated.rows_affected())
}
