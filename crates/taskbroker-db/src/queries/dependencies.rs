use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::BacklogDependency;

/// Depth-first search over the existing edge rows to check whether adding
/// `blocked -> blocker` would close a cycle. Dependencies are stored as
/// rows, not as an in-memory graph, so this walks the table directly.
pub async fn would_create_cycle(pool: &PgPool, blocked_id: Uuid, blocker_id: Uuid) -> Result<bool> {
    if blocked_id == blocker_id {
        return Ok(true);
    }

    let mut stack = vec![blocker_id];
    let mut visited = std::collections::HashSet::new();

    while let Some(current) = stack.pop() {
        if current == blocked_id {
            return Ok(true);
        }
        if !visited.insert(current) {
            continue;
        }
        let next: Vec<(Uuid,)> =
            sqlx::query_as("SELECT blocker_id FROM backlog_dependencies WHERE blocked_id = $1")
                .bind(current)
                .fetch_all(pool)
                .await
                .context("failed to walk dependency edges")?;
        stack.extend(next.into_iter().map(|(id,)| id));
    }

    Ok(false)
}

pub async fn add_dependency(pool: &PgPool, blocked_id: Uuid, blocker_id: Uuid) -> Result<BacklogDependency> {
    if would_create_cycle(pool, blocked_id, blocker_id).await? {
        anyhow::bail!("dependency {blocked_id} -> {blocker_id} would create a cycle");
    }

    sqlx::query_as::<_, BacklogDependency>(
        "INSERT INTO backlog_dependencies (blocked_id, blocker_id) VALUES ($1, $2) RETURNING *",
    )
    .bind(blocked_id)
    .bind(blocker_id)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to add dependency {blocked_id} -> {blocker_id}"))
}

pub async fn dependencies_of(pool: &PgPool, blocked_id: Uuid) -> Result<Vec<BacklogDependency>> {
    sqlx::query_as::<_, BacklogDependency>("SELECT * FROM backlog_dependencies WHERE blocked_id = $1")
        .bind(blocked_id)
        .fetch_all(pool)
        .await
        .with_context(|| format!("failed to fetch dependencies for item {blocked_id}"))
}

/// Whether `blocked_id` has any dependency edge still unresolved.
pub async fn has_unresolved_blockers(pool: &PgPool, blocked_id: Uuid) -> Result<bool> {
    let (exists,): (bool,) = sqlx::query_as(
        "SELECT EXISTS(
            SELECT 1 FROM backlog_dependencies WHERE blocked_id = $1 AND resolved_at IS NULL
         )",
    )
    .bind(blocked_id)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to check unresolved blockers for item {blocked_id}"))?;
    Ok(exists)
}

/// Mark every dependency edge naming `blocker_id` as resolved. Called
/// when `blocker_id`'s item reaches `done`.
pub async fn resolve_all_for_blocker(pool: &PgPool, blocker_id: Uuid) -> Result<u64> {
    let updated = sqlx::query(
        "UPDATE backlog_dependencies SET resolved_at = now()
         WHERE blocker_id = $1 AND resolved_at IS NULL",
    )
    .bind(blocker_id)
    .execute(pool)
    .await
    .with_context(|| format!("failed to resolve dependencies blocked on {blocker_id}"))?;
    Ok(updated.rows_affected())
}
