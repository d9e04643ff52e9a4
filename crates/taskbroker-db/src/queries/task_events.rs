use anyhow::{Context, Result};
use serde_json::Value as Json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::TaskEvent;

pub async fn record_event(
    pool: &PgPool,
    task_id: Uuid,
    event: &str,
    agent_id: Option<&str>,
    payload: &Json,
) -> Result<TaskEvent> {
    sqlx::query_as::<_, TaskEvent>(
        "INSERT INTO task_events (task_id, event, agent_id, payload)
         VALUES ($1, $2, $3, $4)
         RETURNING *",
    )
    .bind(task_id)
    .bind(event)
    .bind(agent_id)
    .bind(payload)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to record event {event} for task {task_id}"))
}

pub async fn history_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<TaskEvent>> {
    sqlx::query_as::<_, TaskEvent>(
        "SELECT * FROM task_events WHERE task_id = $1 ORDER BY created_at ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to fetch event history for task {task_id}"))
}
