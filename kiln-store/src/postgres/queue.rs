//! Task Queue Repository
//!
//! Tasks are claimed with `FOR UPDATE SKIP LOCKED`, so concurrent workers
//! never receive the same row. A claim older than the lease is considered
//! abandoned and the task becomes claimable again.

use chrono::{DateTime, Utc};
use kiln_core::dto::task::{QueuedTask, Task};
use sqlx::PgPool;
use uuid::Uuid;

/// Add a task to the queue
pub async fn enqueue(pool: &PgPool, task: Task) -> Result<QueuedTask, sqlx::Error> {
    let id = Uuid::new_v4();
    let now = Utc::now();
    let value = serde_json::to_value(task).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;

    sqlx::query("INSERT INTO task_queue (id, task, enqueued_at) VALUES ($1, $2, $3)")
        .bind(id)
        .bind(value)
        .bind(now)
        .execute(pool)
        .await?;

    Ok(QueuedTask {
        id,
        task,
        enqueued_at: now,
    })
}

/// Claim the oldest available task
///
/// # Arguments
/// * `worker_id` - Recorded on the claimed row
/// * `stale_before` - Claims made before this instant are treated as abandoned
pub async fn claim(
    pool: &PgPool,
    worker_id: &str,
    stale_before: DateTime<Utc>,
) -> Result<Option<QueuedTask>, sqlx::Error> {
    let row = sqlx::query_as::<_, TaskRow>(
        r#"
        UPDATE task_queue
        SET claimed_by = $1, claimed_at = $2
        WHERE id = (
            SELECT id FROM task_queue
            WHERE claimed_at IS NULL OR claimed_at < $3
            ORDER BY enqueued_at ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
        )
        RETURNING id, task, enqueued_at
        "#,
    )
    .bind(worker_id)
    .bind(Utc::now())
    .bind(stale_before)
    .fetch_optional(pool)
    .await?;

    row.map(QueuedTask::try_from).transpose()
}

/// Remove an acknowledged task
pub async fn complete(pool: &PgPool, id: Uuid) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM task_queue WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: Uuid,
    task: serde_json::Value,
    enqueued_at: DateTime<Utc>,
}

impl TryFrom<TaskRow> for QueuedTask {
    type Error = sqlx::Error;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let task: Task =
            serde_json::from_value(row.task).map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

        Ok(QueuedTask {
            id: row.id,
            task,
            enqueued_at: row.enqueued_at,
        })
    }
}
