//! Job Repository
//!
//! Handles all database operations related to jobs.

use kiln_core::domain::job::Job;
use kiln_core::dto::job::{FinishJob, NewJob};
use sqlx::PgPool;
use uuid::Uuid;

const JOB_COLUMNS: &str = "id, build_id, hook_call_id, started_at, finished_at, exit_code, \
                           output, cache_id, task_id";

/// Create a running job
pub async fn create(pool: &PgPool, req: NewJob) -> Result<Job, sqlx::Error> {
    let now = chrono::Utc::now();

    let row: (i64,) = sqlx::query_as(
        r#"
        INSERT INTO jobs (build_id, hook_call_id, started_at, task_id)
        VALUES ($1, $2, $3, $4)
        RETURNING id
        "#,
    )
    .bind(req.build_id)
    .bind(req.hook_call_id)
    .bind(now)
    .bind(req.task_id)
    .fetch_one(pool)
    .await?;

    Ok(Job {
        id: row.0,
        build_id: req.build_id,
        hook_call_id: req.hook_call_id,
        started_at: now,
        finished_at: None,
        exit_code: None,
        output: None,
        cache_id: None,
        task_id: req.task_id,
    })
}

/// Find a job by ID
pub async fn find_by_id(pool: &PgPool, id: i64) -> Result<Option<Job>, sqlx::Error> {
    let row = sqlx::query_as::<_, JobRow>(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await?;

    Ok(row.map(|r| r.into()))
}

/// Find the job a queue task produced, newest first if it produced several
pub async fn find_by_task(pool: &PgPool, task_id: Uuid) -> Result<Option<Job>, sqlx::Error> {
    let row = sqlx::query_as::<_, JobRow>(&format!(
        "SELECT {JOB_COLUMNS} FROM jobs WHERE task_id = $1 ORDER BY id DESC LIMIT 1"
    ))
    .bind(task_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| r.into()))
}

/// Find the newest job for a hook call
pub async fn find_latest_for_call(
    pool: &PgPool,
    hook_call_id: i64,
) -> Result<Option<Job>, sqlx::Error> {
    let row = sqlx::query_as::<_, JobRow>(&format!(
        "SELECT {JOB_COLUMNS} FROM jobs WHERE hook_call_id = $1 ORDER BY id DESC LIMIT 1"
    ))
    .bind(hook_call_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| r.into()))
}

/// Find jobs by build ID, oldest first
pub async fn find_by_build(pool: &PgPool, build_id: i64) -> Result<Vec<Job>, sqlx::Error> {
    let rows = sqlx::query_as::<_, JobRow>(&format!(
        "SELECT {JOB_COLUMNS} FROM jobs WHERE build_id = $1 ORDER BY id ASC"
    ))
    .bind(build_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|r| r.into()).collect())
}

/// Store a job's result
///
/// Only a running job is updated; finishing twice leaves the first result.
pub async fn finish(pool: &PgPool, id: i64, req: FinishJob) -> Result<bool, sqlx::Error> {
    let now = chrono::Utc::now();

    let result = sqlx::query(
        r#"
        UPDATE jobs
        SET finished_at = $1, exit_code = $2, output = $3, cache_id = $4
        WHERE id = $5 AND finished_at IS NULL
        "#,
    )
    .bind(now)
    .bind(req.exit_code)
    .bind(&req.output)
    .bind(&req.cache_id)
    .bind(id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct JobRow {
    id: i64,
    build_id: i64,
    hook_call_id: i64,
    started_at: chrono::DateTime<chrono::Utc>,
    finished_at: Option<chrono::DateTime<chrono::Utc>>,
    exit_code: Option<i32>,
    output: Option<String>,
    cache_id: Option<String>,
    task_id: Uuid,
}

impl From<JobRow> for Job {
    fn from(row: JobRow) -> Self {
        Job {
            id: row.id,
            build_id: row.build_id,
            hook_call_id: row.hook_call_id,
            started_at: row.started_at,
            finished_at: row.finished_at,
            exit_code: row.exit_code,
            output: row.output,
            cache_id: row.cache_id,
            task_id: row.task_id,
        }
    }
}
