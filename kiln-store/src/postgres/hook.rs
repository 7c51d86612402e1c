//! Hook Repository
//!
//! Handles database operations for hooks, their tracked files and the
//! hook calls recorded against them.

use kiln_core::domain::hook::{Hook, HookCall, TrackedFile};
use kiln_core::dto::hook::{NewHook, NewHookCall};
use kiln_core::dto::payload::StoredPayload;
use sqlx::PgPool;

/// Create a hook together with its tracked files
pub async fn create(pool: &PgPool, req: NewHook) -> Result<Hook, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let row: (i64,) = sqlx::query_as(
        r#"
        INSERT INTO hooks (project_id, title, image, build_script, install_script)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING id
        "#,
    )
    .bind(req.project_id)
    .bind(&req.title)
    .bind(&req.image)
    .bind(&req.build_script)
    .bind(&req.install_script)
    .fetch_one(&mut *tx)
    .await?;

    for file in &req.tracked_files {
        sqlx::query("INSERT INTO tracked_files (hook_id, path) VALUES ($1, $2)")
            .bind(row.0)
            .bind(&file.path)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;

    Ok(Hook {
        id: row.0,
        project_id: req.project_id,
        title: req.title,
        image: req.image,
        build_script: req.build_script,
        install_script: req.install_script,
        tracked_files: req.tracked_files,
    })
}

/// Find a hook by ID, tracked files included
pub async fn find_by_id(pool: &PgPool, id: i64) -> Result<Option<Hook>, sqlx::Error> {
    let Some(row) = sqlx::query_as::<_, HookRow>(
        r#"
        SELECT id, project_id, title, image, build_script, install_script
        FROM hooks
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    else {
        return Ok(None);
    };

    let paths: Vec<(String,)> =
        sqlx::query_as("SELECT path FROM tracked_files WHERE hook_id = $1 ORDER BY id ASC")
            .bind(id)
            .fetch_all(pool)
            .await?;

    Ok(Some(Hook {
        id: row.id,
        project_id: row.project_id,
        title: row.title,
        image: row.image,
        build_script: row.build_script,
        install_script: row.install_script,
        tracked_files: paths.into_iter().map(|(p,)| TrackedFile::new(p)).collect(),
    }))
}

/// Delete a hook and its tracked files
///
/// Hook calls pointing at the hook survive with a null reference. All three
/// statements share one transaction.
pub async fn delete(pool: &PgPool, id: i64) -> Result<bool, sqlx::Error> {
    let mut tx = pool.begin().await?;

    sqlx::query("UPDATE hook_calls SET hook_id = NULL WHERE hook_id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await?;

    sqlx::query("DELETE FROM tracked_files WHERE hook_id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await?;

    let result = sqlx::query("DELETE FROM hooks WHERE id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    Ok(result.rows_affected() > 0)
}

/// Record a hook call
pub async fn create_call(pool: &PgPool, req: NewHookCall) -> Result<HookCall, sqlx::Error> {
    let now = chrono::Utc::now();
    let payload = req
        .payload
        .to_json()
        .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;

    let row: (i64,) = sqlx::query_as(
        r#"
        INSERT INTO hook_calls (hook_id, build_id, created_at, payload)
        VALUES ($1, $2, $3, $4)
        RETURNING id
        "#,
    )
    .bind(req.hook_id)
    .bind(req.build_id)
    .bind(now)
    .bind(payload)
    .fetch_one(pool)
    .await?;

    Ok(HookCall {
        id: row.0,
        hook_id: Some(req.hook_id),
        build_id: req.build_id,
        created_at: now,
        payload: req.payload,
    })
}

/// Find a hook call by ID
pub async fn find_call_by_id(pool: &PgPool, id: i64) -> Result<Option<HookCall>, sqlx::Error> {
    let row = sqlx::query_as::<_, HookCallRow>(
        r#"
        SELECT id, hook_id, build_id, created_at, payload
        FROM hook_calls
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    row.map(HookCall::try_from).transpose()
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct HookRow {
    id: i64,
    project_id: i64,
    title: String,
    image: String,
    build_script: String,
    install_script: Option<String>,
}

#[derive(sqlx::FromRow)]
struct HookCallRow {
    id: i64,
    hook_id: Option<i64>,
    build_id: i64,
    created_at: chrono::DateTime<chrono::Utc>,
    payload: serde_json::Value,
}

impl TryFrom<HookCallRow> for HookCall {
    type Error = sqlx::Error;

    fn try_from(row: HookCallRow) -> Result<Self, Self::Error> {
        let payload =
            StoredPayload::from_json(row.payload).map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

        Ok(HookCall {
            id: row.id,
            hook_id: row.hook_id,
            build_id: row.build_id,
            created_at: row.created_at,
            payload,
        })
    }
}
