//! Build Repository
//!
//! Handles all database operations related to builds.

use kiln_core::domain::build::Build;
use kiln_core::domain::status::CommitStatus;
use kiln_core::dto::build::NewBuild;
use sqlx::{PgExecutor, PgPool};

use super::project;

/// Insert a build with an already allocated number
pub async fn create<'e>(
    executor: impl PgExecutor<'e>,
    req: NewBuild,
    number: i64,
) -> Result<Build, sqlx::Error> {
    let now = chrono::Utc::now();

    let row: (i64,) = sqlx::query_as(
        r#"
        INSERT INTO builds (project_id, number, commit_sha, commit_ref, commit_author,
                            commit_message, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING id
        "#,
    )
    .bind(req.project_id)
    .bind(number)
    .bind(&req.commit_sha)
    .bind(&req.commit_ref)
    .bind(&req.commit_author)
    .bind(&req.commit_message)
    .bind(now)
    .fetch_one(executor)
    .await?;

    Ok(Build {
        id: row.0,
        project_id: req.project_id,
        number,
        commit_sha: req.commit_sha,
        commit_ref: req.commit_ref,
        commit_author: req.commit_author,
        commit_message: req.commit_message,
        created_at: now,
        status: None,
        status_description: None,
    })
}

/// Find a build by ID
pub async fn find_by_id(pool: &PgPool, id: i64) -> Result<Option<Build>, sqlx::Error> {
    let row = sqlx::query_as::<_, BuildRow>(
        r#"
        SELECT id, project_id, number, commit_sha, commit_ref, commit_author,
               commit_message, created_at, status, status_description
        FROM builds
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| r.into()))
}

/// Find the build of a commit within a project
pub async fn find_by_commit<'e>(
    executor: impl PgExecutor<'e>,
    project_id: i64,
    commit_sha: &str,
) -> Result<Option<Build>, sqlx::Error> {
    let row = sqlx::query_as::<_, BuildRow>(
        r#"
        SELECT id, project_id, number, commit_sha, commit_ref, commit_author,
               commit_message, created_at, status, status_description
        FROM builds
        WHERE project_id = $1 AND commit_sha = $2
        "#,
    )
    .bind(project_id)
    .bind(commit_sha)
    .fetch_optional(executor)
    .await?;

    Ok(row.map(|r| r.into()))
}

/// Get the build of a commit, numbering and inserting it if missing
///
/// The project row is locked first, so concurrent callers for one project
/// run one at a time and a later caller sees the build an earlier one
/// created. Lookup, counter bump and insert commit together.
///
/// # Returns
/// `None` if the project does not exist, otherwise the build and whether
/// it was created here
pub async fn find_or_create(
    pool: &PgPool,
    req: NewBuild,
) -> Result<Option<(Build, bool)>, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let project: Option<(i64,)> = sqlx::query_as("SELECT id FROM projects WHERE id = $1 FOR UPDATE")
        .bind(req.project_id)
        .fetch_optional(&mut *tx)
        .await?;
    if project.is_none() {
        return Ok(None);
    }

    if let Some(existing) = find_by_commit(&mut *tx, req.project_id, &req.commit_sha).await? {
        tx.commit().await?;
        return Ok(Some((existing, false)));
    }

    let Some(number) = project::next_build_number(&mut *tx, req.project_id).await? else {
        return Ok(None);
    };
    let build = create(&mut *tx, req, number).await?;
    tx.commit().await?;

    Ok(Some((build, true)))
}

/// Record the status last pushed to the source host
///
/// # Returns
/// `false` if no build with that ID exists
pub async fn update_status(
    pool: &PgPool,
    id: i64,
    status: CommitStatus,
    description: &str,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE builds
        SET status = $1, status_description = $2
        WHERE id = $3
        "#,
    )
    .bind(status.as_str())
    .bind(description)
    .bind(id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct BuildRow {
    id: i64,
    project_id: i64,
    number: i64,
    commit_sha: String,
    commit_ref: String,
    commit_author: String,
    commit_message: String,
    created_at: chrono::DateTime<chrono::Utc>,
    status: Option<String>,
    status_description: Option<String>,
}

impl From<BuildRow> for Build {
    fn from(row: BuildRow) -> Self {
        // An unrecognised status reads as "never reported" and gets re-sent
        let status = row.status.and_then(|s| s.parse::<CommitStatus>().ok());

        Build {
            id: row.id,
            project_id: row.project_id,
            number: row.number,
            commit_sha: row.commit_sha,
            commit_ref: row.commit_ref,
            commit_author: row.commit_author,
            commit_message: row.commit_message,
            created_at: row.created_at,
            status,
            status_description: row.status_description,
        }
    }
}
