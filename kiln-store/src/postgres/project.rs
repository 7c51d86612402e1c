//! Project Repository
//!
//! Handles database operations for projects, their members and the
//! per-project build counter.

use kiln_core::domain::project::{DeployKeyPair, Project, User};
use sqlx::{PgExecutor, PgPool};

/// Find a project by ID
pub async fn find_by_id(pool: &PgPool, id: i64) -> Result<Option<Project>, sqlx::Error> {
    let row = sqlx::query_as::<_, ProjectRow>(
        r#"
        SELECT id, owner_id, full_name, clone_url, deploy_public_key,
               deploy_private_key, build_cursor
        FROM projects
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| r.into()))
}

/// List the users attached to a project
///
/// The owner comes first, followed by members in the order they joined.
pub async fn list_members(pool: &PgPool, project_id: i64) -> Result<Vec<User>, sqlx::Error> {
    let rows = sqlx::query_as::<_, UserRow>(
        r#"
        SELECT u.id, u.login, u.name, u.email
        FROM projects p
        JOIN users u ON u.id = p.owner_id
        WHERE p.id = $1
        UNION ALL
        SELECT u.id, u.login, u.name, u.email
        FROM project_members m
        JOIN projects p ON p.id = m.project_id
        JOIN users u ON u.id = m.user_id
        WHERE m.project_id = $1 AND m.user_id <> p.owner_id
        "#,
    )
    .bind(project_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|r| r.into()).collect())
}

/// Atomically bump the build counter and return the new value
///
/// # Returns
/// `None` if the project does not exist
pub async fn next_build_number<'e>(
    executor: impl PgExecutor<'e>,
    project_id: i64,
) -> Result<Option<i64>, sqlx::Error> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        UPDATE projects
        SET build_cursor = build_cursor + 1
        WHERE id = $1
        RETURNING build_cursor
        "#,
    )
    .bind(project_id)
    .fetch_optional(executor)
    .await?;

    Ok(row.map(|r| r.0))
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct ProjectRow {
    id: i64,
    owner_id: i64,
    full_name: String,
    clone_url: String,
    deploy_public_key: Option<String>,
    deploy_private_key: Option<String>,
    build_cursor: i64,
}

impl From<ProjectRow> for Project {
    fn from(row: ProjectRow) -> Self {
        let deploy_key = match (row.deploy_public_key, row.deploy_private_key) {
            (Some(public_key), Some(private_key)) => Some(DeployKeyPair {
                public_key,
                private_key,
            }),
            _ => None,
        };

        Project {
            id: row.id,
            owner_id: row.owner_id,
            full_name: row.full_name,
            clone_url: row.clone_url,
            deploy_key,
            build_cursor: row.build_cursor,
        }
    }
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: i64,
    login: String,
    name: String,
    email: Option<String>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: row.id,
            login: row.login,
            name: row.name,
            email: row.email,
        }
    }
}
