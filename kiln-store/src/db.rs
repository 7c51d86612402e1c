use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id BIGSERIAL PRIMARY KEY,
            login VARCHAR(200) NOT NULL UNIQUE,
            name VARCHAR(200) NOT NULL,
            email VARCHAR(200)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS projects (
            id BIGSERIAL PRIMARY KEY,
            owner_id BIGINT NOT NULL REFERENCES users(id),
            full_name VARCHAR(200) NOT NULL,
            clone_url VARCHAR(500) NOT NULL,
            deploy_public_key TEXT,
            deploy_private_key TEXT,
            build_cursor BIGINT NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS project_members (
            project_id BIGINT NOT NULL REFERENCES projects(id),
            user_id BIGINT NOT NULL REFERENCES users(id),
            allows_management BOOLEAN NOT NULL DEFAULT FALSE,
            created_at TIMESTAMPTZ NOT NULL,
            PRIMARY KEY (project_id, user_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS builds (
            id BIGSERIAL PRIMARY KEY,
            project_id BIGINT NOT NULL REFERENCES projects(id),
            number BIGINT NOT NULL,
            commit_sha VARCHAR(40) NOT NULL,
            commit_ref VARCHAR(200) NOT NULL,
            commit_author VARCHAR(200) NOT NULL,
            commit_message TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            status VARCHAR(20),
            status_description TEXT,
            UNIQUE (project_id, commit_sha),
            UNIQUE (project_id, number)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS hooks (
            id BIGSERIAL PRIMARY KEY,
            project_id BIGINT NOT NULL REFERENCES projects(id),
            title VARCHAR(200) NOT NULL,
            image VARCHAR(200) NOT NULL,
            build_script TEXT NOT NULL,
            install_script TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tracked_files (
            id BIGSERIAL PRIMARY KEY,
            hook_id BIGINT NOT NULL REFERENCES hooks(id),
            path VARCHAR(500) NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // hook_id is cleared explicitly when a hook is deleted, see hook::delete
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS hook_calls (
            id BIGSERIAL PRIMARY KEY,
            hook_id BIGINT REFERENCES hooks(id),
            build_id BIGINT NOT NULL REFERENCES builds(id),
            created_at TIMESTAMPTZ NOT NULL,
            payload JSONB NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id BIGSERIAL PRIMARY KEY,
            build_id BIGINT NOT NULL REFERENCES builds(id),
            hook_call_id BIGINT NOT NULL REFERENCES hook_calls(id),
            started_at TIMESTAMPTZ NOT NULL,
            finished_at TIMESTAMPTZ,
            exit_code INTEGER,
            output TEXT,
            cache_id VARCHAR(64),
            task_id UUID NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS task_queue (
            id UUID PRIMARY KEY,
            task JSONB NOT NULL,
            enqueued_at TIMESTAMPTZ NOT NULL,
            claimed_by VARCHAR(255),
            claimed_at TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS log_lines (
            id BIGSERIAL PRIMARY KEY,
            channel VARCHAR(255) NOT NULL,
            line TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes for better query performance
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_build_id ON jobs(build_id)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_hook_call_id ON jobs(hook_call_id, id DESC)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_task_id ON jobs(task_id)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_hook_calls_hook_id ON hook_calls(hook_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_task_queue_pending ON task_queue(enqueued_at) WHERE claimed_at IS NULL",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_log_lines_channel ON log_lines(channel, id)")
        .execute(pool)
        .await?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}
