//! Log Line Repository
//!
//! Every channel's lines live in `log_lines`, ordered by serial id. Each
//! published batch raises a `kiln_log` notification carrying the channel
//! name; listeners then read the rows they have not seen yet.

use sqlx::PgPool;

pub const NOTIFY_CHANNEL: &str = "kiln_log";

/// Append lines to a channel and notify listeners, in one transaction
pub async fn append(pool: &PgPool, channel: &str, lines: &[String]) -> Result<(), sqlx::Error> {
    if lines.is_empty() {
        return Ok(());
    }

    let now = chrono::Utc::now();
    let mut tx = pool.begin().await?;

    for line in lines {
        sqlx::query("INSERT INTO log_lines (channel, line, created_at) VALUES ($1, $2, $3)")
            .bind(channel)
            .bind(line)
            .bind(now)
            .execute(&mut *tx)
            .await?;
    }

    // Delivered on commit
    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(NOTIFY_CHANNEL)
        .bind(channel)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}

/// Lines of a channel with an id above `after`, with their ids
pub async fn find_after(
    pool: &PgPool,
    channel: &str,
    after: i64,
) -> Result<Vec<(i64, String)>, sqlx::Error> {
    sqlx::query_as(
        r#"
        SELECT id, line
        FROM log_lines
        WHERE channel = $1 AND id > $2
        ORDER BY id ASC
        "#,
    )
    .bind(channel)
    .bind(after)
    .fetch_all(pool)
    .await
}

/// Delete a channel's lines
pub async fn delete_channel(pool: &PgPool, channel: &str) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM log_lines WHERE channel = $1")
        .bind(channel)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}
