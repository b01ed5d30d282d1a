use anyhow::Result;
use sqlx::SqlitePool;

/// Create the run and step checkpoint tables. Idempotent.
pub async fn migrate_runs(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS runs (
            namespace TEXT NOT NULL,
            run_id TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            generation INTEGER NOT NULL,
            task_queue TEXT NOT NULL,
            state TEXT NOT NULL,
            code TEXT NOT NULL,
            last_error TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (namespace, run_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS run_steps (
            namespace TEXT NOT NULL,
            run_id TEXT NOT NULL,
            generation INTEGER NOT NULL,
            step TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            completed INTEGER NOT NULL DEFAULT 0,
            output_json TEXT,
            last_error TEXT,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (namespace, run_id, generation, step)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS run_history (
            namespace TEXT NOT NULL,
            run_id TEXT NOT NULL,
            generation INTEGER NOT NULL,
            entity_id TEXT NOT NULL,
            state TEXT NOT NULL,
            last_error TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            archived_at INTEGER NOT NULL,
            PRIMARY KEY (namespace, run_id, generation)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_state ON runs(namespace, state)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_updated_at ON runs(updated_at DESC)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Create the message log and committed-offset tables. Idempotent.
pub async fn migrate_broker(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            topic TEXT NOT NULL,
            partition_id INTEGER NOT NULL,
            msg_offset INTEGER NOT NULL,
            msg_key TEXT,
            payload BLOB NOT NULL,
            published_at INTEGER NOT NULL,
            PRIMARY KEY (topic, partition_id, msg_offset)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS consumer_offsets (
            group_id TEXT NOT NULL,
            topic TEXT NOT NULL,
            partition_id INTEGER NOT NULL,
            next_offset INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (group_id, topic, partition_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
