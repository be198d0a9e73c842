//! Database initialization
//!
//! Opens (creating if absent) the station database and brings the schema up
//! idempotently. Three tables: sessions, session_parts, measurements.

use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::info;

use crate::error::Result;

/// Initialize the database connection pool and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;
    // WAL keeps history reads from blocking the consumer-loop writes
    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
    sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

    create_sessions_table(&pool).await?;
    create_session_parts_table(&pool).await?;
    create_measurements_table(&pool).await?;

    Ok(pool)
}

async fn create_sessions_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            guid TEXT NOT NULL UNIQUE,
            operator_name TEXT NOT NULL,
            supervisor_id TEXT NOT NULL,
            company_name TEXT NOT NULL,
            machine_id TEXT NOT NULL,
            part_description TEXT NOT NULL,
            headshot_threshold REAL NOT NULL,
            coilshot_threshold REAL NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_session_parts_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS session_parts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id INTEGER NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
            part_number INTEGER NOT NULL,
            retest_index INTEGER NOT NULL DEFAULT 0,
            part_description TEXT NOT NULL,
            status TEXT,
            crack_detected INTEGER,
            crack_image_path TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_session_parts_number_desc
        ON session_parts(part_number, part_description)
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_measurements_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS measurements (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_part_id INTEGER NOT NULL REFERENCES session_parts(id) ON DELETE CASCADE,
            meter_type TEXT NOT NULL,
            shot_index INTEGER NOT NULL,
            "current" REAL NOT NULL,
            duration REAL NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}
