//! SQLite gateway
//!
//! Thin query layer over the station schema. Each operation is one statement;
//! the caller (the lifecycle controller) decides how failures are reported
//! and never blocks ingestion on this layer.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::error::Result;
use crate::gateway::PersistenceGateway;
use crate::types::{Channel, Disposition, SessionInfo};

/// [`PersistenceGateway`] backed by the station SQLite database
#[derive(Debug, Clone)]
pub struct SqliteGateway {
    pool: SqlitePool,
}

impl SqliteGateway {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl PersistenceGateway for SqliteGateway {
    async fn record_session_start(&self, session: &SessionInfo) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO sessions (
                guid, operator_name, supervisor_id, company_name, machine_id,
                part_description, headshot_threshold, coilshot_threshold, start_time
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(session.id.to_string())
        .bind(&session.operator)
        .bind(&session.supervisor)
        .bind(&session.company)
        .bind(&session.machine_id)
        .bind(&session.part_description)
        .bind(session.thresholds.headshot)
        .bind(session.thresholds.coilshot)
        .bind(session.started_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn record_session_end(&self, session_id: i64, ended_at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE sessions SET end_time = ? WHERE id = ?")
            .bind(ended_at.to_rfc3339())
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_part(
        &self,
        session_id: i64,
        base_number: u32,
        retest_index: u32,
        description: &str,
    ) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO session_parts (session_id, part_number, retest_index, part_description)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(session_id)
        .bind(base_number as i64)
        .bind(retest_index as i64)
        .bind(description)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn record_shot(
        &self,
        part_id: i64,
        channel: Channel,
        sequence_index: usize,
        current: f64,
        duration: f64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO measurements (session_part_id, meter_type, shot_index, "current", duration)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(part_id)
        .bind(channel.as_str())
        .bind(sequence_index as i64)
        .bind(current)
        .bind(duration)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_part_status(&self, part_id: i64, status: Disposition) -> Result<()> {
        sqlx::query("UPDATE session_parts SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(part_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_crack_flag(&self, part_id: i64, crack_detected: bool) -> Result<()> {
        sqlx::query("UPDATE session_parts SET crack_detected = ? WHERE id = ?")
            .bind(crack_detected as i64)
            .bind(part_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_evidence_path(&self, part_id: i64, path: &str) -> Result<()> {
        sqlx::query("UPDATE session_parts SET crack_image_path = ? WHERE id = ?")
            .bind(path)
            .bind(part_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn part_number_exists_in_history(
        &self,
        base_number: u32,
        description: &str,
    ) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM session_parts WHERE part_number = ? AND part_description = ? LIMIT 1",
        )
        .bind(base_number as i64)
        .bind(description)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }
}
