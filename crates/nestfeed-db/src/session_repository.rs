use chrono::{DateTime, Utc};
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

use nestfeed_core::error::AppError;
use nestfeed_core::job::{
    JobKind, ScrapeSession, SessionCounts, SessionOutcome, SessionStats, SessionStatus,
};

use crate::db_err;

/// Append-only job session records.
#[derive(Clone)]
pub struct SessionRepository {
    pool: Pool<Postgres>,
}

impl SessionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn start(&self, kind: JobKind) -> Result<ScrapeSession, AppError> {
        let row = sqlx::query_as::<_, SessionRow>(
            r#"
            INSERT INTO scrape_sessions (kind, status)
            VALUES ($1, 'started')
            RETURNING *
            "#,
        )
        .bind(kind.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        row.try_into()
    }

    /// Write the terminal status and counters. Only a `started` session can end.
    pub async fn end(&self, id: Uuid, outcome: &SessionOutcome) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE scrape_sessions SET
                status = $2,
                completed_at = NOW(),
                listings_found = $3,
                listings_new = $4,
                listings_updated = $5,
                listings_removed = $6,
                error_message = $7,
                execution_time_ms = $8
            WHERE id = $1 AND status = 'started'
            "#,
        )
        .bind(id)
        .bind(outcome.status.as_str())
        .bind(outcome.counts.found as i64)
        .bind(outcome.counts.new as i64)
        .bind(outcome.counts.updated as i64)
        .bind(outcome.counts.removed as i64)
        .bind(&outcome.error)
        .bind(outcome.execution_time_ms as i64)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(AppError::DatabaseError(format!(
                "session {id} not found or already ended"
            )));
        }
        Ok(())
    }

    pub async fn stats(&self, since: DateTime<Utc>) -> Result<SessionStats, AppError> {
        let row = sqlx::query_as::<_, StatsRow>(
            r#"
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) FILTER (WHERE status = 'started') AS running,
                (AVG(execution_time_ms))::float8 AS avg_execution_ms,
                COALESCE(SUM(listings_found), 0)::int8 AS found,
                COALESCE(SUM(listings_new), 0)::int8 AS new,
                COALESCE(SUM(listings_updated), 0)::int8 AS updated,
                COALESCE(SUM(listings_removed), 0)::int8 AS removed
            FROM scrape_sessions
            WHERE started_at >= $1
            "#,
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(SessionStats {
            since: Some(since),
            total: row.total as u64,
            completed: row.completed as u64,
            failed: row.failed as u64,
            running: row.running as u64,
            avg_execution_ms: row.avg_execution_ms,
            counts: SessionCounts {
                found: row.found as u64,
                new: row.new as u64,
                updated: row.updated as u64,
                removed: row.removed as u64,
            },
        })
    }

    pub async fn recent(&self, limit: usize) -> Result<Vec<ScrapeSession>, AppError> {
        let rows = sqlx::query_as::<_, SessionRow>(
            "SELECT * FROM scrape_sessions ORDER BY started_at DESC LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Delete finished sessions outside the `keep` most recent.
    pub async fn prune(&self, keep: usize) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            DELETE FROM scrape_sessions
            WHERE status <> 'started'
              AND id NOT IN (
                SELECT id FROM scrape_sessions
                ORDER BY started_at DESC
                LIMIT $1
            )
            "#,
        )
        .bind(keep as i64)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected())
    }
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: Uuid,
    kind: String,
    status: String,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    listings_found: i64,
    listings_new: i64,
    listings_updated: i64,
    listings_removed: i64,
    error_message: Option<String>,
    execution_time_ms: Option<i64>,
}

impl TryFrom<SessionRow> for ScrapeSession {
    type Error = AppError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        Ok(ScrapeSession {
            id: row.id,
            kind: row.kind.parse().map_err(AppError::DatabaseError)?,
            status: row
                .status
                .parse::<SessionStatus>()
                .map_err(AppError::DatabaseError)?,
            started_at: row.started_at,
            completed_at: row.completed_at,
            counts: SessionCounts {
                found: row.listings_found as u64,
                new: row.listings_new as u64,
                updated: row.listings_updated as u64,
                removed: row.listings_removed as u64,
            },
            error: row.error_message,
            execution_time_ms: row.execution_time_ms.map(|ms| ms as u64),
        })
    }
}

#[derive(sqlx::FromRow)]
struct StatsRow {
    total: i64,
    completed: i64,
    failed: i64,
    running: i64,
    avg_execution_ms: Option<f64>,
    found: i64,
    new: i64,
    updated: i64,
    removed: i64,
}
