use chrono::{DateTime, Utc};
use sqlx::{PgPool, Pool, Postgres};

use nestfeed_core::error::AppError;
use nestfeed_core::models::RequestLogEntry;

use crate::db_err;

/// Outbound request log (quota accounting) and the listing view log.
#[derive(Clone)]
pub struct RequestLogRepository {
    pool: Pool<Postgres>,
}

impl RequestLogRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn append(&self, entry: &RequestLogEntry) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO request_log (url, proxy_id, success, status_code, response_time_ms, requested_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&entry.url)
        .bind(entry.proxy_id)
        .bind(entry.success)
        .bind(entry.status_code.map(i32::from))
        .bind(entry.response_time_ms.map(|ms| ms as i64))
        .bind(entry.at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    pub async fn count_since(&self, since: DateTime<Utc>) -> Result<u64, AppError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM request_log WHERE requested_at >= $1")
                .bind(since)
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?;

        Ok(count as u64)
    }

    pub async fn prune(&self, cutoff: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM request_log WHERE requested_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(result.rows_affected())
    }

    pub async fn prune_views(&self, cutoff: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM listing_views WHERE viewed_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(result.rows_affected())
    }
}
