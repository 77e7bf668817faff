use chrono::{DateTime, Utc};
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

use nestfeed_core::error::AppError;
use nestfeed_core::models::{
    NewProxy, OutcomeSource, ProxyCredentials, ProxyOutcome, ProxyProtocol, ProxyRecord, ProxyScore,
    ProxyStats,
};

use crate::db_err;

/// Proxy inventory and reliability scores.
#[derive(Clone)]
pub struct ProxyRepository {
    pool: Pool<Postgres>,
}

impl ProxyRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Active proxies, least recently used first.
    pub async fn active(&self) -> Result<Vec<ProxyRecord>, AppError> {
        let rows = sqlx::query_as::<_, ProxyRow>(
            r#"
            SELECT * FROM proxies
            WHERE is_active
            ORDER BY last_used ASC NULLS FIRST, created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn due_for_test(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ProxyRecord>, AppError> {
        let rows = sqlx::query_as::<_, ProxyRow>(
            r#"
            SELECT * FROM proxies
            WHERE last_tested IS NULL OR last_tested < $1
            ORDER BY last_tested ASC NULLS FIRST
            LIMIT $2
            "#,
        )
        .bind(cutoff)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Register a proxy. Re-adding an existing endpoint refreshes its credentials.
    pub async fn add(&self, proxy: &NewProxy) -> Result<ProxyRecord, AppError> {
        let (username, password) = match &proxy.credentials {
            Some(c) => (Some(c.username.as_str()), Some(c.password.as_str())),
            None => (None, None),
        };

        let row = sqlx::query_as::<_, ProxyRow>(
            r#"
            INSERT INTO proxies (address, port, protocol, username, password, country)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (address, port, protocol) DO UPDATE SET
                username = EXCLUDED.username,
                password = EXCLUDED.password,
                country = COALESCE(EXCLUDED.country, proxies.country)
            RETURNING *
            "#,
        )
        .bind(&proxy.address)
        .bind(i32::from(proxy.port))
        .bind(proxy.protocol.as_str())
        .bind(username)
        .bind(password)
        .bind(&proxy.country)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.into())
    }

    pub async fn mark_used(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE proxies
            SET last_used = GREATEST(COALESCE(last_used, $2), $2)
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    /// Apply one outcome in a single UPDATE so concurrent outcomes never
    /// overwrite each other.
    ///
    /// Success: `rate * 0.9 + 10`. Live failure: `rate * 0.9`.
    /// Health-check failure: `rate * 0.8`. A passing health check reactivates;
    /// a failure leaving the rate under `deactivation_threshold` deactivates.
    pub async fn record_outcome(
        &self,
        id: Uuid,
        outcome: &ProxyOutcome,
        deactivation_threshold: f64,
    ) -> Result<ProxyScore, AppError> {
        let health_check = outcome.source == OutcomeSource::HealthCheck;
        let row: Option<(f64, bool)> = sqlx::query_as(
            r#"
            UPDATE proxies SET
                success_rate = LEAST(100, GREATEST(0, CASE
                    WHEN $2 THEN success_rate * 0.9 + 10
                    WHEN $3 THEN success_rate * 0.8
                    ELSE success_rate * 0.9
                END)),
                is_active = CASE
                    WHEN $2 AND $3 THEN TRUE
                    WHEN NOT $2 AND LEAST(100, GREATEST(0, CASE
                        WHEN $3 THEN success_rate * 0.8
                        ELSE success_rate * 0.9
                    END)) < $4 THEN FALSE
                    ELSE is_active
                END,
                response_time_ms = COALESCE($5, response_time_ms),
                last_tested = CASE WHEN $3 THEN $6 ELSE last_tested END
            WHERE id = $1
            RETURNING success_rate, is_active
            "#,
        )
        .bind(id)
        .bind(outcome.success)
        .bind(health_check)
        .bind(deactivation_threshold)
        .bind(outcome.response_time_ms.map(|ms| ms as i64))
        .bind(outcome.at)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        let (success_rate, active) =
            row.ok_or_else(|| AppError::DatabaseError(format!("proxy {id} not found")))?;
        Ok(ProxyScore {
            success_rate,
            active,
        })
    }

    pub async fn list(&self) -> Result<Vec<ProxyRecord>, AppError> {
        let rows = sqlx::query_as::<_, ProxyRow>(
            "SELECT * FROM proxies ORDER BY is_active DESC, success_rate DESC, created_at ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Totals, plus averages over active proxies.
    pub async fn stats(&self) -> Result<ProxyStats, AppError> {
        let (total, active, avg_success_rate, avg_response_time_ms): (
            i64,
            i64,
            Option<f64>,
            Option<f64>,
        ) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*),
                COUNT(*) FILTER (WHERE is_active),
                AVG(success_rate) FILTER (WHERE is_active),
                (AVG(response_time_ms) FILTER (WHERE is_active))::float8
            FROM proxies
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(ProxyStats {
            total: total as u64,
            active: active as u64,
            avg_success_rate,
            avg_response_time_ms,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ProxyRow {
    id: Uuid,
    address: String,
    port: i32,
    protocol: String,
    username: Option<String>,
    password: Option<String>,
    country: Option<String>,
    is_active: bool,
    success_rate: f64,
    last_used: Option<DateTime<Utc>>,
    last_tested: Option<DateTime<Utc>>,
    response_time_ms: Option<i64>,
}

impl From<ProxyRow> for ProxyRecord {
    fn from(row: ProxyRow) -> Self {
        ProxyRecord {
            id: row.id,
            address: row.address,
            port: u16::try_from(row.port).unwrap_or_default(),
            protocol: row.protocol.parse().unwrap_or(ProxyProtocol::Http),
            credentials: row.username.map(|username| ProxyCredentials {
                username,
                password: row.password.unwrap_or_default(),
            }),
            country: row.country,
            active: row.is_active,
            success_rate: row.success_rate,
            last_used: row.last_used,
            last_tested: row.last_tested,
            response_time_ms: row.response_time_ms.map(|ms| ms as u64),
        }
    }
}
