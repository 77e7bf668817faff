use chrono::{DateTime, Utc};
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

use nestfeed_core::error::AppError;
use nestfeed_core::models::{
    ListingCounts, ListingRecord, StaleListing, TransactionType, UpsertOutcome,
};

use crate::db_err;

/// Listings and their image galleries.
#[derive(Clone)]
pub struct ListingRepository {
    pool: Pool<Postgres>,
}

impl ListingRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert or update by `external_id`. Re-seen listings are reactivated.
    ///
    /// `xmax = 0` holds only for a freshly inserted row, which tells inserts
    /// apart from conflict updates in a single statement.
    pub async fn upsert(&self, listing: &ListingRecord) -> Result<UpsertOutcome, AppError> {
        let (id, was_new): (Uuid, bool) = sqlx::query_as(
            r#"
            INSERT INTO listings (external_id, transaction_type, url, price, data, data_hash, last_scraped_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            ON CONFLICT (external_id) DO UPDATE SET
                transaction_type = EXCLUDED.transaction_type,
                url = COALESCE(EXCLUDED.url, listings.url),
                price = EXCLUDED.price,
                data = EXCLUDED.data,
                data_hash = EXCLUDED.data_hash,
                is_active = TRUE,
                last_scraped_at = NOW(),
                updated_at = NOW()
            RETURNING id, (xmax = 0) AS was_new
            "#,
        )
        .bind(&listing.external_id)
        .bind(listing.transaction.as_str())
        .bind(&listing.url)
        .bind(listing.price)
        .bind(&listing.data)
        .bind(listing.data_hash())
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(UpsertOutcome { id, was_new })
    }

    /// Replace the listing's image gallery.
    pub async fn replace_images(&self, listing_id: Uuid, images: &[String]) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query("DELETE FROM listing_images WHERE listing_id = $1")
            .bind(listing_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        if !images.is_empty() {
            let positions: Vec<i32> = (0..images.len() as i32).collect();
            sqlx::query(
                r#"
                INSERT INTO listing_images (listing_id, position, url)
                SELECT $1, pos, url FROM UNNEST($2::int4[], $3::text[]) AS t(pos, url)
                "#,
            )
            .bind(listing_id)
            .bind(&positions)
            .bind(images)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)
    }

    pub async fn images(&self, listing_id: Uuid) -> Result<Vec<String>, AppError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT url FROM listing_images WHERE listing_id = $1 ORDER BY position",
        )
        .bind(listing_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows.into_iter().map(|(url,)| url).collect())
    }

    /// Deactivate active listings last scraped before `cutoff`.
    pub async fn mark_stale(&self, cutoff: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE listings
            SET is_active = FALSE, updated_at = NOW()
            WHERE is_active AND last_scraped_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected())
    }

    pub async fn due_for_refresh(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<StaleListing>, AppError> {
        let rows = sqlx::query_as::<_, StaleListingRow>(
            r#"
            SELECT id, external_id, transaction_type, url, last_scraped_at
            FROM listings
            WHERE is_active AND (last_scraped_at IS NULL OR last_scraped_at < $1)
            ORDER BY last_scraped_at ASC NULLS FIRST
            LIMIT $2
            "#,
        )
        .bind(cutoff)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    pub async fn counts(&self) -> Result<ListingCounts, AppError> {
        let (total, active): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COUNT(*) FILTER (WHERE is_active) FROM listings",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(ListingCounts {
            total: total as u64,
            active: active as u64,
        })
    }

    /// Record that a listing was viewed.
    pub async fn record_view(&self, listing_id: Uuid) -> Result<(), AppError> {
        sqlx::query("INSERT INTO listing_views (listing_id) VALUES ($1)")
            .bind(listing_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct StaleListingRow {
    id: Uuid,
    external_id: String,
    transaction_type: String,
    url: Option<String>,
    last_scraped_at: Option<DateTime<Utc>>,
}

impl TryFrom<StaleListingRow> for StaleListing {
    type Error = AppError;

    fn try_from(row: StaleListingRow) -> Result<Self, Self::Error> {
        let transaction: TransactionType =
            row.transaction_type.parse().map_err(AppError::DatabaseError)?;
        Ok(StaleListing {
            id: row.id,
            external_id: row.external_id,
            transaction,
            url: row.url,
            last_scraped_at: row.last_scraped_at,
        })
    }
}
