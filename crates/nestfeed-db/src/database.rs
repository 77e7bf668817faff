use chrono::{DateTime, Utc};
use nestfeed_core::AppError;
use nestfeed_core::job::{JobKind, ScrapeSession, SessionOutcome, SessionStats};
use nestfeed_core::models::{
    ListingCounts, ListingRecord, NewProxy, ProxyOutcome, ProxyRecord, ProxyScore, ProxyStats,
    RequestLogEntry, StaleListing, UpsertOutcome,
};
use nestfeed_core::traits::{ListingStore, ProxyStore, RequestLogStore, SessionStore};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::listing_repository::ListingRepository;
use crate::proxy_repository::ProxyRepository;
use crate::request_log_repository::RequestLogRepository;
use crate::session_repository::SessionRepository;

/// Central database facade. Owns the connection pool, runs migrations,
/// vends repositories, and serves as the pipeline's persistence gateway.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    listings: ListingRepository,
    proxies: ProxyRepository,
    sessions: SessionRepository,
    requests: RequestLogRepository,
}

impl Database {
    /// Connect to PostgreSQL with the given configuration.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to connect: {e}")))?;

        tracing::debug!(max_connections = config.max_connections, "Database pool ready");
        Ok(Self::from_pool(pool))
    }

    /// Create a `Database` from an existing pool (useful for testing).
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            listings: ListingRepository::new(pool.clone()),
            proxies: ProxyRepository::new(pool.clone()),
            sessions: SessionRepository::new(pool.clone()),
            requests: RequestLogRepository::new(pool.clone()),
            pool,
        }
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<(), AppError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Migration failed: {e}")))?;
        Ok(())
    }

    pub fn listings(&self) -> &ListingRepository {
        &self.listings
    }

    pub fn proxies(&self) -> &ProxyRepository {
        &self.proxies
    }

    pub fn sessions(&self) -> &SessionRepository {
        &self.sessions
    }

    pub fn requests(&self) -> &RequestLogRepository {
        &self.requests
    }

    /// Get a reference to the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl ListingStore for Database {
    async fn upsert_listing(&self, listing: &ListingRecord) -> Result<UpsertOutcome, AppError> {
        self.listings.upsert(listing).await
    }

    async fn upsert_images(&self, listing_id: Uuid, images: &[String]) -> Result<(), AppError> {
        self.listings.replace_images(listing_id, images).await
    }

    async fn mark_stale(&self, cutoff: DateTime<Utc>) -> Result<u64, AppError> {
        self.listings.mark_stale(cutoff).await
    }

    async fn listings_due_for_refresh(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<StaleListing>, AppError> {
        self.listings.due_for_refresh(cutoff, limit).await
    }

    async fn listing_counts(&self) -> Result<ListingCounts, AppError> {
        self.listings.counts().await
    }
}

impl ProxyStore for Database {
    async fn active_proxies(&self) -> Result<Vec<ProxyRecord>, AppError> {
        self.proxies.active().await
    }

    async fn proxies_due_for_test(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ProxyRecord>, AppError> {
        self.proxies.due_for_test(cutoff, limit).await
    }

    async fn add_proxy(&self, proxy: &NewProxy) -> Result<ProxyRecord, AppError> {
        self.proxies.add(proxy).await
    }

    async fn mark_proxy_used(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), AppError> {
        self.proxies.mark_used(id, at).await
    }

    async fn update_proxy_stats(
        &self,
        id: Uuid,
        outcome: &ProxyOutcome,
        deactivation_threshold: f64,
    ) -> Result<ProxyScore, AppError> {
        self.proxies
            .record_outcome(id, outcome, deactivation_threshold)
            .await
    }

    async fn list_proxies(&self) -> Result<Vec<ProxyRecord>, AppError> {
        self.proxies.list().await
    }

    async fn proxy_stats(&self) -> Result<ProxyStats, AppError> {
        self.proxies.stats().await
    }
}

impl SessionStore for Database {
    async fn log_session_start(&self, kind: JobKind) -> Result<ScrapeSession, AppError> {
        self.sessions.start(kind).await
    }

    async fn log_session_end(&self, id: Uuid, outcome: &SessionOutcome) -> Result<(), AppError> {
        self.sessions.end(id, outcome).await
    }

    async fn session_stats(&self, since: DateTime<Utc>) -> Result<SessionStats, AppError> {
        self.sessions.stats(since).await
    }

    async fn recent_sessions(&self, limit: usize) -> Result<Vec<ScrapeSession>, AppError> {
        self.sessions.recent(limit).await
    }

    async fn prune_sessions(&self, keep: usize) -> Result<u64, AppError> {
        self.sessions.prune(keep).await
    }
}

impl RequestLogStore for Database {
    async fn log_request(&self, entry: &RequestLogEntry) -> Result<(), AppError> {
        self.requests.append(entry).await
    }

    async fn count_requests_since(&self, since: DateTime<Utc>) -> Result<u64, AppError> {
        self.requests.count_since(since).await
    }

    async fn prune_request_log(&self, cutoff: DateTime<Utc>) -> Result<u64, AppError> {
        self.requests.prune(cutoff).await
    }

    async fn prune_view_log(&self, cutoff: DateTime<Utc>) -> Result<u64, AppError> {
        self.requests.prune_views(cutoff).await
    }
}
