use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{AppError, TransportError};
use crate::job::{JobKind, ScrapeSession, SessionOutcome, SessionStats};
use crate::models::{
    ListingCounts, ListingRecord, NewProxy, ProxyOutcome, ProxyRecord, ProxyScore, ProxyStats,
    RawDocument, RequestLogEntry, ScrapeScope, StaleListing, TransactionType, UpsertOutcome,
};

/// Per-request options passed to a [`Transport`].
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub timeout: Duration,
    pub headers: Vec<(String, String)>,
}

impl RequestOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            headers: Vec::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// A successful response.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub body: String,
}

/// Issues a single HTTP request, optionally through a proxy.
///
/// Implementations report non-success statuses as [`TransportError::BadStatus`].
pub trait Transport: Send + Sync + Clone + 'static {
    fn request(
        &self,
        url: &str,
        options: &RequestOptions,
        proxy: Option<&ProxyRecord>,
    ) -> impl Future<Output = Result<Response, TransportError>> + Send;
}

/// Builds origin URLs for searches and single listings.
pub trait ListingSource: Send + Sync + Clone + 'static {
    fn search_url(&self, transaction: TransactionType, scope: ScrapeScope, page: u32) -> String;

    fn listing_url(&self, external_id: &str) -> String;
}

/// Turns fetched documents into listing records.
pub trait Extractor: Send + Sync + Clone + 'static {
    /// Splits a search results page into per-listing documents.
    fn split_search_page(&self, body: &str) -> Result<Vec<RawDocument>, AppError>;

    /// Extracts one listing. Failures are per item.
    fn extract(
        &self,
        document: &RawDocument,
        transaction: TransactionType,
    ) -> Result<ListingRecord, AppError>;
}

/// Listing persistence.
pub trait ListingStore: Send + Sync + Clone + 'static {
    /// Insert or update by `external_id`, stamping `last_scraped_at = now`.
    fn upsert_listing(
        &self,
        listing: &ListingRecord,
    ) -> impl Future<Output = Result<UpsertOutcome, AppError>> + Send;

    fn upsert_images(
        &self,
        listing_id: Uuid,
        images: &[String],
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Mark active listings last scraped before `cutoff` inactive. Returns the number changed.
    fn mark_stale(&self, cutoff: DateTime<Utc>)
    -> impl Future<Output = Result<u64, AppError>> + Send;

    /// Active listings last scraped before `cutoff`, never-scraped first, then oldest first.
    fn listings_due_for_refresh(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<StaleListing>, AppError>> + Send;

    fn listing_counts(&self) -> impl Future<Output = Result<ListingCounts, AppError>> + Send;
}

/// Proxy persistence.
pub trait ProxyStore: Send + Sync + Clone + 'static {
    /// Active proxies ordered by `last_used` ascending, never-used first.
    fn active_proxies(&self) -> impl Future<Output = Result<Vec<ProxyRecord>, AppError>> + Send;

    /// Proxies (active or not) never tested or last tested before `cutoff`.
    fn proxies_due_for_test(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<ProxyRecord>, AppError>> + Send;

    fn add_proxy(&self, proxy: &NewProxy)
    -> impl Future<Output = Result<ProxyRecord, AppError>> + Send;

    fn mark_proxy_used(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Apply one outcome to the proxy's score as a single atomic read-modify-write
    /// and return the resulting score.
    ///
    /// `deactivation_threshold` is the score below which a failure deactivates the proxy.
    fn update_proxy_stats(
        &self,
        id: Uuid,
        outcome: &ProxyOutcome,
        deactivation_threshold: f64,
    ) -> impl Future<Output = Result<ProxyScore, AppError>> + Send;

    fn list_proxies(&self) -> impl Future<Output = Result<Vec<ProxyRecord>, AppError>> + Send;

    fn proxy_stats(&self) -> impl Future<Output = Result<ProxyStats, AppError>> + Send;
}

/// Append-only session records.
pub trait SessionStore: Send + Sync + Clone + 'static {
    fn log_session_start(
        &self,
        kind: JobKind,
    ) -> impl Future<Output = Result<ScrapeSession, AppError>> + Send;

    fn log_session_end(
        &self,
        id: Uuid,
        outcome: &SessionOutcome,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn session_stats(
        &self,
        since: DateTime<Utc>,
    ) -> impl Future<Output = Result<SessionStats, AppError>> + Send;

    /// Most recent sessions, newest first.
    fn recent_sessions(
        &self,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<ScrapeSession>, AppError>> + Send;

    /// Delete sessions outside the `keep` most recent. Sessions still
    /// `started` are never deleted.
    fn prune_sessions(&self, keep: usize) -> impl Future<Output = Result<u64, AppError>> + Send;
}

/// Request and view logs.
pub trait RequestLogStore: Send + Sync + Clone + 'static {
    fn log_request(
        &self,
        entry: &RequestLogEntry,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn count_requests_since(
        &self,
        since: DateTime<Utc>,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;

    fn prune_request_log(
        &self,
        cutoff: DateTime<Utc>,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;

    fn prune_view_log(
        &self,
        cutoff: DateTime<Utc>,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;
}

/// Everything the pipeline persists.
pub trait PersistenceGateway: ListingStore + ProxyStore + SessionStore + RequestLogStore {}

impl<T> PersistenceGateway for T where T: ListingStore + ProxyStore + SessionStore + RequestLogStore {}
