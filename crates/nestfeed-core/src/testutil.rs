//! Test utilities: mock implementations of all core traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{AppError, TransportError};
use crate::job::{
    JobKind, ScrapeSession, SessionCounts, SessionOutcome, SessionStats, SessionStatus,
};
use crate::models::{
    ListingCounts, ListingRecord, NewProxy, OutcomeSource, ProxyOutcome, ProxyProtocol,
    ProxyRecord, ProxyScore, ProxyStats, RawDocument, RequestLogEntry, ScrapeScope, StaleListing,
    TransactionType, UpsertOutcome,
};
use crate::proxy_pool::apply_outcome;
use crate::traits::{
    Extractor, ListingSource, ListingStore, ProxyStore, RequestLogStore, RequestOptions, Response,
    SessionStore, Transport,
};

pub fn make_test_proxy(address: &str) -> ProxyRecord {
    ProxyRecord {
        id: Uuid::new_v4(),
        address: address.to_string(),
        port: 8080,
        protocol: ProxyProtocol::Http,
        credentials: None,
        country: None,
        active: true,
        success_rate: 100.0,
        last_used: None,
        last_tested: None,
        response_time_ms: None,
    }
}

// ---------------------------------------------------------------------------
// MockTransport
// ---------------------------------------------------------------------------

/// One request seen by [`MockTransport`].
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub url: String,
    pub proxy_id: Option<Uuid>,
}

/// Mock transport that returns queued responses.
#[derive(Clone)]
pub struct MockTransport {
    /// Queue of responses. Each call pops the first element.
    /// If empty, returns `default_body`.
    responses: Arc<Mutex<Vec<Result<String, TransportError>>>>,
    default_body: String,
    /// Proxy addresses whose requests are refused.
    failing: Arc<Mutex<Vec<String>>>,
    delay: Option<Duration>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl MockTransport {
    pub fn new(body: &str) -> Self {
        Self {
            responses: Arc::new(Mutex::new(Vec::new())),
            default_body: body.to_string(),
            failing: Arc::new(Mutex::new(Vec::new())),
            delay: None,
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_responses(responses: Vec<Result<String, TransportError>>) -> Self {
        let transport = Self::new("[]");
        *transport.responses.lock().unwrap() = responses;
        transport
    }

    /// Sleep before answering each request.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Refuse every request routed through the proxy at `address`.
    pub fn fail_through(self, address: &str) -> Self {
        self.failing.lock().unwrap().push(address.to_string());
        self
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Transport for MockTransport {
    async fn request(
        &self,
        url: &str,
        _options: &RequestOptions,
        proxy: Option<&ProxyRecord>,
    ) -> Result<Response, TransportError> {
        self.requests.lock().unwrap().push(RecordedRequest {
            url: url.to_string(),
            proxy_id: proxy.map(|p| p.id),
        });

        let refused = proxy.is_some_and(|p| self.failing.lock().unwrap().contains(&p.address));
        let next = if refused {
            Err(TransportError::Refused("proxy refused connection".into()))
        } else {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(self.default_body.clone())
            } else {
                responses.remove(0)
            }
        };

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        next.map(|body| Response { status: 200, body })
    }
}

// ---------------------------------------------------------------------------
// MockSource / MockExtractor
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct MockSource;

impl ListingSource for MockSource {
    fn search_url(&self, transaction: TransactionType, scope: ScrapeScope, page: u32) -> String {
        let scope = match scope {
            ScrapeScope::All => "all",
            ScrapeScope::Recent => "recent",
        };
        format!("mock://search/{transaction}/{scope}/{page}")
    }

    fn listing_url(&self, external_id: &str) -> String {
        format!("mock://listing/{external_id}")
    }
}

/// Mock extractor over JSON bodies.
///
/// A search page is a JSON array; each element becomes one document. A
/// document needs a string `id`; `"panic": true` makes extraction panic.
#[derive(Clone, Default)]
pub struct MockExtractor;

impl MockExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl Extractor for MockExtractor {
    fn split_search_page(&self, body: &str) -> Result<Vec<RawDocument>, AppError> {
        let items: Vec<Value> =
            serde_json::from_str(body).map_err(|e| AppError::Extraction(e.to_string()))?;
        Ok(items
            .into_iter()
            .map(|item| RawDocument::new(item.to_string()))
            .collect())
    }

    fn extract(
        &self,
        document: &RawDocument,
        transaction: TransactionType,
    ) -> Result<ListingRecord, AppError> {
        let data: Value = serde_json::from_str(&document.body)
            .map_err(|e| AppError::Extraction(e.to_string()))?;
        if data.get("panic").and_then(Value::as_bool) == Some(true) {
            panic!("extractor blew up on {}", document.body);
        }
        let external_id = data
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::Extraction("missing id".into()))?
            .to_string();
        let images = data
            .get("images")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(ListingRecord {
            external_id,
            transaction,
            url: document.source_url.clone(),
            price: data.get("price").and_then(Value::as_f64),
            images,
            data,
        })
    }
}

// ---------------------------------------------------------------------------
// InMemoryGateway
// ---------------------------------------------------------------------------

/// A listing as held by [`InMemoryGateway`].
#[derive(Debug, Clone)]
pub struct StoredListing {
    pub id: Uuid,
    pub record: ListingRecord,
    pub active: bool,
    pub last_scraped_at: Option<DateTime<Utc>>,
    pub data_hash: String,
    pub images: Vec<String>,
}

#[derive(Default)]
struct GatewayState {
    listings: Vec<StoredListing>,
    proxies: Vec<ProxyRecord>,
    sessions: Vec<ScrapeSession>,
    requests: Vec<RequestLogEntry>,
    views: Vec<DateTime<Utc>>,
    fail_session_end: bool,
    fail_prune_request_log: bool,
}

/// In-memory implementation of every store trait.
#[derive(Clone, Default)]
pub struct InMemoryGateway {
    state: Arc<Mutex<GatewayState>>,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_listing(
        &self,
        external_id: &str,
        transaction: TransactionType,
        last_scraped_at: Option<DateTime<Utc>>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let record = ListingRecord {
            external_id: external_id.to_string(),
            transaction,
            url: None,
            price: None,
            images: Vec::new(),
            data: serde_json::json!({ "id": external_id }),
        };
        self.state.lock().unwrap().listings.push(StoredListing {
            id,
            data_hash: record.data_hash(),
            record,
            active: true,
            last_scraped_at,
            images: Vec::new(),
        });
        id
    }

    pub async fn listing(&self, external_id: &str) -> Option<StoredListing> {
        self.state
            .lock()
            .unwrap()
            .listings
            .iter()
            .find(|l| l.record.external_id == external_id)
            .cloned()
    }

    pub async fn insert_proxy(&self, proxy: ProxyRecord) -> ProxyRecord {
        self.state.lock().unwrap().proxies.push(proxy.clone());
        proxy
    }

    pub async fn proxy(&self, id: Uuid) -> Option<ProxyRecord> {
        self.state
            .lock()
            .unwrap()
            .proxies
            .iter()
            .find(|p| p.id == id)
            .cloned()
    }

    /// Every session, oldest first.
    pub async fn sessions(&self) -> Vec<ScrapeSession> {
        self.state.lock().unwrap().sessions.clone()
    }

    pub async fn request_log(&self) -> Vec<RequestLogEntry> {
        self.state.lock().unwrap().requests.clone()
    }

    pub async fn insert_request_at(&self, at: DateTime<Utc>) {
        self.state.lock().unwrap().requests.push(RequestLogEntry {
            url: "mock://seed".into(),
            proxy_id: None,
            success: true,
            status_code: Some(200),
            response_time_ms: Some(1),
            at,
        });
    }

    pub async fn insert_view_at(&self, at: DateTime<Utc>) {
        self.state.lock().unwrap().views.push(at);
    }

    /// Make every `log_session_end` fail.
    pub fn fail_session_end(&self) {
        self.state.lock().unwrap().fail_session_end = true;
    }

    /// Make every `prune_request_log` fail.
    pub fn fail_prune_request_log(&self) {
        self.state.lock().unwrap().fail_prune_request_log = true;
    }
}

impl ListingStore for InMemoryGateway {
    async fn upsert_listing(&self, listing: &ListingRecord) -> Result<UpsertOutcome, AppError> {
        let mut state = self.state.lock().unwrap();
        let now = Utc::now();
        if let Some(existing) = state
            .listings
            .iter_mut()
            .find(|l| l.record.external_id == listing.external_id)
        {
            existing.record = listing.clone();
            existing.data_hash = listing.data_hash();
            existing.active = true;
            existing.last_scraped_at = Some(now);
            return Ok(UpsertOutcome {
                id: existing.id,
                was_new: false,
            });
        }

        let id = Uuid::new_v4();
        state.listings.push(StoredListing {
            id,
            record: listing.clone(),
            active: true,
            last_scraped_at: Some(now),
            data_hash: listing.data_hash(),
            images: Vec::new(),
        });
        Ok(UpsertOutcome { id, was_new: true })
    }

    async fn upsert_images(&self, listing_id: Uuid, images: &[String]) -> Result<(), AppError> {
        let mut state = self.state.lock().unwrap();
        let listing = state
            .listings
            .iter_mut()
            .find(|l| l.id == listing_id)
            .ok_or_else(|| AppError::DatabaseError("listing not found".into()))?;
        listing.images = images.to_vec();
        Ok(())
    }

    async fn mark_stale(&self, cutoff: DateTime<Utc>) -> Result<u64, AppError> {
        let mut state = self.state.lock().unwrap();
        let mut changed = 0;
        for listing in state.listings.iter_mut() {
            if listing.active && listing.last_scraped_at.is_some_and(|t| t < cutoff) {
                listing.active = false;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn listings_due_for_refresh(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<StaleListing>, AppError> {
        let state = self.state.lock().unwrap();
        let mut due: Vec<&StoredListing> = state
            .listings
            .iter()
            .filter(|l| l.active && l.last_scraped_at.is_none_or(|t| t < cutoff))
            .collect();
        due.sort_by_key(|l| l.last_scraped_at);
        Ok(due
            .into_iter()
            .take(limit)
            .map(|l| StaleListing {
                id: l.id,
                external_id: l.record.external_id.clone(),
                transaction: l.record.transaction,
                url: l.record.url.clone(),
                last_scraped_at: l.last_scraped_at,
            })
            .collect())
    }

    async fn listing_counts(&self) -> Result<ListingCounts, AppError> {
        let state = self.state.lock().unwrap();
        Ok(ListingCounts {
            total: state.listings.len() as u64,
            active: state.listings.iter().filter(|l| l.active).count() as u64,
        })
    }
}

impl ProxyStore for InMemoryGateway {
    async fn active_proxies(&self) -> Result<Vec<ProxyRecord>, AppError> {
        let state = self.state.lock().unwrap();
        let mut proxies: Vec<ProxyRecord> =
            state.proxies.iter().filter(|p| p.active).cloned().collect();
        proxies.sort_by_key(|p| p.last_used);
        Ok(proxies)
    }

    async fn proxies_due_for_test(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ProxyRecord>, AppError> {
        let state = self.state.lock().unwrap();
        let mut due: Vec<ProxyRecord> = state
            .proxies
            .iter()
            .filter(|p| p.last_tested.is_none_or(|t| t < cutoff))
            .cloned()
            .collect();
        due.sort_by_key(|p| p.last_tested);
        due.truncate(limit);
        Ok(due)
    }

    async fn add_proxy(&self, proxy: &NewProxy) -> Result<ProxyRecord, AppError> {
        let record = ProxyRecord {
            id: Uuid::new_v4(),
            address: proxy.address.clone(),
            port: proxy.port,
            protocol: proxy.protocol,
            credentials: proxy.credentials.clone(),
            country: proxy.country.clone(),
            active: true,
            success_rate: 100.0,
            last_used: None,
            last_tested: None,
            response_time_ms: None,
        };
        self.state.lock().unwrap().proxies.push(record.clone());
        Ok(record)
    }

    async fn mark_proxy_used(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), AppError> {
        let mut state = self.state.lock().unwrap();
        if let Some(proxy) = state.proxies.iter_mut().find(|p| p.id == id) {
            proxy.last_used = Some(at);
        }
        Ok(())
    }

    async fn update_proxy_stats(
        &self,
        id: Uuid,
        outcome: &ProxyOutcome,
        deactivation_threshold: f64,
    ) -> Result<ProxyScore, AppError> {
        let mut state = self.state.lock().unwrap();
        let proxy = state
            .proxies
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| AppError::DatabaseError(format!("proxy {id} not found")))?;

        let score = apply_outcome(proxy.success_rate, proxy.active, outcome, deactivation_threshold);
        proxy.success_rate = score.success_rate;
        proxy.active = score.active;
        if outcome.response_time_ms.is_some() {
            proxy.response_time_ms = outcome.response_time_ms;
        }
        if outcome.source == OutcomeSource::HealthCheck {
            proxy.last_tested = Some(outcome.at);
        }
        Ok(score)
    }

    async fn list_proxies(&self) -> Result<Vec<ProxyRecord>, AppError> {
        Ok(self.state.lock().unwrap().proxies.clone())
    }

    async fn proxy_stats(&self) -> Result<ProxyStats, AppError> {
        let state = self.state.lock().unwrap();
        let active: Vec<&ProxyRecord> = state.proxies.iter().filter(|p| p.active).collect();
        let times: Vec<u64> = active.iter().filter_map(|p| p.response_time_ms).collect();
        Ok(ProxyStats {
            total: state.proxies.len() as u64,
            active: active.len() as u64,
            avg_success_rate: (!active.is_empty()).then(|| {
                active.iter().map(|p| p.success_rate).sum::<f64>() / active.len() as f64
            }),
            avg_response_time_ms: (!times.is_empty())
                .then(|| times.iter().sum::<u64>() as f64 / times.len() as f64),
        })
    }
}

impl SessionStore for InMemoryGateway {
    async fn log_session_start(&self, kind: JobKind) -> Result<ScrapeSession, AppError> {
        let session = ScrapeSession {
            id: Uuid::new_v4(),
            kind,
            status: SessionStatus::Started,
            started_at: Utc::now(),
            completed_at: None,
            counts: SessionCounts::default(),
            error: None,
            execution_time_ms: None,
        };
        self.state.lock().unwrap().sessions.push(session.clone());
        Ok(session)
    }

    async fn log_session_end(&self, id: Uuid, outcome: &SessionOutcome) -> Result<(), AppError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_session_end {
            return Err(AppError::DatabaseError("session table unavailable".into()));
        }
        let session = state
            .sessions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| AppError::DatabaseError(format!("session {id} not found")))?;
        session.status = outcome.status;
        session.counts = outcome.counts;
        session.error = outcome.error.clone();
        session.execution_time_ms = Some(outcome.execution_time_ms);
        session.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn session_stats(&self, since: DateTime<Utc>) -> Result<SessionStats, AppError> {
        let state = self.state.lock().unwrap();
        let mut stats = SessionStats {
            since: Some(since),
            ..SessionStats::default()
        };
        let mut times = Vec::new();
        for session in state.sessions.iter().filter(|s| s.started_at >= since) {
            stats.total += 1;
            match session.status {
                SessionStatus::Started => stats.running += 1,
                SessionStatus::Completed => stats.completed += 1,
                SessionStatus::Failed => stats.failed += 1,
            }
            stats.counts.add(&session.counts);
            times.extend(session.execution_time_ms);
        }
        stats.avg_execution_ms =
            (!times.is_empty()).then(|| times.iter().sum::<u64>() as f64 / times.len() as f64);
        Ok(stats)
    }

    async fn recent_sessions(&self, limit: usize) -> Result<Vec<ScrapeSession>, AppError> {
        let state = self.state.lock().unwrap();
        Ok(state.sessions.iter().rev().take(limit).cloned().collect())
    }

    async fn prune_sessions(&self, keep: usize) -> Result<u64, AppError> {
        let mut state = self.state.lock().unwrap();
        let before = state.sessions.len();
        let cutoff = before.saturating_sub(keep);
        let mut position = 0;
        state.sessions.retain(|s| {
            let kept = position >= cutoff || s.status == SessionStatus::Started;
            position += 1;
            kept
        });
        Ok((before - state.sessions.len()) as u64)
    }
}

impl RequestLogStore for InMemoryGateway {
    async fn log_request(&self, entry: &RequestLogEntry) -> Result<(), AppError> {
        self.state.lock().unwrap().requests.push(entry.clone());
        Ok(())
    }

    async fn count_requests_since(&self, since: DateTime<Utc>) -> Result<u64, AppError> {
        let state = self.state.lock().unwrap();
        Ok(state.requests.iter().filter(|r| r.at >= since).count() as u64)
    }

    async fn prune_request_log(&self, cutoff: DateTime<Utc>) -> Result<u64, AppError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_prune_request_log {
            return Err(AppError::DatabaseError("request_log locked".into()));
        }
        let before = state.requests.len();
        state.requests.retain(|r| r.at >= cutoff);
        Ok((before - state.requests.len()) as u64)
    }

    async fn prune_view_log(&self, cutoff: DateTime<Utc>) -> Result<u64, AppError> {
        let mut state = self.state.lock().unwrap();
        let before = state.views.len();
        state.views.retain(|at| *at >= cutoff);
        Ok((before - state.views.len()) as u64)
    }
}
