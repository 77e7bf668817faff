//! Rotating, health-scored proxy pool.
//!
//! The pool keeps the active proxies in memory and hands them out
//! round-robin. Scores are exponentially weighted:
//!
//! ```text
//! live outcome:          score' = score * 0.9 + (success ? 100 : 0) * 0.1
//! health-check failure:  score' = score * 0.8
//! health-check success:  score' = score * 0.9 + 100 * 0.1   (re-activates)
//! ```
//!
//! A failure that leaves the score below the deactivation threshold marks
//! the proxy inactive. Each entry keeps score and activation in one atomic
//! word updated by compare-and-swap, so concurrent outcomes for one proxy
//! never lose updates and never split the flag from the score. After the
//! store applies an outcome, its result replaces the entry's state.

use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::config::ProxyPoolConfig;
use crate::error::AppError;
use crate::models::{OutcomeSource, ProxyOutcome, ProxyRecord, ProxyScore};
use crate::traits::{ProxyStore, RequestOptions, Transport};

const NONE_MS: i64 = i64::MIN;
const NONE_RT: u64 = u64::MAX;
/// Sign bit of the packed score; scores are never negative.
const INACTIVE: u64 = 1 << 63;

/// Apply one outcome to a score, returning the new score and activation state.
pub fn apply_outcome(
    success_rate: f64,
    active: bool,
    outcome: &ProxyOutcome,
    deactivation_threshold: f64,
) -> ProxyScore {
    let next = next_score(success_rate, outcome);
    let active = match (outcome.source, outcome.success) {
        (OutcomeSource::HealthCheck, true) => true,
        (_, false) if next < deactivation_threshold => false,
        _ => active,
    };
    ProxyScore {
        success_rate: next,
        active,
    }
}

fn next_score(score: f64, outcome: &ProxyOutcome) -> f64 {
    let next = match (outcome.source, outcome.success) {
        (_, true) => score * 0.9 + 100.0 * 0.1,
        (OutcomeSource::Live, false) => score * 0.9,
        (OutcomeSource::HealthCheck, false) => score * 0.8,
    };
    next.clamp(0.0, 100.0)
}

/// Pack a score and its activation flag into one word.
fn pack(score: ProxyScore) -> u64 {
    let bits = score.success_rate.abs().to_bits();
    if score.active { bits } else { bits | INACTIVE }
}

fn unpack(word: u64) -> ProxyScore {
    ProxyScore {
        success_rate: f64::from_bits(word & !INACTIVE),
        active: word & INACTIVE == 0,
    }
}

/// In-memory state of one proxy.
#[derive(Debug)]
struct PoolEntry {
    record: ProxyRecord,
    state: AtomicU64,
    last_used_ms: AtomicI64,
    last_tested_ms: AtomicI64,
    response_time_ms: AtomicU64,
}

/// Result of applying an outcome to a [`PoolEntry`].
struct Applied {
    before: ProxyScore,
    after: ProxyScore,
    /// Word installed by the update, used to detect later writers.
    word: u64,
}

impl PoolEntry {
    fn new(record: ProxyRecord) -> Self {
        Self {
            state: AtomicU64::new(pack(ProxyScore {
                success_rate: record.success_rate,
                active: record.active,
            })),
            last_used_ms: AtomicI64::new(to_ms(record.last_used)),
            last_tested_ms: AtomicI64::new(to_ms(record.last_tested)),
            response_time_ms: AtomicU64::new(record.response_time_ms.unwrap_or(NONE_RT)),
            record,
        }
    }

    fn score(&self) -> ProxyScore {
        unpack(self.state.load(Ordering::Acquire))
    }

    fn snapshot(&self) -> ProxyRecord {
        let rt = self.response_time_ms.load(Ordering::Acquire);
        let score = self.score();
        ProxyRecord {
            active: score.active,
            success_rate: score.success_rate,
            last_used: from_ms(self.last_used_ms.load(Ordering::Acquire)),
            last_tested: from_ms(self.last_tested_ms.load(Ordering::Acquire)),
            response_time_ms: (rt != NONE_RT).then_some(rt),
            ..self.record.clone()
        }
    }

    fn apply(&self, outcome: &ProxyOutcome, threshold: f64) -> Applied {
        let step = |word: u64| {
            let current = unpack(word);
            pack(apply_outcome(current.success_rate, current.active, outcome, threshold))
        };
        let previous = match self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| Some(step(word)))
        {
            Ok(word) | Err(word) => word,
        };
        let word = step(previous);

        if let Some(rt) = outcome.response_time_ms {
            self.response_time_ms.store(rt, Ordering::Release);
        }
        if outcome.source == OutcomeSource::HealthCheck {
            self.last_tested_ms
                .store(outcome.at.timestamp_millis(), Ordering::Release);
        }
        Applied {
            before: unpack(previous),
            after: unpack(word),
            word,
        }
    }

    /// Adopt the store's score unless another outcome has landed since `installed`.
    fn sync(&self, installed: u64, stored: ProxyScore) -> ProxyScore {
        match self.state.compare_exchange(
            installed,
            pack(stored),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => stored,
            Err(current) => unpack(current),
        }
    }
}

fn to_ms(t: Option<DateTime<Utc>>) -> i64 {
    t.map_or(NONE_MS, |t| t.timestamp_millis())
}

fn from_ms(ms: i64) -> Option<DateTime<Utc>> {
    if ms == NONE_MS {
        return None;
    }
    Utc.timestamp_millis_opt(ms).single()
}

/// Pool summary for status output.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolSnapshot {
    pub loaded: usize,
    pub active: usize,
    pub avg_success_rate: Option<f64>,
}

/// Round-robin proxy pool backed by a [`ProxyStore`].
pub struct ProxyPool<S: ProxyStore> {
    store: S,
    config: ProxyPoolConfig,
    entries: RwLock<Arc<Vec<Arc<PoolEntry>>>>,
    cursor: AtomicUsize,
    /// Highest `last_used` stamp handed out, keeps stamps non-decreasing.
    clock_ms: AtomicI64,
}

impl<S: ProxyStore> ProxyPool<S> {
    pub fn new(store: S, config: ProxyPoolConfig) -> Self {
        Self {
            store,
            config,
            entries: RwLock::new(Arc::new(Vec::new())),
            cursor: AtomicUsize::new(0),
            clock_ms: AtomicI64::new(NONE_MS),
        }
    }

    pub fn config(&self) -> &ProxyPoolConfig {
        &self.config
    }

    /// Load active proxies, seeding the configured defaults when there are none.
    pub async fn bootstrap(&self) -> Result<usize, AppError> {
        let mut proxies = self.store.active_proxies().await?;

        if proxies.is_empty() && !self.config.default_proxies.is_empty() {
            tracing::info!(
                count = self.config.default_proxies.len(),
                "No active proxies found; seeding defaults"
            );
            for proxy in &self.config.default_proxies {
                match self.store.add_proxy(proxy).await {
                    Ok(record) => proxies.push(record),
                    Err(e) => {
                        tracing::warn!(address = %proxy.address, error = %e, "Failed to seed proxy")
                    }
                }
            }
        }

        let count = proxies.len();
        self.install(proxies);
        tracing::info!(count, "Proxy pool loaded");
        Ok(count)
    }

    /// Replace the in-memory set with the store's current active proxies.
    pub async fn reload(&self) -> Result<usize, AppError> {
        let proxies = self.store.active_proxies().await?;
        let count = proxies.len();
        self.install(proxies);
        tracing::debug!(count, "Proxy pool reloaded");
        Ok(count)
    }

    fn install(&self, proxies: Vec<ProxyRecord>) {
        let entries: Vec<Arc<PoolEntry>> = proxies
            .into_iter()
            .map(|p| Arc::new(PoolEntry::new(p)))
            .collect();
        let mut slot = self.entries.write().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned proxy pool lock");
            poisoned.into_inner()
        });
        *slot = Arc::new(entries);
        self.cursor.store(0, Ordering::Release);
    }

    fn entries(&self) -> Arc<Vec<Arc<PoolEntry>>> {
        let guard = self.entries.read().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned proxy pool lock");
            poisoned.into_inner()
        });
        Arc::clone(&guard)
    }

    fn find(&self, id: Uuid) -> Option<Arc<PoolEntry>> {
        self.entries().iter().find(|e| e.record.id == id).cloned()
    }

    /// Next stamp for `last_used`, never earlier than a previous one.
    fn stamp(&self) -> DateTime<Utc> {
        let now = Utc::now().timestamp_millis();
        let previous = self.clock_ms.fetch_max(now, Ordering::AcqRel);
        from_ms(previous.max(now)).unwrap_or_else(Utc::now)
    }

    /// Hand out the next active proxy, or `None` when none is available.
    pub async fn get_next(&self) -> Option<ProxyRecord> {
        let entries = self.entries();
        if entries.is_empty() {
            return None;
        }

        for _ in 0..entries.len() {
            let idx = self.cursor.fetch_add(1, Ordering::AcqRel) % entries.len();
            let entry = &entries[idx];
            if !entry.score().active {
                continue;
            }

            let at = self.stamp();
            entry
                .last_used_ms
                .fetch_max(at.timestamp_millis(), Ordering::AcqRel);
            let record = entry.snapshot();

            if let Err(e) = self.store.mark_proxy_used(record.id, at).await {
                tracing::warn!(proxy_id = %record.id, error = %e, "Failed to persist proxy last_used");
            }
            return Some(record);
        }

        None
    }

    /// Apply an outcome to the in-memory entry and the store.
    ///
    /// The store's result is adopted by the loaded entry, so changes made
    /// through the store by other pools are picked up here. Returns the
    /// store's score when available, else the in-memory one; `None` when the
    /// proxy is neither loaded nor persisted.
    pub async fn record_outcome(&self, id: Uuid, outcome: ProxyOutcome) -> Option<ProxyScore> {
        let threshold = self.config.deactivation_threshold;
        let entry = self.find(id);
        let local = entry.as_ref().map(|e| e.apply(&outcome, threshold));

        let stored = match self
            .store
            .update_proxy_stats(id, &outcome, threshold)
            .await
        {
            Ok(score) => Some(score),
            Err(e) => {
                tracing::warn!(proxy_id = %id, error = %e, "Failed to persist proxy outcome");
                None
            }
        };

        if let (Some(entry), Some(applied)) = (&entry, &local) {
            let after = match stored {
                Some(score) => entry.sync(applied.word, score),
                None => applied.after,
            };
            if applied.before.active && !after.active {
                tracing::warn!(
                    proxy_id = %id,
                    proxy = %entry.record.label(),
                    score = after.success_rate,
                    "Proxy deactivated"
                );
            }
        }

        stored.or(local.map(|applied| applied.after))
    }

    /// Test a proxy once. The outcome is returned, not applied.
    pub async fn test_health<T: Transport>(&self, transport: &T, proxy: &ProxyRecord) -> ProxyOutcome {
        let options = RequestOptions::with_timeout(self.config.health_check_timeout);
        let started = Instant::now();
        let result = tokio::time::timeout(
            self.config.health_check_timeout + Duration::from_millis(100),
            transport.request(&self.config.health_check_url, &options, Some(proxy)),
        )
        .await;
        let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match result {
            Ok(Ok(_)) => {
                tracing::debug!(proxy = %proxy.label(), elapsed_ms = elapsed, "Proxy healthy");
                ProxyOutcome::health_check(true, Some(elapsed))
            }
            Ok(Err(e)) => {
                tracing::debug!(proxy = %proxy.label(), error = %e, "Proxy health check failed");
                ProxyOutcome::health_check(false, None)
            }
            Err(_) => {
                tracing::debug!(proxy = %proxy.label(), "Proxy health check timed out");
                ProxyOutcome::health_check(false, None)
            }
        }
    }

    /// Current in-memory view of every loaded proxy.
    pub fn proxies(&self) -> Vec<ProxyRecord> {
        self.entries().iter().map(|e| e.snapshot()).collect()
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let entries = self.entries();
        let active: Vec<f64> = entries
            .iter()
            .map(|e| e.score())
            .filter(|score| score.active)
            .map(|score| score.success_rate)
            .collect();
        PoolSnapshot {
            loaded: entries.len(),
            active: active.len(),
            avg_success_rate: (!active.is_empty())
                .then(|| active.iter().sum::<f64>() / active.len() as f64),
        }
    }
}
