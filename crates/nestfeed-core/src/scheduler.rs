//! Timer-driven orchestration of every job kind.
//!
//! The scheduler owns one [`Ticker`] per job kind plus a one-shot warm-up
//! incremental scrape. Gated kinds go through the [`JobRunner`] with
//! [`Trigger::Scheduled`], so a busy slot is skipped rather than reported.
//! Maintenance kinds call [`MaintenanceJobs`] directly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use crate::config::ScheduleConfig;
use crate::error::AppError;
use crate::fetcher::ProxiedFetcher;
use crate::job::{JobKind, JobReport, ScrapeSession, SessionStats, Trigger};
use crate::maintenance::{CleanupReport, HealthReport, MaintenanceJobs};
use crate::models::{ListingCounts, ProxyStats};
use crate::proxy_pool::PoolSnapshot;
use crate::rate_limiter::RateLimitSnapshot;
use crate::runner::JobRunner;
use crate::session_log::SessionLog;
use crate::ticker::{Cadence, Ticker, TickerHandle, lock};
use crate::traits::{
    Extractor, ListingSource, ListingStore, PersistenceGateway, ProxyStore, Transport,
};

/// Status of one schedule.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleStatus {
    pub kind: JobKind,
    pub cadence: String,
    pub active: bool,
    pub next_fire: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub schedules: Vec<ScheduleStatus>,
    /// Gated job currently holding the slot.
    pub current_job: Option<JobKind>,
    pub proxies: Option<ProxyStats>,
    pub sessions: Option<SessionStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub window_hours: i64,
    pub sessions: SessionStats,
    pub recent_sessions: Vec<ScrapeSession>,
    pub proxies: ProxyStats,
    pub pool: PoolSnapshot,
    pub listings: ListingCounts,
    pub rate_limit: RateLimitSnapshot,
}

impl PipelineStats {
    /// Gather statistics from the store and the fetcher's pool and limiter.
    pub async fn collect<T, G>(
        store: &G,
        fetcher: &ProxiedFetcher<T, G>,
        window: TimeDelta,
    ) -> Result<Self, AppError>
    where
        T: Transport,
        G: PersistenceGateway,
    {
        let sessions = SessionLog::new(store.clone());
        Ok(Self {
            window_hours: window.num_hours(),
            sessions: sessions.query_stats(window).await?,
            recent_sessions: sessions.recent(10).await?,
            proxies: store.proxy_stats().await?,
            pool: fetcher.pool().snapshot(),
            listings: store.listing_counts().await?,
            rate_limit: fetcher.limiter().snapshot().await,
        })
    }
}

pub struct Scheduler<T, G, E, L>
where
    T: Transport,
    G: PersistenceGateway,
    E: Extractor,
    L: ListingSource,
{
    runner: Arc<JobRunner<T, G, E, L>>,
    maintenance: Arc<MaintenanceJobs<T, G>>,
    store: G,
    config: ScheduleConfig,
    tickers: Mutex<Vec<(JobKind, TickerHandle)>>,
    warmup: Mutex<Option<TickerHandle>>,
    running: AtomicBool,
}

impl<T, G, E, L> Scheduler<T, G, E, L>
where
    T: Transport,
    G: PersistenceGateway,
    E: Extractor,
    L: ListingSource,
{
    pub fn new(
        runner: Arc<JobRunner<T, G, E, L>>,
        maintenance: Arc<MaintenanceJobs<T, G>>,
        store: G,
        config: ScheduleConfig,
    ) -> Self {
        Self {
            runner,
            maintenance,
            store,
            config,
            tickers: Mutex::new(Vec::new()),
            warmup: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    pub fn runner(&self) -> &Arc<JobRunner<T, G, E, L>> {
        &self.runner
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn cadence(&self, kind: JobKind) -> &Cadence {
        match kind {
            JobKind::Full => &self.config.full,
            JobKind::Incremental => &self.config.incremental,
            JobKind::PriceUpdate => &self.config.price_update,
            JobKind::Cleanup => &self.config.cleanup,
            JobKind::ProxyHealth => &self.config.proxy_health,
        }
    }

    /// Start every schedule and the warm-up scrape. A second call is a no-op.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            tracing::warn!("Scheduler already running; ignoring start");
            return;
        }

        let handles: Vec<(JobKind, TickerHandle)> = JobKind::ALL
            .into_iter()
            .map(|kind| (kind, self.spawn_ticker(kind)))
            .collect();
        for (kind, handle) in &handles {
            tracing::info!(
                job = %kind,
                cadence = %self.cadence(*kind).describe(),
                next_fire = ?handle.next_fire(),
                "Schedule started"
            );
        }
        *lock(&self.tickers) = handles;

        let runner = Arc::clone(&self.runner);
        let warmup = Ticker::once("warmup", self.config.warmup_delay, move || async move {
            tracing::info!("Running warm-up incremental scrape");
            log_scheduled(
                JobKind::Incremental,
                runner.run(JobKind::Incremental, Trigger::Scheduled).await,
            );
        });
        *lock(&self.warmup) = Some(warmup);

        tracing::info!(
            warmup_delay_secs = self.config.warmup_delay.as_secs(),
            "Scheduler started"
        );
    }

    fn spawn_ticker(&self, kind: JobKind) -> TickerHandle {
        let ticker = Ticker::new(kind.as_str(), self.cadence(kind).clone());
        match kind {
            JobKind::Cleanup => {
                let maintenance = Arc::clone(&self.maintenance);
                ticker.spawn(move || {
                    let maintenance = Arc::clone(&maintenance);
                    async move {
                        if let Err(e) = maintenance.run_cleanup().await {
                            tracing::error!(job = %JobKind::Cleanup, error = %e, "Scheduled cleanup failed");
                        }
                    }
                })
            }
            JobKind::ProxyHealth => {
                let maintenance = Arc::clone(&self.maintenance);
                ticker.spawn(move || {
                    let maintenance = Arc::clone(&maintenance);
                    async move {
                        if let Err(e) = maintenance.run_proxy_health().await {
                            tracing::error!(job = %JobKind::ProxyHealth, error = %e, "Scheduled proxy health check failed");
                        }
                    }
                })
            }
            JobKind::Full | JobKind::Incremental | JobKind::PriceUpdate => {
                let runner = Arc::clone(&self.runner);
                ticker.spawn(move || {
                    let runner = Arc::clone(&runner);
                    async move {
                        log_scheduled(kind, runner.run(kind, Trigger::Scheduled).await);
                    }
                })
            }
        }
    }

    /// Stop all timers. Jobs already in flight run to completion.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            tracing::debug!("Scheduler not running; ignoring stop");
            return;
        }
        for (_, handle) in lock(&self.tickers).iter() {
            handle.cancel();
        }
        if let Some(warmup) = lock(&self.warmup).as_ref() {
            warmup.cancel();
        }
        tracing::info!("Scheduler stopped");
    }

    /// Stop all timers and cancel in-flight fetches at their next wait.
    pub fn shutdown(&self) {
        self.stop();
        self.runner.fetcher().cancellation_token().cancel();
        tracing::info!("Cancellation requested for in-flight jobs");
    }

    pub async fn status(&self) -> SchedulerStatus {
        let schedules = {
            let tickers = lock(&self.tickers);
            JobKind::ALL
                .into_iter()
                .map(|kind| {
                    let handle = tickers.iter().find(|(k, _)| *k == kind).map(|(_, h)| h);
                    ScheduleStatus {
                        kind,
                        cadence: self.cadence(kind).describe(),
                        active: handle.is_some_and(TickerHandle::is_active),
                        next_fire: handle.and_then(TickerHandle::next_fire),
                    }
                })
                .collect()
        };

        let proxies = match self.store.proxy_stats().await {
            Ok(stats) => Some(stats),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load proxy stats for status");
                None
            }
        };
        let sessions = match self.runner.sessions().query_stats(TimeDelta::hours(24)).await {
            Ok(stats) => Some(stats),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load session stats for status");
                None
            }
        };

        SchedulerStatus {
            running: self.is_running(),
            schedules,
            current_job: self.runner.slot().current(),
            proxies,
            sessions,
        }
    }

    pub async fn trigger_full(&self) -> Result<JobReport, AppError> {
        self.trigger(JobKind::Full).await
    }

    pub async fn trigger_incremental(&self) -> Result<JobReport, AppError> {
        self.trigger(JobKind::Incremental).await
    }

    pub async fn trigger_price_update(&self) -> Result<JobReport, AppError> {
        self.trigger(JobKind::PriceUpdate).await
    }

    pub async fn trigger_cleanup(&self) -> Result<CleanupReport, AppError> {
        self.maintenance.run_cleanup().await
    }

    pub async fn trigger_proxy_health(&self) -> Result<HealthReport, AppError> {
        self.maintenance.run_proxy_health().await
    }

    async fn trigger(&self, kind: JobKind) -> Result<JobReport, AppError> {
        tracing::info!(job = %kind, "Manual trigger");
        self.runner
            .run(kind, Trigger::Manual)
            .await?
            .ok_or_else(|| AppError::Generic(format!("{kind} run was skipped")))
    }

    /// Session, proxy, listing and quota statistics over a trailing window.
    pub async fn stats(&self, window: TimeDelta) -> Result<PipelineStats, AppError> {
        PipelineStats::collect(&self.store, self.runner.fetcher(), window).await
    }
}

fn log_scheduled(kind: JobKind, result: Result<Option<JobReport>, AppError>) {
    match result {
        Ok(Some(report)) => tracing::info!(
            job = %kind,
            session_id = %report.session_id,
            status = %report.status,
            found = report.counts.found,
            "Scheduled job finished"
        ),
        Ok(None) => {}
        Err(e) => tracing::error!(job = %kind, error = %e, "Scheduled job crashed"),
    }
}
