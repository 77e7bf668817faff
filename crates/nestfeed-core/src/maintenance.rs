//! Cleanup and proxy health checks.
//!
//! Neither job takes the single-flight slot; both may run while a scrape is
//! in flight. Each run is recorded as its own session.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::config::{MaintenanceConfig, window_start};
use crate::error::AppError;
use crate::job::{JobKind, SessionCounts, SessionOutcome};
use crate::proxy_pool::ProxyPool;
use crate::session_log::SessionLog;
use crate::traits::{PersistenceGateway, Transport};

/// What a cleanup run removed. Sub-step failures are collected in `errors`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub session_id: Option<Uuid>,
    pub listings_deactivated: u64,
    pub sessions_pruned: u64,
    pub request_log_pruned: u64,
    pub view_log_pruned: u64,
    pub errors: Vec<String>,
}

impl CleanupReport {
    fn record(&mut self, step: &str, error: AppError) {
        tracing::error!(step, error = %error, "Cleanup step failed");
        self.errors.push(format!("{step}: {error}"));
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthReport {
    pub session_id: Option<Uuid>,
    pub tested: u64,
    pub healthy: u64,
    pub deactivated: u64,
    pub reactivated: u64,
}

pub struct MaintenanceJobs<T, G>
where
    T: Transport,
    G: PersistenceGateway,
{
    transport: T,
    store: G,
    sessions: SessionLog<G>,
    pool: Arc<ProxyPool<G>>,
    config: MaintenanceConfig,
}

impl<T, G> MaintenanceJobs<T, G>
where
    T: Transport,
    G: PersistenceGateway,
{
    pub fn new(transport: T, store: G, pool: Arc<ProxyPool<G>>, config: MaintenanceConfig) -> Self {
        Self {
            transport,
            sessions: SessionLog::new(store.clone()),
            store,
            pool,
            config,
        }
    }

    /// Deactivate long-unseen listings and prune the logs.
    ///
    /// Every step runs even if an earlier one failed. The session is
    /// `completed` with the failures joined into its error text.
    pub async fn run_cleanup(&self) -> Result<CleanupReport, AppError> {
        let session_id = self.sessions.log_start(JobKind::Cleanup).await?;
        let started = Instant::now();
        let now = Utc::now();
        let mut report = CleanupReport {
            session_id: Some(session_id),
            ..CleanupReport::default()
        };

        let stale = match window_start(now, self.config.listing_retention) {
            Ok(cutoff) => self.store.mark_stale(cutoff).await,
            Err(e) => Err(e),
        };
        match stale {
            Ok(n) => report.listings_deactivated = n,
            Err(e) => report.record("deactivate stale listings", e),
        }
        match self.sessions.prune(self.config.session_keep).await {
            Ok(n) => report.sessions_pruned = n,
            Err(e) => report.record("prune sessions", e),
        }
        let requests = match window_start(now, self.config.request_log_retention) {
            Ok(cutoff) => self.store.prune_request_log(cutoff).await,
            Err(e) => Err(e),
        };
        match requests {
            Ok(n) => report.request_log_pruned = n,
            Err(e) => report.record("prune request log", e),
        }
        let views = match window_start(now, self.config.view_log_retention) {
            Ok(cutoff) => self.store.prune_view_log(cutoff).await,
            Err(e) => Err(e),
        };
        match views {
            Ok(n) => report.view_log_pruned = n,
            Err(e) => report.record("prune view log", e),
        }

        let counts = SessionCounts {
            removed: report.listings_deactivated,
            ..SessionCounts::default()
        };
        let mut outcome = SessionOutcome::completed(counts, elapsed_ms(started));
        if !report.errors.is_empty() {
            outcome.error = Some(report.errors.join("; "));
        }
        self.sessions.log_end(session_id, &outcome).await?;

        tracing::info!(
            listings_deactivated = report.listings_deactivated,
            sessions_pruned = report.sessions_pruned,
            request_log_pruned = report.request_log_pruned,
            view_log_pruned = report.view_log_pruned,
            errors = report.errors.len(),
            "Cleanup finished"
        );
        Ok(report)
    }

    /// Test proxies not tested within the health-check interval, then reload the pool.
    pub async fn run_proxy_health(&self) -> Result<HealthReport, AppError> {
        let session_id = self.sessions.log_start(JobKind::ProxyHealth).await?;
        let started = Instant::now();
        let mut report = HealthReport {
            session_id: Some(session_id),
            ..HealthReport::default()
        };

        let due = match window_start(Utc::now(), self.config.health_check_interval) {
            Ok(cutoff) => {
                self.store
                    .proxies_due_for_test(cutoff, self.config.health_check_batch)
                    .await
            }
            Err(e) => Err(e),
        };
        let due = match due {
            Ok(due) => due,
            Err(e) => {
                let outcome = SessionOutcome::failed(
                    SessionCounts::default(),
                    e.to_string(),
                    elapsed_ms(started),
                );
                self.sessions.log_end(session_id, &outcome).await?;
                return Err(e);
            }
        };

        let outcomes = futures::future::join_all(
            due.iter()
                .map(|proxy| self.pool.test_health(&self.transport, proxy)),
        )
        .await;

        for (proxy, outcome) in due.iter().zip(outcomes) {
            report.tested += 1;
            if outcome.success {
                report.healthy += 1;
            }
            match self.pool.record_outcome(proxy.id, outcome).await {
                Some(score) if proxy.active && !score.active => report.deactivated += 1,
                Some(score) if !proxy.active && score.active => {
                    tracing::info!(proxy = %proxy.label(), "Proxy re-activated");
                    report.reactivated += 1;
                }
                _ => {}
            }
        }

        if let Err(e) = self.pool.reload().await {
            tracing::warn!(error = %e, "Failed to reload proxy pool after health check");
        }

        let counts = SessionCounts {
            found: report.tested,
            new: 0,
            updated: report.healthy,
            removed: report.deactivated,
        };
        self.sessions
            .log_end(session_id, &SessionOutcome::completed(counts, elapsed_ms(started)))
            .await?;

        tracing::info!(
            tested = report.tested,
            healthy = report.healthy,
            deactivated = report.deactivated,
            reactivated = report.reactivated,
            "Proxy health check finished"
        );
        Ok(report)
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
