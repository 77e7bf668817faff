use chrono::{TimeDelta, Utc};
use uuid::Uuid;

use crate::config::window_start;
use crate::error::AppError;
use crate::job::{JobKind, ScrapeSession, SessionOutcome, SessionStats};
use crate::traits::SessionStore;

/// Records job executions as scrape sessions.
///
/// A session is written once at start and once at end; nothing in between.
#[derive(Clone)]
pub struct SessionLog<S: SessionStore> {
    store: S,
}

impl<S: SessionStore> SessionLog<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub async fn log_start(&self, kind: JobKind) -> Result<Uuid, AppError> {
        let session = self.store.log_session_start(kind).await?;
        tracing::info!(session_id = %session.id, job = %kind, "Session started");
        Ok(session.id)
    }

    pub async fn log_end(&self, id: Uuid, outcome: &SessionOutcome) -> Result<(), AppError> {
        self.store.log_session_end(id, outcome).await?;
        match &outcome.error {
            Some(error) => tracing::info!(
                session_id = %id,
                status = %outcome.status,
                found = outcome.counts.found,
                new = outcome.counts.new,
                updated = outcome.counts.updated,
                removed = outcome.counts.removed,
                execution_time_ms = outcome.execution_time_ms,
                error = %error,
                "Session ended"
            ),
            None => tracing::info!(
                session_id = %id,
                status = %outcome.status,
                found = outcome.counts.found,
                new = outcome.counts.new,
                updated = outcome.counts.updated,
                removed = outcome.counts.removed,
                execution_time_ms = outcome.execution_time_ms,
                "Session ended"
            ),
        }
        Ok(())
    }

    /// Aggregates over sessions started within the trailing `window`.
    pub async fn query_stats(&self, window: TimeDelta) -> Result<SessionStats, AppError> {
        self.store
            .session_stats(window_start(Utc::now(), window)?)
            .await
    }

    pub async fn recent(&self, limit: usize) -> Result<Vec<ScrapeSession>, AppError> {
        self.store.recent_sessions(limit).await
    }

    /// Delete finished sessions outside the `keep` most recent.
    pub async fn prune(&self, keep: usize) -> Result<u64, AppError> {
        let removed = self.store.prune_sessions(keep).await?;
        if removed > 0 {
            tracing::info!(removed, keep, "Pruned old sessions");
        }
        Ok(removed)
    }
}
