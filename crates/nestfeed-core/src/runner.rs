//! Single-flight execution of the gated job kinds.
//!
//! At most one of full scrape, incremental scrape and price update runs at a
//! time. The slot is held through a [`SlotGuard`](crate::slot::SlotGuard)
//! for the whole run and released on every exit path.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;

use crate::config::{JobConfig, window_start};
use crate::error::AppError;
use crate::fetcher::ProxiedFetcher;
use crate::job::{JobKind, JobReport, SessionCounts, SessionOutcome, Trigger};
use crate::models::{RawDocument, ScrapeScope, StaleListing, TransactionType};
use crate::session_log::SessionLog;
use crate::slot::ConcurrencySlot;
use crate::traits::{Extractor, ListingSource, PersistenceGateway, Transport};

pub struct JobRunner<T, G, E, L>
where
    T: Transport,
    G: PersistenceGateway,
    E: Extractor,
    L: ListingSource,
{
    fetcher: Arc<ProxiedFetcher<T, G>>,
    extractor: E,
    source: L,
    store: G,
    sessions: SessionLog<G>,
    slot: ConcurrencySlot,
    config: JobConfig,
}

impl<T, G, E, L> JobRunner<T, G, E, L>
where
    T: Transport,
    G: PersistenceGateway,
    E: Extractor,
    L: ListingSource,
{
    pub fn new(
        fetcher: Arc<ProxiedFetcher<T, G>>,
        extractor: E,
        source: L,
        store: G,
        config: JobConfig,
    ) -> Self {
        Self {
            fetcher,
            extractor,
            source,
            sessions: SessionLog::new(store.clone()),
            store,
            slot: ConcurrencySlot::new(),
            config,
        }
    }

    pub fn slot(&self) -> &ConcurrencySlot {
        &self.slot
    }

    pub fn fetcher(&self) -> &Arc<ProxiedFetcher<T, G>> {
        &self.fetcher
    }

    pub fn sessions(&self) -> &SessionLog<G> {
        &self.sessions
    }

    /// Run a gated job if the slot is free.
    ///
    /// A busy slot is an [`AppError::ConcurrentJob`] for manual triggers and
    /// `Ok(None)` for scheduled ones. Job failures are reported through the
    /// returned session status; only a failure to record the session's end
    /// is returned as an error.
    pub async fn run(&self, kind: JobKind, trigger: Trigger) -> Result<Option<JobReport>, AppError> {
        if !kind.is_gated() {
            return Err(AppError::Generic(format!(
                "{kind} is not a single-flight job"
            )));
        }

        let _guard = match self.slot.try_acquire(kind) {
            Ok(guard) => guard,
            Err(running) => match trigger {
                Trigger::Manual => {
                    tracing::warn!(job = %kind, running = %running, "Rejected manual trigger; job slot occupied");
                    return Err(AppError::ConcurrentJob {
                        requested: kind,
                        running,
                    });
                }
                Trigger::Scheduled => {
                    tracing::info!(job = %kind, running = %running, "Skipping scheduled run; job slot occupied");
                    return Ok(None);
                }
            },
        };

        self.execute(kind).await.map(Some)
    }

    async fn execute(&self, kind: JobKind) -> Result<JobReport, AppError> {
        let session_id = self.sessions.log_start(kind).await?;
        let started = Instant::now();
        let mut counts = SessionCounts::default();

        let result = AssertUnwindSafe(self.run_body(kind, &mut counts))
            .catch_unwind()
            .await;
        let execution_time_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let outcome = match result {
            Ok(Ok(())) => SessionOutcome::completed(counts, execution_time_ms),
            Ok(Err(e)) => {
                tracing::error!(job = %kind, session_id = %session_id, error = %e, "Job failed");
                SessionOutcome::failed(counts, e.to_string(), execution_time_ms)
            }
            Err(payload) => {
                let message = format!("job panicked: {}", panic_message(payload.as_ref()));
                tracing::error!(job = %kind, session_id = %session_id, "{message}");
                SessionOutcome::failed(counts, message, execution_time_ms)
            }
        };

        self.sessions.log_end(session_id, &outcome).await?;

        Ok(JobReport {
            session_id,
            kind,
            status: outcome.status,
            counts: outcome.counts,
            error: outcome.error,
            execution_time_ms,
        })
    }

    async fn run_body(&self, kind: JobKind, counts: &mut SessionCounts) -> Result<(), AppError> {
        match kind {
            JobKind::Full => self.full_scrape(counts).await,
            JobKind::Incremental => self.incremental_scrape(counts).await,
            JobKind::PriceUpdate => self.price_update(counts).await,
            JobKind::Cleanup | JobKind::ProxyHealth => Err(AppError::Generic(format!(
                "{kind} is not a single-flight job"
            ))),
        }
    }

    async fn full_scrape(&self, counts: &mut SessionCounts) -> Result<(), AppError> {
        for transaction in [TransactionType::Rent, TransactionType::Sale] {
            self.scrape_pages(transaction, ScrapeScope::All, self.config.full_pages, counts)
                .await?;
        }

        let cutoff = window_start(Utc::now(), self.config.stale_sweep_window)?;
        counts.removed = self.store.mark_stale(cutoff).await?;
        tracing::info!(
            found = counts.found,
            new = counts.new,
            updated = counts.updated,
            removed = counts.removed,
            "Full scrape finished"
        );
        Ok(())
    }

    async fn incremental_scrape(&self, counts: &mut SessionCounts) -> Result<(), AppError> {
        self.scrape_pages(
            TransactionType::Rent,
            ScrapeScope::Recent,
            self.config.incremental_pages,
            counts,
        )
        .await?;
        tracing::info!(
            found = counts.found,
            new = counts.new,
            updated = counts.updated,
            "Incremental scrape finished"
        );
        Ok(())
    }

    /// Fetch search pages until `pages` is reached or a page comes back empty.
    async fn scrape_pages(
        &self,
        transaction: TransactionType,
        scope: ScrapeScope,
        pages: u32,
        counts: &mut SessionCounts,
    ) -> Result<(), AppError> {
        for page in 1..=pages {
            let url = self.source.search_url(transaction, scope, page);
            let body = self.fetcher.fetch(&url).await?;

            let documents = match self.extractor.split_search_page(&body) {
                Ok(documents) => documents,
                Err(e) => {
                    tracing::warn!(url = %url, error = %e, "Could not split search page; skipping");
                    continue;
                }
            };
            if documents.is_empty() {
                tracing::debug!(transaction = %transaction, page, "Empty search page; stopping");
                break;
            }

            for document in documents {
                let document = match document.source_url {
                    Some(_) => document,
                    None => document.with_source_url(url.clone()),
                };
                counts.found += 1;
                match self.persist(&document, transaction).await {
                    Ok(true) => counts.new += 1,
                    Ok(false) => counts.updated += 1,
                    Err(e) => {
                        tracing::warn!(url = %url, error = %e, "Skipping listing");
                    }
                }
            }
        }
        Ok(())
    }

    /// Extract and upsert one listing. Returns whether it was new.
    async fn persist(
        &self,
        document: &RawDocument,
        transaction: TransactionType,
    ) -> Result<bool, AppError> {
        let listing = self.extractor.extract(document, transaction)?;
        let outcome = self.store.upsert_listing(&listing).await?;
        if !listing.images.is_empty() {
            self.store.upsert_images(outcome.id, &listing.images).await?;
        }
        Ok(outcome.was_new)
    }

    async fn price_update(&self, counts: &mut SessionCounts) -> Result<(), AppError> {
        let cutoff = window_start(Utc::now(), self.config.price_update_age)?;
        let due = self
            .store
            .listings_due_for_refresh(cutoff, self.config.price_update_batch)
            .await?;
        counts.found = due.len() as u64;
        tracing::info!(count = due.len(), "Refreshing listings");

        for (i, listing) in due.iter().enumerate() {
            if i > 0 {
                self.pause(self.config.price_update_delay).await?;
            }
            match self.refresh(listing).await {
                Ok(()) => counts.updated += 1,
                Err(e) if e.aborts_batch() => return Err(e),
                Err(e) => {
                    tracing::warn!(external_id = %listing.external_id, error = %e, "Price update failed for listing");
                }
            }
        }
        Ok(())
    }

    async fn refresh(&self, listing: &StaleListing) -> Result<(), AppError> {
        let url = listing
            .url
            .clone()
            .unwrap_or_else(|| self.source.listing_url(&listing.external_id));
        let body = self.fetcher.fetch(&url).await?;

        let document = RawDocument::new(body).with_source_url(url);
        let mut record = self.extractor.extract(&document, listing.transaction)?;
        if record.external_id != listing.external_id {
            tracing::debug!(
                expected = %listing.external_id,
                extracted = %record.external_id,
                "Detail page reported a different id; keeping the stored one"
            );
            record.external_id = listing.external_id.clone();
        }

        let outcome = self.store.upsert_listing(&record).await?;
        if !record.images.is_empty() {
            self.store.upsert_images(outcome.id, &record.images).await?;
        }
        Ok(())
    }

    async fn pause(&self, delay: Duration) -> Result<(), AppError> {
        if delay.is_zero() {
            return Ok(());
        }
        let cancel = self.fetcher.cancellation_token();
        tokio::select! {
            () = tokio::time::sleep(delay) => Ok(()),
            () = cancel.cancelled() => Err(AppError::Cancelled),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
