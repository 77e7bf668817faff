//! Global request pacing and daily quota.
//!
//! Every outbound request attempt, retries included, passes through
//! [`RateLimiter::acquire`]. The limiter paces the origin rather than the
//! proxy: two requests through different proxies are still spaced by the
//! configured interval.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::RateLimitConfig;
use crate::error::AppError;

/// Mutable limiter state.
#[derive(Debug)]
struct RateLimitState {
    request_count_today: u32,
    /// UTC day the counter belongs to.
    window_start: NaiveDate,
    /// Time the most recently admitted request was (or will be) sent.
    last_request: Option<Instant>,
}

impl RateLimitState {
    fn new(today: NaiveDate) -> Self {
        Self {
            request_count_today: 0,
            window_start: today,
            last_request: None,
        }
    }

    /// Reset the counter when the UTC day has changed.
    fn roll_window(&mut self, today: NaiveDate) {
        if self.window_start != today {
            tracing::info!(
                previous_day = %self.window_start,
                requests = self.request_count_today,
                "Daily request window rolled over"
            );
            self.window_start = today;
            self.request_count_today = 0;
        }
    }
}

/// Point-in-time view of the limiter for status output.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitSnapshot {
    pub request_count_today: u32,
    pub daily_limit: u32,
    pub remaining_today: u32,
    pub window_start: NaiveDate,
    pub request_interval_ms: u64,
}

/// Shared pacing + quota gate. Clones share state.
#[derive(Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    state: Arc<Mutex<RateLimitState>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(RateLimitState::new(Utc::now().date_naive()))),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Seed today's counter, e.g. from the persisted request log after a restart.
    pub async fn restore(&self, request_count_today: u32) {
        let mut state = self.state.lock().await;
        state.roll_window(Utc::now().date_naive());
        state.request_count_today = request_count_today;
        tracing::info!(
            requests = request_count_today,
            limit = self.config.daily_limit,
            "Restored daily request count"
        );
    }

    /// Admit one request, waiting out the pacing interval if needed.
    ///
    /// Fails immediately with [`AppError::QuotaExceeded`] once the daily
    /// limit is reached, without waiting.
    pub async fn acquire(&self, cancel: Option<&CancellationToken>) -> Result<(), AppError> {
        let send_at = {
            let mut state = self.state.lock().await;
            state.roll_window(Utc::now().date_naive());

            if state.request_count_today >= self.config.daily_limit {
                tracing::warn!(
                    limit = self.config.daily_limit,
                    "Daily request quota exhausted"
                );
                return Err(AppError::QuotaExceeded {
                    limit: self.config.daily_limit,
                });
            }

            // Reserve the next send time so concurrent callers queue up
            // behind each other instead of all sleeping the same interval.
            let now = Instant::now();
            let send_at = match state.last_request {
                Some(last) => now.max(last + self.config.request_interval),
                None => now,
            };
            state.last_request = Some(send_at);
            state.request_count_today += 1;
            send_at
        };

        let wait = send_at.saturating_duration_since(Instant::now());
        if wait.is_zero() {
            return Ok(());
        }

        tracing::debug!(sleep_ms = %wait.as_millis(), "Pacing request");
        match cancel {
            Some(token) => {
                tokio::select! {
                    () = tokio::time::sleep(wait) => Ok(()),
                    () = token.cancelled() => Err(AppError::Cancelled),
                }
            }
            None => {
                tokio::time::sleep(wait).await;
                Ok(())
            }
        }
    }

    pub async fn snapshot(&self) -> RateLimitSnapshot {
        let mut state = self.state.lock().await;
        state.roll_window(Utc::now().date_naive());
        RateLimitSnapshot {
            request_count_today: state.request_count_today,
            daily_limit: self.config.daily_limit,
            remaining_today: self
                .config
                .daily_limit
                .saturating_sub(state.request_count_today),
            window_start: state.window_start,
            request_interval_ms: duration_ms(self.config.request_interval),
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
