//! Rate-limited, proxy-rotating fetcher with bounded retries.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::config::FetchConfig;
use crate::error::{AppError, TransportError};
use crate::models::{ProxyOutcome, RequestLogEntry};
use crate::proxy_pool::ProxyPool;
use crate::rate_limiter::RateLimiter;
use crate::traits::{ProxyStore, RequestLogStore, RequestOptions, Transport};

/// Fetches URLs through the proxy pool, one paced attempt at a time.
///
/// Each attempt acquires the rate limiter, takes the next proxy (or goes
/// direct when the pool is empty), records the request and feeds the
/// outcome back into the pool. A failed attempt backs off linearly before
/// the next one; the last error is returned once retries are exhausted.
pub struct ProxiedFetcher<T, G>
where
    T: Transport,
    G: ProxyStore + RequestLogStore,
{
    transport: T,
    pool: Arc<ProxyPool<G>>,
    store: G,
    limiter: RateLimiter,
    config: FetchConfig,
    cancel: CancellationToken,
}

impl<T, G> ProxiedFetcher<T, G>
where
    T: Transport,
    G: ProxyStore + RequestLogStore,
{
    pub fn new(
        transport: T,
        pool: Arc<ProxyPool<G>>,
        store: G,
        limiter: RateLimiter,
        config: FetchConfig,
    ) -> Self {
        Self {
            transport,
            pool,
            store,
            limiter,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Use an externally owned cancellation token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn pool(&self) -> &Arc<ProxyPool<G>> {
        &self.pool
    }

    /// Seed the limiter with the requests already logged today (UTC).
    pub async fn restore_quota(&self) -> Result<u32, AppError> {
        let since = start_of_utc_day(Utc::now());
        let count = self.store.count_requests_since(since).await?;
        let count = u32::try_from(count).unwrap_or(u32::MAX);
        self.limiter.restore(count).await;
        Ok(count)
    }

    /// Fetch `url`, retrying through different proxies.
    pub async fn fetch(&self, url: &str) -> Result<String, AppError> {
        let max_attempts = self.config.max_proxy_retries.max(1);
        let options = RequestOptions::with_timeout(self.config.request_timeout)
            .header("User-Agent", self.config.user_agent.clone());
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            if self.cancel.is_cancelled() {
                return Err(AppError::Cancelled);
            }
            self.limiter.acquire(Some(&self.cancel)).await?;

            let proxy = self.pool.get_next().await;
            let started = Instant::now();
            let result = match tokio::time::timeout(
                self.config.request_timeout,
                self.transport.request(url, &options, proxy.as_ref()),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(duration_ms(
                    self.config.request_timeout,
                ))),
            };
            let elapsed = duration_ms(started.elapsed());

            let entry = RequestLogEntry {
                url: url.to_string(),
                proxy_id: proxy.as_ref().map(|p| p.id),
                success: result.is_ok(),
                status_code: match &result {
                    Ok(response) => Some(response.status),
                    Err(TransportError::BadStatus(code)) => Some(*code),
                    Err(_) => None,
                },
                response_time_ms: Some(elapsed),
                at: Utc::now(),
            };
            if let Err(e) = self.store.log_request(&entry).await {
                tracing::warn!(url, error = %e, "Failed to log request");
            }

            match result {
                Ok(response) => {
                    if let Some(proxy) = &proxy {
                        self.pool
                            .record_outcome(proxy.id, ProxyOutcome::live(true, Some(elapsed)))
                            .await;
                    }
                    tracing::debug!(url, attempt, elapsed_ms = elapsed, "Fetched");
                    return Ok(response.body);
                }
                Err(e) => {
                    if let Some(proxy) = &proxy {
                        self.pool
                            .record_outcome(proxy.id, ProxyOutcome::live(false, None))
                            .await;
                    }
                    tracing::warn!(
                        url,
                        attempt,
                        max_attempts,
                        proxy = proxy.as_ref().map(|p| p.label()).unwrap_or_else(|| "direct".into()),
                        error = %e,
                        "Fetch attempt failed"
                    );
                    last_error = Some(e);
                }
            }

            if attempt < max_attempts {
                let backoff = self.config.base_delay * attempt;
                tokio::select! {
                    () = tokio::time::sleep(backoff) => {}
                    () = self.cancel.cancelled() => return Err(AppError::Cancelled),
                }
            }
        }

        Err(match last_error {
            Some(e) => AppError::Transport(e),
            None => AppError::Generic(format!("No fetch attempt made for {url}")),
        })
    }
}

fn start_of_utc_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|midnight| midnight.and_utc())
        .unwrap_or(now)
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
