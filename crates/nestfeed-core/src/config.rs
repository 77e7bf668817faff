//! Pipeline configuration.
//!
//! Every knob has a default; [`PipelineConfig::from_env`] overrides them from
//! `NESTFEED_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use percent_encoding::percent_decode_str;
use url::Url;

use crate::error::AppError;
use crate::models::{NewProxy, ProxyProtocol};
use crate::ticker::Cadence;

/// Longest retention or lookback window accepted from the environment.
pub const MAX_WINDOW_DAYS: i64 = 3650;

/// Start of a trailing window ending at `now`.
pub fn window_start(now: DateTime<Utc>, window: TimeDelta) -> Result<DateTime<Utc>, AppError> {
    now.checked_sub_signed(window).ok_or_else(|| {
        AppError::ConfigError(format!(
            "Window of {} days reaches outside the supported date range",
            window.num_days()
        ))
    })
}

/// Outbound request pacing and quota.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Minimum spacing between any two outbound requests.
    pub request_interval: Duration,
    /// Maximum requests per UTC day, retries included.
    pub daily_limit: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            request_interval: Duration::from_millis(2000),
            daily_limit: 1000,
        }
    }
}

/// Retry behaviour of a single logical fetch.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub max_proxy_retries: u32,
    /// Backoff before attempt `n + 1` is `base_delay * n`.
    pub base_delay: Duration,
    pub request_timeout: Duration,
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_proxy_retries: 3,
            base_delay: Duration::from_millis(1000),
            request_timeout: Duration::from_secs(30),
            user_agent: "Mozilla/5.0 (compatible; nestfeed/0.1)".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxyPoolConfig {
    /// Scores below this deactivate a proxy on failure.
    pub deactivation_threshold: f64,
    pub health_check_url: String,
    pub health_check_timeout: Duration,
    /// Seeded when the store has no active proxies at bootstrap.
    pub default_proxies: Vec<NewProxy>,
}

impl Default for ProxyPoolConfig {
    fn default() -> Self {
        Self {
            deactivation_threshold: 50.0,
            health_check_url: "https://httpbin.org/ip".to_string(),
            health_check_timeout: Duration::from_secs(10),
            default_proxies: Vec::new(),
        }
    }
}

/// Sizes and windows of the gated jobs.
#[derive(Debug, Clone)]
pub struct JobConfig {
    /// Search pages fetched per transaction type by a full scrape.
    pub full_pages: u32,
    /// Search pages of recent rentals fetched by an incremental scrape.
    pub incremental_pages: u32,
    /// Maximum listings re-fetched by one price update.
    pub price_update_batch: usize,
    /// Pause between price-update items, on top of request pacing.
    pub price_update_delay: Duration,
    /// Listings not scraped for this long are due for a price update.
    pub price_update_age: TimeDelta,
    /// Stale window applied at the end of a full scrape.
    pub stale_sweep_window: TimeDelta,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            full_pages: 5,
            incremental_pages: 1,
            price_update_batch: 50,
            price_update_delay: Duration::from_millis(2000),
            price_update_age: TimeDelta::days(1),
            stale_sweep_window: TimeDelta::days(7),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// Listings not scraped for this long are deactivated by cleanup.
    pub listing_retention: TimeDelta,
    pub request_log_retention: TimeDelta,
    pub view_log_retention: TimeDelta,
    /// Number of most recent sessions kept by cleanup.
    pub session_keep: usize,
    /// Proxies tested per health-check run.
    pub health_check_batch: usize,
    /// Proxies tested more recently than this are skipped.
    pub health_check_interval: TimeDelta,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            listing_retention: TimeDelta::days(30),
            request_log_retention: TimeDelta::days(7),
            view_log_retention: TimeDelta::days(30),
            session_keep: 500,
            health_check_batch: 10,
            health_check_interval: TimeDelta::hours(1),
        }
    }
}

/// Timer cadences for every job kind.
#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub full: Cadence,
    pub incremental: Cadence,
    pub price_update: Cadence,
    pub cleanup: Cadence,
    pub proxy_health: Cadence,
    /// Delay before the extra incremental scrape fired by `start()`.
    pub warmup_delay: Duration,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            full: Cadence::every(Duration::from_secs(6 * 60 * 60)),
            incremental: Cadence::every(Duration::from_secs(60 * 60)),
            price_update: Cadence::every(Duration::from_secs(30 * 60)),
            cleanup: Cadence::every(Duration::from_secs(24 * 60 * 60)),
            proxy_health: Cadence::every(Duration::from_secs(15 * 60)),
            warmup_delay: Duration::from_secs(10),
        }
    }
}

impl ScheduleConfig {
    /// Default cron cadences: every 6h, hourly, every 30min, daily at 02:00 local, every 15min.
    pub fn default_cron() -> Result<Self, AppError> {
        Ok(Self {
            full: Cadence::cron("0 0 */6 * * *")?,
            incremental: Cadence::cron("0 0 * * * *")?,
            price_update: Cadence::cron("0 */30 * * * *")?,
            cleanup: Cadence::cron("0 0 2 * * *")?,
            proxy_health: Cadence::cron("0 */15 * * * *")?,
            warmup_delay: Duration::from_secs(10),
        })
    }
}

/// Complete pipeline configuration.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub rate_limit: RateLimitConfig,
    pub fetch: FetchConfig,
    pub proxy: ProxyPoolConfig,
    pub jobs: JobConfig,
    pub maintenance: MaintenanceConfig,
    pub schedule: ScheduleConfig,
}

impl PipelineConfig {
    /// Read configuration from `NESTFEED_*` environment variables.
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup, falling back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);
        let defaults = ScheduleConfig::default_cron()?;

        let rate_limit = RateLimitConfig {
            request_interval: Duration::from_millis(env.parse("NESTFEED_REQUEST_INTERVAL_MS", 2000)?),
            daily_limit: env.positive("NESTFEED_DAILY_REQUEST_LIMIT", 1000)?,
        };

        let fetch = FetchConfig {
            max_proxy_retries: env.positive("NESTFEED_MAX_PROXY_RETRIES", 3)?,
            base_delay: Duration::from_millis(env.parse("NESTFEED_RETRY_BASE_DELAY_MS", 1000)?),
            request_timeout: Duration::from_secs(env.positive("NESTFEED_REQUEST_TIMEOUT_SECS", 30)?),
            user_agent: env
                .raw("NESTFEED_USER_AGENT")
                .unwrap_or_else(|| FetchConfig::default().user_agent),
        };

        let threshold: f64 = env.parse("NESTFEED_PROXY_DEACTIVATION_THRESHOLD", 50.0)?;
        if !(0.0..=100.0).contains(&threshold) {
            return Err(AppError::ConfigError(format!(
                "NESTFEED_PROXY_DEACTIVATION_THRESHOLD must be within 0..=100, got {threshold}"
            )));
        }
        let default_proxies = match env.raw("NESTFEED_DEFAULT_PROXIES") {
            Some(list) => parse_proxy_list(&list)?,
            None => Vec::new(),
        };
        let proxy = ProxyPoolConfig {
            deactivation_threshold: threshold,
            health_check_url: env
                .raw("NESTFEED_HEALTH_CHECK_URL")
                .unwrap_or_else(|| ProxyPoolConfig::default().health_check_url),
            health_check_timeout: Duration::from_secs(
                env.positive("NESTFEED_HEALTH_CHECK_TIMEOUT_SECS", 10)?,
            ),
            default_proxies,
        };

        let jobs = JobConfig {
            full_pages: env.positive("NESTFEED_FULL_PAGES", 5)?,
            incremental_pages: env.positive("NESTFEED_INCREMENTAL_PAGES", 1)?,
            price_update_batch: env.positive("NESTFEED_PRICE_UPDATE_BATCH", 50)?,
            price_update_delay: Duration::from_millis(env.parse("NESTFEED_PRICE_UPDATE_DELAY_MS", 2000)?),
            price_update_age: TimeDelta::days(1),
            stale_sweep_window: env.days("NESTFEED_STALE_SWEEP_DAYS", 7)?,
        };

        let maintenance = MaintenanceConfig {
            listing_retention: env.days("NESTFEED_RETENTION_DAYS", 30)?,
            request_log_retention: env.days("NESTFEED_REQUEST_LOG_RETENTION_DAYS", 7)?,
            view_log_retention: env.days("NESTFEED_VIEW_LOG_RETENTION_DAYS", 30)?,
            session_keep: env.positive("NESTFEED_SESSION_KEEP", 500)?,
            health_check_batch: env.positive("NESTFEED_HEALTH_CHECK_BATCH", 10)?,
            health_check_interval: TimeDelta::hours(1),
        };

        let schedule = ScheduleConfig {
            full: env.cadence("NESTFEED_CRON_FULL", defaults.full)?,
            incremental: env.cadence("NESTFEED_CRON_INCREMENTAL", defaults.incremental)?,
            price_update: env.cadence("NESTFEED_CRON_PRICE_UPDATE", defaults.price_update)?,
            cleanup: env.cadence("NESTFEED_CRON_CLEANUP", defaults.cleanup)?,
            proxy_health: env.cadence("NESTFEED_CRON_PROXY_HEALTH", defaults.proxy_health)?,
            warmup_delay: Duration::from_secs(env.parse("NESTFEED_WARMUP_DELAY_SECS", 10)?),
        };

        Ok(Self {
            rate_limit,
            fetch,
            proxy,
            jobs,
            maintenance,
            schedule,
        })
    }
}

struct Lookup<F>(F);

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> Result<T, AppError> {
        match self.raw(key) {
            None => Ok(default),
            Some(raw) => raw
                .parse()
                .map_err(|_| AppError::ConfigError(format!("Invalid {key} '{raw}'"))),
        }
    }

    fn positive<T>(&self, key: &str, default: T) -> Result<T, AppError>
    where
        T: FromStr + PartialOrd + Default,
    {
        let value = self.parse(key, default)?;
        if value <= T::default() {
            return Err(AppError::ConfigError(format!("{key} must be at least 1")));
        }
        Ok(value)
    }

    /// A whole number of days in `1..=MAX_WINDOW_DAYS`.
    fn days(&self, key: &str, default: i64) -> Result<TimeDelta, AppError> {
        let days: i64 = self.positive(key, default)?;
        if days > MAX_WINDOW_DAYS {
            return Err(AppError::ConfigError(format!(
                "{key} must be at most {MAX_WINDOW_DAYS} days, got {days}"
            )));
        }
        TimeDelta::try_days(days)
            .ok_or_else(|| AppError::ConfigError(format!("{key} is out of range: {days}")))
    }

    fn cadence(&self, key: &str, default: Cadence) -> Result<Cadence, AppError> {
        match self.raw(key) {
            None => Ok(default),
            Some(expr) => Cadence::cron(&expr)
                .map_err(|e| AppError::ConfigError(format!("Invalid {key}: {e}"))),
        }
    }
}

/// Parse a comma-separated list of proxy URLs (`scheme://[user:pass@]host:port`).
pub fn parse_proxy_list(list: &str) -> Result<Vec<NewProxy>, AppError> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(parse_proxy_url)
        .collect()
}

/// Parse a single proxy URL.
pub fn parse_proxy_url(raw: &str) -> Result<NewProxy, AppError> {
    let url = Url::parse(raw)
        .map_err(|e| AppError::ConfigError(format!("Invalid proxy URL '{raw}': {e}")))?;
    let protocol: ProxyProtocol = url.scheme().parse().map_err(AppError::ConfigError)?;
    let host = url
        .host_str()
        .ok_or_else(|| AppError::ConfigError(format!("Proxy URL '{raw}' has no host")))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| AppError::ConfigError(format!("Proxy URL '{raw}' has no port")))?;

    let mut proxy = NewProxy::new(host, port, protocol);
    if !url.username().is_empty() {
        let username = decode_userinfo(url.username(), raw)?;
        let password = decode_userinfo(url.password().unwrap_or_default(), raw)?;
        proxy = proxy.with_credentials(username, password);
    }
    Ok(proxy)
}

fn decode_userinfo(part: &str, raw: &str) -> Result<String, AppError> {
    percent_decode_str(part)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|_| AppError::ConfigError(format!("Proxy URL '{raw}' has non UTF-8 credentials")))
}
