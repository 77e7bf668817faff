//! Timer abstraction used by the scheduler.
//!
//! A [`Ticker`] fires a callback on a [`Cadence`] until its [`TickerHandle`]
//! is cancelled. Each callback runs on its own task so a slow job never
//! delays the next timer firing.

use std::future::Future;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Local, TimeDelta, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;

/// When a ticker fires.
#[derive(Debug, Clone)]
pub enum Cadence {
    /// Six-field cron expression (seconds first), evaluated in local time.
    Cron {
        expression: String,
        schedule: cron::Schedule,
    },
    /// Fixed period measured from the previous firing.
    Every(Duration),
}

impl Cadence {
    pub fn cron(expression: &str) -> Result<Self, AppError> {
        let schedule = cron::Schedule::from_str(expression).map_err(|e| {
            AppError::ConfigError(format!("Invalid cron expression '{expression}': {e}"))
        })?;
        Ok(Cadence::Cron {
            expression: expression.to_string(),
            schedule,
        })
    }

    pub fn every(period: Duration) -> Self {
        Cadence::Every(period.max(Duration::from_millis(1)))
    }

    /// Human-readable form for status output.
    pub fn describe(&self) -> String {
        match self {
            Cadence::Cron { expression, .. } => expression.clone(),
            Cadence::Every(period) => format!("every {}ms", period.as_millis()),
        }
    }

    /// First firing strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Cadence::Cron { schedule, .. } => schedule
                .after(&now.with_timezone(&Local))
                .next()
                .map(|t| t.with_timezone(&Utc)),
            Cadence::Every(period) => TimeDelta::from_std(*period).ok().map(|d| now + d),
        }
    }
}

/// Cancellation handle for a running ticker.
///
/// Dropping the handle cancels the ticker. Callbacks already started are
/// not affected.
pub struct TickerHandle {
    name: String,
    cancel: CancellationToken,
    next_fire: Arc<Mutex<Option<DateTime<Utc>>>>,
    task: JoinHandle<()>,
}

impl TickerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled() && !self.task.is_finished()
    }

    /// When the ticker fires next, or `None` once it has stopped.
    pub fn next_fire(&self) -> Option<DateTime<Utc>> {
        if !self.is_active() {
            return None;
        }
        *lock(&self.next_fire)
    }
}

impl Drop for TickerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// A named timer that fires on a [`Cadence`].
#[derive(Debug, Clone)]
pub struct Ticker {
    name: String,
    cadence: Cadence,
}

impl Ticker {
    pub fn new(name: impl Into<String>, cadence: Cadence) -> Self {
        Self {
            name: name.into(),
            cadence,
        }
    }

    /// Start firing `on_tick` until the returned handle is cancelled.
    pub fn spawn<F, Fut>(self, on_tick: F) -> TickerHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let next_fire = Arc::new(Mutex::new(None));
        let token = cancel.clone();
        let slot = Arc::clone(&next_fire);
        let Ticker { name, cadence } = self;
        let task_name = name.clone();

        let task = tokio::spawn(async move {
            loop {
                let Some(next) = cadence.next_after(Utc::now()) else {
                    tracing::warn!(ticker = %task_name, "Cadence has no upcoming firing; stopping");
                    break;
                };
                *lock(&slot) = Some(next);

                let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                tokio::select! {
                    () = tokio::time::sleep(wait) => {}
                    () = token.cancelled() => break,
                }

                tracing::debug!(ticker = %task_name, "Ticker fired");
                tokio::spawn(on_tick());
            }
            *lock(&slot) = None;
        });

        TickerHandle {
            name,
            cancel,
            next_fire,
            task,
        }
    }

    /// Fire `on_fire` once after `delay`, unless cancelled first.
    pub fn once<F, Fut>(name: impl Into<String>, delay: Duration, on_fire: F) -> TickerHandle
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let cancel = CancellationToken::new();
        let fire_at = TimeDelta::from_std(delay).ok().map(|d| Utc::now() + d);
        let next_fire = Arc::new(Mutex::new(fire_at));
        let token = cancel.clone();
        let slot = Arc::clone(&next_fire);

        let task = tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(delay) => {
                    *lock(&slot) = None;
                    on_fire().await;
                }
                () = token.cancelled() => {
                    *lock(&slot) = None;
                }
            }
        });

        TickerHandle {
            name,
            cancel,
            next_fire,
            task,
        }
    }
}

/// Lock a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("Recovered from poisoned mutex");
        poisoned.into_inner()
    })
}
