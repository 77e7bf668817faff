use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The kinds of work the pipeline runs.
///
/// `Full`, `Incremental` and `PriceUpdate` share the single-flight slot;
/// `Cleanup` and `ProxyHealth` run independently of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Full,
    Incremental,
    PriceUpdate,
    Cleanup,
    ProxyHealth,
}

impl JobKind {
    pub const ALL: [JobKind; 5] = [
        JobKind::Full,
        JobKind::Incremental,
        JobKind::PriceUpdate,
        JobKind::Cleanup,
        JobKind::ProxyHealth,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Full => "full",
            JobKind::Incremental => "incremental",
            JobKind::PriceUpdate => "price_update",
            JobKind::Cleanup => "cleanup",
            JobKind::ProxyHealth => "proxy_health",
        }
    }

    /// Whether this kind is mutually exclusive with the other gated kinds.
    pub fn is_gated(&self) -> bool {
        matches!(
            self,
            JobKind::Full | JobKind::Incremental | JobKind::PriceUpdate
        )
    }

    /// Non-zero code used to store the kind in an atomic slot.
    pub(crate) fn code(&self) -> u8 {
        match self {
            JobKind::Full => 1,
            JobKind::Incremental => 2,
            JobKind::PriceUpdate => 3,
            JobKind::Cleanup => 4,
            JobKind::ProxyHealth => 5,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<JobKind> {
        match code {
            1 => Some(JobKind::Full),
            2 => Some(JobKind::Incremental),
            3 => Some(JobKind::PriceUpdate),
            4 => Some(JobKind::Cleanup),
            5 => Some(JobKind::ProxyHealth),
            _ => None,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "full" => Ok(JobKind::Full),
            "incremental" => Ok(JobKind::Incremental),
            "price_update" => Ok(JobKind::PriceUpdate),
            "cleanup" => Ok(JobKind::Cleanup),
            "proxy_health" => Ok(JobKind::ProxyHealth),
            _ => Err(format!("Unknown job kind: {}", s)),
        }
    }
}

/// Who asked for a job to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Operator request; a busy slot is reported as an error.
    Manual,
    /// Timer firing; a busy slot is logged and skipped.
    Scheduled,
}

/// Lifecycle status of a scrape session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Started,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Started => "started",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "started" => Ok(SessionStatus::Started),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            _ => Err(format!("Unknown session status: {}", s)),
        }
    }
}

/// Item counters accumulated by a job run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCounts {
    pub found: u64,
    pub new: u64,
    pub updated: u64,
    pub removed: u64,
}

impl SessionCounts {
    pub fn add(&mut self, other: &SessionCounts) {
        self.found += other.found;
        self.new += other.new;
        self.updated += other.updated;
        self.removed += other.removed;
    }
}

/// One execution record of a job kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeSession {
    pub id: Uuid,
    pub kind: JobKind,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub counts: SessionCounts,
    pub error: Option<String>,
    pub execution_time_ms: Option<u64>,
}

/// Terminal data written once when a session ends.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub status: SessionStatus,
    pub counts: SessionCounts,
    pub error: Option<String>,
    pub execution_time_ms: u64,
}

impl SessionOutcome {
    pub fn completed(counts: SessionCounts, execution_time_ms: u64) -> Self {
        Self {
            status: SessionStatus::Completed,
            counts,
            error: None,
            execution_time_ms,
        }
    }

    pub fn failed(counts: SessionCounts, error: impl Into<String>, execution_time_ms: u64) -> Self {
        Self {
            status: SessionStatus::Failed,
            counts,
            error: Some(error.into()),
            execution_time_ms,
        }
    }
}

/// Aggregates over sessions started within a trailing window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionStats {
    pub since: Option<DateTime<Utc>>,
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub running: u64,
    pub avg_execution_ms: Option<f64>,
    pub counts: SessionCounts,
}

/// What a runner invocation produced.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub session_id: Uuid,
    pub kind: JobKind,
    pub status: SessionStatus,
    pub counts: SessionCounts,
    pub error: Option<String>,
    pub execution_time_ms: u64,
}
