pub mod config;
pub mod error;
pub mod fetcher;
pub mod job;
pub mod maintenance;
pub mod models;
pub mod proxy_pool;
pub mod rate_limiter;
pub mod runner;
pub mod scheduler;
pub mod session_log;
pub mod slot;
pub mod ticker;
pub mod traits;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::PipelineConfig;
pub use error::{AppError, TransportError};
pub use fetcher::ProxiedFetcher;
pub use job::{JobKind, JobReport, ScrapeSession, SessionStatus, Trigger};
pub use maintenance::MaintenanceJobs;
pub use models::{ListingRecord, NewProxy, ProxyRecord, TransactionType, compute_hash};
pub use proxy_pool::ProxyPool;
pub use rate_limiter::RateLimiter;
pub use runner::JobRunner;
pub use scheduler::{PipelineStats, Scheduler};
pub use traits::{
    Extractor, ListingSource, ListingStore, PersistenceGateway, ProxyStore, RequestLogStore,
    SessionStore, Transport,
};
