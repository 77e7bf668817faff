pub mod config;
pub mod database;
pub mod listing_repository;
pub mod proxy_repository;
pub mod request_log_repository;
pub mod session_repository;

pub use config::DatabaseConfig;
pub use database::Database;
pub use listing_repository::ListingRepository;
pub use proxy_repository::ProxyRepository;
pub use request_log_repository::RequestLogRepository;
pub use session_repository::SessionRepository;

use nestfeed_core::AppError;

pub(crate) fn db_err(e: sqlx::Error) -> AppError {
    AppError::DatabaseError(e.to_string())
}
