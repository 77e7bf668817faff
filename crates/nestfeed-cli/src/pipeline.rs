use std::sync::Arc;

use anyhow::{Context, Result};
use nestfeed_client::{HttpListingSource, JsonListingExtractor, ReqwestTransport};
use chrono::TimeDelta;
use nestfeed_core::{
    JobRunner, MaintenanceJobs, PipelineConfig, PipelineStats, ProxiedFetcher, ProxyPool,
    RateLimiter, Scheduler,
};
use nestfeed_db::{Database, DatabaseConfig};

pub type Pipeline = Scheduler<ReqwestTransport, Database, JsonListingExtractor, HttpListingSource>;
pub type Maintenance = MaintenanceJobs<ReqwestTransport, Database>;
type Fetcher = ProxiedFetcher<ReqwestTransport, Database>;

/// Connect to PostgreSQL using `DATABASE_URL` and apply migrations.
pub async fn connect_db() -> Result<Database> {
    let config = DatabaseConfig::from_env()?;
    let db = Database::connect(&config)
        .await
        .context("Failed to connect to database")?;
    db.migrate().await?;
    Ok(db)
}

/// Maintenance jobs only; needs no listing source.
pub async fn build_maintenance(config: &PipelineConfig, db: &Database) -> Result<Maintenance> {
    let transport = ReqwestTransport::new(&config.fetch.user_agent)?;
    let pool = Arc::new(ProxyPool::new(db.clone(), config.proxy.clone()));
    pool.bootstrap().await.context("Failed to load proxy pool")?;
    Ok(MaintenanceJobs::new(
        transport,
        db.clone(),
        pool,
        config.maintenance.clone(),
    ))
}

/// Statistics over the trailing `window`; needs no listing source.
pub async fn stats(config: &PipelineConfig, db: &Database, window: TimeDelta) -> Result<PipelineStats> {
    let transport = ReqwestTransport::new(&config.fetch.user_agent)?;
    let pool = Arc::new(ProxyPool::new(db.clone(), config.proxy.clone()));
    pool.reload().await.context("Failed to load proxy pool")?;
    let (fetcher, _) = paced_fetcher(config, db, transport, pool).await?;
    Ok(PipelineStats::collect(db, &fetcher, window).await?)
}

/// Fetcher with the quota restored from today's request log.
async fn paced_fetcher(
    config: &PipelineConfig,
    db: &Database,
    transport: ReqwestTransport,
    pool: Arc<ProxyPool<Database>>,
) -> Result<(Fetcher, u32)> {
    let fetcher = ProxiedFetcher::new(
        transport,
        pool,
        db.clone(),
        RateLimiter::new(config.rate_limit.clone()),
        config.fetch.clone(),
    );
    let used_today = fetcher
        .restore_quota()
        .await
        .context("Failed to restore request quota")?;
    Ok((fetcher, used_today))
}

/// Wire the whole pipeline: proxy pool, paced fetcher with the quota
/// restored from today's request log, runner, maintenance and scheduler.
pub async fn build(config: &PipelineConfig, db: &Database, source_url: &str) -> Result<Pipeline> {
    let source = HttpListingSource::new(source_url)?;
    let transport = ReqwestTransport::new(&config.fetch.user_agent)?;

    let pool = Arc::new(ProxyPool::new(db.clone(), config.proxy.clone()));
    let loaded = pool.bootstrap().await.context("Failed to load proxy pool")?;

    let (fetcher, used_today) = paced_fetcher(config, db, transport.clone(), pool.clone()).await?;

    tracing::info!(
        source = %source.base(),
        proxies = loaded,
        used_today,
        daily_limit = config.rate_limit.daily_limit,
        "Pipeline ready"
    );

    let runner = Arc::new(JobRunner::new(
        Arc::new(fetcher),
        JsonListingExtractor::new(),
        source,
        db.clone(),
        config.jobs.clone(),
    ));
    let maintenance = Arc::new(MaintenanceJobs::new(
        transport,
        db.clone(),
        pool,
        config.maintenance.clone(),
    ));

    Ok(Scheduler::new(
        runner,
        maintenance,
        db.clone(),
        config.schedule.clone(),
    ))
}
