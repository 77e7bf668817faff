mod pipeline;
mod proxy_import;

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use chrono::TimeDelta;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use nestfeed_core::PipelineConfig;
use nestfeed_core::config::MAX_WINDOW_DAYS;
use nestfeed_core::traits::ProxyStore;
use nestfeed_db::Database;

const DEFAULT_LOG_FILTER: &str = "nestfeed=info,nestfeed_cli=info,nestfeed_core=info,nestfeed_client=info,nestfeed_db=info";

#[derive(Parser)]
#[command(name = "nestfeed", version, about = "Property listing acquisition pipeline")]
struct Cli {
    /// Base URL of the listing origin
    #[arg(long, env = "NESTFEED_SOURCE_URL", global = true)]
    source_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every job on its schedule until Ctrl-C
    Run,

    /// Run one scrape job now
    Scrape {
        #[arg(value_enum)]
        kind: ScrapeKind,
    },

    /// Deactivate stale listings and prune old logs and sessions
    Cleanup,

    /// Run a health check on proxies that are due
    HealthCheck,

    /// Print session, proxy, listing and quota statistics as JSON
    Stats {
        /// Trailing window for session statistics
        #[arg(long, default_value_t = 24)]
        hours: i64,
    },

    /// Manage the proxy inventory
    Proxies {
        #[command(subcommand)]
        command: ProxyCommands,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ScrapeKind {
    Full,
    Incremental,
    PriceUpdate,
}

#[derive(Subcommand)]
enum ProxyCommands {
    /// List all proxies with their scores
    List,

    /// Import proxies from a CSV file (address,port,protocol,username,password,country)
    Import { path: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env()?;
    let db = pipeline::connect_db().await?;

    match cli.command {
        Commands::Run => {
            let source_url = require_source(cli.source_url.as_deref())?;
            cmd_run(&config, &db, source_url).await?;
        }
        Commands::Scrape { kind } => {
            let source_url = require_source(cli.source_url.as_deref())?;
            let scheduler = pipeline::build(&config, &db, source_url).await?;
            let report = match kind {
                ScrapeKind::Full => scheduler.trigger_full().await?,
                ScrapeKind::Incremental => scheduler.trigger_incremental().await?,
                ScrapeKind::PriceUpdate => scheduler.trigger_price_update().await?,
            };
            print_json(&report)?;
        }
        Commands::Cleanup => {
            let maintenance = pipeline::build_maintenance(&config, &db).await?;
            print_json(&maintenance.run_cleanup().await?)?;
        }
        Commands::HealthCheck => {
            let maintenance = pipeline::build_maintenance(&config, &db).await?;
            print_json(&maintenance.run_proxy_health().await?)?;
        }
        Commands::Stats { hours } => {
            let window = stats_window(hours)?;
            print_json(&pipeline::stats(&config, &db, window).await?)?;
        }
        Commands::Proxies { command } => match command {
            ProxyCommands::List => print_json(&db.list_proxies().await?)?,
            ProxyCommands::Import { path } => cmd_import(&db, &path).await?,
        },
    }

    Ok(())
}

fn require_source(source_url: Option<&str>) -> Result<&str> {
    source_url.context("NESTFEED_SOURCE_URL not set. Required for this command.")
}

/// Trailing window for `stats`, at most `MAX_WINDOW_DAYS` long.
fn stats_window(hours: i64) -> Result<TimeDelta> {
    if hours <= 0 {
        bail!("--hours must be positive");
    }
    match TimeDelta::try_hours(hours) {
        Some(window) if window <= TimeDelta::days(MAX_WINDOW_DAYS) => Ok(window),
        _ => bail!("--hours must be at most {}", MAX_WINDOW_DAYS * 24),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn cmd_run(config: &PipelineConfig, db: &Database, source_url: &str) -> Result<()> {
    let scheduler = pipeline::build(config, db, source_url).await?;
    scheduler.start();

    for schedule in scheduler.status().await.schedules {
        tracing::info!(
            job = %schedule.kind,
            cadence = %schedule.cadence,
            next_fire = ?schedule.next_fire,
            "Scheduled"
        );
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to install Ctrl-C handler")?;
    tracing::info!("Shutdown signal received");

    scheduler.shutdown();
    Ok(())
}

async fn cmd_import(db: &Database, path: &std::path::Path) -> Result<()> {
    let proxies = proxy_import::load_proxies(path)?;
    let total = proxies.len();

    for proxy in &proxies {
        let record = db
            .add_proxy(proxy)
            .await
            .with_context(|| format!("Failed to add proxy {}:{}", proxy.address, proxy.port))?;
        tracing::info!(proxy_id = %record.id, proxy = %record.label(), "Imported proxy");
    }

    tracing::info!(total, file = %path.display(), "Proxy import finished");
    Ok(())
}
