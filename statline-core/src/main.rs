//! statline - operator CLI for the pipeline core
//!
//! Validates configuration, initializes the run log and inspects run state
//! for a (processor, data unit) key.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use statline_common::config::{load_config, resolve_config_path, RunLogBackend, StatlineConfig};
use statline_common::time::SystemClock;
use statline_core::tracker::open_run_log;
use statline_core::types::{ExtractionOutcome, ExtractionResult};
use statline_core::{RunTracker, SourceCatalog, QualityScorer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "statline")]
#[command(about = "Fallback resolution and run tracking for the stats pipeline")]
#[command(version)]
struct Args {
    /// Configuration file (falls back to STATLINE_CONFIG, then the platform config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load and validate the configuration
    CheckConfig,
    /// Create the run-log database if missing
    InitDb,
    /// Show whether a data unit counts as processed
    Status { processor: String, data_unit_key: String },
    /// Show the run-log audit trail for a data unit, newest first
    History {
        processor: String,
        data_unit_key: String,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Score a hypothetical result resolved from `source`
    Score {
        #[arg(long)]
        chain: String,
        #[arg(long)]
        source: String,
        /// Issue reported by the data (repeatable)
        #[arg(long = "issue")]
        issues: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = resolve_config_path(args.config.as_deref())?;
    let config = load_config(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;

    // RUST_LOG wins over [logging] level
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(config = %config_path.display(), "statline {}", env!("CARGO_PKG_VERSION"));

    match args.command {
        Command::CheckConfig => check_config(&config),
        Command::InitDb => init_db(&config).await,
        Command::Status {
            processor,
            data_unit_key,
        } => status(&config, &processor, &data_unit_key).await,
        Command::History {
            processor,
            data_unit_key,
            limit,
        } => history(&config, &processor, &data_unit_key, limit).await,
        Command::Score {
            chain,
            source,
            issues,
        } => score(&config, &chain, &source, issues),
    }
}

fn check_config(config: &StatlineConfig) -> Result<()> {
    let catalog = SourceCatalog::from_config(config)?;

    println!("Configuration OK (version {})", config.version);
    println!("Sources:");
    for source in catalog.sources() {
        println!(
            "  {:<16} weight {:>3}  tier {:<10} chains: {}",
            source.id,
            source.weight,
            source.tier,
            catalog.chains_for_source(&source.id).join(", ")
        );
    }
    println!("Chains:");
    for chain in catalog.chains() {
        println!(
            "  {:<20} [{}] on exhaustion: {}",
            chain.name,
            chain.sources.join(" -> "),
            chain.exhaustion.as_str()
        );
    }
    Ok(())
}

async fn init_db(config: &StatlineConfig) -> Result<()> {
    if config.run_log.backend != RunLogBackend::Sqlite {
        println!("Run log backend is in-memory; nothing to initialize");
        return Ok(());
    }

    statline_common::db::init_database(&config.run_log.database)
        .await
        .context("Failed to initialize run-log database")?;
    println!("Run log ready at {}", config.run_log.database.display());
    Ok(())
}

async fn tracker(config: &StatlineConfig) -> Result<RunTracker> {
    let log = open_run_log(&config.run_log)
        .await
        .context("Failed to open run log")?;
    Ok(RunTracker::new(
        log,
        Arc::new(SystemClock),
        config.tracker.clone(),
    ))
}

async fn status(config: &StatlineConfig, processor: &str, data_unit_key: &str) -> Result<()> {
    let tracker = tracker(config).await?;
    let check = tracker.evaluate(processor, data_unit_key).await?;

    println!("{} / {}: {}", processor, data_unit_key, check);
    println!("processed: {}", check.is_processed());
    Ok(())
}

async fn history(
    config: &StatlineConfig,
    processor: &str,
    data_unit_key: &str,
    limit: Option<usize>,
) -> Result<()> {
    let tracker = tracker(config).await?;
    let limit = limit.unwrap_or(config.tracker.history_limit);
    let records = tracker
        .history_with_limit(processor, data_unit_key, limit)
        .await?;

    if records.is_empty() {
        println!("No runs recorded for {} / {}", processor, data_unit_key);
        return Ok(());
    }

    for record in records {
        let completed = record
            .completed_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}  {:<8} started {}  completed {}  run {}",
            record.phase, record.status, record.started_at.to_rfc3339(), completed, record.run_id
        );
        if let Some(metrics) = record.metrics {
            println!("    {}", serde_json::to_string(&metrics)?);
        }
    }
    Ok(())
}

fn score(config: &StatlineConfig, chain: &str, source: &str, issues: Vec<String>) -> Result<()> {
    let catalog = SourceCatalog::from_config(config)?;
    let chain_def = catalog
        .chain(chain)
        .ok_or_else(|| anyhow!("Unknown chain: {}", chain))?;
    if !chain_def.sources.iter().any(|s| s == source) {
        bail!("Source '{}' is not part of chain '{}'", source, chain);
    }
    let weight = catalog
        .weight(source)
        .ok_or_else(|| anyhow!("Unknown source: {}", source))?;

    let extraction = ExtractionResult {
        chain: chain.to_string(),
        data_unit_key: "dry-run".to_string(),
        outcome: ExtractionOutcome::Resolved {
            source: source.to_string(),
            weight,
        },
        payload: Value::Null,
        attempted: vec![source.to_string()],
        failures: vec![],
        quality_issues: issues.clone(),
        current_issues: issues,
    };

    let quality = QualityScorer::new(config.scoring.clone()).score(&extraction, &catalog);
    println!("{}", serde_json::to_string_pretty(&quality)?);
    Ok(())
}
