//! Asclepius - command line entry point
//!
//! Runs the training scheduler as a long-lived service, triggers sessions by
//! hand, inspects learner state and feeds outcome reports to the learners.

use anyhow::Context;
use asclepius_core::{
    compute_advanced_metrics,
    learning::{LearningContext, StaticCatalogue},
    pipeline::TrainingPipeline,
    scheduler::{CheckOutcome, TrainingScheduler},
    LearningConfig, LearningStore, LibsqlStore, OutcomeFeedback, PredictionRecord,
    RuleBasedInference,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::EnvFilter;

/// Default database path under the platform's local data directory
fn get_default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("asclepius")
        .join("asclepius.db")
}

#[derive(Parser)]
#[command(name = "asclepius")]
#[command(about = "Continuous-learning control loop for clinical decision support", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Set log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Database path
    #[arg(long, env = "ASCLEPIUS_DB_PATH")]
    db_path: Option<PathBuf>,

    /// TOML configuration file (ASCLEPIUS__SECTION__KEY variables override it)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the training scheduler until Ctrl-C
    Serve,

    /// Run one training session now, ignoring the threshold
    Train,

    /// Show scheduler settings and the latest sessions
    Status {
        /// Number of recent sessions to list
        #[arg(short, long, default_value = "5")]
        limit: usize,
    },

    /// Compute metrics over a JSON array of prediction records
    Metrics {
        /// Path to the JSON file
        #[arg(short, long)]
        input: PathBuf,

        /// Number of confused pairs to report
        #[arg(long)]
        top_n: Option<usize>,
    },

    /// List treatment bandit arms
    Arms,

    /// Delete outcome records past the retention window
    Purge {
        /// Override the configured retention in days
        #[arg(long)]
        days: Option<u32>,
    },

    /// Feed a JSON array of outcome reports to the learners
    Ingest {
        /// Path to the JSON file
        #[arg(short, long)]
        input: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::new(format!(
        "asclepius={level},asclepius_core={level},libsql=warn",
        level = level.as_str().to_lowercase()
    ));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr) // Write logs to stderr, not stdout
        .init();

    debug!("Asclepius v{} starting...", env!("CARGO_PKG_VERSION"));

    let config = LearningConfig::load(cli.config.as_deref())
        .context("Failed to load configuration")?;

    // Metrics needs no database
    if let Commands::Metrics { input, top_n } = &cli.command {
        let records: Vec<PredictionRecord> = read_json(input)?;
        let metrics = compute_advanced_metrics(
            &records,
            top_n.unwrap_or(config.evaluation.top_confused_pairs),
        )?;
        println!("{}", serde_json::to_string_pretty(&metrics)?);
        return Ok(());
    }

    let db_path = cli.db_path.clone().unwrap_or_else(get_default_db_path);
    let store: Arc<dyn LearningStore> = Arc::new(
        LibsqlStore::new_local(&db_path)
            .await
            .with_context(|| format!("Failed to open database {}", db_path.display()))?,
    );

    match cli.command {
        Commands::Serve => serve(store, config).await,
        Commands::Train => {
            let scheduler = build_scheduler(store, &config);
            match scheduler.trigger_manual_training().await? {
                CheckOutcome::Triggered(session) => {
                    println!("{}", serde_json::to_string_pretty(&session)?);
                }
                CheckOutcome::Busy => println!("A training session is already running"),
                CheckOutcome::Skipped { .. } => {}
            }
            Ok(())
        }
        Commands::Status { limit } => {
            let scheduler = build_scheduler(store.clone(), &config);
            let status = scheduler.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);

            let sessions = store.list_sessions(limit).await?;
            println!("{}", serde_json::to_string_pretty(&sessions)?);
            Ok(())
        }
        Commands::Arms => {
            let context = load_context(store, &config).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&context.bandit().all_arm_stats())?
            );
            Ok(())
        }
        Commands::Purge { days } => {
            let days = days.unwrap_or(config.retention.outcome_retention_days);
            let removed = store.purge_outcomes_older_than(days).await?;
            println!("Removed {} outcome records older than {} days", removed, days);
            Ok(())
        }
        Commands::Ingest { input } => {
            let feedback: Vec<OutcomeFeedback> = read_json(&input)?;
            let context = load_context(store, &config).await?;

            let mut reports = Vec::with_capacity(feedback.len());
            for item in &feedback {
                reports.push(context.ingest_outcome(item).await?);
            }
            let unrecorded = reports.iter().filter(|r| !r.outcome_recorded).count();
            if unrecorded > 0 {
                warn!("{} outcome rows could not be stored", unrecorded);
            }
            if context.pending_sync() > 0 {
                match context.sync_to_store().await {
                    Ok(written) => info!("Replayed {} learner rows", written),
                    Err(e) => warn!(
                        "{} learner rows are still not persisted: {}",
                        context.pending_sync(),
                        e
                    ),
                }
            }
            println!("{}", serde_json::to_string_pretty(&reports)?);
            Ok(())
        }
        Commands::Metrics { .. } => Ok(()),
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("Invalid JSON in {}", path.display()))
}

fn build_scheduler(store: Arc<dyn LearningStore>, config: &LearningConfig) -> TrainingScheduler {
    let pipeline = Arc::new(TrainingPipeline::from_config(
        store,
        Arc::new(RuleBasedInference::new()),
        config,
    ));
    TrainingScheduler::new(pipeline, config.scheduler.clone())
}

async fn load_context(
    store: Arc<dyn LearningStore>,
    config: &LearningConfig,
) -> anyhow::Result<LearningContext> {
    let catalogue = Arc::new(StaticCatalogue::from_config(&config.catalogue));
    Ok(LearningContext::load(store, config, catalogue).await?)
}

async fn serve(store: Arc<dyn LearningStore>, config: LearningConfig) -> anyhow::Result<()> {
    let scheduler = build_scheduler(store, &config);
    if !scheduler.start() {
        anyhow::bail!("Scheduler did not start (is [scheduler] enabled = false?)");
    }
    info!("Asclepius scheduler running, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Shutting down");
    scheduler.stop().await?;
    Ok(())
}
