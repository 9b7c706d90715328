use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use feedwarden::config::Config;
use feedwarden::feed::{FeedRsParser, HttpFeedClient, Scheduler};
use feedwarden::ingest;
use feedwarden::storage::{Database, DatabaseError};

#[derive(Parser, Debug)]
#[command(name = "feedwarden", about = "Poll RSS/Atom sources and reconcile them into SQLite")]
struct Args {
    /// Configuration file
    #[arg(long, value_name = "FILE", default_value = "feedwarden.toml")]
    config: PathBuf,

    /// Database file (overrides `database_path` from the config)
    #[arg(long, value_name = "FILE")]
    database: Option<String>,

    /// Additional source URL to poll at the default cadence (repeatable)
    #[arg(long = "source", value_name = "URL")]
    sources: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config = Config::load(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;
    let db_path = args.database.as_deref().unwrap_or(&config.database_path);

    let db = match Database::open(db_path).await {
        Ok(db) => db,
        Err(DatabaseError::Locked) => {
            eprintln!("Error: Database {db_path} is locked by another process.");
            std::process::exit(1);
        }
        Err(e) => {
            return Err(anyhow::anyhow!("Failed to open database: {}", e));
        }
    };

    let client = HttpFeedClient::new(
        &config.user_agent,
        config.request_timeout(),
        config.max_body_bytes,
    )
    .context("Failed to build HTTP client")?;
    let (scheduler, output) = Scheduler::new(
        Arc::new(client),
        Arc::new(FeedRsParser),
        config.scheduler_options(),
    )
    .context("Invalid scheduler options")?;

    for source in &config.sources {
        scheduler
            .register(&source.url, source.cadence())
            .await
            .with_context(|| format!("Failed to register source {}", source.url))?;
    }
    for url in &args.sources {
        scheduler
            .register(url, None)
            .await
            .with_context(|| format!("Failed to register source {url}"))?;
    }

    if scheduler.sources().await.is_empty() {
        eprintln!("Warning: No sources configured. Add [[sources]] to the config or pass --source.");
    }

    let ingest_task = tokio::spawn(ingest::run_ingest(db.clone(), output.documents));
    let errors_task = tokio::spawn(ingest::drain_errors(output.errors));

    scheduler.start().await;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Shutting down");

    scheduler.stop().await;
    // Dropping the scheduler closes both streams so the consumers finish.
    drop(scheduler);

    let stats = ingest_task.await.context("Ingest task panicked")?;
    let errors = errors_task.await.context("Error drain task panicked")?;
    tracing::info!(
        documents = stats.documents,
        failed = stats.failed,
        inserted = stats.rows.inserted,
        updated = stats.rows.updated,
        errors,
        "Stopped"
    );

    Ok(())
}
