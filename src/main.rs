//! Rankstats ingestion service
//!
//! Reads match deliveries (one JSON array per line) from a file or stdin,
//! feeds them through the ingestion workers and keeps the population
//! aggregates fresh on a timer.
//!
//! Usage:
//!   rankstats --db-path rankstats.db --input deliveries.jsonl
//!   cat deliveries.jsonl | rankstats --run-once
//!
//! Environment:
//!   DB_PATH - SQLite database path (default: rankstats.db)
//!   INPUT_PATH - Delivery file (default: stdin)
//!   DEDUP_THRESHOLD, DEDUP_WINDOW, FILTER_EXPECTED_ITEMS, FILTER_FP_RATE,
//!   FLUSH_CHUNK_SIZE, FLUSH_MAX_ATTEMPTS, FLUSH_BACKOFF_BASE_MS,
//!   INGEST_WORKERS, QUEUE_CAPACITY, MAX_REDELIVERIES, AGGREGATION_PERIOD_SECS

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rankstats_backend::aggregation::AggregationEngine;
use rankstats_backend::config::PipelineConfig;
use rankstats_backend::ingest::{
    delivery_channel, spawn_workers, BloomFilter, Delivery, IngestPipeline, WorkerSummary,
};
use rankstats_backend::storage::{MatchStore, SqliteStore};

#[derive(Parser, Debug)]
#[command(name = "rankstats")]
#[command(about = "Match ingestion and population statistics")]
struct Args {
    /// SQLite database path
    #[arg(long, env = "DB_PATH", default_value = "rankstats.db")]
    db_path: String,

    /// Delivery file, one JSON array of matches per line (stdin when omitted)
    #[arg(long, env = "INPUT_PATH")]
    input: Option<PathBuf>,

    /// Ingestion worker count (overrides INGEST_WORKERS)
    #[arg(long)]
    workers: Option<usize>,

    /// Aggregation period in seconds (overrides AGGREGATION_PERIOD_SECS)
    #[arg(long)]
    aggregation_period_secs: Option<u64>,

    /// Drain the input, run one aggregation cycle and exit
    #[arg(long, default_value_t = false)]
    run_once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();
    let args = Args::parse();

    info!("🚀 Rankstats ingestion starting");

    let mut config = PipelineConfig::from_env();
    if let Some(workers) = args.workers {
        config.queue.workers = workers.max(1);
    }
    if let Some(secs) = args.aggregation_period_secs {
        config.aggregation.period = Duration::from_secs(secs.max(1));
    }

    let store = Arc::new(SqliteStore::new(&args.db_path)?);
    info!("💾 Match store opened at: {}", args.db_path);

    let known_ids = store
        .all_match_ids()
        .await
        .context("loading stored match ids")?;
    let expected_items = config.filter.expected_items.max(known_ids.len() * 2);
    let filter = Arc::new(BloomFilter::seeded(
        known_ids,
        expected_items,
        config.filter.false_positive_rate,
    ));

    let pipeline = Arc::new(IngestPipeline::new(store.clone(), filter, &config));
    let engine = Arc::new(AggregationEngine::new(
        store.clone(),
        config.aggregation.period,
    ));

    let (tx, rx) = delivery_channel(&config.queue);
    let workers = spawn_workers(pipeline, rx, &config.queue);
    info!(
        workers = config.queue.workers,
        capacity = config.queue.capacity,
        "⚙️ Ingestion workers started"
    );

    let aggregation = (!args.run_once).then(|| engine.clone().spawn());

    let reader: Box<dyn AsyncBufRead + Unpin + Send> = match &args.input {
        Some(path) => Box::new(BufReader::new(
            tokio::fs::File::open(path)
                .await
                .with_context(|| format!("opening {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(tokio::io::stdin())),
    };

    let interrupted = tokio::select! {
        res = feed(reader, tx) => {
            let sent = res?;
            info!(sent, "📥 Input drained");
            false
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("🛑 Ctrl-C received, draining queued deliveries");
            true
        }
    };

    let mut summary = WorkerSummary::default();
    for handle in workers {
        match handle.await {
            Ok(s) => summary = summary.merge(s),
            Err(e) => error!(error = %e, "Ingestion worker panicked"),
        }
    }
    info!(
        processed = summary.processed,
        rejected = summary.rejected,
        failed = summary.failed,
        redeliveries = summary.redeliveries,
        "✅ Ingestion finished"
    );

    match aggregation {
        None => {
            engine.run_cycle().await?;
        }
        Some(handle) => {
            if !interrupted {
                info!("Input finished; aggregation keeps running until Ctrl-C");
                tokio::signal::ctrl_c()
                    .await
                    .context("waiting for Ctrl-C")?;
            }
            handle.abort();
        }
    }

    info!("👋 Rankstats stopped");
    Ok(())
}

/// Sends one delivery per non-empty line. Dropping `tx` on return closes
/// the queue so the workers exit once it drains.
async fn feed(
    reader: Box<dyn AsyncBufRead + Unpin + Send>,
    tx: tokio::sync::mpsc::Sender<Delivery>,
) -> Result<usize> {
    let mut lines = reader.lines();
    let mut sent = 0usize;
    while let Some(line) = lines.next_line().await.context("reading input")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if tx.send(Delivery::new(line)).await.is_err() {
            warn!("Delivery queue closed, stopping input");
            break;
        }
        sent += 1;
    }
    Ok(sent)
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rankstats_backend=info,rankstats=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    // 1) Standard dotenv search (cwd + parents)
    let _ = dotenv();

    // 2) Crate-root .env when run from elsewhere with --manifest-path
    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}
