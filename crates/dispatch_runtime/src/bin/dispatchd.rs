//! Replays a JSON-lines stream of inbound events through the dispatch service.
//!
//! Outbound deliveries are written to stdout, one JSON object per line. Logs
//! go to stderr.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use dispatch_core::clock::SystemClock;
use dispatch_core::config::DispatchConfig;
use dispatch_core::coordinator::DispatchCoordinator;
use dispatch_core::events::InboundEvent;
use dispatch_core::store::{InMemoryHistoryStore, RideRecord};
use dispatch_runtime::{DispatchService, RuntimeConfig};

#[derive(Parser, Debug)]
#[command(name = "dispatchd", about = "Ride dispatch event processor")]
struct Cli {
    /// Dispatch config (JSON). Defaults apply when omitted.
    #[arg(long, env = "DISPATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Inbound events, one JSON object per line. Reads stdin when omitted.
    #[arg(long)]
    events: Option<PathBuf>,

    /// Ride history to seed the earnings ledger from (JSON lines).
    #[arg(long)]
    history: Option<PathBuf>,

    #[arg(long, default_value_t = 1_000)]
    tick_ms: u64,

    #[arg(long, default_value_t = 4)]
    workers: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dispatchd=info,dispatch_runtime=info,dispatch_core=info".into()),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => DispatchConfig::from_path(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => DispatchConfig::default(),
    };

    let history = match &cli.history {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("reading history from {}", path.display()))?;
            InMemoryHistoryStore::with_records(parse_lines::<RideRecord>(&contents, "history")?)
        }
        None => InMemoryHistoryStore::new(),
    };

    let coordinator = Arc::new(
        DispatchCoordinator::from_config(&config, Arc::new(SystemClock), Arc::new(history))
            .context("building dispatch coordinator")?,
    );
    if cli.history.is_some() {
        let outcomes = coordinator
            .ledger()
            .recompute_all()
            .context("recomputing earnings from history")?;
        let drifted = outcomes.iter().filter(|outcome| outcome.drifted()).count();
        tracing::info!(drivers = outcomes.len(), drifted, "earnings rebuilt from history");
    }

    let input = match &cli.events {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("reading events from {}", path.display()))?,
        None => std::io::read_to_string(std::io::stdin()).context("reading events from stdin")?,
    };
    let events = parse_lines::<InboundEvent>(&input, "events")?;

    let runtime = RuntimeConfig::default()
        .with_workers(cli.workers)
        .with_tick_interval(Duration::from_millis(cli.tick_ms.max(1)));
    let (service, mut deliveries) = DispatchService::start(coordinator.clone(), runtime);

    let printer = tokio::spawn(async move {
        let mut written = 0usize;
        while let Some(delivery) = deliveries.recv().await {
            match serde_json::to_string(&delivery) {
                Ok(line) => println!("{line}"),
                Err(err) => tracing::error!(error = %err, "failed to encode delivery"),
            }
            written += 1;
        }
        written
    });

    let submitted = events.len();
    for event in events {
        service.submit(event).await?;
    }
    service.shutdown().await?;
    let written = printer.await?;

    let snapshot = coordinator.telemetry().snapshot();
    println!(
        "{}",
        serde_json::json!({ "kind": "telemetry", "snapshot": snapshot })
    );
    tracing::info!(
        submitted,
        written,
        match_rate = snapshot.match_rate(),
        "replay finished"
    );
    Ok(())
}

fn parse_lines<T: serde::de::DeserializeOwned>(contents: &str, what: &str) -> Result<Vec<T>> {
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(index, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("{what} line {}: invalid JSON", index + 1))
        })
        .collect()
}
