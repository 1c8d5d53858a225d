//! Tokio host for the dispatch coordinator.
//!
//! Inbound events are sharded across workers by session key, so events from
//! one session are handled in arrival order while different sessions run in
//! parallel. A ticker task drives acceptance timeouts and search retries.
//! Everything the coordinator produces, including rejections, is forwarded on
//! a single outbound channel.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use dispatch_core::coordinator::DispatchCoordinator;
use dispatch_core::events::{InboundEvent, OutboundEvent};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub workers: usize,
    pub tick_interval: Duration,
    /// Per-worker inbound buffer.
    pub inbound_buffer: usize,
    pub outbound_buffer: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            tick_interval: Duration::from_secs(1),
            inbound_buffer: 256,
            outbound_buffer: 1_024,
        }
    }
}

impl RuntimeConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }
}

/// What the service hands to the transport layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Delivery {
    Event {
        event: OutboundEvent,
    },
    Rejected {
        session: String,
        event: &'static str,
        error: String,
        retryable: bool,
    },
}

pub struct DispatchService {
    shards: Vec<mpsc::Sender<InboundEvent>>,
    workers: Vec<JoinHandle<()>>,
    ticker: JoinHandle<()>,
    stop_ticker: watch::Sender<bool>,
}

impl DispatchService {
    /// Spawns the workers and the ticker on the current tokio runtime.
    pub fn start(
        coordinator: Arc<DispatchCoordinator>,
        config: RuntimeConfig,
    ) -> (Self, mpsc::Receiver<Delivery>) {
        let (out_tx, out_rx) = mpsc::channel(config.outbound_buffer.max(1));
        let worker_count = config.workers.max(1);

        let mut shards = Vec::with_capacity(worker_count);
        let mut workers = Vec::with_capacity(worker_count);
        for shard in 0..worker_count {
            let (tx, rx) = mpsc::channel(config.inbound_buffer.max(1));
            shards.push(tx);
            workers.push(tokio::spawn(run_worker(
                shard,
                coordinator.clone(),
                rx,
                out_tx.clone(),
            )));
        }

        let (stop_ticker, stop_rx) = watch::channel(false);
        let ticker = tokio::spawn(run_ticker(
            coordinator,
            config.tick_interval,
            stop_rx,
            out_tx,
        ));

        tracing::info!(
            workers = worker_count,
            tick_ms = config.tick_interval.as_millis() as u64,
            "dispatch service started"
        );
        (
            Self {
                shards,
                workers,
                ticker,
                stop_ticker,
            },
            out_rx,
        )
    }

    pub fn shard_for(&self, session_key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        session_key.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    pub async fn submit(&self, event: InboundEvent) -> Result<()> {
        let shard = self.shard_for(event.session_key());
        self.shards[shard]
            .send(event)
            .await
            .map_err(|_| anyhow!("dispatch worker {shard} has stopped"))
    }

    /// Stops accepting events, lets workers drain their queues, then stops the
    /// ticker. The outbound channel closes once everything has finished.
    pub async fn shutdown(self) -> Result<()> {
        let Self {
            shards,
            workers,
            ticker,
            stop_ticker,
        } = self;
        drop(shards);
        for worker in workers {
            worker.await?;
        }
        // The ticker may already be gone if the outbound side was dropped.
        let _ = stop_ticker.send(true);
        ticker.await?;
        tracing::info!("dispatch service stopped");
        Ok(())
    }
}

async fn run_worker(
    shard: usize,
    coordinator: Arc<DispatchCoordinator>,
    mut inbound: mpsc::Receiver<InboundEvent>,
    outbound: mpsc::Sender<Delivery>,
) {
    while let Some(event) = inbound.recv().await {
        let session = event.session_key().to_string();
        let name = event.name();
        let deliveries = match coordinator.handle(event) {
            Ok(events) => events
                .into_iter()
                .map(|event| Delivery::Event { event })
                .collect(),
            Err(err) => {
                tracing::warn!(shard, session = %session, event = name, error = %err, "event rejected");
                vec![Delivery::Rejected {
                    session,
                    event: name,
                    retryable: err.is_retryable(),
                    error: err.to_string(),
                }]
            }
        };
        if !forward(&outbound, deliveries).await {
            tracing::warn!(shard, "outbound channel closed; worker exiting");
            return;
        }
    }
    tracing::debug!(shard, "dispatch worker drained");
}

async fn run_ticker(
    coordinator: Arc<DispatchCoordinator>,
    period: Duration,
    mut stop: watch::Receiver<bool>,
    outbound: mpsc::Sender<Delivery>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let events = coordinator.tick();
                if !events.is_empty() {
                    tracing::debug!(events = events.len(), "tick produced events");
                }
                let deliveries = events.into_iter().map(|event| Delivery::Event { event }).collect();
                if !forward(&outbound, deliveries).await {
                    return;
                }
            }
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    return;
                }
            }
        }
    }
}

async fn forward(outbound: &mpsc::Sender<Delivery>, deliveries: Vec<Delivery>) -> bool {
    for delivery in deliveries {
        if outbound.send(delivery).await.is_err() {
            return false;
        }
    }
    true
}
