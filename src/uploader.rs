//! Batch uploader: durable log → collector.
//!
//! Each upload tick runs one cycle of a small state machine:
//!
//! ```text
//! Fetch ──none──────────────────────────────▶ Done(Empty)
//!   │
//!   ▼
//! Decide ──partial and too soon──────────────▶ Done(Deferred)
//!   │
//!   ▼
//! Send ──error / non-200──▶ Fail ────────────▶ Done(Failed)
//!   │
//!   ▼
//! Confirm ──mark failed──▶ Fail
//!   │
//!   ▼
//! Done(Delivered)
//! ```
//!
//! A failed cycle leaves every record undelivered; the next tick fetches the
//! same records again. There is no backoff and no retry ceiling. Delivery is
//! at-least-once: a batch the collector accepted but whose confirmation was
//! never recorded locally is sent again.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::{Collector, EventBatch};
use crate::config::Config;
use crate::error::Error;
use crate::store::{self, EventLog, EventRecord};

/// Configuration for the uploader.
#[derive(Debug, Clone)]
pub struct UploaderConfig {
    /// Identifier sent as `raspi_no`
    pub source_id: String,

    /// Maximum records per request; a full batch is sent immediately
    pub max_batch: usize,

    /// Partial batches wait this long after the last successful send
    pub min_send_interval: Duration,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            source_id: "raspi_01".to_string(),
            max_batch: 100,
            min_send_interval: Duration::from_secs(20),
        }
    }
}

impl From<&Config> for UploaderConfig {
    fn from(config: &Config) -> Self {
        Self {
            source_id: config.source_id.clone(),
            max_batch: config.max_batch,
            min_send_interval: config.min_send_interval,
        }
    }
}

/// How one upload cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing to send
    Empty,
    /// A partial batch is waiting for the send interval
    Deferred { pending: usize },
    /// The collector acknowledged this many records
    Delivered { count: usize },
    /// Send or storage failed; records stay undelivered
    Failed,
}

/// Statistics about upload cycles.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploaderStats {
    /// Batches acknowledged by the collector
    pub batches_sent: u64,

    /// Records marked delivered
    pub events_sent: u64,

    /// Cycles ending in failure
    pub failed_attempts: u64,

    /// Cycles that held back a partial batch
    pub deferred_cycles: u64,
}

enum Phase {
    Fetch,
    Decide(Vec<EventRecord>),
    Send(Vec<EventRecord>),
    Confirm(Vec<i64>),
    Fail(Error),
    Done(CycleOutcome),
}

/// Whether a batch of `batch_len` records goes out now.
///
/// Full batches always do. Partial ones wait until `min_send_interval` has
/// passed since the last successful send; before any send they go at once.
pub fn should_send(
    batch_len: usize,
    max_batch: usize,
    since_last_send: Option<Duration>,
    min_send_interval: Duration,
) -> bool {
    batch_len >= max_batch || since_last_send.map_or(true, |elapsed| elapsed >= min_send_interval)
}

/// Forwards undelivered records from the durable log to a collector.
pub struct Uploader<C> {
    config: UploaderConfig,
    log: Arc<EventLog>,
    collector: C,
    last_sent: Option<Instant>,
    stats: UploaderStats,
}

impl<C: Collector> Uploader<C> {
    pub fn new(config: UploaderConfig, log: Arc<EventLog>, collector: C) -> Self {
        Self {
            config,
            log,
            collector,
            last_sent: None,
            stats: UploaderStats::default(),
        }
    }

    /// Run one full cycle of the state machine.
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        let mut phase = Phase::Fetch;
        loop {
            phase = match phase {
                Phase::Done(outcome) => return outcome,
                other => self.step(other).await,
            };
        }
    }

    async fn step(&mut self, phase: Phase) -> Phase {
        match phase {
            Phase::Fetch => {
                let limit = self.config.max_batch;
                match store::blocking(&self.log, move |log| log.fetch_undelivered(limit)).await {
                    Ok(records) if records.is_empty() => Phase::Done(CycleOutcome::Empty),
                    Ok(records) => Phase::Decide(records),
                    Err(e) => Phase::Fail(e),
                }
            }

            Phase::Decide(records) => {
                let since_last_send = self.last_sent.map(|at| at.elapsed());
                if should_send(
                    records.len(),
                    self.config.max_batch,
                    since_last_send,
                    self.config.min_send_interval,
                ) {
                    Phase::Send(records)
                } else {
                    self.stats.deferred_cycles += 1;
                    debug!(pending = records.len(), "Holding partial batch");
                    Phase::Done(CycleOutcome::Deferred {
                        pending: records.len(),
                    })
                }
            }

            Phase::Send(records) => {
                let batch = EventBatch::from_records(self.config.source_id.clone(), &records);
                match self.collector.send_batch(&batch).await {
                    Ok(ack) => {
                        debug!(status = %ack.status, received = ack.received, "Collector acknowledged batch");
                        Phase::Confirm(records.iter().map(|r| r.id).collect())
                    }
                    Err(e) => Phase::Fail(e.into()),
                }
            }

            Phase::Confirm(ids) => {
                let count = ids.len();
                if let Err(e) = store::blocking(&self.log, move |log| log.mark_delivered(&ids)).await {
                    return Phase::Fail(e);
                }

                self.last_sent = Some(Instant::now());
                self.stats.batches_sent += 1;
                self.stats.events_sent += count as u64;

                match store::blocking(&self.log, |log| log.counts()).await {
                    Ok(counts) => info!(
                        batch_size = count,
                        delivered = counts.delivered,
                        total = counts.total,
                        "Batch delivered"
                    ),
                    Err(e) => info!(batch_size = count, error = %e, "Batch delivered; log counts unavailable"),
                }
                Phase::Done(CycleOutcome::Delivered { count })
            }

            Phase::Fail(error) => {
                self.stats.failed_attempts += 1;
                match error {
                    Error::Client(e) => warn!(error = %e, "Upload failed; retrying next tick"),
                    e => warn!(error = %e, "Durable log unavailable during upload"),
                }
                Phase::Done(CycleOutcome::Failed)
            }

            done @ Phase::Done(_) => done,
        }
    }

    /// Get current uploader statistics.
    pub fn stats(&self) -> &UploaderStats {
        &self.stats
    }

    /// Get the collector this uploader sends to.
    pub fn collector(&self) -> &C {
        &self.collector
    }
}
