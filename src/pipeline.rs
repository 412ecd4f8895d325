//! Wiring between the pipeline stages and the two periodic cycles.
//!
//! ```text
//! EdgeSource ──edges──▶ EdgeFilter ──append──▶ StagingBuffer
//!                                                   │ flush cycle
//!                                                   ▼
//!                         collector ◀──upload── EventLog
//! ```
//!
//! Each cycle sleeps its period, checks for shutdown, then does its work, so
//! an in-flight flush or upload always completes before the cycle exits.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::buffer::StagingBuffer;
use crate::client::Collector;
use crate::config::Config;
use crate::edge::{EdgeFilter, FilterConfig, WallClock};
use crate::error::Result;
use crate::source::EdgeSink;
use crate::store::{self, EventLog};
use crate::uploader::Uploader;

/// Sends the shutdown request to every cycle.
#[derive(Debug)]
pub struct ShutdownTrigger(watch::Sender<bool>);

impl ShutdownTrigger {
    /// Ask every cycle to stop after its current step.
    pub fn trigger(&self) {
        self.0.send_replace(true);
    }
}

/// Observes the shutdown request. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Shutdown(watch::Receiver<bool>);

impl Shutdown {
    /// Whether shutdown was requested.
    pub fn is_requested(&self) -> bool {
        *self.0.borrow()
    }

    /// Sleep for `period`, returning early with `true` if shutdown arrives.
    pub async fn sleep(&mut self, period: Duration) -> bool {
        if self.is_requested() {
            return true;
        }
        let trigger_dropped = tokio::select! {
            _ = tokio::time::sleep(period) => false,
            changed = self.0.changed() => changed.is_err(),
        };
        trigger_dropped || self.is_requested()
    }
}

/// Create a linked shutdown trigger and observer.
pub fn shutdown_channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger(tx), Shutdown(rx))
}

/// Shared state of a running pipeline.
#[derive(Clone)]
pub struct PipelineContext {
    pub config: Arc<Config>,
    pub buffer: Arc<StagingBuffer>,
    pub log: Arc<EventLog>,
}

impl PipelineContext {
    pub fn new(config: Config, log: EventLog) -> Self {
        let buffer = StagingBuffer::new((&config).into());
        Self {
            config: Arc::new(config),
            buffer: Arc::new(buffer),
            log: Arc::new(log),
        }
    }

    /// Build the edge callback: filter with the system clock, then stage.
    pub fn edge_sink(&self) -> EdgeSink {
        self.edge_sink_with(EdgeFilter::new(FilterConfig::from(self.config.as_ref())))
    }

    /// Build the edge callback around an existing filter.
    pub fn edge_sink_with<C>(&self, mut filter: EdgeFilter<C>) -> EdgeSink
    where
        C: WallClock + Send + 'static,
    {
        let buffer = Arc::clone(&self.buffer);
        Box::new(move |level, tick| {
            if let Some(event) = filter.on_edge(level, tick) {
                buffer.append(event.timestamp_ms);
                info!(
                    count = filter.stats().accepted,
                    pulse_ms = event.pulse.as_millis() as u64,
                    "Press accepted"
                );
            }
        })
    }
}

/// Move everything staged into the durable log.
///
/// On a storage error the batch is put back in front of the buffer and the
/// error returned; nothing is lost or reordered.
pub async fn flush_buffer(buffer: &StagingBuffer, log: &Arc<EventLog>) -> Result<usize> {
    let batch = buffer.drain();
    if batch.is_empty() {
        return Ok(0);
    }

    let count = batch.len();
    // The blocking task takes a copy; `batch` is kept for restore.
    let pending = batch.clone();
    match store::blocking(log, move |log| log.insert_batch(&pending)).await {
        Ok(_) => {
            debug!(count, "Flushed staged presses to durable log");
            Ok(count)
        }
        Err(e) => {
            buffer.restore(batch);
            Err(e)
        }
    }
}

/// Periodically flush the staging buffer until shutdown.
///
/// Presses still staged when shutdown arrives are not flushed; the loss
/// window is at most one flush interval.
pub async fn run_flush_cycle(ctx: PipelineContext, mut shutdown: Shutdown) {
    let period = ctx.buffer.config().flush_interval;
    info!(interval_secs = period.as_secs(), "Flush cycle started");

    while !shutdown.sleep(period).await {
        if let Err(e) = flush_buffer(&ctx.buffer, &ctx.log).await {
            error!(error = %e, buffered = ctx.buffer.len(), "Flush failed; batch kept in buffer");
        }
    }

    if !ctx.buffer.is_empty() {
        warn!(buffered = ctx.buffer.len(), "Unflushed presses dropped at shutdown");
    }
    info!("Flush cycle stopped");
}

/// Periodically run upload cycles until shutdown.
pub async fn run_upload_cycle<C>(mut uploader: Uploader<C>, period: Duration, mut shutdown: Shutdown)
where
    C: Collector + Send,
{
    info!(interval_secs = period.as_secs(), "Upload cycle started");

    while !shutdown.sleep(period).await {
        uploader.run_cycle().await;
    }

    let stats = uploader.stats();
    info!(
        batches_sent = stats.batches_sent,
        events_sent = stats.events_sent,
        failed_attempts = stats.failed_attempts,
        "Upload cycle stopped"
    );
}
