//! Press Counter - switch press daemon for the edge-to-cloud pipeline
//!
//! Watches one input line, debounces it into press events, stores every
//! accepted press durably in SQLite and batch-uploads them to the collector.
//!
//! ## Features
//!
//! - Bounce, double-trigger and power-on transient rejection
//! - Presses survive restarts and network outages (durable log)
//! - Full batches sent immediately, partial batches rate-limited
//! - Graceful shutdown on SIGINT
//!
//! ## Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! - `PRESS_COUNTER_API_URL`: Collector URL (default: http://localhost:8000/api/iot/events)
//! - `PRESS_COUNTER_SOURCE_ID`: Device identifier (default: raspi_01)
//! - `PRESS_COUNTER_DB_PATH`: SQLite file (default: press_events.db)
//! - `PRESS_COUNTER_INPUT`: `gpiomon` or `simulated` (default: gpiomon)
//! - `PRESS_COUNTER_GPIO_CHIP` / `PRESS_COUNTER_GPIO_LINE`: Input line (default: gpiochip0 / 27)
//! - `PRESS_COUNTER_FLUSH_INTERVAL_SECS`: Buffer flush period (default: 3)
//! - `PRESS_COUNTER_UPLOAD_TICK_SECS`: Upload cycle period (default: 1)
//! - `PRESS_COUNTER_MIN_SEND_INTERVAL_SECS`: Partial batch spacing (default: 20)
//! - `RUST_LOG`: Logging level filter (default: info)

use std::io::Write;
use std::time::Duration;

use tokio::time::interval;
use tracing_appender::non_blocking::{NonBlocking, NonBlockingBuilder, WorkerGuard};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use press_counter::client::CollectorClient;
use press_counter::config::{Config, InputKind};
use press_counter::pipeline::{run_flush_cycle, run_upload_cycle, shutdown_channel, PipelineContext};
use press_counter::source::{EdgeSource, GpiomonSource, SimulatedSource, SourceHandle};
use press_counter::store::EventLog;
use press_counter::uploader::Uploader;

/// How often the input source is checked for liveness
const SOURCE_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound on waiting for the cycles to finish at shutdown
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber with environment filter; the guard
    // flushes buffered log lines when main returns
    let _log_guard = init_tracing();

    info!("Starting press counter...");

    // Load configuration from environment
    let config = match Config::from_env() {
        Ok(config) => {
            info!(
                api_url = %config.api_url,
                source_id = %config.source_id,
                db_path = %config.db_path.display(),
                input = ?config.input,
                max_batch = config.max_batch,
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    // Open the durable log; unsent presses from earlier runs are picked up
    let log = match EventLog::open(&config.db_path) {
        Ok(log) => {
            match log.counts() {
                Ok(counts) => info!(
                    total = counts.total,
                    pending = counts.pending,
                    "Durable log opened"
                ),
                Err(e) => warn!(error = %e, "Durable log opened but counts unavailable"),
            }
            log
        }
        Err(e) => {
            error!(error = %e, path = %config.db_path.display(), "Failed to open durable log");
            std::process::exit(1);
        }
    };

    // Create HTTP client with connection pooling
    let client = match CollectorClient::new(&config) {
        Ok(client) => {
            info!(api_url = %client.api_url(), "HTTP client initialized");
            client
        }
        Err(e) => {
            error!(error = %e, "Failed to create HTTP client");
            std::process::exit(1);
        }
    };

    let ctx = PipelineContext::new(config, log);

    let source: Box<dyn EdgeSource> = match ctx.config.input {
        InputKind::Gpiomon => Box::new(GpiomonSource::from_config(&ctx.config)),
        InputKind::Simulated => Box::new(SimulatedSource::with_defaults()),
    };
    let source = match source.listen(ctx.edge_sink()) {
        Ok(handle) => {
            info!(
                source = handle.name(),
                quiet_secs = ctx.config.startup_quiet.as_secs(),
                "Input line attached"
            );
            handle
        }
        Err(e) => {
            error!(error = %e, "Failed to attach input line");
            std::process::exit(1);
        }
    };

    let (trigger, shutdown) = shutdown_channel();

    let flush_handle = tokio::spawn(run_flush_cycle(ctx.clone(), shutdown.clone()));

    let uploader = Uploader::new(ctx.config.as_ref().into(), ctx.log.clone(), client);
    let upload_handle = tokio::spawn(run_upload_cycle(uploader, ctx.config.upload_tick, shutdown));

    // Wait for shutdown signal or loss of the input line
    info!("Press counter running. Press Ctrl+C to stop.");
    let exit_code = wait_for_exit(&source).await;

    // Graceful shutdown
    info!("Initiating graceful shutdown...");
    trigger.trigger();

    // Stopping the source kills the driver and joins its reader thread
    if let Err(e) = tokio::task::spawn_blocking(move || source.stop()).await {
        warn!(error = %e, "Input source panicked while stopping");
    }

    // Wait for the cycles to finish their last step (with timeout)
    for (name, handle) in [("flush", flush_handle), ("upload", upload_handle)] {
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await {
            Ok(Ok(())) => {
                info!(cycle = name, "Cycle shut down gracefully");
            }
            Ok(Err(e)) => {
                warn!(cycle = name, error = %e, "Cycle panicked during shutdown");
            }
            Err(_) => {
                warn!(cycle = name, "Cycle shutdown timed out after {:?}", SHUTDOWN_TIMEOUT);
            }
        }
    }

    info!("Press counter stopped");
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
}

/// Initialize the tracing subscriber with environment-based filtering.
///
/// Lines go through a background writer so the edge callback never waits on
/// stdout.
fn init_tracing() -> WorkerGuard {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let (writer, guard) = non_blocking_writer(std::io::stdout());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();

    guard
}

/// Wrap `out` in a lossy background writer; a stalled sink drops lines
/// instead of blocking the logging thread.
fn non_blocking_writer<W>(out: W) -> (NonBlocking, WorkerGuard)
where
    W: Write + Send + 'static,
{
    NonBlockingBuilder::default().lossy(true).finish(out)
}

/// Wait for Ctrl+C, or for the source to die. Returns the process exit code.
async fn wait_for_exit(source: &SourceHandle) -> i32 {
    let mut ticker = interval(SOURCE_CHECK_INTERVAL);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            signal = &mut ctrl_c => {
                match signal {
                    Ok(()) => info!("Shutdown signal received, stopping..."),
                    Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
                }
                return 0;
            }
            _ = ticker.tick() => {
                if !source.is_alive() {
                    error!(source = source.name(), "Input line lost");
                    return 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use press_counter::source::ScriptedSource;
    use std::sync::mpsc;

    /// Blocks every write until released.
    struct StalledWriter(mpsc::Receiver<()>);

    impl Write for StalledWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let _ = self.0.recv();
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_stalled_output_does_not_block_logging() {
        let (release, stalled) = mpsc::channel();
        let (mut writer, guard) = non_blocking_writer(StalledWriter(stalled));

        let started = std::time::Instant::now();
        for _ in 0..10_000 {
            writer.write_all(b"Press accepted\n").unwrap();
        }
        assert!(started.elapsed() < Duration::from_secs(1));

        drop(release);
        drop(guard);
    }

    #[tokio::test]
    async fn test_dead_source_exits_with_failure() {
        let source = Box::new(ScriptedSource::default())
            .listen(Box::new(|_, _| {}))
            .unwrap();
        assert!(!source.is_alive());

        let code = tokio::time::timeout(Duration::from_secs(5), wait_for_exit(&source))
            .await
            .expect("a dead source should end the wait");
        assert_eq!(code, 1);
    }
}
