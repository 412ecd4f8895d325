//! Press Counter Library
//!
//! This library provides the stages of a switch press counter that survives
//! restarts and network outages:
//!
//! - **edge**: Debounce filter turning raw edges into accepted presses
//! - **source**: Edge sources (libgpiod `gpiomon`, simulated switch, scripted)
//! - **buffer**: Mutex-guarded staging buffer between the callback and storage
//! - **store**: SQLite durable log with per-record delivery state
//! - **client**: HTTP client for the collector's batch endpoint
//! - **uploader**: Batch uploader state machine
//! - **pipeline**: Flush and upload cycles with cooperative shutdown
//! - **config**: Environment-based configuration
//!
//! # Example
//!
//! ```no_run
//! use press_counter::client::CollectorClient;
//! use press_counter::config::Config;
//! use press_counter::pipeline::{run_flush_cycle, run_upload_cycle, shutdown_channel, PipelineContext};
//! use press_counter::source::{EdgeSource, SimulatedSource};
//! use press_counter::store::EventLog;
//! use press_counter::uploader::Uploader;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("Failed to load config");
//!     let log = EventLog::open(&config.db_path).expect("Failed to open durable log");
//!     let client = CollectorClient::new(&config).expect("Failed to create client");
//!
//!     let ctx = PipelineContext::new(config, log);
//!     let _source = Box::new(SimulatedSource::with_defaults())
//!         .listen(ctx.edge_sink())
//!         .expect("Failed to attach input");
//!
//!     let (trigger, shutdown) = shutdown_channel();
//!     let uploader = Uploader::new(ctx.config.as_ref().into(), ctx.log.clone(), client);
//!     tokio::spawn(run_flush_cycle(ctx.clone(), shutdown.clone()));
//!     tokio::spawn(run_upload_cycle(uploader, ctx.config.upload_tick, shutdown));
//!
//!     tokio::signal::ctrl_c().await.ok();
//!     trigger.trigger();
//! }
//! ```

// Module declarations
pub mod buffer;
pub mod client;
pub mod config;
pub mod edge;
pub mod error;
pub mod pipeline;
pub mod source;
pub mod store;
pub mod uploader;

// Re-export commonly used types at crate root for convenience
pub use buffer::{BufferConfig, BufferStats, StagingBuffer};
pub use client::{ClientError, Collector, CollectorAck, CollectorClient, EventBatch, WireEvent};
pub use config::{Config, ConfigError, InputKind};
pub use edge::{AcceptedEvent, EdgeFilter, FilterConfig, Level, Tick};
pub use error::{Error, Result};
pub use pipeline::{PipelineContext, Shutdown, ShutdownTrigger};
pub use source::{EdgeSource, ScriptedSource, SourceError, SourceHandle};
pub use store::{EventLog, EventRecord, LogCounts};
pub use uploader::{CycleOutcome, Uploader, UploaderConfig, UploaderStats};
