//! Edge sources: where raw `(level, tick)` transitions come from.
//!
//! The pipeline depends only on [`EdgeSource`]. Concrete adapters:
//!
//! - [`GpiomonSource`]: a real input line through libgpiod's `gpiomon`
//! - [`SimulatedSource`]: a synthetic operator with realistic contact bounce
//! - [`ScriptedSource`]: a fixed edge list, for tests

pub mod gpiomon;
pub mod simulated;

use std::process::Child;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use thiserror::Error;
use tracing::{debug, warn};

use crate::edge::{Level, Tick};

pub use gpiomon::GpiomonSource;
pub use simulated::{SimulatedSource, SimulatorConfig};

/// Callback receiving every raw edge. Must return quickly.
pub type EdgeSink = Box<dyn FnMut(Level, Tick) + Send + 'static>;

/// Errors raised while attaching to an input line.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The driver process could not be started
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The driver exited while the line was being configured
    #[error("{program} exited during startup ({status}): {stderr}")]
    Exited {
        program: String,
        status: String,
        stderr: String,
    },

    /// The driver's output stream was not available
    #[error("{0} produced no output stream")]
    NoOutput(String),

    /// A reader thread could not be spawned
    #[error("failed to spawn reader thread: {0}")]
    Thread(#[source] std::io::Error),
}

/// A single-method capability delivering edges to a sink.
///
/// `listen` attaches to the line and returns once edges are flowing (or have
/// all been delivered). Edges stop when the returned handle is dropped.
pub trait EdgeSource {
    fn listen(self: Box<Self>, sink: EdgeSink) -> Result<SourceHandle, SourceError>;
}

/// Keeps a running source alive; stops it on drop.
pub struct SourceHandle {
    name: &'static str,
    stop: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
    child: Option<Child>,
    thread: Option<JoinHandle<()>>,
}

impl SourceHandle {
    fn new(
        name: &'static str,
        stop: Arc<AtomicBool>,
        alive: Arc<AtomicBool>,
        child: Option<Child>,
        thread: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            name,
            stop,
            alive,
            child,
            thread,
        }
    }

    /// Handle for a source that already delivered everything.
    fn finished(name: &'static str) -> Self {
        Self::new(
            name,
            Arc::new(AtomicBool::new(true)),
            Arc::new(AtomicBool::new(false)),
            None,
            None,
        )
    }

    /// Short name of the source, for logging.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the source is still delivering edges.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Stop the source and wait for its reader thread.
    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for SourceHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);

        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                debug!(error = %e, source = self.name, "Driver already exited");
            }
            let _ = child.wait();
        }

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(source = self.name, "Edge reader thread panicked");
            }
        }
    }
}

/// Replays a fixed list of edges synchronously inside `listen`.
#[derive(Debug, Clone, Default)]
pub struct ScriptedSource {
    edges: Vec<(Level, Tick)>,
}

impl ScriptedSource {
    pub fn new(edges: Vec<(Level, Tick)>) -> Self {
        Self { edges }
    }

    /// Append one press/release cycle.
    pub fn press(mut self, at: Tick, hold_micros: u64) -> Self {
        self.edges.push((Level::Active, at));
        self.edges.push((
            Level::Inactive,
            Tick::from_micros(at.as_micros() + hold_micros),
        ));
        self
    }
}

impl EdgeSource for ScriptedSource {
    fn listen(self: Box<Self>, mut sink: EdgeSink) -> Result<SourceHandle, SourceError> {
        for (level, tick) in self.edges {
            sink(level, tick);
        }
        Ok(SourceHandle::finished("scripted"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_scripted_source_delivers_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();

        let source = ScriptedSource::default()
            .press(Tick::from_millis(0), 15_000)
            .press(Tick::from_millis(500), 40_000);

        let handle = Box::new(source)
            .listen(Box::new(move |level, tick| {
                seen_clone.lock().unwrap().push((level, tick));
            }))
            .unwrap();

        assert!(!handle.is_alive());
        assert_eq!(handle.name(), "scripted");

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                (Level::Active, Tick::from_millis(0)),
                (Level::Inactive, Tick::from_millis(15)),
                (Level::Active, Tick::from_millis(500)),
                (Level::Inactive, Tick::from_millis(540)),
            ]
        );
    }

    #[test]
    fn test_source_error_display() {
        let err = SourceError::Exited {
            program: "gpiomon".to_string(),
            status: "exit status: 1".to_string(),
            stderr: "unable to request lines".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("gpiomon"));
        assert!(text.contains("unable to request lines"));
    }
}
