//! Staging buffer between the edge callback and the durable log.
//!
//! The edge callback appends accepted timestamps under a short critical
//! section; the flush cycle drains everything at once and hands it to the
//! durable log. A failed durable write puts the batch back at the front so
//! acceptance order is preserved.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::Config;

/// Maximum buffer capacity to prevent memory issues while storage is failing.
/// If the buffer exceeds this, the oldest timestamps are dropped.
const MAX_BUFFER_CAPACITY: usize = 100_000;

/// Initial allocation, sized for a few seconds of furious pressing.
const INITIAL_CAPACITY: usize = 64;

/// Configuration for the staging buffer.
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Period of the flush cycle draining this buffer
    pub flush_interval: Duration,

    /// Maximum number of timestamps to hold
    pub max_capacity: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(3),
            max_capacity: MAX_BUFFER_CAPACITY,
        }
    }
}

impl BufferConfig {
    /// Create a new buffer config with the specified flush interval and bound.
    pub fn new(flush_interval: Duration, max_capacity: usize) -> Self {
        Self {
            flush_interval,
            max_capacity,
        }
    }
}

impl From<&Config> for BufferConfig {
    fn from(config: &Config) -> Self {
        Self::new(config.flush_interval, config.buffer_capacity)
    }
}

/// Statistics about buffer operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferStats {
    /// Total number of timestamps appended
    pub appended: u64,

    /// Total number of timestamps handed to the durable log
    pub drained: u64,

    /// Total number of timestamps put back after a failed write
    pub restored: u64,

    /// Total number of timestamps dropped due to buffer overflow
    pub dropped: u64,
}

struct Inner {
    events: Vec<i64>,
    stats: BufferStats,
}

/// Ordered, mutex-guarded holding area for accepted event timestamps.
///
/// # Example
///
/// ```
/// use press_counter::buffer::{BufferConfig, StagingBuffer};
///
/// let buffer = StagingBuffer::new(BufferConfig::default());
/// buffer.append(1_700_000_000_000);
/// buffer.append(1_700_000_000_250);
///
/// assert_eq!(buffer.drain(), vec![1_700_000_000_000, 1_700_000_000_250]);
/// assert!(buffer.is_empty());
/// ```
pub struct StagingBuffer {
    inner: Mutex<Inner>,
    config: BufferConfig,
}

impl StagingBuffer {
    /// Create a new staging buffer with the given configuration.
    pub fn new(config: BufferConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                events: Vec::with_capacity(INITIAL_CAPACITY),
                stats: BufferStats::default(),
            }),
            config,
        }
    }

    /// Create a new staging buffer with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(BufferConfig::default())
    }

    // A panic while holding the lock cannot leave the Vec half-written, so
    // poisoning is ignored rather than losing every later press.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append one accepted timestamp.
    pub fn append(&self, timestamp_ms: i64) {
        let mut inner = self.lock();
        inner.stats.appended += 1;
        Self::make_room(&mut inner, self.config.max_capacity, 1);
        inner.events.push(timestamp_ms);
    }

    /// Atomically take the full contents, oldest first, leaving the buffer empty.
    pub fn drain(&self) -> Vec<i64> {
        let mut inner = self.lock();
        let events = std::mem::take(&mut inner.events);
        inner.stats.drained += events.len() as u64;
        events
    }

    /// Put a drained batch back in front of anything appended since.
    ///
    /// Used when the durable write for `batch` failed; the events are retried
    /// on the next flush.
    pub fn restore(&self, mut batch: Vec<i64>) {
        if batch.is_empty() {
            return;
        }

        let mut inner = self.lock();
        let count = batch.len() as u64;
        inner.stats.drained = inner.stats.drained.saturating_sub(count);
        inner.stats.restored += count;

        batch.append(&mut inner.events);
        inner.events = batch;

        let overflow = inner.events.len().saturating_sub(self.config.max_capacity);
        if overflow > 0 {
            Self::drop_oldest(&mut inner, overflow);
        }
        debug!(restored = count, buffered = inner.events.len(), "Batch restored to staging buffer");
    }

    /// Ensure there is room for `incoming` more timestamps.
    fn make_room(inner: &mut Inner, max_capacity: usize, incoming: usize) {
        if inner.events.len() + incoming <= max_capacity {
            return;
        }

        // Drop 10% to avoid dropping on every append
        let drop_count = (inner.events.len() / 10).max(incoming);
        Self::drop_oldest(inner, drop_count);
    }

    fn drop_oldest(inner: &mut Inner, drop_count: usize) {
        let drop_count = drop_count.min(inner.events.len());
        warn!(
            buffer_size = inner.events.len(),
            drop_count = drop_count,
            "Staging buffer overflow: dropping oldest presses"
        );
        inner.events.drain(0..drop_count);
        inner.stats.dropped += drop_count as u64;
    }

    /// Get the current number of timestamps in the buffer.
    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().events.is_empty()
    }

    /// Get current buffer statistics.
    pub fn stats(&self) -> BufferStats {
        self.lock().stats.clone()
    }

    /// Get the buffer configuration.
    pub fn config(&self) -> &BufferConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_buffer_config_default() {
        let config = BufferConfig::default();
        assert_eq!(config.flush_interval, Duration::from_secs(3));
        assert_eq!(config.max_capacity, MAX_BUFFER_CAPACITY);
    }

    #[test]
    fn test_buffer_config_from_config() {
        let config = Config {
            flush_interval: Duration::from_secs(7),
            buffer_capacity: 42,
            ..Config::default()
        };
        let buffer_config = BufferConfig::from(&config);
        assert_eq!(buffer_config.flush_interval, Duration::from_secs(7));
        assert_eq!(buffer_config.max_capacity, 42);
    }

    #[test]
    fn test_append_and_drain_preserve_order() {
        let buffer = StagingBuffer::with_defaults();
        for ts in [30, 10, 20] {
            buffer.append(ts);
        }

        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.drain(), vec![30, 10, 20]);
        assert!(buffer.is_empty());
        assert!(buffer.drain().is_empty());

        let stats = buffer.stats();
        assert_eq!(stats.appended, 3);
        assert_eq!(stats.drained, 3);
    }

    #[test]
    fn test_restore_goes_in_front_of_new_events() {
        let buffer = StagingBuffer::with_defaults();
        buffer.append(1);
        buffer.append(2);

        let batch = buffer.drain();
        buffer.append(3);
        buffer.restore(batch);

        assert_eq!(buffer.drain(), vec![1, 2, 3]);

        let stats = buffer.stats();
        assert_eq!(stats.restored, 2);
        assert_eq!(stats.drained, 3);
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let buffer = StagingBuffer::new(BufferConfig::new(Duration::from_secs(3), 20));
        for ts in 0..25 {
            buffer.append(ts);
        }

        let events = buffer.drain();
        assert!(events.len() <= 20);
        assert_eq!(events.last(), Some(&24));
        assert!(events.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(buffer.stats().dropped, 25 - events.len() as u64);
    }

    #[test]
    fn test_restore_respects_capacity() {
        let buffer = StagingBuffer::new(BufferConfig::new(Duration::from_secs(3), 4));
        buffer.append(5);
        buffer.append(6);
        buffer.restore(vec![1, 2, 3, 4]);

        assert_eq!(buffer.drain(), vec![3, 4, 5, 6]);
        assert_eq!(buffer.stats().dropped, 2);
    }

    #[test]
    fn test_concurrent_appends_are_never_lost() {
        let buffer = Arc::new(StagingBuffer::with_defaults());
        let mut collected = Vec::new();

        let writers: Vec<_> = (0..4)
            .map(|w| {
                let buffer = buffer.clone();
                thread::spawn(move || {
                    for i in 0..1_000 {
                        buffer.append(w * 1_000 + i);
                    }
                })
            })
            .collect();

        while writers.iter().any(|w| !w.is_finished()) {
            collected.extend(buffer.drain());
        }
        for writer in writers {
            writer.join().unwrap();
        }
        collected.extend(buffer.drain());

        assert_eq!(collected.len(), 4_000);

        // Each writer's own events stay in order
        for w in 0..4 {
            let mine: Vec<i64> = collected
                .iter()
                .copied()
                .filter(|ts| ts / 1_000 == w)
                .collect();
            assert!(mine.windows(2).all(|pair| pair[0] < pair[1]));
        }
    }
}
