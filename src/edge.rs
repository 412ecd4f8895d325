//! Edge filter turning a noisy switch line into clean press events.
//!
//! The filter consumes raw level transitions with a monotonic microsecond tick
//! and accepts a press only on release, once the full press-release cycle has
//! passed three checks:
//!
//! - the daemon is past its startup quiet period (power-on transients),
//! - the pulse lasted at least `min_pulse` (contact bounce),
//! - the release is at least `min_interval` after the previous accepted one
//!   (mechanical double-trigger of a single human action).
//!
//! Thresholds are exclusive lower bounds: a pulse of exactly `min_pulse` is
//! accepted.

use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::trace;

use crate::config::Config;

/// Logic level of the input line, already mapped through the active polarity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    /// Switch closed
    Active,
    /// Switch open
    Inactive,
}

impl Level {
    /// Map an electrical level to a logic level.
    pub fn from_electrical(high: bool, active_low: bool) -> Self {
        if high != active_low {
            Level::Active
        } else {
            Level::Inactive
        }
    }
}

/// Monotonic driver timestamp in microseconds.
///
/// Only differences between ticks carry meaning; the base is arbitrary and
/// does not survive restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tick(u64);

impl Tick {
    pub const fn from_micros(micros: u64) -> Self {
        Tick(micros)
    }

    pub const fn from_millis(millis: u64) -> Self {
        Tick(millis * 1_000)
    }

    pub const fn as_micros(self) -> u64 {
        self.0
    }

    /// Time elapsed since `earlier`. A tick that runs backwards yields zero.
    pub fn since(self, earlier: Tick) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0))
    }
}

/// A press that passed every validity rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceptedEvent {
    /// Wall-clock time of acceptance, epoch milliseconds
    pub timestamp_ms: i64,

    /// Measured press duration
    pub pulse: Duration,
}

/// Source of wall-clock timestamps for accepted events.
pub trait WallClock {
    /// Current time in epoch milliseconds.
    fn now_ms(&self) -> i64;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl WallClock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Thresholds for the edge filter.
#[derive(Debug, Clone)]
pub struct FilterConfig {
    /// Pulses shorter than this are discarded as bounce
    pub min_pulse: Duration,

    /// Minimum spacing between two accepted releases
    pub min_interval: Duration,

    /// Edges are ignored for this long after the filter is created
    pub startup_quiet: Duration,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            min_pulse: Duration::from_millis(10),
            min_interval: Duration::from_millis(120),
            startup_quiet: Duration::from_secs(5),
        }
    }
}

impl From<&Config> for FilterConfig {
    fn from(config: &Config) -> Self {
        Self {
            min_pulse: config.min_pulse,
            min_interval: config.min_interval,
            startup_quiet: config.startup_quiet,
        }
    }
}

/// Counters for every way an edge can be handled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterStats {
    /// Presses accepted
    pub accepted: u64,

    /// Edges dropped during the startup quiet period
    pub quiet_period: u64,

    /// Releases rejected as contact bounce
    pub bounces: u64,

    /// Releases rejected as double-triggers
    pub double_triggers: u64,

    /// Releases with no matching press
    pub orphan_releases: u64,
}

/// Stateful debounce filter. One instance per input line.
pub struct EdgeFilter<C = SystemClock> {
    config: FilterConfig,
    clock: C,
    started: Instant,
    press_started_at: Option<Tick>,
    last_accepted_at: Option<Tick>,
    stats: FilterStats,
}

impl EdgeFilter<SystemClock> {
    /// Create a filter stamping events with the system clock.
    pub fn new(config: FilterConfig) -> Self {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: WallClock> EdgeFilter<C> {
    /// Create a filter with a custom wall clock.
    ///
    /// The startup quiet period is measured from this call.
    pub fn with_clock(config: FilterConfig, clock: C) -> Self {
        Self {
            config,
            clock,
            started: Instant::now(),
            press_started_at: None,
            last_accepted_at: None,
            stats: FilterStats::default(),
        }
    }

    /// Feed one raw edge. Returns the accepted event, if this edge completed one.
    pub fn on_edge(&mut self, level: Level, tick: Tick) -> Option<AcceptedEvent> {
        if self.started.elapsed() < self.config.startup_quiet {
            self.stats.quiet_period += 1;
            trace!(?level, tick = tick.as_micros(), "Edge ignored: startup quiet period");
            return None;
        }

        match level {
            Level::Active => {
                self.press_started_at = Some(tick);
                None
            }
            Level::Inactive => {
                let Some(pressed) = self.press_started_at.take() else {
                    self.stats.orphan_releases += 1;
                    trace!(tick = tick.as_micros(), "Release without press ignored");
                    return None;
                };
                self.on_release(pressed, tick)
            }
        }
    }

    fn on_release(&mut self, pressed: Tick, tick: Tick) -> Option<AcceptedEvent> {
        let pulse = tick.since(pressed);
        if pulse < self.config.min_pulse {
            self.stats.bounces += 1;
            trace!(pulse_us = pulse.as_micros() as u64, "Pulse rejected: bounce");
            return None;
        }

        if let Some(last) = self.last_accepted_at {
            let interval = tick.since(last);
            if interval < self.config.min_interval {
                self.stats.double_triggers += 1;
                trace!(
                    interval_us = interval.as_micros() as u64,
                    "Pulse rejected: double trigger"
                );
                return None;
            }
        }

        self.last_accepted_at = Some(tick);
        self.stats.accepted += 1;

        Some(AcceptedEvent {
            timestamp_ms: self.clock.now_ms(),
            pulse,
        })
    }

    /// Whether a press is currently held.
    pub fn is_pressed(&self) -> bool {
        self.press_started_at.is_some()
    }

    /// Get current filter statistics.
    pub fn stats(&self) -> &FilterStats {
        &self.stats
    }
}
