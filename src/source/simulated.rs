//! Simulated switch for bench runs without hardware.
//!
//! Generates human-like press actions with the failure modes a real
//! mechanical switch shows: contact bounce on the press edge, sub-threshold
//! glitches, and double-triggers where one push produces two full cycles.

use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

use super::{EdgeSink, EdgeSource, SourceError, SourceHandle};
use crate::edge::{Level, Tick};

/// Sleep granularity while waiting between actions, so stop requests are seen quickly.
const STOP_POLL: Duration = Duration::from_millis(50);

/// Kinds of human action the simulator produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressKind {
    /// One press, one release
    Clean,
    /// Press edge chatters before settling
    Bouncy,
    /// One push registering as two full cycles
    DoubleTrigger,
    /// A spike too short to be a press
    Glitch,
}

impl PressKind {
    /// Number of presses a correct filter should accept for this action.
    pub fn expected_presses(&self) -> u64 {
        match self {
            PressKind::Glitch => 0,
            _ => 1,
        }
    }
}

/// Configuration for the simulated switch.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Pause between the end of one action and the start of the next
    pub gap_ms: RangeInclusive<u64>,

    /// How long a press is held
    pub hold_ms: RangeInclusive<u64>,

    /// Percent of actions with contact bounce (0 - 100)
    pub bouncy_pct: u32,

    /// Percent of actions that double-trigger (0 - 100)
    pub double_trigger_pct: u32,

    /// Percent of actions that are glitches (0 - 100)
    pub glitch_pct: u32,

    /// Fixed RNG seed for reproducible runs
    pub seed: Option<u64>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            gap_ms: 300..=2_000,
            hold_ms: 40..=150,
            bouncy_pct: 20,
            double_trigger_pct: 5,
            glitch_pct: 5,
            seed: None,
        }
    }
}

/// Produces the raw edges of one human action at a time.
#[derive(Debug, Clone)]
pub struct PressGenerator {
    config: SimulatorConfig,
}

impl PressGenerator {
    pub fn new(config: SimulatorConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::new(SimulatorConfig::default())
    }

    /// Pick the kind of the next action.
    pub fn choose_kind(&self, rng: &mut impl Rng) -> PressKind {
        let roll = rng.gen_range(0..100u32);
        let bouncy = self.config.bouncy_pct;
        let double = bouncy + self.config.double_trigger_pct;
        let glitch = double + self.config.glitch_pct;

        if roll < bouncy {
            PressKind::Bouncy
        } else if roll < double {
            PressKind::DoubleTrigger
        } else if roll < glitch {
            PressKind::Glitch
        } else {
            PressKind::Clean
        }
    }

    /// Generate the edges of one action starting at `start`.
    pub fn generate(&self, rng: &mut impl Rng, kind: PressKind, start: Tick) -> Vec<(Level, Tick)> {
        let at = |offset_us: u64| Tick::from_micros(start.as_micros() + offset_us);
        let hold_us = rng.gen_range(self.config.hold_ms.clone()) * 1_000;
        let mut edges = vec![(Level::Active, at(0))];

        match kind {
            PressKind::Clean => {
                edges.push((Level::Inactive, at(hold_us)));
            }
            PressKind::Bouncy => {
                let mut offset = 0;
                for _ in 0..rng.gen_range(1..=4) {
                    offset += rng.gen_range(200..=2_000);
                    edges.push((Level::Inactive, at(offset)));
                    offset += rng.gen_range(200..=2_000);
                    edges.push((Level::Active, at(offset)));
                }
                edges.push((Level::Inactive, at(offset + hold_us)));
            }
            PressKind::DoubleTrigger => {
                edges.push((Level::Inactive, at(hold_us)));
                let second = hold_us + rng.gen_range(3_000..=20_000);
                edges.push((Level::Active, at(second)));
                edges.push((Level::Inactive, at(second + rng.gen_range(15_000..=40_000))));
            }
            PressKind::Glitch => {
                edges.push((Level::Inactive, at(rng.gen_range(100..=5_000))));
            }
        }

        edges
    }

    /// Pause before the next action.
    pub fn gap(&self, rng: &mut impl Rng) -> Duration {
        Duration::from_millis(rng.gen_range(self.config.gap_ms.clone()))
    }
}

/// Edge source driven by a [`PressGenerator`] on its own thread, in real time.
#[derive(Debug, Clone)]
pub struct SimulatedSource {
    generator: PressGenerator,
    seed: Option<u64>,
}

impl SimulatedSource {
    pub fn new(config: SimulatorConfig) -> Self {
        let seed = config.seed;
        Self {
            generator: PressGenerator::new(config),
            seed,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(SimulatorConfig::default())
    }
}

impl EdgeSource for SimulatedSource {
    fn listen(self: Box<Self>, mut sink: EdgeSink) -> Result<SourceHandle, SourceError> {
        let stop = Arc::new(AtomicBool::new(false));
        let alive = Arc::new(AtomicBool::new(true));
        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let generator = self.generator;

        let thread = {
            let stop = stop.clone();
            let alive = alive.clone();
            thread::Builder::new()
                .name("simulated-edges".to_string())
                .spawn(move || {
                    let origin = Instant::now();
                    let elapsed = || Tick::from_micros(origin.elapsed().as_micros() as u64);

                    'actions: while !stop.load(Ordering::Acquire) {
                        let mut remaining = generator.gap(&mut rng);
                        while !remaining.is_zero() {
                            if stop.load(Ordering::Acquire) {
                                break 'actions;
                            }
                            let step = remaining.min(STOP_POLL);
                            thread::sleep(step);
                            remaining -= step;
                        }

                        let kind = generator.choose_kind(&mut rng);
                        for (level, tick) in generator.generate(&mut rng, kind, elapsed()) {
                            let now = elapsed();
                            if tick > now {
                                thread::sleep(tick.since(now));
                            }
                            sink(level, tick);
                        }
                    }

                    alive.store(false, Ordering::Release);
                })
                .map_err(SourceError::Thread)?
        };

        info!("Simulated input line attached");
        Ok(SourceHandle::new("simulated", stop, alive, None, Some(thread)))
    }
}
