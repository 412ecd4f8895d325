//! Hardware edge source backed by libgpiod's `gpiomon`.
//!
//! The line is requested with a pull bias towards the inactive level, both
//! edges, and the configured glitch filter as the kernel debounce period.
//! `gpiomon` prints one event per line; each is parsed into an electrical
//! level and a monotonic microsecond tick.

use std::io::{BufRead, BufReader, Read};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::{EdgeSink, EdgeSource, SourceError, SourceHandle};
use crate::config::Config;
use crate::edge::{Level, Tick};

const DEFAULT_PROGRAM: &str = "gpiomon";

/// How long the driver must stay up before the line counts as configured.
const STARTUP_PROBE: Duration = Duration::from_millis(300);

/// Edge source reading a GPIO line through a `gpiomon` child process.
#[derive(Debug, Clone)]
pub struct GpiomonSource {
    program: String,
    chip: String,
    line: u32,
    active_low: bool,
    glitch_filter_us: u32,
}

impl GpiomonSource {
    pub fn new(chip: impl Into<String>, line: u32, active_low: bool, glitch_filter_us: u32) -> Self {
        Self {
            program: DEFAULT_PROGRAM.to_string(),
            chip: chip.into(),
            line,
            active_low,
            glitch_filter_us,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.gpio_chip.clone(),
            config.gpio_line,
            config.active_low,
            config.glitch_filter_us,
        )
    }

    /// Use a different executable (e.g. an absolute path to gpiomon).
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn args(&self) -> Vec<String> {
        // Pull towards the released level so a floating switch reads inactive
        let bias = if self.active_low { "pull-up" } else { "pull-down" };
        vec![
            "--chip".to_string(),
            self.chip.clone(),
            "--bias".to_string(),
            bias.to_string(),
            "--edges".to_string(),
            "both".to_string(),
            "--debounce-period".to_string(),
            format!("{}us", self.glitch_filter_us),
            "--format".to_string(),
            "%E %S".to_string(),
            self.line.to_string(),
        ]
    }
}

impl EdgeSource for GpiomonSource {
    fn listen(self: Box<Self>, mut sink: EdgeSink) -> Result<SourceHandle, SourceError> {
        let args = self.args();
        debug!(program = %self.program, ?args, "Starting input line driver");

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| SourceError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        thread::sleep(STARTUP_PROBE);
        if let Ok(Some(status)) = child.try_wait() {
            let mut stderr = String::new();
            if let Some(mut pipe) = child.stderr.take() {
                let _ = pipe.read_to_string(&mut stderr);
            }
            return Err(SourceError::Exited {
                program: self.program.clone(),
                status: status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SourceError::NoOutput(self.program.clone()))?;

        if let Some(stderr) = child.stderr.take() {
            let program = self.program.clone();
            thread::Builder::new()
                .name("gpiomon-stderr".to_string())
                .spawn(move || {
                    for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                        warn!(program = %program, "{}", line);
                    }
                })
                .map_err(SourceError::Thread)?;
        }

        let stop = Arc::new(AtomicBool::new(false));
        let alive = Arc::new(AtomicBool::new(true));
        let active_low = self.active_low;

        let reader = {
            let stop = stop.clone();
            let alive = alive.clone();
            thread::Builder::new()
                .name("gpiomon-edges".to_string())
                .spawn(move || {
                    for line in BufReader::new(stdout).lines().map_while(Result::ok) {
                        if stop.load(Ordering::Acquire) {
                            break;
                        }
                        match parse_event(&line) {
                            Some((high, tick)) => {
                                sink(Level::from_electrical(high, active_low), tick)
                            }
                            None => debug!(line = %line, "Unrecognised gpiomon output"),
                        }
                    }

                    alive.store(false, Ordering::Release);
                    if !stop.load(Ordering::Acquire) {
                        error!("Input line driver stopped delivering edges");
                    }
                })
                .map_err(SourceError::Thread)?
        };

        info!(
            chip = %self.chip,
            line = self.line,
            glitch_filter_us = self.glitch_filter_us,
            "GPIO line requested"
        );

        Ok(SourceHandle::new(
            "gpiomon",
            stop,
            alive,
            Some(child),
            Some(reader),
        ))
    }
}

/// Parse one `gpiomon` output line into `(is_high, tick)`.
///
/// Accepts the `--format "%E %S"` form (`rising 1234.567890123`) as well as
/// the default libgpiod v1 form
/// (`event:  RISING EDGE offset: 27 timestamp: [    1234.567890123]`).
pub fn parse_event(line: &str) -> Option<(bool, Tick)> {
    let mut high = None;
    let mut tick = None;

    for token in line.split_whitespace() {
        if high.is_none() {
            match token.to_ascii_lowercase().as_str() {
                "rising" | "1" => {
                    high = Some(true);
                    continue;
                }
                "falling" | "2" => {
                    high = Some(false);
                    continue;
                }
                _ => {}
            }
        }
        if let Some(parsed) = parse_timestamp(token) {
            tick = Some(parsed);
        }
    }

    Some((high?, tick?))
}

/// Parse `seconds.fraction` (optionally bracketed) into a microsecond tick.
fn parse_timestamp(token: &str) -> Option<Tick> {
    let token = token.trim_matches(|c| c == '[' || c == ']');
    let (secs, frac) = token.split_once('.')?;
    if secs.is_empty() || frac.is_empty() || frac.len() > 9 {
        return None;
    }

    let secs: u64 = secs.parse().ok()?;
    let frac_value: u64 = frac.parse().ok()?;
    let nanos = frac_value * 10u64.pow(9 - frac.len() as u32);

    let micros = secs.checked_mul(1_000_000)?.checked_add(nanos / 1_000)?;
    Some(Tick::from_micros(micros))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_formatted_event() {
        assert_eq!(
            parse_event("falling 1234.567890123"),
            Some((false, Tick::from_micros(1_234_567_890)))
        );
        assert_eq!(
            parse_event("rising 12.5"),
            Some((true, Tick::from_micros(12_500_000)))
        );
    }

    #[test]
    fn test_parse_legacy_event() {
        let line = "event:  RISING EDGE offset: 27 timestamp: [    1234.000015000]";
        assert_eq!(
            parse_event(line),
            Some((true, Tick::from_micros(1_234_000_015)))
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(parse_event(""), None);
        assert_eq!(parse_event("rising"), None);
        assert_eq!(parse_event("1234.5"), None);
        assert_eq!(parse_event("sideways 1234.5"), None);
        assert_eq!(parse_event("rising 12.1234567890"), None);
    }

    #[test]
    fn test_parse_rejects_out_of_range_timestamp() {
        // Fits in u64 seconds, overflows as microseconds
        assert_eq!(parse_event("rising 18446744073709551.5"), None);
        assert_eq!(
            parse_event("rising 18446744073709.551615"),
            Some((true, Tick::from_micros(18_446_744_073_709_551_615)))
        );
    }

    #[test]
    fn test_args_follow_polarity_and_filter() {
        let source = GpiomonSource::new("gpiochip0", 27, true, 1_000);
        let args = source.args();
        assert!(args.windows(2).any(|w| w == ["--bias", "pull-up"]));
        assert!(args.windows(2).any(|w| w == ["--debounce-period", "1000us"]));
        assert_eq!(args.last().map(String::as_str), Some("27"));

        let source = GpiomonSource::new("gpiochip1", 4, false, 0);
        assert!(source.args().windows(2).any(|w| w == ["--bias", "pull-down"]));
    }

    #[test]
    fn test_missing_program_is_spawn_error() {
        let source = GpiomonSource::new("gpiochip0", 27, true, 1_000)
            .with_program("/nonexistent/gpiomon-for-tests");
        let result = Box::new(source).listen(Box::new(|_, _| {}));
        assert!(matches!(result, Err(SourceError::Spawn { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn test_driver_exiting_at_startup_is_fatal() {
        // `false` ignores its arguments and exits with status 1
        let source = GpiomonSource::new("gpiochip0", 27, true, 1_000).with_program("false");
        let result = Box::new(source).listen(Box::new(|_, _| {}));
        assert!(matches!(result, Err(SourceError::Exited { .. })));
    }
}
