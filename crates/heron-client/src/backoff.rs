// Backoff timers and the throughput state machine driven by message outcomes.
//
// `BackoffTimer` is a plain failure counter with an exponential interval; the
// consumer keeps one per peer for reconnects. `ThroughputBackoff` wraps a
// timer with the Normal -> Backoff -> ThroughputTest cycle that throttles the
// whole consumer. Neither type does I/O or owns a clock: the engine schedules
// the returned intervals and reports back with the window generation.
use rand::Rng;
use std::fmt;
use std::time::Duration;

use crate::config::BackoffConfig;

/// Failure counter with an exponential, jittered interval.
///
/// ```
/// use heron_client::BackoffConfig;
/// use heron_client::backoff::BackoffTimer;
/// use std::time::Duration;
///
/// let mut config = BackoffConfig::throughput_defaults();
/// config.jitter = 0.0;
/// let mut timer = BackoffTimer::new(config);
/// timer.failure();
/// timer.failure();
/// assert_eq!(timer.interval(), Duration::from_secs(3));
/// ```
#[derive(Debug, Clone)]
pub struct BackoffTimer {
    config: BackoffConfig,
    level: u32,
}

impl BackoffTimer {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, level: 0 }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn is_reset(&self) -> bool {
        self.level == 0
    }

    pub fn success(&mut self) {
        self.level = self.level.saturating_sub(1);
    }

    pub fn failure(&mut self) {
        self.level = (self.level + 1).min(self.config.max_level);
    }

    pub fn reset(&mut self) {
        self.level = 0;
    }

    pub fn interval(&self) -> Duration {
        let sample = rand::thread_rng().gen_range(0.0..1.0);
        self.interval_with(sample)
    }

    /// Interval for a given jitter sample in `[0, 1)`.
    pub fn interval_with(&self, sample: f64) -> Duration {
        if !self.config.is_enabled() {
            return Duration::ZERO;
        }
        let growth = self.config.multiplier.powi(self.level as i32) - 1.0;
        let raw = self.config.base.as_secs_f64() * growth;
        let capped = raw.min(self.config.max.as_secs_f64());
        let jittered = capped * (1.0 - self.config.jitter * sample.clamp(0.0, 1.0));
        Duration::from_secs_f64(jittered.max(0.0)).max(self.config.min)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffMode {
    Normal,
    Backoff,
    ThroughputTest,
}

impl fmt::Display for BackoffMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackoffMode::Normal => "normal",
            BackoffMode::Backoff => "backoff",
            BackoffMode::ThroughputTest => "throughput_test",
        })
    }
}

/// A scheduled backoff window; the timer that ends it must report the same
/// generation or it is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffWindow {
    pub interval: Duration,
    pub generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    /// Throttle: no credit until the window elapses.
    Backoff(BackoffWindow),
    /// Level reached zero; full credit restored.
    Resumed,
}

/// Consumer-wide throughput throttle.
#[derive(Debug, Clone)]
pub struct ThroughputBackoff {
    timer: BackoffTimer,
    mode: BackoffMode,
    generation: u64,
}

impl ThroughputBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            timer: BackoffTimer::new(config),
            mode: BackoffMode::Normal,
            generation: 0,
        }
    }

    pub fn mode(&self) -> BackoffMode {
        self.mode
    }

    pub fn level(&self) -> u32 {
        self.timer.level()
    }

    pub fn is_enabled(&self) -> bool {
        self.timer.config().is_enabled()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// A handler failure or a requeue that asked for backoff.
    pub fn on_failure(&mut self) -> Transition {
        if !self.is_enabled() {
            return Transition::Unchanged;
        }
        self.timer.failure();
        self.enter_backoff()
    }

    /// A message finished, or requeued without backoff.
    pub fn on_success(&mut self) -> Transition {
        if !self.is_enabled() || self.mode != BackoffMode::ThroughputTest {
            return Transition::Unchanged;
        }
        self.timer.success();
        if self.timer.is_reset() {
            self.mode = BackoffMode::Normal;
            self.generation += 1;
            Transition::Resumed
        } else {
            self.enter_backoff()
        }
    }

    /// A connection went away. Only counted while running normally with
    /// messages outstanding; inside a window the triggering failure was
    /// already counted.
    pub fn on_connection_failure(&mut self, had_outstanding: bool) -> Transition {
        if had_outstanding && self.mode == BackoffMode::Normal {
            self.on_failure()
        } else {
            Transition::Unchanged
        }
    }

    /// The window scheduled with `generation` elapsed. Returns true when the
    /// machine moved to ThroughputTest.
    pub fn on_timer(&mut self, generation: u64) -> bool {
        if self.mode != BackoffMode::Backoff || generation != self.generation {
            return false;
        }
        self.mode = BackoffMode::ThroughputTest;
        true
    }

    /// Requeue delay for the current level: `base * multiplier^level`, capped.
    pub fn requeue_delay(&self, base: Duration, cap: Duration) -> Duration {
        let factor = self
            .timer
            .config()
            .multiplier
            .powi(self.timer.level() as i32);
        let delay = base.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(cap.as_secs_f64()).max(0.0))
    }

    fn enter_backoff(&mut self) -> Transition {
        self.mode = BackoffMode::Backoff;
        self.generation += 1;
        Transition::Backoff(BackoffWindow {
            interval: self.timer.interval(),
            generation: self.generation,
        })
    }
}
