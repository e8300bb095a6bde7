//! Retry delay strategies
//!
//! Both the registry bootstrap and the watch restart path sleep between
//! attempts. The delay sequence lives here so it can be checked without a
//! clock; callers do the actual sleeping.

use rand::Rng;
use serde::Deserialize;
use std::time::Duration;

/// A source of delays between retry attempts
pub trait Backoff: Send {
    /// Delay to wait before the next attempt
    fn next_delay(&mut self) -> Duration;

    /// Forget previous failures (called after a successful attempt)
    fn reset(&mut self);
}

/// Same delay every time
#[derive(Debug, Clone)]
pub struct ConstantBackoff {
    delay: Duration,
}

impl ConstantBackoff {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for ConstantBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl Backoff for ConstantBackoff {
    fn next_delay(&mut self) -> Duration {
        self.delay
    }

    fn reset(&mut self) {}
}

/// Doubling delay capped at `max`, with optional jitter of up to 10%
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    jitter: bool,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }
}

impl Backoff for ExponentialBackoff {
    fn next_delay(&mut self) -> Duration {
        let delay = self.current.min(self.max);
        self.current = self.current.saturating_mul(2).min(self.max);

        if !self.jitter {
            return delay;
        }

        let jitter_range = delay.as_millis() as u64 / 10;
        if jitter_range == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..jitter_range))
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Which strategy to build from configuration
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    #[default]
    Constant,
    Exponential,
}

/// `[backoff]` section of the configuration file
#[derive(Debug, Deserialize, Clone)]
pub struct BackoffConfig {
    /// "constant" (default) or "exponential"
    #[serde(default)]
    pub strategy: BackoffStrategy,

    /// First (or only) delay in milliseconds
    #[serde(default = "default_initial_ms")]
    pub initial_ms: u64,

    /// Upper bound for exponential growth in milliseconds
    #[serde(default = "default_max_ms")]
    pub max_ms: u64,

    /// Add up to 10% random jitter to exponential delays
    #[serde(default)]
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::default(),
            initial_ms: default_initial_ms(),
            max_ms: default_max_ms(),
            jitter: false,
        }
    }
}

fn default_initial_ms() -> u64 {
    1000
}

fn default_max_ms() -> u64 {
    30_000
}

impl BackoffConfig {
    pub fn build(&self) -> Box<dyn Backoff> {
        let initial = Duration::from_millis(self.initial_ms);
        match self.strategy {
            BackoffStrategy::Constant => Box::new(ConstantBackoff::new(initial)),
            BackoffStrategy::Exponential => {
                let backoff = ExponentialBackoff::new(initial, Duration::from_millis(self.max_ms));
                if self.jitter {
                    Box::new(backoff.with_jitter())
                } else {
                    Box::new(backoff)
                }
            }
        }
    }
}
