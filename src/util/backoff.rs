use std::time::Duration;

use rand::Rng;

pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(1_000);
pub const DEFAULT_BACKOFF_FACTOR: f64 = 1.5;
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(60_000);
pub const RANDOM_FACTOR: f64 = 0.5;

/// Tuning knobs for [`ExponentialBackoff`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffSettings {
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    pub jitter_factor: f64,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_DELAY,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            max_delay: DEFAULT_MAX_DELAY,
            jitter_factor: RANDOM_FACTOR,
        }
    }
}

impl BackoffSettings {
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }
}

/// Computes successive retry delays.
///
/// The first attempt after construction or [`reset`](Self::reset) runs without
/// delay. Each later attempt waits for the current base delay plus or minus
/// the jitter factor, after which the base grows by the backoff factor,
/// clamped to `[initial_delay, max_delay]`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    settings: BackoffSettings,
    current_base: Duration,
}

impl ExponentialBackoff {
    pub fn new(settings: BackoffSettings) -> Self {
        Self {
            settings,
            current_base: Duration::ZERO,
        }
    }

    pub fn settings(&self) -> &BackoffSettings {
        &self.settings
    }

    /// Makes the next attempt run immediately.
    pub fn reset(&mut self) {
        self.current_base = Duration::ZERO;
    }

    /// Makes the next attempt wait the maximum delay.
    pub fn reset_to_max(&mut self) {
        self.current_base = self.settings.max_delay;
    }

    pub fn current_base(&self) -> Duration {
        self.current_base
    }

    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_with_rng(&mut rand::thread_rng())
    }

    pub fn next_delay_with_rng<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let base = self.current_base.as_secs_f64() * 1_000.0;
        let jitter = if base > 0.0 {
            self.settings.jitter_factor * base * rng.gen_range(-1.0..=1.0)
        } else {
            0.0
        };
        let delay_millis = (base + jitter).round().max(0.0);

        let grown = self.current_base.mul_f64(self.settings.backoff_factor);
        self.current_base = grown
            .max(self.settings.initial_delay)
            .min(self.settings.max_delay);

        Duration::from_millis(delay_millis as u64)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(BackoffSettings::default())
    }
}
