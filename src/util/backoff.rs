use std::time::Duration;

use rand::Rng;

pub const DEFAULT_INITIAL_DELAY_MILLIS: u64 = 1_000;
pub const DEFAULT_BACKOFF_FACTOR: f64 = 1.5;
pub const DEFAULT_MAX_DELAY_MILLIS: u64 = 60 * 1_000;
pub const RANDOM_FACTOR: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(DEFAULT_INITIAL_DELAY_MILLIS),
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MILLIS),
        }
    }
}

/// Exponential backoff with jitter.
///
/// The first delay after construction or [`reset`](Self::reset) is zero; each
/// following delay grows by `backoff_factor` from `initial_delay` up to
/// `max_delay`, randomized by up to half of its value in either direction.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    current_base: Duration,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            current_base: Duration::ZERO,
        }
    }

    pub fn config(&self) -> BackoffConfig {
        self.config
    }

    pub fn reset(&mut self) {
        self.current_base = Duration::ZERO;
    }

    /// Makes the next delay the maximum one, used when the backend reports
    /// resource exhaustion.
    pub fn reset_to_max(&mut self) {
        self.current_base = self.config.max_delay;
    }

    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_with_rng(&mut rand::thread_rng())
    }

    fn next_delay_with_rng<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let delay = jittered(self.current_base, rng);

        let grown = self.current_base.mul_f64(self.config.backoff_factor);
        self.current_base = grown.max(self.config.initial_delay).min(self.config.max_delay);
        delay
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

fn jittered<R: Rng + ?Sized>(base: Duration, rng: &mut R) -> Duration {
    if base.is_zero() {
        return base;
    }
    let base_millis = base.as_millis() as f64;
    let jitter = RANDOM_FACTOR * base_millis * rng.gen_range(-1.0..=1.0);
    Duration::from_millis((base_millis + jitter).round().max(0.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn first_attempt_is_immediate() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut backoff = ExponentialBackoff::default();
        assert_eq!(backoff.next_delay_with_rng(&mut rng), Duration::ZERO);
        let second = backoff.next_delay_with_rng(&mut rng);
        assert!(second >= Duration::from_millis(500) && second <= Duration::from_millis(1_500));
    }

    #[test]
    fn grows_and_caps() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut backoff = ExponentialBackoff::default();
        let mut last = Duration::ZERO;
        for _ in 0..40 {
            last = backoff.next_delay_with_rng(&mut rng);
        }
        assert!(last <= Duration::from_millis(90_000));
        assert!(last >= Duration::from_millis(30_000));
    }

    #[test]
    fn reset_to_max_uses_cap() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut backoff = ExponentialBackoff::default();
        backoff.reset_to_max();
        let delay = backoff.next_delay_with_rng(&mut rng);
        assert!(delay >= Duration::from_millis(30_000));

        backoff.reset();
        assert_eq!(backoff.next_delay_with_rng(&mut rng), Duration::ZERO);
    }
}
