use std::time::Duration;

use rand::Rng;

pub const DEFAULT_BACKOFF_INITIAL_DELAY_MILLIS: u64 = 1_000;
pub const DEFAULT_BACKOFF_FACTOR: f64 = 1.5;
pub const DEFAULT_BACKOFF_MAX_DELAY_MILLIS: u64 = 60_000;
/// Jitter is applied as a symmetric fraction of the current base delay.
pub const RANDOM_FACTOR: f64 = 0.5;

#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub initial_delay_millis: u64,
    pub backoff_factor: f64,
    pub max_delay_millis: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_millis: DEFAULT_BACKOFF_INITIAL_DELAY_MILLIS,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            max_delay_millis: DEFAULT_BACKOFF_MAX_DELAY_MILLIS,
        }
    }
}

/// Stateful exponential backoff with full jitter.
///
/// The base delay grows by `backoff_factor` per attempt and is clamped to
/// `max_delay_millis`; the returned delay is the base plus a random offset in
/// `[-RANDOM_FACTOR * base, +RANDOM_FACTOR * base]`, never exceeding the cap.
#[derive(Debug)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    current_base_millis: f64,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            current_base_millis: 0.0,
        }
    }

    /// Resets to a zero-delay first attempt.
    pub fn reset(&mut self) {
        self.current_base_millis = 0.0;
    }

    /// Forces the next delay to the maximum; used when the backend reports
    /// RESOURCE_EXHAUSTED.
    pub fn reset_to_max(&mut self) {
        self.current_base_millis = self.config.max_delay_millis as f64;
    }

    /// Returns the delay to wait before the next attempt and advances the
    /// internal state.
    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_with_rng(&mut rand::thread_rng())
    }

    fn next_delay_with_rng<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let jitter = RANDOM_FACTOR * self.current_base_millis * rng.gen_range(-1.0..=1.0);
        let delay =
            (self.current_base_millis + jitter).clamp(0.0, self.config.max_delay_millis as f64);

        self.current_base_millis = if self.current_base_millis == 0.0 {
            self.config.initial_delay_millis as f64
        } else {
            (self.current_base_millis * self.config.backoff_factor)
                .min(self.config.max_delay_millis as f64)
        };

        Duration::from_millis(delay.round() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn first_attempt_is_immediate() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut backoff = ExponentialBackoff::new(BackoffConfig::default());
        assert_eq!(backoff.next_delay_with_rng(&mut rng), Duration::ZERO);
    }

    #[test]
    fn delays_stay_within_jitter_bounds() {
        let config = BackoffConfig::default();
        let mut rng = StdRng::seed_from_u64(42);
        let mut backoff = ExponentialBackoff::new(config);
        backoff.next_delay_with_rng(&mut rng);

        let mut expected_base = config.initial_delay_millis as f64;
        for _ in 0..10 {
            let delay = backoff.next_delay_with_rng(&mut rng).as_millis() as f64;
            let lower = expected_base * (1.0 - RANDOM_FACTOR);
            let upper = expected_base * (1.0 + RANDOM_FACTOR);
            assert!(
                delay + 1.0 >= lower && delay <= upper + 1.0,
                "delay {delay} outside [{lower}, {upper}]"
            );
            expected_base =
                (expected_base * config.backoff_factor).min(config.max_delay_millis as f64);
        }
    }

    #[test]
    fn reset_to_max_jumps_to_cap() {
        let config = BackoffConfig::default();
        let mut rng = StdRng::seed_from_u64(3);
        let mut backoff = ExponentialBackoff::new(config);
        backoff.reset_to_max();
        let delay = backoff.next_delay_with_rng(&mut rng).as_millis() as f64;
        let base = config.max_delay_millis as f64;
        assert!(delay >= base * (1.0 - RANDOM_FACTOR) - 1.0);
        assert!(delay <= base + 1.0);
    }

    #[test]
    fn jitter_never_exceeds_the_cap() {
        let config = BackoffConfig::default();
        let cap = config.max_delay_millis as u128;
        let mut rng = StdRng::seed_from_u64(19);
        let mut backoff = ExponentialBackoff::new(config);
        backoff.reset_to_max();
        for _ in 0..50 {
            assert!(backoff.next_delay_with_rng(&mut rng).as_millis() <= cap);
        }
    }

    #[test]
    fn reset_restarts_the_sequence() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut backoff = ExponentialBackoff::new(BackoffConfig::default());
        backoff.next_delay_with_rng(&mut rng);
        backoff.next_delay_with_rng(&mut rng);
        backoff.reset();
        assert_eq!(backoff.next_delay_with_rng(&mut rng), Duration::ZERO);
    }
}
