use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::settings::BackoffSettings;

/// Exponential backoff with jitter.
///
/// The base delay starts at `initial_delay`, grows by `multiplier` after every
/// attempt and saturates at `max_delay`. Each returned delay is the base
/// delay perturbed by up to `jitter_factor / 2` of itself in either direction.
#[derive(Debug)]
pub struct ExponentialBackoff {
    settings: BackoffSettings,
    current_base: Duration,
    rng: StdRng,
}

impl ExponentialBackoff {
    pub fn new(settings: BackoffSettings) -> Self {
        Self::with_rng(settings, StdRng::from_entropy())
    }

    pub fn with_seed(settings: BackoffSettings, seed: u64) -> Self {
        Self::with_rng(settings, StdRng::seed_from_u64(seed))
    }

    fn with_rng(settings: BackoffSettings, rng: StdRng) -> Self {
        Self {
            current_base: settings.initial_delay,
            settings,
            rng,
        }
    }

    /// Base delay the next attempt will be scheduled around.
    pub fn current_base(&self) -> Duration {
        self.current_base
    }

    /// Returns the delay for the next attempt and advances the base.
    pub fn next_delay(&mut self) -> Duration {
        let delay = jittered(self.current_base, self.settings.jitter_factor, &mut self.rng);
        let grown = self.current_base.mul_f64(self.settings.multiplier.max(1.0));
        self.current_base = grown.min(self.settings.max_delay);
        delay
    }

    pub fn reset(&mut self) {
        self.current_base = self.settings.initial_delay;
    }

    /// Jumps straight to the cap; used after resource-exhaustion errors.
    pub fn reset_to_max(&mut self) {
        self.current_base = self.settings.max_delay;
    }
}

fn jittered<R: Rng + ?Sized>(base: Duration, jitter_factor: f64, rng: &mut R) -> Duration {
    if base.is_zero() || jitter_factor <= 0.0 {
        return base;
    }
    let base_millis = base.as_secs_f64() * 1_000.0;
    let jitter = jitter_factor * base_millis * rng.gen_range(-0.5..=0.5);
    let millis = (base_millis + jitter).round().max(0.0);
    Duration::from_millis(millis as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> BackoffSettings {
        BackoffSettings::default()
    }

    #[test]
    fn base_is_non_decreasing_up_to_cap() {
        let mut backoff = ExponentialBackoff::with_seed(settings(), 7);
        let mut previous = backoff.current_base();
        for _ in 0..30 {
            backoff.next_delay();
            let base = backoff.current_base();
            assert!(base >= previous);
            assert!(base <= Duration::from_secs(60));
            previous = base;
        }
        assert_eq!(backoff.current_base(), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let mut backoff = ExponentialBackoff::with_seed(settings(), 42);
        let delay = backoff.next_delay();
        assert!(delay >= Duration::from_millis(750));
        assert!(delay <= Duration::from_millis(1_250));
    }

    #[test]
    fn reset_returns_to_initial_delay() {
        let mut backoff = ExponentialBackoff::with_seed(settings(), 1);
        for _ in 0..5 {
            backoff.next_delay();
        }
        assert!(backoff.current_base() > Duration::from_secs(1));
        backoff.reset();
        assert_eq!(backoff.current_base(), Duration::from_secs(1));
    }

    #[test]
    fn reset_to_max_jumps_to_cap() {
        let mut backoff = ExponentialBackoff::with_seed(settings(), 3);
        backoff.reset_to_max();
        assert_eq!(backoff.current_base(), Duration::from_secs(60));
    }
}
