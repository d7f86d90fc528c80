//! # Backoff Calculation
//!
//! Computes the delay before a scheduled retry attempt from the step's
//! retry policy. Three strategies: fixed, exponential, and decorrelated
//! jitter (`min(max, rand(initial, prev * 3))`). Jitter draws from an
//! explicitly seeded generator, so a given seed always produces the same
//! delay sequence. A server-requested delay (e.g. Retry-After) takes
//! precedence over the computed one, capped at the policy maximum.

use parking_lot::Mutex;
use std::time::Duration;

use crate::definition::template::{BackoffStrategy, RetryPolicy};

pub struct BackoffCalculator {
    multiplier: f64,
    rng: Mutex<fastrand::Rng>,
}

impl BackoffCalculator {
    /// Calculator seeded from entropy
    pub fn new(multiplier: f64) -> Self {
        Self {
            multiplier,
            rng: Mutex::new(fastrand::Rng::new()),
        }
    }

    /// Calculator with a fixed seed; jittered sequences are reproducible
    pub fn with_seed(multiplier: f64, seed: u64) -> Self {
        Self {
            multiplier,
            rng: Mutex::new(fastrand::Rng::with_seed(seed)),
        }
    }

    /// Delay before the attempt numbered `next_attempt` (2-based: the first
    /// retry follows attempt 1). `previous_delay` feeds decorrelated jitter
    /// and is the delay scheduled before the attempt that just failed.
    pub fn delay_for(
        &self,
        policy: &RetryPolicy,
        next_attempt: u32,
        previous_delay: Option<Duration>,
    ) -> Duration {
        let initial = Duration::from_millis(policy.initial_delay_ms);
        let max = Duration::from_millis(policy.max_delay_ms);

        let delay = match policy.backoff {
            BackoffStrategy::Fixed => initial,
            BackoffStrategy::Exponential => {
                let exponent = next_attempt.saturating_sub(2).min(63);
                initial.mul_f64(self.multiplier.powi(exponent as i32))
            }
            BackoffStrategy::DecorrelatedJitter => {
                let prev = previous_delay.unwrap_or(initial).max(initial);
                let upper = prev.mul_f64(3.0).min(max);
                let low = initial.as_millis() as u64;
                let high = (upper.as_millis() as u64).max(low);
                let picked = self.rng.lock().u64(low..=high);
                Duration::from_millis(picked)
            }
        };

        delay.clamp(initial.min(max), max)
    }

    /// Honor a server-requested delay, capped at the policy maximum
    pub fn server_requested(&self, policy: &RetryPolicy, requested: Duration) -> Duration {
        requested.min(Duration::from_millis(policy.max_delay_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn policy(strategy: BackoffStrategy, initial: u64, max: u64) -> RetryPolicy {
        RetryPolicy {
            backoff: strategy,
            initial_delay_ms: initial,
            max_delay_ms: max,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn test_fixed_strategy_is_constant() {
        let calc = BackoffCalculator::new(2.0);
        let policy = policy(BackoffStrategy::Fixed, 250, 10_000);
        for attempt in 2..8 {
            assert_eq!(
                calc.delay_for(&policy, attempt, None),
                Duration::from_millis(250)
            );
        }
    }

    #[test]
    fn test_exponential_doubles_and_caps() {
        let calc = BackoffCalculator::new(2.0);
        let policy = policy(BackoffStrategy::Exponential, 100, 1000);
        assert_eq!(calc.delay_for(&policy, 2, None), Duration::from_millis(100));
        assert_eq!(calc.delay_for(&policy, 3, None), Duration::from_millis(200));
        assert_eq!(calc.delay_for(&policy, 4, None), Duration::from_millis(400));
        assert_eq!(calc.delay_for(&policy, 5, None), Duration::from_millis(800));
        // Capped at max_delay_ms
        assert_eq!(calc.delay_for(&policy, 6, None), Duration::from_millis(1000));
        assert_eq!(calc.delay_for(&policy, 12, None), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_deterministic_given_seed() {
        let policy = policy(BackoffStrategy::DecorrelatedJitter, 100, 30_000);
        let first = BackoffCalculator::with_seed(2.0, 42);
        let second = BackoffCalculator::with_seed(2.0, 42);

        let mut prev = None;
        for attempt in 2..10 {
            let a = first.delay_for(&policy, attempt, prev);
            let b = second.delay_for(&policy, attempt, prev);
            assert_eq!(a, b);
            prev = Some(a);
        }
    }

    #[test]
    fn test_server_requested_is_capped() {
        let calc = BackoffCalculator::new(2.0);
        let policy = policy(BackoffStrategy::Exponential, 100, 5000);
        assert_eq!(
            calc.server_requested(&policy, Duration::from_secs(60)),
            Duration::from_millis(5000)
        );
        assert_eq!(
            calc.server_requested(&policy, Duration::from_millis(750)),
            Duration::from_millis(750)
        );
    }

    proptest! {
        #[test]
        fn prop_delay_is_always_within_policy_bounds(
            seed in any::<u64>(),
            initial in 1u64..5_000,
            extra in 0u64..60_000,
            attempt in 2u32..20,
            strategy_pick in 0u8..3,
        ) {
            let strategy = match strategy_pick {
                0 => BackoffStrategy::Fixed,
                1 => BackoffStrategy::Exponential,
                _ => BackoffStrategy::DecorrelatedJitter,
            };
            let max = initial + extra;
            let policy = policy(strategy, initial, max);
            let calc = BackoffCalculator::with_seed(2.0, seed);

            let delay = calc.delay_for(&policy, attempt, None);
            prop_assert!(delay >= Duration::from_millis(initial).min(Duration::from_millis(max)));
            prop_assert!(delay <= Duration::from_millis(max));
        }
    }
}
