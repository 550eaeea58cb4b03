//! Exponential backoff with jitter for replication retry loops.
//!
//! One [`BackoffCtx`] lives for exactly one retry loop (data transfer or
//! status write) and is discarded once the loop resolves. Retry state is
//! memory-resident only: a process restart resets counters and relies on the
//! log transport re-delivering unacknowledged records.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff parameters: `delay = min(max, min * factor^attempt) * (1 ± jitter)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Base delay for the first retry, in milliseconds.
    #[serde(default = "default_min_ms")]
    pub min_ms: u64,
    /// Ceiling on the computed delay before jitter, in milliseconds.
    #[serde(default = "default_max_ms")]
    pub max_ms: u64,
    /// Exponential growth factor per attempt.
    #[serde(default = "default_factor")]
    pub factor: f64,
    /// Relative jitter applied to the computed delay (0.1 = ±10%).
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_min_ms() -> u64 {
    1000
}

fn default_max_ms() -> u64 {
    300_000
}

fn default_factor() -> f64 {
    1.5
}

fn default_jitter() -> f64 {
    0.1
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_ms: default_min_ms(),
            max_ms: default_max_ms(),
            factor: default_factor(),
            jitter: default_jitter(),
        }
    }
}

/// Computed delay in milliseconds for a given attempt, before jitter.
pub fn raw_delay_ms(config: &BackoffConfig, attempt: u32) -> u64 {
    let base = config.min_ms as f64 * config.factor.powi(attempt as i32);
    base.min(config.max_ms as f64).round() as u64
}

/// Per-loop mutable retry counter producing successive backoff delays.
///
/// Attempt count is unbounded by design: bounding retries is a caller or
/// configuration choice, never a hardcoded limit here.
#[derive(Debug, Clone)]
pub struct BackoffCtx {
    config: BackoffConfig,
    attempt: u32,
}

impl BackoffCtx {
    /// Create a fresh context at attempt zero.
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            config: config.clone(),
            attempt: 0,
        }
    }

    /// Number of delays produced so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Reset the context to attempt zero.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Produce the next delay and advance the attempt counter.
    pub fn duration(&mut self) -> Duration {
        let capped = raw_delay_ms(&self.config, self.attempt) as f64;
        self.attempt = self.attempt.saturating_add(1);

        let jitter = self.config.jitter;
        let jittered = if jitter > 0.0 {
            let spread = rand::thread_rng().gen_range(-jitter..=jitter);
            capped * (1.0 + spread)
        } else {
            capped
        };
        Duration::from_millis(jittered.max(0.0).round() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    mod raw_sequence {
        use super::*;

        #[test]
        fn test_first_delay_is_min() {
            let config = BackoffConfig::default();
            assert_eq!(raw_delay_ms(&config, 0), 1000);
        }

        #[test]
        fn test_exponential_growth() {
            let config = BackoffConfig::default();
            assert_eq!(raw_delay_ms(&config, 1), 1500);
            assert_eq!(raw_delay_ms(&config, 2), 2250);
            assert_eq!(raw_delay_ms(&config, 3), 3375);
        }

        #[test]
        fn test_caps_at_max() {
            let config = BackoffConfig::default();
            // 1000 * 1.5^20 is well past 300000
            assert_eq!(raw_delay_ms(&config, 20), 300_000);
            assert_eq!(raw_delay_ms(&config, 40), 300_000);
        }

        #[test]
        fn test_non_decreasing_up_to_cap() {
            let config = BackoffConfig::default();
            let mut prev = 0;
            for attempt in 0..32 {
                let delay = raw_delay_ms(&config, attempt);
                assert!(delay >= prev, "attempt {attempt}: {delay} < {prev}");
                prev = delay;
            }
        }
    }

    mod ctx {
        use super::*;

        #[test]
        fn test_duration_advances_attempt() {
            let mut ctx = BackoffCtx::new(&BackoffConfig::default());
            assert_eq!(ctx.attempt(), 0);
            let _ = ctx.duration();
            let _ = ctx.duration();
            assert_eq!(ctx.attempt(), 2);
        }

        #[test]
        fn test_reset() {
            let mut ctx = BackoffCtx::new(&BackoffConfig::default());
            let _ = ctx.duration();
            ctx.reset();
            assert_eq!(ctx.attempt(), 0);
        }

        #[test]
        fn test_no_jitter_matches_raw_sequence() {
            let config = BackoffConfig {
                jitter: 0.0,
                ..Default::default()
            };
            let mut ctx = BackoffCtx::new(&config);
            assert_eq!(ctx.duration(), Duration::from_millis(1000));
            assert_eq!(ctx.duration(), Duration::from_millis(1500));
            assert_eq!(ctx.duration(), Duration::from_millis(2250));
        }

        #[test]
        fn test_jittered_delay_within_bounds() {
            let config = BackoffConfig::default();
            let mut ctx = BackoffCtx::new(&config);
            for attempt in 0..40 {
                let raw = raw_delay_ms(&config, attempt) as f64;
                let delay = ctx.duration().as_millis() as f64;
                let lo = (raw * (1.0 - config.jitter)).floor();
                let hi = (raw * (1.0 + config.jitter)).ceil();
                assert!(
                    delay >= lo && delay <= hi,
                    "attempt {attempt}: {delay} outside [{lo}, {hi}]"
                );
            }
        }

        #[test]
        fn test_jittered_delay_never_exceeds_max_plus_jitter() {
            let config = BackoffConfig::default();
            let ceiling = (config.max_ms as f64 * (1.0 + config.jitter)).ceil() as u128;
            let mut ctx = BackoffCtx::new(&config);
            for _ in 0..100 {
                assert!(ctx.duration().as_millis() <= ceiling);
            }
        }
    }

    proptest! {
        #[test]
        fn prop_raw_sequence_non_decreasing(
            min_ms in 1u64..10_000,
            factor in 1.0f64..4.0,
            attempts in 1u32..40,
        ) {
            let config = BackoffConfig {
                min_ms,
                max_ms: min_ms * 500,
                factor,
                jitter: 0.0,
            };
            let mut prev = 0;
            for attempt in 0..attempts {
                let delay = raw_delay_ms(&config, attempt);
                prop_assert!(delay >= prev);
                prop_assert!(delay <= config.max_ms);
                prev = delay;
            }
        }

        #[test]
        fn prop_jittered_delay_within_envelope(
            attempt in 0u32..64,
            jitter in 0.0f64..0.5,
        ) {
            let config = BackoffConfig {
                jitter,
                ..Default::default()
            };
            let mut ctx = BackoffCtx::new(&config);
            for _ in 0..attempt {
                let _ = ctx.duration();
            }
            let raw = raw_delay_ms(&config, attempt) as f64;
            let delay = ctx.duration().as_millis() as f64;
            prop_assert!(delay >= (raw * (1.0 - jitter)).floor());
            prop_assert!(delay <= (raw * (1.0 + jitter)).ceil());
        }
    }
}
