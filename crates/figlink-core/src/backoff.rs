//! Reconnect policy and backoff calculation.
//!
//! Attempt `n` (1-based) waits `base_delay * multiplier^(n-1)`, floored to
//! whole milliseconds and capped at `max_delay_ms`. With the defaults
//! (`base = 1000`, `multiplier = 1.5`) attempts 1–5 wait
//! `1000, 1500, 2250, 3375, 5062` ms. No attempt beyond `max_attempts` is
//! ever scheduled.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default base delay in milliseconds.
pub const DEFAULT_BASE_DELAY_MS: u64 = 1000;
/// Default growth factor between attempts.
pub const DEFAULT_MULTIPLIER: f64 = 1.5;
/// Default maximum number of automatic attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
/// Default delay cap in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 60_000;

/// Parameters of automatic reconnection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectPolicy {
    /// Whether unexpected connection loss triggers reconnection at all.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Delay before the first attempt, in ms.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Growth factor between consecutive attempts.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Attempts after which automatic reconnection stops.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Upper bound for a single delay, in ms.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Jitter factor 0.0–1.0 applied by [`ReconnectPolicy::delay_with_random`].
    #[serde(default)]
    pub jitter_factor: f64,
}

fn default_enabled() -> bool {
    true
}
fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}
fn default_multiplier() -> f64 {
    DEFAULT_MULTIPLIER
}
fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}
fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            multiplier: DEFAULT_MULTIPLIER,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter_factor: 0.0,
        }
    }
}

impl ReconnectPolicy {
    /// Policy that never reconnects automatically.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Delay in ms before attempt `attempt` (1-based), without jitter.
    ///
    /// Returns `None` when the attempt must not be made: automatic
    /// reconnection is disabled, `attempt` is zero, or it exceeds
    /// `max_attempts`.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap
    )]
    pub fn delay_ms(&self, attempt: u32) -> Option<u64> {
        if !self.enabled || attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let exponent = (attempt - 1).min(1024) as i32;
        let raw = (self.base_delay_ms as f64) * self.multiplier.powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64).max(0.0);
        Some(capped.floor() as u64)
    }

    /// [`ReconnectPolicy::delay_ms`] as a [`Duration`].
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        self.delay_ms(attempt).map(Duration::from_millis)
    }

    /// Delay with jitter applied.
    ///
    /// `random` should be a value in `[0.0, 1.0)`; it is mapped onto
    /// `[-jitter_factor, +jitter_factor]` around the unjittered delay.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn delay_with_random(&self, attempt: u32, random: f64) -> Option<Duration> {
        let base = self.delay_ms(attempt)?;
        let jitter = 1.0 + (random * 2.0 - 1.0) * self.jitter_factor;
        let ms = ((base as f64) * jitter).round().max(0.0) as u64;
        Some(Duration::from_millis(ms))
    }

    /// The whole delay schedule, one entry per permitted attempt.
    #[must_use]
    pub fn schedule(&self) -> Vec<u64> {
        (1..=self.max_attempts).filter_map(|n| self.delay_ms(n)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn default_schedule_matches_documented_sequence() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.schedule(), vec![1000, 1500, 2250, 3375, 5062]);
    }

    #[test]
    fn no_attempt_beyond_max() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_ms(5), Some(5062));
        assert_eq!(policy.delay_ms(6), None);
    }

    #[test]
    fn attempt_zero_is_invalid() {
        assert_eq!(ReconnectPolicy::default().delay_ms(0), None);
    }

    #[test]
    fn disabled_policy_never_schedules() {
        let policy = ReconnectPolicy::disabled();
        assert_eq!(policy.delay_ms(1), None);
        assert!(policy.schedule().is_empty());
    }

    #[test]
    fn delay_is_capped() {
        let policy = ReconnectPolicy {
            max_attempts: 100,
            max_delay_ms: 4000,
            ..ReconnectPolicy::default()
        };
        assert_eq!(policy.delay_ms(4), Some(3375));
        assert_eq!(policy.delay_ms(5), Some(4000));
        assert_eq!(policy.delay_ms(100), Some(4000));
    }

    #[test]
    fn jitter_bounds() {
        let policy = ReconnectPolicy {
            jitter_factor: 0.2,
            ..ReconnectPolicy::default()
        };
        assert_eq!(policy.delay_with_random(1, 0.0), Some(Duration::from_millis(800)));
        assert_eq!(policy.delay_with_random(1, 0.5), Some(Duration::from_millis(1000)));
        assert_eq!(policy.delay_with_random(7, 0.5), None);
    }

    #[test]
    fn serde_defaults_fill_missing_fields() {
        let policy: ReconnectPolicy = serde_json::from_str(r#"{"maxAttempts": 2}"#).unwrap();
        assert!(policy.enabled);
        assert_eq!(policy.max_attempts, 2);
        assert_eq!(policy.base_delay_ms, DEFAULT_BASE_DELAY_MS);
        assert_eq!(policy.schedule(), vec![1000, 1500]);
    }

    proptest! {
        #[test]
        fn schedule_is_non_decreasing(base in 1u64..10_000, attempts in 1u32..40) {
            let policy = ReconnectPolicy {
                base_delay_ms: base,
                max_attempts: attempts,
                ..ReconnectPolicy::default()
            };
            let schedule = policy.schedule();
            prop_assert_eq!(schedule.len(), attempts as usize);
            prop_assert!(schedule.windows(2).all(|w| w[0] <= w[1]));
            prop_assert!(schedule.iter().all(|d| *d <= policy.max_delay_ms));
        }
    }
}
