//! Delay between retry attempts.

use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};

const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(100);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(10);
const DEFAULT_MULTIPLIER: f64 = 2.0;

/// Exponential backoff, `base_delay * multiplier^(ordinal - 1)` clamped to `max_delay`.
///
/// The policy is stateless: the caller passes the ordinal of the attempt that just failed and
/// the policy never counts attempts itself.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    base_delay: Duration,
    multiplier: f64,
    max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            multiplier: DEFAULT_MULTIPLIER,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl BackoffPolicy {
    /// Multipliers below `1.0` (or NaN) are raised to `1.0` so delays never shrink.
    #[must_use]
    pub fn new(base_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        let multiplier = if multiplier >= 1.0 { multiplier } else { 1.0 };

        Self {
            base_delay,
            multiplier,
            max_delay,
        }
    }

    #[must_use]
    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    #[must_use]
    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    #[must_use]
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Delay to wait after attempt `ordinal` (1-based) failed.
    ///
    /// A positive `retry_after` hint from the server is honoured exactly, even above
    /// `max_delay`. A zero hint counts as absent.
    #[must_use]
    pub fn delay(&self, ordinal: u32, retry_after: Option<Duration>) -> Duration {
        match retry_after {
            Some(hint) if !hint.is_zero() => hint,
            _ => self.exponential(ordinal),
        }
    }

    #[expect(
        clippy::float_arithmetic,
        reason = "Exponential growth is computed in seconds as f64 and clamped afterwards"
    )]
    fn exponential(&self, ordinal: u32) -> Duration {
        let exponent = i32::try_from(ordinal.saturating_sub(1)).unwrap_or(i32::MAX);
        let seconds = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);

        // Overflow and infinity fail the conversion and land on the ceiling
        Duration::try_from_secs_f64(seconds).map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

/// Parses the `Retry-After` header as a positive whole number of seconds.
///
/// Zero, negative, fractional and HTTP-date values are treated as absent.
#[must_use]
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?;
    let seconds = value.trim().parse::<i64>().ok()?;

    u64::try_from(seconds)
        .ok()
        .filter(|s| *s > 0)
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use reqwest::header::HeaderValue;

    use super::*;

    fn headers(value: &'static str) -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert(RETRY_AFTER, HeaderValue::from_static(value));
        map
    }

    #[test]
    fn default_sequence_doubles_from_base() {
        let policy = BackoffPolicy::default();

        assert_eq!(policy.delay(1, None), Duration::from_millis(100));
        assert_eq!(policy.delay(2, None), Duration::from_millis(200));
        assert_eq!(policy.delay(3, None), Duration::from_millis(400));
        assert_eq!(policy.delay(4, None), Duration::from_millis(800));
    }

    #[test]
    fn delay_is_non_decreasing_then_constant_at_ceiling() {
        let policy = BackoffPolicy::default();

        let delays: Vec<_> = (1..=64).map(|ordinal| policy.delay(ordinal, None)).collect();

        for pair in delays.windows(2) {
            assert!(pair[0] <= pair[1], "delays should never shrink: {pair:?}");
        }
        // 100ms * 2^7 = 12.8s is the first value past the 10s ceiling
        assert_eq!(delays[6], Duration::from_millis(6_400));
        assert!(
            delays[7..].iter().all(|d| *d == Duration::from_secs(10)),
            "delays past the ceiling should be constant"
        );
    }

    #[test]
    fn huge_ordinal_saturates_at_ceiling() {
        let policy = BackoffPolicy::default();

        assert_eq!(policy.delay(u32::MAX, None), Duration::from_secs(10));
    }

    #[test]
    fn ordinal_zero_is_treated_as_first_attempt() {
        let policy = BackoffPolicy::default();

        assert_eq!(policy.delay(0, None), policy.delay(1, None));
    }

    #[test]
    fn positive_hint_is_honoured_exactly() {
        let policy = BackoffPolicy::default();

        assert_eq!(
            policy.delay(1, Some(Duration::from_secs(2))),
            Duration::from_secs(2)
        );
        assert_eq!(
            policy.delay(5, Some(Duration::from_secs(1))),
            Duration::from_secs(1)
        );
        // Above the ceiling, still honoured
        assert_eq!(
            policy.delay(1, Some(Duration::from_secs(30))),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn zero_hint_falls_back_to_exponential() {
        let policy = BackoffPolicy::default();

        assert_eq!(
            policy.delay(3, Some(Duration::ZERO)),
            Duration::from_millis(400)
        );
    }

    #[test]
    fn multiplier_below_one_is_raised() {
        let policy = BackoffPolicy::new(Duration::from_millis(50), 0.5, Duration::from_secs(1));

        assert!((policy.multiplier() - 1.0).abs() < f64::EPSILON, "multiplier");
        assert_eq!(policy.delay(1, None), Duration::from_millis(50));
        assert_eq!(policy.delay(10, None), Duration::from_millis(50));
    }

    #[test]
    fn retry_after_parses_positive_seconds() {
        assert_eq!(retry_after(&headers("2")), Some(Duration::from_secs(2)));
        assert_eq!(retry_after(&headers(" 15 ")), Some(Duration::from_secs(15)));
    }

    #[test]
    fn retry_after_rejects_invalid_values() {
        assert_eq!(retry_after(&headers("0")), None);
        assert_eq!(retry_after(&headers("-3")), None);
        assert_eq!(retry_after(&headers("1.5")), None);
        assert_eq!(retry_after(&headers("soon")), None);
        assert_eq!(retry_after(&headers("Wed, 21 Oct 2015 07:28:00 GMT")), None);
        assert_eq!(retry_after(&HeaderMap::new()), None);
    }
}
