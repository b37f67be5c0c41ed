//! Backoff policies.
//!
//! Two independent policies exist: a table-driven schedule used for
//! reconnecting live channels, and a doubling policy used for retrying a
//! single message's delivery. Both are pure and never panic for large
//! attempt indices.

use std::fmt;
use std::time::Duration;

/// A delay schedule indexed by attempt number (0-based).
pub trait BackoffPolicy: fmt::Debug + Send + Sync {
    /// Delay before the attempt following `attempt`.
    fn delay(&self, attempt: u32) -> Duration;

    /// Largest delay this policy will ever return.
    fn max_delay(&self) -> Duration;
}

/// Binary exponential backoff: `base * 2^attempt`, capped at `max`.
///
/// | attempt | delay (base=1s) |
/// |---------|-----------------|
/// | 0       | 1s              |
/// | 1       | 2s              |
/// | 2       | 4s              |
/// | 3       | 8s              |
pub fn exponential_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let base_ms = base.as_millis().min(u64::MAX as u128) as u64;
    let max_ms = max.as_millis().min(u64::MAX as u128) as u64;
    let multiplier = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    let delay_ms = base_ms.saturating_mul(multiplier).min(max_ms);
    Duration::from_millis(delay_ms)
}

/// Doubling backoff used by the delivery retry engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    pub fn base(&self) -> Duration {
        self.base
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        exponential_delay(attempt, self.base, self.max)
    }

    fn max_delay(&self) -> Duration {
        self.max
    }
}

/// Shortest delay a reconnection schedule will ever return.
pub const MIN_RECONNECT_DELAY: Duration = Duration::from_millis(100);

/// Table-driven backoff used for channel reconnection.
///
/// Attempts past the end of the table repeat the last entry. Entries are
/// raised to their predecessor's value on construction so the schedule is
/// non-decreasing, and never fall below [`MIN_RECONNECT_DELAY`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleBackoff {
    schedule: Vec<Duration>,
}

impl ScheduleBackoff {
    pub fn new(schedule: Vec<Duration>) -> Self {
        let mut normalized = Vec::with_capacity(schedule.len());
        let mut floor = MIN_RECONNECT_DELAY;
        for delay in schedule {
            floor = floor.max(delay);
            normalized.push(floor);
        }
        Self {
            schedule: normalized,
        }
    }

    pub fn from_millis(schedule_ms: &[u64]) -> Self {
        Self::new(schedule_ms.iter().copied().map(Duration::from_millis).collect())
    }

    /// 1s, 5s, 15s, 30s.
    pub fn connection_default() -> Self {
        Self::from_millis(&[1_000, 5_000, 15_000, 30_000])
    }

    pub fn schedule(&self) -> &[Duration] {
        &self.schedule
    }
}

impl Default for ScheduleBackoff {
    fn default() -> Self {
        Self::connection_default()
    }
}

impl BackoffPolicy for ScheduleBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        self.schedule
            .get(attempt as usize)
            .or_else(|| self.schedule.last())
            .copied()
            .unwrap_or(MIN_RECONNECT_DELAY)
    }

    fn max_delay(&self) -> Duration {
        self.schedule.last().copied().unwrap_or(MIN_RECONNECT_DELAY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_monotone_then_flat(policy: &dyn BackoffPolicy, attempts: u32) {
        let mut previous = Duration::ZERO;
        let mut reached_max = false;
        for attempt in 0..attempts {
            let delay = policy.delay(attempt);
            assert!(delay >= previous, "delay decreased at attempt {}", attempt);
            assert!(delay <= policy.max_delay());
            if reached_max {
                assert_eq!(delay, policy.max_delay());
            }
            reached_max = delay == policy.max_delay();
            previous = delay;
        }
    }

    #[test]
    fn exponential_doubles_and_caps() {
        let policy = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(8));
        let delays: Vec<u64> = (0..6).map(|n| policy.delay(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 8, 8]);
    }

    #[test]
    fn exponential_saturates_for_huge_attempts() {
        let max = Duration::from_secs(30);
        assert_eq!(exponential_delay(200, Duration::from_secs(1), max), max);
        assert_eq!(exponential_delay(u32::MAX, Duration::from_secs(1), max), max);
    }

    #[test]
    fn exponential_max_never_below_base() {
        let policy = ExponentialBackoff::new(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(policy.delay(0), Duration::from_secs(5));
        assert_eq!(policy.max_delay(), Duration::from_secs(5));
    }

    #[test]
    fn schedule_follows_table_then_repeats_last() {
        let policy = ScheduleBackoff::connection_default();
        let delays: Vec<u64> = (0..7).map(|n| policy.delay(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 5, 15, 30, 30, 30, 30]);
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn schedule_is_normalized_to_non_decreasing() {
        let policy = ScheduleBackoff::from_millis(&[2_000, 500, 4_000]);
        assert_eq!(
            policy.schedule(),
            &[
                Duration::from_millis(2_000),
                Duration::from_millis(2_000),
                Duration::from_millis(4_000)
            ]
        );
    }

    #[test]
    fn empty_schedule_yields_floor() {
        let policy = ScheduleBackoff::new(Vec::new());
        assert_eq!(policy.delay(0), MIN_RECONNECT_DELAY);
        assert_eq!(policy.max_delay(), MIN_RECONNECT_DELAY);
    }

    #[test]
    fn zero_entries_are_raised_to_floor() {
        let policy = ScheduleBackoff::from_millis(&[0, 0, 250]);
        assert_eq!(policy.delay(0), MIN_RECONNECT_DELAY);
        assert_eq!(policy.delay(1), MIN_RECONNECT_DELAY);
        assert_eq!(policy.delay(2), Duration::from_millis(250));
    }

    #[test]
    fn all_policies_are_monotone_until_max() {
        assert_monotone_then_flat(&ScheduleBackoff::connection_default(), 20);
        assert_monotone_then_flat(&ExponentialBackoff::default(), 64);
        assert_monotone_then_flat(&ScheduleBackoff::from_millis(&[300, 100, 900, 900, 50]), 10);
    }
}
