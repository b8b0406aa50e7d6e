//! Backoff builders for connection retries.
//!
//! Uses `backon` builders so callers can either drive the delays themselves
//! (the consumer races them against its stop signal) or hand the builder to
//! [`connect_with_retry`](super::bootstrap::connect_with_retry).

use std::time::Duration;

use backon::{ConstantBuilder, ExponentialBuilder};

/// Exponential backoff for broker connection attempts.
///
/// The delay before retry *n* (n = 1, 2, ...) is `retry_delay * 2^n`, capped
/// at `max_delay`. `max_attempts` counts the first attempt too, so the
/// builder yields `max_attempts - 1` delays. No jitter: delays are
/// deterministic.
pub fn connection_backoff(
    retry_delay: Duration,
    max_delay: Duration,
    max_attempts: usize,
) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(retry_delay.saturating_mul(2).min(max_delay))
        .with_max_delay(max_delay)
        .with_factor(2.0)
        .with_max_times(max_attempts.saturating_sub(1))
}

/// Fixed-delay backoff: `attempts` total attempts, `delay` apart.
pub fn fixed_backoff(delay: Duration, attempts: usize) -> ConstantBuilder {
    ConstantBuilder::default()
        .with_delay(delay)
        .with_max_times(attempts.saturating_sub(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use backon::BackoffBuilder;

    fn secs(values: &[u64]) -> Vec<Duration> {
        values.iter().copied().map(Duration::from_secs).collect()
    }

    #[test]
    fn test_connection_backoff_doubles_and_caps() {
        let delays: Vec<_> =
            connection_backoff(Duration::from_secs(5), Duration::from_secs(60), 7)
                .build()
                .collect();

        assert_eq!(delays, secs(&[10, 20, 40, 60, 60, 60]));
    }

    #[test]
    fn test_connection_backoff_single_attempt_never_retries() {
        let delays: Vec<_> =
            connection_backoff(Duration::from_secs(5), Duration::from_secs(60), 1)
                .build()
                .collect();
        assert!(delays.is_empty());
    }

    #[test]
    fn test_connection_backoff_small_cap() {
        let delays: Vec<_> =
            connection_backoff(Duration::from_secs(5), Duration::from_secs(8), 3)
                .build()
                .collect();
        assert_eq!(delays, secs(&[8, 8]));
    }

    #[test]
    fn test_fixed_backoff() {
        let delays: Vec<_> = fixed_backoff(Duration::from_secs(5), 5).build().collect();
        assert_eq!(delays, secs(&[5, 5, 5, 5]));
    }
}
