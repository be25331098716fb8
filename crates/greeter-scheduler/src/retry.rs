//! Retry policy for transient delivery failures.
//!
//! Fixed table, not a formula: retry 1 waits 1 minute, retry 2 waits 5,
//! retry 3 waits 15. A transient failure after the third retry is final.

use chrono::Duration;

pub const MAX_RETRIES: u32 = 3;

const BACKOFF_MINUTES: [i64; MAX_RETRIES as usize] = [1, 5, 15];

/// Delay before retry number `retry` (1-based).
pub fn backoff_for_retry(retry: u32) -> Option<Duration> {
    let idx = retry.checked_sub(1)? as usize;
    BACKOFF_MINUTES.get(idx).map(|m| Duration::minutes(*m))
}

/// What to do after a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Put the record back in the queue with the new count after `delay`.
    Requeue { retry_count: u32, delay: Duration },
    /// Retries used up; mark the record FAILED.
    Exhausted,
}

/// Decide the next step for a record that has already been retried
/// `retry_count` times.
pub fn next_attempt(retry_count: u32) -> RetryDecision {
    let next = retry_count + 1;
    match backoff_for_retry(next) {
        Some(delay) if next <= MAX_RETRIES => RetryDecision::Requeue {
            retry_count: next,
            delay,
        },
        _ => RetryDecision::Exhausted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_table() {
        assert_eq!(backoff_for_retry(0), None);
        assert_eq!(backoff_for_retry(1), Some(Duration::minutes(1)));
        assert_eq!(backoff_for_retry(2), Some(Duration::minutes(5)));
        assert_eq!(backoff_for_retry(3), Some(Duration::minutes(15)));
        assert_eq!(backoff_for_retry(4), None);
    }

    #[test]
    fn test_next_attempt_walks_the_table() {
        assert_eq!(
            next_attempt(0),
            RetryDecision::Requeue { retry_count: 1, delay: Duration::minutes(1) }
        );
        assert_eq!(
            next_attempt(2),
            RetryDecision::Requeue { retry_count: 3, delay: Duration::minutes(15) }
        );
        assert_eq!(next_attempt(MAX_RETRIES), RetryDecision::Exhausted);
    }
}
