// Per-batch flush state machine and retry policy
use crate::application::errors::StoreError;
use std::time::Duration;

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Exponential backoff for batch retries: base, 2*base, 4*base ... capped at 30s
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total store attempts per batch, including the first
    pub max_attempts: u32,
    pub base: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base,
        }
    }

    /// Delay before attempt `attempt + 1`, after `attempt` failures
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(MAX_BACKOFF)
            .min(MAX_BACKOFF)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowOutcome {
    OverflowLogged,
    /// Writing the side channel failed too; the samples only survive in the error log
    OverflowWriteFailed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BatchState {
    Pending,
    Flushing { attempt: u32 },
    RetryScheduled { attempt: u32, delay: Duration },
    Stored,
    Failed(OverflowOutcome),
}

impl BatchState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchState::Stored | BatchState::Failed(_))
    }

    /// Transition out of `Flushing { attempt }` given the store's answer.
    /// Returns `None` when the batch must go to the overflow log.
    pub fn after_attempt(
        attempt: u32,
        result: &Result<(), StoreError>,
        policy: &RetryPolicy,
    ) -> Option<BatchState> {
        match result {
            Ok(()) => Some(BatchState::Stored),
            Err(StoreError::Malformed(_)) => None,
            Err(_) if attempt >= policy.max_attempts => None,
            Err(_) => Some(BatchState::RetryScheduled {
                attempt,
                delay: policy.delay_after(attempt),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(10, Duration::from_millis(200));
        assert_eq!(policy.delay_after(1), Duration::from_millis(200));
        assert_eq!(policy.delay_after(2), Duration::from_millis(400));
        assert_eq!(policy.delay_after(3), Duration::from_millis(800));
        assert_eq!(policy.delay_after(12), MAX_BACKOFF);
    }

    #[test]
    fn test_transient_failure_schedules_retry_until_exhausted() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        let failed = Err(StoreError::Transient("boom".to_string()));

        assert_eq!(
            BatchState::after_attempt(1, &failed, &policy),
            Some(BatchState::RetryScheduled {
                attempt: 1,
                delay: Duration::from_millis(100)
            })
        );
        assert_eq!(BatchState::after_attempt(3, &failed, &policy), None);
    }

    #[test]
    fn test_unavailable_is_retried_but_malformed_is_not() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        let unavailable = Err(StoreError::Unavailable("down".to_string()));
        let malformed = Err(StoreError::Malformed("400".to_string()));

        assert!(matches!(
            BatchState::after_attempt(1, &unavailable, &policy),
            Some(BatchState::RetryScheduled { .. })
        ));
        assert_eq!(BatchState::after_attempt(1, &malformed, &policy), None);
        assert_eq!(
            BatchState::after_attempt(2, &Ok(()), &policy),
            Some(BatchState::Stored)
        );
    }

    #[test]
    fn test_zero_attempts_still_tries_once() {
        let policy = RetryPolicy::new(0, Duration::from_millis(1));
        assert_eq!(policy.max_attempts, 1);
    }
}
