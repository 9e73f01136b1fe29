use chrono::Duration;

use crate::dispatch::models::MissionQueueItem;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-enter `ReadyToAssign` once `delay` has elapsed.
    Retry { delay: Duration },
    /// Retries exhausted; the caller must move the item to `Failed`.
    GiveUp,
}

/// Fixed-delay retry policy for failed mission submissions. The caller
/// increments `retry_count` before asking, so `GiveUp` fires on the attempt
/// that reaches the cap.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retry_attempts: i32,
    pub retry_delay_seconds: i64,
}

impl RetryPolicy {
    pub fn decide(&self, item: &MissionQueueItem) -> RetryDecision {
        if item.retry_count < self.max_retry_attempts {
            RetryDecision::Retry {
                delay: Duration::seconds(self.retry_delay_seconds),
            }
        } else {
            RetryDecision::GiveUp
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::models::Point;

    fn item_with_retry_count(retry_count: i32) -> MissionQueueItem {
        let mut item = MissionQueueItem::enqueue(
            "M-1".to_string(),
            "MAP-A".to_string(),
            Point::new(0.0, 0.0),
            5,
            false,
        );
        item.retry_count = retry_count;
        item
    }

    #[test]
    fn test_retries_until_cap_then_gives_up() {
        let policy = RetryPolicy {
            max_retry_attempts: 3,
            retry_delay_seconds: 10,
        };
        for attempt in 1..3 {
            assert_eq!(
                policy.decide(&item_with_retry_count(attempt)),
                RetryDecision::Retry {
                    delay: Duration::seconds(10)
                },
                "attempt {attempt} should still retry"
            );
        }
        assert_eq!(
            policy.decide(&item_with_retry_count(3)),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn test_zero_cap_never_retries() {
        let policy = RetryPolicy {
            max_retry_attempts: 0,
            retry_delay_seconds: 10,
        };
        assert_eq!(
            policy.decide(&item_with_retry_count(1)),
            RetryDecision::GiveUp
        );
    }
}
