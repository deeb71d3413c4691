//! Bounded retry of single USB transfers.
//!
//! Both directions go through [`retry_transfer`]: writes pass the chunk length
//! so a short write counts as a failed attempt, reads pass `None` and only
//! retry on transfer errors.

use tracing::warn;

use crate::transport::TransportError;

/// How many times one transfer may be attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Why the last attempt of an exhausted retry failed.
#[derive(Debug)]
pub enum LastFailure {
    /// Transfer completed with fewer bytes than expected.
    Short { transferred: usize, expected: usize },
    Error(TransportError),
}

#[derive(Debug)]
pub struct RetryExhausted {
    pub attempts: u32,
    pub last: LastFailure,
}

/// Run `transfer` until it succeeds or the policy runs out.
///
/// With `expected = Some(n)` a result below `n` is a failed attempt. Timeouts
/// are retried like any other error; callers that treat an idle endpoint as
/// normal should use a single-attempt policy.
pub fn retry_transfer<F>(
    policy: RetryPolicy,
    expected: Option<usize>,
    mut transfer: F,
) -> Result<usize, RetryExhausted>
where
    F: FnMut(u32) -> Result<usize, TransportError>,
{
    let attempts = policy.attempts();
    let mut last = None;

    for attempt in 1..=attempts {
        match transfer(attempt) {
            Ok(n) => match expected {
                Some(expected) if n < expected => {
                    warn!(attempt, transferred = n, expected, "Short USB transfer");
                    last = Some(LastFailure::Short {
                        transferred: n,
                        expected,
                    });
                }
                _ => return Ok(n),
            },
            Err(TransportError::Disconnected) => {
                return Err(RetryExhausted {
                    attempts: attempt,
                    last: LastFailure::Error(TransportError::Disconnected),
                });
            }
            Err(e) => {
                if attempts > 1 {
                    warn!(attempt, error = %e, "USB transfer failed");
                }
                last = Some(LastFailure::Error(e));
            }
        }
    }

    Err(RetryExhausted {
        attempts,
        last: last.unwrap_or(LastFailure::Short {
            transferred: 0,
            expected: expected.unwrap_or(0),
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_writes_retried() {
        let mut results = vec![Ok(3), Ok(3), Ok(8)].into_iter();
        let n = retry_transfer(RetryPolicy::new(3), Some(8), |_| results.next().unwrap()).unwrap();
        assert_eq!(n, 8);
    }

    #[test]
    fn test_exhausted_after_max_attempts() {
        let mut calls = 0;
        let err = retry_transfer(RetryPolicy::new(3), Some(8), |_| {
            calls += 1;
            Ok(4)
        })
        .unwrap_err();
        assert_eq!(calls, 3);
        assert_eq!(err.attempts, 3);
        assert!(matches!(
            err.last,
            LastFailure::Short {
                transferred: 4,
                expected: 8
            }
        ));
    }

    #[test]
    fn test_errors_retried_without_expected_length() {
        let mut results = vec![
            Err(TransportError::Timeout { timeout_ms: 20 }),
            Ok(0),
        ]
        .into_iter();
        let n = retry_transfer(RetryPolicy::new(2), None, |_| results.next().unwrap()).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_disconnect_is_not_retried() {
        let mut calls = 0;
        let err = retry_transfer(RetryPolicy::new(3), Some(8), |_| {
            calls += 1;
            Err(TransportError::Disconnected)
        })
        .unwrap_err();
        assert_eq!(calls, 1);
        assert!(matches!(
            err.last,
            LastFailure::Error(TransportError::Disconnected)
        ));
    }

    #[test]
    fn test_zero_attempts_treated_as_one() {
        let mut calls = 0;
        let _ = retry_transfer(RetryPolicy::new(0), None, |_| {
            calls += 1;
            Ok(1)
        });
        assert_eq!(calls, 1);
    }
}
