//! Bounded status polling
//!
//! Fixed-interval re-fetch with a hard attempt cap. No backoff.

use super::error::{ApiError, Result};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            interval: Duration::from_secs(3),
        }
    }
}

/// Sleep, fetch, test; repeat up to `policy.max_attempts` times.
///
/// `done` may fail to abort the loop early. The sleep comes first, so the
/// first fetch happens one interval after the call.
pub async fn poll_until<T, F, Fut, P, E>(
    policy: &PollPolicy,
    cancel: &CancellationToken,
    mut fetch: F,
    mut done: P,
    on_timeout: E,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: FnMut(&T) -> Result<bool>,
    E: FnOnce(u32) -> ApiError,
{
    for attempt in 1..=policy.max_attempts {
        if cancel.is_cancelled() {
            return Err(ApiError::Cancelled);
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(ApiError::Cancelled),
            _ = tokio::time::sleep(policy.interval) => {}
        }

        let value = fetch().await?;
        if done(&value)? {
            tracing::debug!("Poll satisfied on attempt {}", attempt);
            return Ok(value);
        }
        tracing::trace!("Poll attempt {}/{} not ready", attempt, policy.max_attempts);
    }

    tracing::warn!("Poll gave up after {} attempts", policy.max_attempts);
    Err(on_timeout(policy.max_attempts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn timeout(attempts: u32) -> ApiError {
        ApiError::Timeout {
            message: "not ready".into(),
            attempts,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_first_satisfying_value() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let start = tokio::time::Instant::now();

        let value = poll_until(
            &PollPolicy::default(),
            &CancellationToken::new(),
            || async move { Ok(calls.fetch_add(1, Ordering::SeqCst) + 1) },
            |n| Ok(*n == 3),
            timeout,
        )
        .await
        .unwrap();

        assert_eq!(value, 3);
        assert_eq!(start.elapsed(), Duration::from_secs(9));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_timeout_error() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let policy = PollPolicy {
            max_attempts: 4,
            interval: Duration::from_millis(500),
        };

        let err = poll_until(
            &policy,
            &CancellationToken::new(),
            || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            |_| Ok(false),
            timeout,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ApiError::Timeout { attempts: 4, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_predicate_error_aborts() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let err = poll_until(
            &PollPolicy::default(),
            &CancellationToken::new(),
            || async move { Ok(counter.fetch_add(1, Ordering::SeqCst)) },
            |_| {
                Err(ApiError::VolumeFailed {
                    volume_id: "vol-1".into(),
                    status: "error".into(),
                })
            },
            timeout,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ApiError::VolumeFailed { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_polling() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let handle = {
            let calls = Arc::clone(&calls);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let counter = &*calls;
                poll_until(
                    &PollPolicy::default(),
                    &cancel,
                    || async move { Ok(counter.fetch_add(1, Ordering::SeqCst)) },
                    |_| Ok(false),
                    timeout,
                )
                .await
            })
        };

        tokio::time::sleep(Duration::from_millis(7500)).await;
        cancel.cancel();

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, ApiError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_already_cancelled_never_fetches() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = poll_until(
            &PollPolicy::default(),
            &cancel,
            || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            |_| Ok(true),
            timeout,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ApiError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
