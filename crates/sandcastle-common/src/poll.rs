//! Bounded polling for readiness waits
//!
//! The bootstrap sequence has exactly two kinds of blocking wait: API
//! reachability and node registration. Both go through [`wait_with_timeout`],
//! which polls a check function until it reports a value, the deadline
//! passes, or the caller cancels.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::Error;

/// Result type for polling check functions.
///
/// - `Ok(Some(value))` - Condition met, return the value
/// - `Ok(None)` - Condition not met yet, keep polling
/// - `Err(e)` - Fatal error, stop polling immediately
pub type PollResult<T> = std::result::Result<Option<T>, Error>;

/// Poll `check_fn` every `interval` until it yields a value.
///
/// The check always runs at least once. A check still in flight when the
/// deadline passes is abandoned. Timeouts surface as
/// [`Error::ReadinessTimeout`] naming `target`; cancellation surfaces as
/// [`Error::Cancelled`].
pub async fn wait_with_timeout<T, F, Fut>(
    timeout: Duration,
    interval: Duration,
    target: &str,
    cancel: &CancellationToken,
    mut check_fn: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PollResult<T>>,
{
    let deadline = Instant::now() + timeout;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::cancelled(format!("wait for {}", target)));
        }

        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::cancelled(format!("wait for {}", target))),
            outcome = tokio::time::timeout_at(deadline, check_fn()) => outcome,
        };

        match outcome {
            Ok(Ok(Some(value))) => return Ok(value),
            Ok(Ok(None)) => debug!(target = %target, "not ready yet"),
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(Error::readiness_timeout(target, timeout)),
        }

        if Instant::now() + interval > deadline {
            return Err(Error::readiness_timeout(target, timeout));
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::cancelled(format!("wait for {}", target))),
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn returns_value_once_condition_is_met() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let value = wait_with_timeout(
            Duration::from_secs(30),
            Duration::from_secs(1),
            "counter",
            &CancellationToken::new(),
            || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    Ok(if n >= 3 { Some(n) } else { None })
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_naming_the_target() {
        let err = wait_with_timeout(
            Duration::from_secs(300),
            Duration::from_secs(2),
            "10.87.13.37:6443",
            &CancellationToken::new(),
            || async { Ok::<Option<()>, Error>(None) },
        )
        .await
        .unwrap_err();

        match err {
            Error::ReadinessTimeout {
                target,
                waited_secs,
            } => {
                assert_eq!(target, "10.87.13.37:6443");
                assert_eq!(waited_secs, 300);
            }
            other => panic!("expected ReadinessTimeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hung_check_is_bounded_by_the_deadline() {
        let err = wait_with_timeout(
            Duration::from_secs(5),
            Duration::from_secs(1),
            "node/t1-worker-1",
            &CancellationToken::new(),
            || async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok::<Option<()>, Error>(Some(()))
            },
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind(), "ReadinessTimeoutError");
    }

    #[tokio::test(start_paused = true)]
    async fn check_errors_stop_polling_immediately() {
        let err = wait_with_timeout(
            Duration::from_secs(300),
            Duration::from_secs(2),
            "node/t1-worker-1",
            &CancellationToken::new(),
            || async { Err::<Option<()>, _>(Error::engine("exec", "toolbox gone")) },
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind(), "EngineError");
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_wait() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            trigger.cancel();
        });

        let err = wait_with_timeout(
            Duration::from_secs(300),
            Duration::from_secs(2),
            "10.87.13.37:6443",
            &cancel,
            || async { Ok::<Option<()>, Error>(None) },
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind(), "Cancelled");
    }
}
