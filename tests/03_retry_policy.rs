//! Retry bound tests
//!
//! A send wrapped in the three-attempt policy resolves when the transport
//! recovers within the bound and surfaces the last error otherwise.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tessera::error::{ErrorCode, ExchangeError, ExchangeResult};
use tessera::retry::{ReconnectPolicy, RetryPolicy};

fn flaky(failures: u32) -> (Arc<AtomicU32>, impl FnMut() -> ExchangeResult<&'static str>) {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let op = move || {
        let attempt = counter.fetch_add(1, Ordering::SeqCst);
        if attempt < failures {
            Err(ExchangeError::general(format!("attempt {} failed", attempt + 1)))
        } else {
            Ok("delivered")
        }
    };
    (calls, op)
}

fn quick_policy() -> RetryPolicy {
    RetryPolicy::new(3).with_backoff(Duration::from_millis(1), Duration::from_millis(2))
}

#[tokio::test]
async fn test_recovers_within_bound() {
    for failures in 0..3u32 {
        let (calls, mut op) = flaky(failures);
        let result = quick_policy().execute(|| {
            let outcome = op();
            async move { outcome }
        })
        .await;

        assert_eq!(result.unwrap(), "delivered", "with {} failures", failures);
        assert_eq!(calls.load(Ordering::SeqCst), failures + 1);
    }
}

#[tokio::test]
async fn test_rejects_at_bound() {
    let (calls, mut op) = flaky(3);
    let result = quick_policy().execute(|| {
        let outcome = op();
        async move { outcome }
    })
    .await;

    let err = result.unwrap_err();
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    // the surfaced error is the last attempt's
    assert!(err.message().contains("attempt 3"));
}

#[tokio::test]
async fn test_retry_hook_sees_every_retry() {
    let retries = Arc::new(AtomicU32::new(0));
    let seen = retries.clone();
    let policy = RetryPolicy::new(3)
        .with_backoff(Duration::from_millis(1), Duration::from_millis(2))
        .on_retry(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

    let _: ExchangeResult<()> = policy
        .execute(|| async { Err(ExchangeError::general("always")) })
        .await;

    // three attempts means two retries
    assert_eq!(retries.load(Ordering::SeqCst), 2);
}

#[test]
fn test_reconnect_backoff_shape() {
    let policy = ReconnectPolicy::new(Duration::from_millis(5_000), None);
    assert_eq!(policy.interval(1), Duration::from_millis(50));
    assert_eq!(policy.interval(20), Duration::from_millis(1_000));
    // capped at the configured maximum
    assert_eq!(policy.interval(1_000), Duration::from_millis(5_000));
}

#[test]
fn test_reconnect_attempt_cap_is_typed() {
    let policy = ReconnectPolicy::new(Duration::from_millis(100), Some(10));
    assert!(policy.check_attempts(10).is_ok());
    assert_eq!(
        policy.check_attempts(11).unwrap_err().code(),
        ErrorCode::RetryAttemptsExceeded
    );
}

#[test]
fn test_uncapped_reconnect_never_gives_up() {
    let policy = ReconnectPolicy::new(Duration::from_millis(100), None);
    assert!(policy.check_attempts(u32::MAX).is_ok());
}
