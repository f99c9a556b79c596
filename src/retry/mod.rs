//! 重试策略模块

pub mod exponential;

pub use exponential::ExponentialBackoffPolicy;

use crate::error::{CoordError, Result};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// 重试策略 trait
///
/// `attempt` 从 1 开始，表示已经失败的次数。
pub trait RetryPolicy: Send + Sync {
    fn should_retry(&self, attempt: usize, error: &CoordError) -> bool;
    fn backoff_duration(&self, attempt: usize) -> Duration;
    fn max_attempts(&self) -> usize;
}

/// 按策略执行异步操作
///
/// 只重试瞬时错误；预算耗尽后把最后一次错误包装为 `ServiceUnavailable`。
/// 语义错误（不存在、冲突、校验失败）立即返回。
pub async fn retry_with_policy<P, F, Fut, T>(policy: &P, operation: &str, mut f: F) -> Result<T>
where
    P: RetryPolicy + ?Sized,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0usize;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) => {
                attempt += 1;
                if !policy.should_retry(attempt, &err) {
                    warn!(
                        operation,
                        attempts = attempt,
                        error = %err,
                        "Store operation exhausted its retry budget"
                    );
                    return Err(CoordError::unavailable(format!(
                        "{} failed after {} attempts: {}",
                        operation, attempt, err
                    )));
                }
                let delay = policy.backoff_duration(attempt);
                debug!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying store operation"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn policy() -> ExponentialBackoffPolicy {
        ExponentialBackoffPolicy::new(3, Duration::from_millis(10), Duration::from_millis(40))
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried_then_succeed() {
        let calls = AtomicUsize::new(0);
        let result = retry_with_policy(&policy(), "get", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(CoordError::connection("reset by peer"))
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_budget_becomes_unavailable() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = retry_with_policy(&policy(), "put", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(CoordError::connection("refused"))
        })
        .await;
        assert!(matches!(result, Err(CoordError::ServiceUnavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_semantic_errors_are_not_retried() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = retry_with_policy(&policy(), "txn", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(CoordError::lock_held("job:42"))
        })
        .await;
        assert!(result.unwrap_err().is_conflict());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
