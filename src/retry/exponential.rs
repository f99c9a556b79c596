use super::RetryPolicy;
use crate::config::RetryConfig;
use crate::error::CoordError;
use rand::Rng;
use std::time::Duration;

/// 指数退避重试策略
///
/// 第 n 次重试的基础延迟为 `base_delay * multiplier^(n-1)`，上限 `max_delay`，
/// 再叠加 `±jitter` 比例的随机抖动。
#[derive(Debug, Clone)]
pub struct ExponentialBackoffPolicy {
    max_attempts: usize,
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: f64,
}

impl ExponentialBackoffPolicy {
    pub fn new(max_attempts: usize, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            config.initial_delay(),
            config.max_delay(),
        )
        .with_multiplier(config.multiplier)
        .with_jitter(config.jitter)
    }

    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// 不带抖动的延迟
    fn raw_delay(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let millis = self.base_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

impl RetryPolicy for ExponentialBackoffPolicy {
    fn should_retry(&self, attempt: usize, error: &CoordError) -> bool {
        if attempt >= self.max_attempts {
            return false;
        }

        // 只对可重试的错误进行重试
        error.is_retryable()
    }

    fn backoff_duration(&self, attempt: usize) -> Duration {
        let delay = self.raw_delay(attempt);
        if self.jitter <= f64::EPSILON {
            return delay;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        let millis = (delay.as_millis() as f64 * (1.0 + spread)).max(0.0);
        Duration::from_millis(millis as u64).min(self.max_delay)
    }

    fn max_attempts(&self) -> usize {
        self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = ExponentialBackoffPolicy::new(
            10,
            Duration::from_millis(100),
            Duration::from_secs(2),
        )
        .with_multiplier(1.5);

        assert_eq!(policy.backoff_duration(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_duration(2), Duration::from_millis(150));
        assert_eq!(policy.backoff_duration(3), Duration::from_millis(225));
        assert_eq!(policy.backoff_duration(30), Duration::from_secs(2));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = ExponentialBackoffPolicy::new(
            5,
            Duration::from_millis(1000),
            Duration::from_secs(10),
        )
        .with_jitter(0.1);

        for _ in 0..100 {
            let delay = policy.backoff_duration(1);
            assert!(delay >= Duration::from_millis(900), "{:?}", delay);
            assert!(delay <= Duration::from_millis(1100), "{:?}", delay);
        }
    }

    #[test]
    fn test_should_retry_respects_budget_and_kind() {
        let policy =
            ExponentialBackoffPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5));
        let transient = CoordError::connection("eof");
        assert!(policy.should_retry(1, &transient));
        assert!(policy.should_retry(2, &transient));
        assert!(!policy.should_retry(3, &transient));
        assert!(!policy.should_retry(1, &CoordError::key_not_found("k")));
    }
}
