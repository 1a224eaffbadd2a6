//! 带指数退避与随机抖动的重试
//!
//! 所有需要重试的写入都走这里，工作单元以闭包传入，每次尝试从头执行。

use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::Config;

/// 重试策略
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// 最大尝试次数（含第一次）
    pub max_attempts: u32,
    /// 第一次重试前的基准等待
    pub base_delay: Duration,
    /// 退避上限（不含抖动）
    pub max_delay: Duration,
    /// 抖动上限，实际抖动在 [0, jitter] 内均匀分布
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            jitter: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.write_max_attempts.max(1),
            base_delay: Duration::from_millis(config.write_backoff_base_ms),
            max_delay: Duration::from_millis(config.write_backoff_cap_ms),
            jitter: Duration::from_millis(config.write_jitter_ms),
        }
    }

    /// 不等待的策略（测试用）
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    /// 第 `failed_attempts` 次失败后的退避（不含抖动）：min(base × 2^(n-1), cap)
    pub fn backoff(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(20);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// 退避加上随机抖动
    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.backoff(failed_attempts) + Duration::from_millis(jitter)
    }
}

/// 重试过程中的事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryEvent {
    /// 即将开始第 `attempt` 次尝试（从 1 开始）
    Attempting { attempt: u32 },
    /// 第 `attempt` 次尝试遇到瞬时错误，等待后重试
    Retrying { attempt: u32, delay: Duration },
}

/// 重试失败
#[derive(Debug)]
pub enum RetryError<E> {
    /// 瞬时错误，尝试次数已用完
    Exhausted { attempts: u32, last: E },
    /// 不可重试的错误
    Permanent { attempt: u32, error: E },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } => *attempts,
            RetryError::Permanent { attempt, .. } => *attempt,
        }
    }

    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Permanent { error, .. } => error,
        }
    }
}

/// 执行 `operation`，遇到瞬时错误时按策略退避重试
///
/// 成功时返回 (结果, 实际尝试次数)
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    is_transient: impl Fn(&E) -> bool,
    operation: F,
) -> Result<(T, u32), RetryError<E>>
where
    E: Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    retry_with_backoff_observed(policy, label, is_transient, operation, |_| {}).await
}

/// 同 [`retry_with_backoff`]，并把每次状态变化通知给 `on_event`
pub async fn retry_with_backoff_observed<T, E, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    is_transient: impl Fn(&E) -> bool,
    mut operation: F,
    mut on_event: impl FnMut(RetryEvent),
) -> Result<(T, u32), RetryError<E>>
where
    E: Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        on_event(RetryEvent::Attempting { attempt });

        match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!("[{}] 第 {} 次尝试成功", label, attempt);
                }
                return Ok((value, attempt));
            }
            Err(e) if !is_transient(&e) => {
                warn!("[{}] 不可重试的错误: {}", label, e);
                return Err(RetryError::Permanent { attempt, error: e });
            }
            Err(e) if attempt >= max_attempts => {
                warn!("[{}] ❌ 已尝试 {} 次仍失败: {}", label, attempt, e);
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: e,
                });
            }
            Err(e) => {
                let delay = policy.delay_for(attempt);
                warn!(
                    "[{}] ⚠️ 瞬时错误 (尝试 {}/{}), {:?} 后重试: {}",
                    label, attempt, max_attempts, delay, e
                );
                on_event(RetryEvent::Retrying { attempt, delay });
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    enum TestError {
        Busy,
        Broken,
    }

    impl Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    fn transient(e: &TestError) -> bool {
        matches!(e, TestError::Busy)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            jitter: Duration::ZERO,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_millis(500));
        assert_eq!(policy.backoff(60), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(10),
            jitter: Duration::from_millis(5),
        };
        for _ in 0..200 {
            let delay = policy.delay_for(1);
            assert!(delay >= Duration::from_millis(10));
            assert!(delay <= Duration::from_millis(15));
        }
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(&RetryPolicy::immediate(3), "test", transient, |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(TestError::Busy)
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        let (value, attempts) = result.unwrap();
        assert_eq!(value, "done");
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let calls = AtomicU32::new(0);
        let result: Result<((), u32), _> =
            retry_with_backoff(&RetryPolicy::immediate(3), "test", transient, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError::Busy) }
            })
            .await;

        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 3, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<((), u32), _> =
            retry_with_backoff(&RetryPolicy::immediate(5), "test", transient, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError::Broken) }
            })
            .await;

        assert!(matches!(result, Err(RetryError::Permanent { attempt: 1, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_events_reported_in_order() {
        let mut events = Vec::new();
        let calls = AtomicU32::new(0);
        let _ = retry_with_backoff_observed(
            &RetryPolicy::immediate(3),
            "test",
            transient,
            |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(TestError::Busy)
                    } else {
                        Ok(())
                    }
                }
            },
            |event| events.push(event),
        )
        .await;

        assert_eq!(
            events,
            vec![
                RetryEvent::Attempting { attempt: 1 },
                RetryEvent::Retrying {
                    attempt: 1,
                    delay: Duration::ZERO
                },
                RetryEvent::Attempting { attempt: 2 },
            ]
        );
    }
}
