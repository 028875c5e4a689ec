//! 登录限流
//! 显式构造、可注入的固定窗口计数器，挡在会话协议之前；
//! 超限的请求在触达凭证存储之前就被拒绝

use crate::{config::SecurityConfig, error::AppError};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// 登录限流器接口
///
/// 具体算法是策略而非正确性问题，保持可替换（如换成 Redis 分布式限流）
pub trait LoginRateLimiter: Send + Sync {
    /// 登录入口处调用；该客户端已超限时返回 RateLimitExceeded
    fn check(&self, client_key: &str) -> Result<(), AppError>;

    /// 记录一次失败的登录尝试
    fn record_failure(&self, client_key: &str);

    /// 登录成功后清空该客户端的计数
    fn reset(&self, client_key: &str);
}

/// 超过此条目数时顺带清理过期窗口，保证状态有界
const PRUNE_THRESHOLD: usize = 1024;

struct AttemptWindow {
    started_at: Instant,
    failures: u32,
}

/// 基于内存的固定窗口限流器
pub struct FixedWindowLimiter {
    max_attempts: u32,
    window: Duration,
    windows: Mutex<HashMap<String, AttemptWindow>>,
}

impl FixedWindowLimiter {
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(policy: &SecurityConfig) -> Self {
        Self::new(
            policy.max_login_attempts,
            Duration::from_secs(policy.login_window_secs),
        )
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, AttemptWindow>> {
        self.windows.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl LoginRateLimiter for FixedWindowLimiter {
    fn check(&self, client_key: &str) -> Result<(), AppError> {
        let mut windows = self.lock();

        match windows.get(client_key) {
            // 窗口已滚动，旧计数作废
            Some(w) if w.started_at.elapsed() >= self.window => {
                windows.remove(client_key);
                Ok(())
            }
            Some(w) if w.failures >= self.max_attempts => {
                tracing::warn!(
                    %client_key,
                    failures = w.failures,
                    "Rate limit exceeded for login"
                );
                Err(AppError::RateLimitExceeded)
            }
            _ => Ok(()),
        }
    }

    fn record_failure(&self, client_key: &str) {
        let mut windows = self.lock();

        if windows.len() >= PRUNE_THRESHOLD {
            let window = self.window;
            windows.retain(|_, w| w.started_at.elapsed() < window);
        }

        let entry = windows
            .entry(client_key.to_string())
            .or_insert_with(|| AttemptWindow {
                started_at: Instant::now(),
                failures: 0,
            });

        if entry.started_at.elapsed() >= self.window {
            entry.started_at = Instant::now();
            entry.failures = 0;
        }

        entry.failures += 1;
    }

    fn reset(&self, client_key: &str) {
        self.lock().remove(client_key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_until_threshold() {
        let limiter = FixedWindowLimiter::new(5, Duration::from_secs(300));

        for _ in 0..5 {
            assert!(limiter.check("10.0.0.1").is_ok());
            limiter.record_failure("10.0.0.1");
        }

        // 第 6 次尝试被拒绝
        assert!(limiter.check("10.0.0.1").is_err());
    }

    #[test]
    fn test_window_rollover_clears_count() {
        let limiter = FixedWindowLimiter::new(2, Duration::from_millis(20));

        limiter.record_failure("10.0.0.1");
        limiter.record_failure("10.0.0.1");
        assert!(limiter.check("10.0.0.1").is_err());

        std::thread::sleep(Duration::from_millis(30));
        assert!(limiter.check("10.0.0.1").is_ok());
    }

    #[test]
    fn test_reset_clears_count() {
        let limiter = FixedWindowLimiter::new(2, Duration::from_secs(300));

        limiter.record_failure("10.0.0.1");
        limiter.record_failure("10.0.0.1");
        assert!(limiter.check("10.0.0.1").is_err());

        limiter.reset("10.0.0.1");
        assert!(limiter.check("10.0.0.1").is_ok());
    }

    #[test]
    fn test_clients_are_counted_separately() {
        let limiter = FixedWindowLimiter::new(1, Duration::from_secs(300));

        limiter.record_failure("10.0.0.1");
        assert!(limiter.check("10.0.0.1").is_err());
        assert!(limiter.check("10.0.0.2").is_ok());
    }
}
