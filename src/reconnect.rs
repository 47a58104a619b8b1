//! 重连策略
//!
//! 传输层（TransportManager）和会话层（ChatChannel）共用同一个策略：
//! 第 n 次重试前等待 `min(base * 2^n, max_delay)`，最多重试 `max_attempts` 次。

use std::time::Duration;

/// 重连策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// 最大重试次数
    pub max_attempts: u32,
    /// 初始延迟
    pub base_delay: Duration,
    /// 延迟上限
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
        }
    }
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// 第 `attempt` 次重试（从 0 开始）前的等待时间，超过上限返回 None
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        Some(self.base_delay.saturating_mul(factor).min(self.max_delay))
    }
}

/// 重试计数器
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempts: u32,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempts: 0 }
    }

    /// 取下一次延迟并计数；已用尽返回 None
    pub fn next_delay(&mut self) -> Option<Duration> {
        let delay = self.policy.delay_for(self.attempts)?;
        self.attempts += 1;
        Some(delay)
    }

    /// 已尝试次数
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// 连接成功后清零
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.policy.max_attempts
    }
}
