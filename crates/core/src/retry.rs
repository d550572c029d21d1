use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 任务重试策略：指数退避加随机抖动
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// 首次尝试之外允许的重试次数
    pub max_retries: u32,
    /// 基础重试间隔（毫秒）
    pub base_delay_ms: u64,
    /// 最大重试间隔（毫秒）
    pub max_delay_ms: u64,
    /// 指数退避倍数
    pub multiplier: f64,
    /// 重试间隔的随机抖动范围（0.0-1.0）
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 60_000,
            max_delay_ms: 3_600_000,
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// 不带抖动的间隔，抖动只在此基础上上下浮动
    pub fn base_delay_for(&self, retries_done: u32) -> Duration {
        let base = self.base_delay_ms as f64;
        let exponent = i32::try_from(retries_done).unwrap_or(i32::MAX);
        let capped = (base * self.multiplier.powi(exponent)).min(self.max_delay_ms as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// 第 `retries_done + 1` 次重试前的等待时间
    pub fn delay_for(&self, retries_done: u32) -> Duration {
        let capped = self.base_delay_for(retries_done).as_millis() as f64;
        let jitter = capped * self.jitter_factor * (rand::random::<f64>() - 0.5) * 2.0;
        let final_ms = (capped + jitter)
            .max(self.base_delay_ms as f64)
            .min(self.max_delay_ms.max(self.base_delay_ms) as f64);
        Duration::from_millis(final_ms as u64)
    }

    pub fn next_eta(&self, retries_done: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = self.delay_for(retries_done);
        now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::seconds(60))
    }
}

/// 连接恢复用的有上限指数退避
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// 返回本次等待时间并把下一次翻倍（不超过上限）
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}
