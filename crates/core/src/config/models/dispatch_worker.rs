use serde::{Deserialize, Serialize};

use crate::models::ScheduleEntry;
use crate::retry::RetryPolicy;

/// 提交侧默认值
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub default_queue: String,
    /// 内置任务定义使用的重试策略
    pub retry: RetryPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_queue: "default".to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

impl DispatchConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.default_queue.is_empty() {
            return Err(anyhow::anyhow!("默认队列名称不能为空"));
        }

        if self.retry.multiplier < 1.0 {
            return Err(anyhow::anyhow!("退避倍数不能小于1: {}", self.retry.multiplier));
        }

        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(anyhow::anyhow!(
                "抖动因子必须在0.0-1.0之间: {}",
                self.retry.jitter_factor
            ));
        }

        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(anyhow::anyhow!("最大重试间隔不能小于基础重试间隔"));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// 未设置时使用 `<hostname>-<随机后缀>`
    pub worker_id: Option<String>,
    pub concurrency: usize,
    /// 按优先级从高到低排列
    pub queues: Vec<String>,
    pub poll_interval_ms: u64,
    pub prefetch: usize,
    /// 任务定义未声明超时时使用
    pub task_timeout_seconds: u64,
    pub revocation_poll_ms: u64,
    pub shutdown_grace_seconds: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: None,
            concurrency: 4,
            queues: vec!["default".to_string()],
            poll_interval_ms: 500,
            prefetch: 1,
            task_timeout_seconds: 300,
            revocation_poll_ms: 1_000,
            shutdown_grace_seconds: 30,
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if matches!(&self.worker_id, Some(id) if id.is_empty()) {
            return Err(anyhow::anyhow!("Worker ID不能为空"));
        }

        if self.concurrency == 0 {
            return Err(anyhow::anyhow!("最大并发任务数必须大于0"));
        }

        if self.queues.is_empty() || self.queues.iter().any(|q| q.is_empty()) {
            return Err(anyhow::anyhow!("消费队列列表不能为空"));
        }

        if self.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("任务轮询间隔必须大于0"));
        }

        if self.prefetch == 0 {
            return Err(anyhow::anyhow!("预取数量必须大于0"));
        }

        if self.task_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("任务超时时间必须大于0"));
        }

        if self.revocation_poll_ms == 0 {
            return Err(anyhow::anyhow!("撤销检查间隔必须大于0"));
        }

        Ok(())
    }
}

const MAX_LEASE_TTL_SECONDS: u64 = 24 * 3600;
const MAX_RECOVERY_GRACE_SECONDS: u64 = 30 * 24 * 3600;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BeatConfig {
    pub enabled: bool,
    pub tick_interval_ms: u64,
    pub lease_name: String,
    pub lease_ttl_seconds: u64,
    /// 未设置时使用 `<hostname>-<随机后缀>`
    pub scheduler_id: Option<String>,
    /// 超过该时长仍未确认发布的信封由恢复扫描补发
    pub recovery_grace_seconds: u64,
    pub recovery_batch: usize,
    pub entries: Vec<ScheduleEntry>,
}

impl Default for BeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval_ms: 1_000,
            lease_name: "taskbeat-beat".to_string(),
            lease_ttl_seconds: 15,
            scheduler_id: None,
            recovery_grace_seconds: 60,
            recovery_batch: 100,
            entries: Vec::new(),
        }
    }
}

impl BeatConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.tick_interval_ms == 0 {
            return Err(anyhow::anyhow!("调度间隔必须大于0"));
        }

        if self.lease_name.is_empty() {
            return Err(anyhow::anyhow!("租约名称不能为空"));
        }

        if self.lease_ttl_seconds > MAX_LEASE_TTL_SECONDS {
            return Err(anyhow::anyhow!(
                "租约TTL不能超过{}秒",
                MAX_LEASE_TTL_SECONDS
            ));
        }

        if self.recovery_grace_seconds > MAX_RECOVERY_GRACE_SECONDS {
            return Err(anyhow::anyhow!(
                "恢复宽限期不能超过{}秒",
                MAX_RECOVERY_GRACE_SECONDS
            ));
        }

        // 续期发生在每次 tick，TTL 至少要覆盖两次 tick
        if self.lease_ttl_seconds.saturating_mul(1_000) < self.tick_interval_ms.saturating_mul(2) {
            return Err(anyhow::anyhow!(
                "租约TTL({}s)必须至少为调度间隔({}ms)的两倍",
                self.lease_ttl_seconds,
                self.tick_interval_ms
            ));
        }

        let mut names = std::collections::HashSet::new();
        for entry in &self.entries {
            if entry.name.is_empty() || entry.task_name.is_empty() {
                return Err(anyhow::anyhow!("调度条目名称和任务名称不能为空"));
            }
            if !names.insert(entry.name.as_str()) {
                return Err(anyhow::anyhow!("调度条目名称重复: {}", entry.name));
            }
        }

        Ok(())
    }
}
