use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 调度触发器
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleTrigger {
    /// 固定间隔，单位秒
    Interval { seconds: u64 },
    /// 标准CRON表达式（含秒字段）
    Cron { expression: String },
}

impl ScheduleTrigger {
    pub fn describe(&self) -> String {
        match self {
            ScheduleTrigger::Interval { seconds } => format!("every {seconds}s"),
            ScheduleTrigger::Cron { expression } => format!("cron '{expression}'"),
        }
    }
}

/// 周期调度条目，只由 beat 调度器修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub name: String,
    pub task_name: String,
    pub trigger: ScheduleTrigger,
    #[serde(default = "empty_args")]
    pub args: serde_json::Value,
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub total_run_count: u64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_enabled() -> bool {
    true
}

fn empty_args() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl ScheduleEntry {
    pub fn new(
        name: impl Into<String>,
        task_name: impl Into<String>,
        trigger: ScheduleTrigger,
        args: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            task_name: task_name.into(),
            trigger,
            args,
            queue: None,
            max_retries: None,
            last_run_at: None,
            enabled: true,
            total_run_count: 0,
            created_at: Utc::now(),
        }
    }

    pub fn interval(
        name: impl Into<String>,
        task_name: impl Into<String>,
        seconds: u64,
        args: serde_json::Value,
    ) -> Self {
        Self::new(name, task_name, ScheduleTrigger::Interval { seconds }, args)
    }

    pub fn cron(
        name: impl Into<String>,
        task_name: impl Into<String>,
        expression: impl Into<String>,
        args: serde_json::Value,
    ) -> Self {
        Self::new(
            name,
            task_name,
            ScheduleTrigger::Cron {
                expression: expression.into(),
            },
            args,
        )
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// 计算下一次到期时间的基准点
    pub fn reference_time(&self) -> DateTime<Utc> {
        self.last_run_at.unwrap_or(self.created_at)
    }
}

/// 单个条目在一次 tick 中的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireOutcome {
    /// CAS 成功，本 tick 负责发布
    Fired,
    /// last_run_at 已被其他调度器推进
    AlreadyFired,
    /// 租约已不属于本调度器
    LeaseLost,
}
