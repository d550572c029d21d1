use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use std::str::FromStr;

use taskbeat_core::{Result, ScheduleEntry, ScheduleTrigger, TaskbeatError};

/// CRON表达式解析和调度工具
pub struct CronScheduler {
    schedule: Schedule,
}

impl CronScheduler {
    /// 创建新的CRON调度器
    pub fn new(cron_expr: &str) -> Result<Self> {
        let schedule = Schedule::from_str(cron_expr).map_err(|e| TaskbeatError::InvalidCron {
            expr: cron_expr.to_string(),
            message: e.to_string(),
        })?;

        Ok(Self { schedule })
    }

    /// 获取下一次执行时间
    pub fn next_execution_time(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&from).next()
    }

    /// 验证CRON表达式是否有效
    pub fn validate_cron_expression(cron_expr: &str) -> Result<()> {
        Self::new(cron_expr).map(|_| ())
    }
}

/// 触发器在 `reference` 之后的下一次触发时间
///
/// 间隔触发器以上次运行时间（从未运行时为创建时间）为基准。
pub fn next_fire_after(
    trigger: &ScheduleTrigger,
    reference: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    match trigger {
        ScheduleTrigger::Interval { seconds } => {
            let next = interval_duration(*seconds)
                .and_then(|interval| reference.checked_add_signed(interval))
                .ok_or_else(|| {
                    TaskbeatError::Configuration(format!("间隔秒数超出范围: {seconds}"))
                })?;
            Ok(Some(next))
        }
        ScheduleTrigger::Cron { expression } => {
            Ok(CronScheduler::new(expression)?.next_execution_time(reference))
        }
    }
}

/// 间隔触发器允许的最大秒数（约100年）
pub const MAX_INTERVAL_SECONDS: u64 = 100 * 366 * 24 * 3600;

fn interval_duration(seconds: u64) -> Option<Duration> {
    if seconds > MAX_INTERVAL_SECONDS {
        return None;
    }
    Duration::try_seconds(i64::try_from(seconds).ok()?)
}

/// 条目是否到期（IDLE → DUE）
pub fn is_due(entry: &ScheduleEntry, now: DateTime<Utc>) -> Result<bool> {
    Ok(next_fire_after(&entry.trigger, entry.reference_time())?.is_some_and(|next| next <= now))
}

/// 校验触发器定义
pub fn validate_trigger(trigger: &ScheduleTrigger) -> Result<()> {
    match trigger {
        ScheduleTrigger::Interval { seconds: 0 } => Err(TaskbeatError::Configuration(
            "间隔触发器的秒数必须大于0".to_string(),
        )),
        ScheduleTrigger::Interval { seconds } if *seconds > MAX_INTERVAL_SECONDS => {
            Err(TaskbeatError::Configuration(format!(
                "间隔触发器的秒数不能超过 {MAX_INTERVAL_SECONDS}: {seconds}"
            )))
        }
        ScheduleTrigger::Interval { .. } => Ok(()),
        ScheduleTrigger::Cron { expression } => CronScheduler::validate_cron_expression(expression),
    }
}
