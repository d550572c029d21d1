use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use taskbeat_core::config::BeatConfig;
use taskbeat_core::{
    FireOutcome, LeaseStore, Result, ScheduleEntry, ScheduleStore, TaskbeatError,
};
use taskbeat_infrastructure::{MetricsCollector, StructuredLogger};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cron_utils::{is_due, validate_trigger};
use crate::dispatch::{DispatchCore, SubmitOptions};
use crate::leader::LeaderElector;

/// 单个条目在一次 tick 中的状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryTick {
    Disabled,
    /// 尚未到期
    Idle,
    /// 本 tick 触发并已提交
    Fired { envelope_id: String },
    /// 其他调度器已触发同一周期
    AlreadyFired,
    /// 触发器无效或提交失败
    Failed { error: String },
}

/// 一次 tick 的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub leader: bool,
    pub token: Option<u64>,
    pub entries: Vec<(String, EntryTick)>,
    /// 触发过程中发现租约已失效，本 tick 中止
    pub lease_lost: bool,
    pub recovered: usize,
}

impl TickReport {
    pub fn fired(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter_map(|(_, tick)| match tick {
                EntryTick::Fired { envelope_id } => Some(envelope_id.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn entry(&self, name: &str) -> Option<&EntryTick> {
        self.entries
            .iter()
            .find(|(entry, _)| entry == name)
            .map(|(_, tick)| tick)
    }
}

/// 周期调度器
///
/// 只有持有领导者租约的实例会触发条目。每个到期条目先以 CAS 推进
/// `last_run_at`，成功后才通过 [`DispatchCore`] 提交，因此同一周期至多产生一个信封。
pub struct BeatScheduler {
    schedules: Arc<dyn ScheduleStore>,
    dispatch: Arc<DispatchCore>,
    leader: LeaderElector,
    tick_interval: Duration,
    metrics: MetricsCollector,
}

impl BeatScheduler {
    pub fn new(
        schedules: Arc<dyn ScheduleStore>,
        dispatch: Arc<DispatchCore>,
        leader: LeaderElector,
        tick_interval: Duration,
    ) -> Self {
        Self {
            schedules,
            dispatch,
            leader,
            tick_interval,
            metrics: MetricsCollector::new(),
        }
    }

    /// 按配置构建，租约 TTL 与 tick 间隔取自 `BeatConfig`
    pub fn from_config(
        config: &BeatConfig,
        scheduler_id: impl Into<String>,
        schedules: Arc<dyn ScheduleStore>,
        leases: Arc<dyn LeaseStore>,
        dispatch: Arc<DispatchCore>,
    ) -> Self {
        let ttl_seconds = i64::try_from(config.lease_ttl_seconds).unwrap_or(i64::MAX / 1_000);
        let leader = LeaderElector::new(
            leases,
            config.lease_name.clone(),
            scheduler_id,
            chrono::Duration::seconds(ttl_seconds),
        );
        Self::new(
            schedules,
            dispatch,
            leader,
            Duration::from_millis(config.tick_interval_ms),
        )
    }

    pub fn scheduler_id(&self) -> &str {
        self.leader.owner()
    }

    /// 把配置中的条目写入存储；已有条目的运行历史保持不变
    pub async fn sync_entries(&self, entries: &[ScheduleEntry]) -> Result<usize> {
        for entry in entries {
            validate_trigger(&entry.trigger)?;
            if !self.dispatch.registry().contains(&entry.task_name) {
                return Err(TaskbeatError::UnknownTask {
                    name: entry.task_name.clone(),
                });
            }
            self.schedules.upsert_entry(entry).await?;
            debug!(entry = %entry.name, trigger = %entry.trigger.describe(), "调度条目已同步");
        }
        info!(count = entries.len(), "调度条目同步完成");
        Ok(entries.len())
    }

    /// 以给定时间执行一次 tick
    pub async fn tick_at(&mut self, now: DateTime<Utc>) -> Result<TickReport> {
        let mut report = TickReport::default();

        let Some(lease) = self.leader.ensure(now).await else {
            return Ok(report);
        };
        report.leader = true;
        report.token = Some(lease.token);

        let entries = self.schedules.list_entries().await?;
        for entry in entries {
            if !entry.enabled {
                report.entries.push((entry.name, EntryTick::Disabled));
                continue;
            }

            match is_due(&entry, now) {
                Ok(true) => {}
                Ok(false) => {
                    report.entries.push((entry.name, EntryTick::Idle));
                    continue;
                }
                Err(e) => {
                    warn!(entry = %entry.name, error = %e, "调度条目触发器无效");
                    report.entries.push((
                        entry.name,
                        EntryTick::Failed {
                            error: e.to_string(),
                        },
                    ));
                    continue;
                }
            }

            match self
                .schedules
                .record_fire(&entry.name, entry.last_run_at, now, &lease)
                .await?
            {
                FireOutcome::Fired => {
                    let tick = self.submit_entry(&entry, now).await;
                    report.entries.push((entry.name, tick));
                }
                FireOutcome::AlreadyFired => {
                    debug!(entry = %entry.name, "条目已由其他调度器触发");
                    report.entries.push((entry.name, EntryTick::AlreadyFired));
                }
                FireOutcome::LeaseLost => {
                    self.leader.invalidate("record_fire_rejected");
                    report.lease_lost = true;
                    report.leader = false;
                    return Ok(report);
                }
            }
        }

        match self.dispatch.recover_unpublished(now).await {
            Ok(recovered) => report.recovered = recovered,
            Err(e) => warn!(error = %e, "补发扫描失败"),
        }

        Ok(report)
    }

    async fn submit_entry(&self, entry: &ScheduleEntry, fired_at: DateTime<Utc>) -> EntryTick {
        let options = SubmitOptions {
            queue: entry.queue.clone(),
            max_retries: entry.max_retries,
            schedule: Some(entry.name.clone()),
            ..Default::default()
        };

        match self
            .dispatch
            .submit(&entry.task_name, entry.args.clone(), options)
            .await
        {
            Ok(envelope_id) => {
                self.metrics.record_beat_fire();
                StructuredLogger::log_beat_fired(&entry.name, &entry.task_name, &envelope_id, fired_at);
                EntryTick::Fired { envelope_id }
            }
            Err(e) => {
                // last_run_at 已推进，本周期不会再次触发
                error!(entry = %entry.name, error = %e, "调度条目提交失败");
                EntryTick::Failed {
                    error: e.to_string(),
                }
            }
        }
    }

    /// 运行调度循环直到收到关闭信号，退出前释放租约
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            scheduler_id = %self.scheduler_id(),
            tick_interval_ms = self.tick_interval.as_millis() as u64,
            "beat 调度器启动"
        );

        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let started = Instant::now();
                    match self.tick_at(Utc::now()).await {
                        Ok(report) => {
                            let fired = report.fired().len();
                            if fired > 0 {
                                debug!(fired, token = ?report.token, "tick 完成");
                            }
                        }
                        Err(e) => error!(error = %e, "tick 失败"),
                    }
                    self.metrics.record_beat_tick(started.elapsed().as_secs_f64());
                }
            }
        }

        self.leader.release().await;
        info!(scheduler_id = %self.scheduler_id(), "beat 调度器已停止");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use taskbeat_core::{Broker, FnHandler, TaskDefinition, TaskRegistry};
    use taskbeat_infrastructure::{InMemoryBroker, MemoryStore};

    fn scheduler(store: Arc<MemoryStore>, broker: Arc<InMemoryBroker>, owner: &str) -> BeatScheduler {
        let mut registry = TaskRegistry::new();
        let handler = Arc::new(FnHandler::new(|_ctx| async { Ok(json!(null)) }));
        registry
            .register(TaskDefinition::new("poll_feed", handler))
            .unwrap();
        let dispatch = Arc::new(DispatchCore::new(Arc::new(registry), broker, store.clone()));
        let leader = LeaderElector::new(store.clone(), "beat", owner, chrono::Duration::seconds(15));
        BeatScheduler::new(store, dispatch, leader, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_sync_rejects_unregistered_task() {
        let store = Arc::new(MemoryStore::new());
        let beat = scheduler(store, Arc::new(InMemoryBroker::new()), "a");

        let entry = ScheduleEntry::interval("bad", "missing_task", 10, json!({}));
        assert!(matches!(
            beat.sync_entries(&[entry]).await,
            Err(TaskbeatError::UnknownTask { .. })
        ));
    }

    #[tokio::test]
    async fn test_disabled_entry_never_fires() {
        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        let mut beat = scheduler(store.clone(), broker.clone(), "a");
        let created = Utc::now();

        let entry = ScheduleEntry::interval("poll", "poll_feed", 10, json!({})).with_created_at(created);
        beat.sync_entries(&[entry]).await.unwrap();
        store.set_enabled("poll", false).await.unwrap();

        let report = beat.tick_at(created + chrono::Duration::seconds(30)).await.unwrap();
        assert_eq!(report.entry("poll"), Some(&EntryTick::Disabled));
        assert_eq!(broker.queue_len("default").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_follower_publishes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        let mut leader = scheduler(store.clone(), broker.clone(), "a");
        let mut follower = scheduler(store.clone(), broker.clone(), "b");
        let created = Utc::now();

        let entry = ScheduleEntry::interval("poll", "poll_feed", 10, json!({})).with_created_at(created);
        leader.sync_entries(&[entry]).await.unwrap();

        let early = created + chrono::Duration::seconds(1);
        assert!(leader.tick_at(early).await.unwrap().leader);
        let report = follower.tick_at(created + chrono::Duration::seconds(11)).await.unwrap();
        assert!(!report.leader);
        assert!(report.entries.is_empty());
        assert_eq!(broker.queue_len("default").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_entry_queue_and_retries_flow_into_envelope() {
        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        let mut beat = scheduler(store.clone(), broker.clone(), "a");
        let created = Utc::now();

        let entry = ScheduleEntry::interval("poll", "poll_feed", 5, json!({"feed": "news"}))
            .with_queue("feeds")
            .with_max_retries(1)
            .with_created_at(created);
        beat.sync_entries(&[entry]).await.unwrap();

        let report = beat.tick_at(created + chrono::Duration::seconds(5)).await.unwrap();
        assert_eq!(report.fired().len(), 1);

        let delivery = broker.fetch("feeds", 1).await.unwrap().remove(0);
        assert_eq!(delivery.envelope.max_retries, 1);
        assert_eq!(delivery.envelope.schedule.as_deref(), Some("poll"));
        assert_eq!(delivery.envelope.args, json!({"feed": "news"}));
    }
}
