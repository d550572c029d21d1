use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use taskbeat_core::{
    Broker, ExecutionRecord, PublishReceipt, Result, ResultStore, RevokeOutcome, TaskEnvelope,
    TaskRegistry, TaskbeatError,
};
use taskbeat_infrastructure::{MetricsCollector, StructuredLogger};
use tracing::{debug, info, instrument, warn};

/// `submit` 的可选参数
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// 覆盖任务定义的默认队列
    pub queue: Option<String>,
    /// 最早执行时间
    pub eta: Option<DateTime<Utc>>,
    /// 相对当前时间的延迟，`eta` 优先
    pub countdown: Option<Duration>,
    pub max_retries: Option<u32>,
    pub timeout: Option<Duration>,
    /// 由 beat 产生时的调度条目名称
    pub schedule: Option<String>,
}

impl SubmitOptions {
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_eta(mut self, eta: DateTime<Utc>) -> Self {
        self.eta = Some(eta);
        self
    }

    pub fn with_countdown(mut self, countdown: Duration) -> Self {
        self.countdown = Some(countdown);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// 状态行最后更新后超过该时长仍未确认发布才补发
    pub grace: chrono::Duration,
    pub batch: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            grace: chrono::Duration::seconds(60),
            batch: 100,
        }
    }
}

/// 任务提交入口
///
/// 先写入 PENDING 状态行再发布，代理确认后标记已发布。调用方拿到的 id
/// 总能通过 [`DispatchCore::get_status`] 查询到。
pub struct DispatchCore {
    registry: Arc<TaskRegistry>,
    broker: Arc<dyn Broker>,
    store: Arc<dyn ResultStore>,
    recovery: RecoveryConfig,
    metrics: MetricsCollector,
}

impl DispatchCore {
    pub fn new(
        registry: Arc<TaskRegistry>,
        broker: Arc<dyn Broker>,
        store: Arc<dyn ResultStore>,
    ) -> Self {
        Self {
            registry,
            broker,
            store,
            recovery: RecoveryConfig::default(),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_recovery(mut self, recovery: RecoveryConfig) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// 提交任务，返回信封 id；不等待执行完成
    #[instrument(skip(self, args, options), fields(task_name = %task_name))]
    pub async fn submit(
        &self,
        task_name: &str,
        args: serde_json::Value,
        options: SubmitOptions,
    ) -> Result<String> {
        let envelope = self.build_envelope(task_name, args, options, Utc::now())?;
        self.enqueue(&envelope).await?;
        Ok(envelope.id)
    }

    /// 按任务定义和选项构建信封
    pub fn build_envelope(
        &self,
        task_name: &str,
        args: serde_json::Value,
        options: SubmitOptions,
        now: DateTime<Utc>,
    ) -> Result<TaskEnvelope> {
        let definition = self.registry.resolve(task_name)?;
        definition.schema.validate(task_name, &args)?;

        let eta = match (options.eta, options.countdown) {
            (Some(eta), _) => Some(eta),
            (None, Some(countdown)) => Some(
                now + chrono::Duration::from_std(countdown).map_err(|e| {
                    TaskbeatError::InvalidTaskParams(format!("countdown 超出范围: {e}"))
                })?,
            ),
            (None, None) => None,
        };
        let queue = options
            .queue
            .unwrap_or_else(|| definition.default_queue.clone());
        let max_retries = options
            .max_retries
            .unwrap_or(definition.retry_policy.max_retries);
        let timeout_seconds = options
            .timeout
            .or(definition.timeout)
            .map(|timeout| timeout.as_secs());

        let mut envelope = TaskEnvelope::new(task_name, args, queue, max_retries)
            .with_eta(eta)
            .with_timeout_seconds(timeout_seconds);
        if let Some(schedule) = options.schedule {
            envelope = envelope.with_schedule(schedule);
        }
        Ok(envelope)
    }

    /// 持久化后发布；发布失败时删除 PENDING 行并返回错误
    async fn enqueue(&self, envelope: &TaskEnvelope) -> Result<()> {
        let now = Utc::now();
        self.store.insert_pending(envelope, now).await?;

        match self.broker.publish(&envelope.queue, envelope).await {
            Ok(receipt) => {
                let buffered = receipt == PublishReceipt::Buffered;
                if !buffered {
                    self.store
                        .mark_published(&envelope.id, envelope.retries_done, Utc::now())
                        .await?;
                }
                self.metrics.record_task_submitted();
                StructuredLogger::log_task_submitted(envelope, buffered);
                Ok(())
            }
            Err(e) => {
                warn!(envelope.id = %envelope.id, error = %e, "发布失败，撤回待发布记录");
                if let Err(discard_error) = self.store.discard_pending(&envelope.id).await {
                    warn!(envelope.id = %envelope.id, error = %discard_error, "删除待发布记录失败");
                }
                Err(e)
            }
        }
    }

    /// 当前状态；尚未开始的尝试以下一次尝试序号返回
    pub async fn get_status(&self, envelope_id: &str) -> Result<ExecutionRecord> {
        let state = self
            .store
            .get_state(envelope_id)
            .await?
            .ok_or_else(|| TaskbeatError::EnvelopeNotFound {
                id: envelope_id.to_string(),
            })?;
        let attempts = self.store.list_attempts(envelope_id).await?;
        Ok(state.status_record(attempts.last()))
    }

    /// 撤销任务；开始前撤销立即生效，执行中撤销为协作式取消
    pub async fn revoke(&self, envelope_id: &str) -> Result<bool> {
        let outcome = self.store.revoke(envelope_id, Utc::now()).await?;
        match &outcome {
            RevokeOutcome::Revoked => info!(envelope.id = %envelope_id, "任务已在开始前撤销"),
            RevokeOutcome::Requested => info!(envelope.id = %envelope_id, "已请求取消执行中的任务"),
            RevokeOutcome::AlreadyTerminal(status) => {
                debug!(envelope.id = %envelope_id, %status, "任务已结束，忽略撤销")
            }
            RevokeOutcome::NotFound => debug!(envelope.id = %envelope_id, "撤销的任务不存在"),
        }
        Ok(outcome.accepted())
    }

    /// 全部尝试记录，按尝试序号升序
    pub async fn attempts(&self, envelope_id: &str) -> Result<Vec<ExecutionRecord>> {
        if self.store.get_state(envelope_id).await?.is_none() {
            return Err(TaskbeatError::EnvelopeNotFound {
                id: envelope_id.to_string(),
            });
        }
        self.store.list_attempts(envelope_id).await
    }

    /// 补发持久化后从未被代理确认的信封，返回补发数量
    ///
    /// 代理不可用或发布进入本地缓冲时停止本轮扫描。
    pub async fn recover_unpublished(&self, now: DateTime<Utc>) -> Result<usize> {
        let stale = self
            .store
            .list_unpublished(now - self.recovery.grace, self.recovery.batch)
            .await?;

        let mut recovered = 0;
        for envelope in stale {
            match self.broker.publish(&envelope.queue, &envelope).await? {
                PublishReceipt::Confirmed => {
                    self.store
                        .mark_published(&envelope.id, envelope.retries_done, Utc::now())
                        .await?;
                    recovered += 1;
                }
                // 代理仍不可用，剩余信封留给下一轮
                PublishReceipt::Buffered => break,
            }
        }

        if recovered > 0 {
            info!(recovered, "已补发未确认发布的信封");
        }
        Ok(recovered)
    }
}
