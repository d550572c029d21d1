use std::any::Any;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use taskbeat_core::{
    AttemptClaim, AttemptOutcome, Broker, Delivery, ErrorPayload, PublishReceipt, Result,
    ResultStore, TaskContext, TaskDefinition, TaskEnvelope, TaskRegistry, TaskStatus,
    TaskbeatError,
};
use taskbeat_infrastructure::{MetricsCollector, StructuredLogger};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// 单次投递的处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// 尝试已结束并写入存储
    Completed(TaskStatus),
    /// 开始前已撤销
    Revoked,
    /// 重复投递：信封已是终态或正在别处执行
    Duplicate,
    /// 旧副本，必要时已补发最新副本
    Superseded,
    /// 执行期间尝试被其他 worker 接管，结果被丢弃
    Stale,
    /// 关闭时中止，投递已退回代理
    Abandoned,
}

#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    /// 任务定义和信封都未声明超时时使用
    pub default_timeout: Duration,
    pub revocation_poll: Duration,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(300),
            revocation_poll: Duration::from_secs(1),
        }
    }
}

enum HandlerRun {
    Completed(Result<serde_json::Value>),
    TimedOut(u64),
    Panicked(String),
    Revoked,
    Aborted,
}

/// 单个 worker 的投递执行器
///
/// 领取尝试、运行处理器、记录结果并确认投递。处理器在独立任务中运行，
/// panic 只影响当前尝试。
pub struct ExecutionManager {
    worker_id: String,
    registry: Arc<TaskRegistry>,
    broker: Arc<dyn Broker>,
    store: Arc<dyn ResultStore>,
    settings: ExecutionSettings,
    /// 关闭宽限期结束后取消所有处理器
    abort: CancellationToken,
    running: Arc<RwLock<HashSet<String>>>,
    metrics: MetricsCollector,
}

impl ExecutionManager {
    pub fn new(
        worker_id: impl Into<String>,
        registry: Arc<TaskRegistry>,
        broker: Arc<dyn Broker>,
        store: Arc<dyn ResultStore>,
        settings: ExecutionSettings,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            registry,
            broker,
            store,
            settings,
            abort: CancellationToken::new(),
            running: Arc::new(RwLock::new(HashSet::new())),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub async fn in_flight(&self) -> usize {
        self.running.read().await.len()
    }

    /// 协作式取消所有正在执行的处理器
    pub fn abort_all(&self) {
        self.abort.cancel();
    }

    /// 处理一次投递；返回 `Err` 时投递未确认，由调用方退回代理
    pub async fn process(&self, delivery: Delivery) -> Result<DeliveryOutcome> {
        let envelope = &delivery.envelope;

        // 代理提前投递时等到 eta
        if let Some(wait) = envelope.eta.and_then(|eta| (eta - Utc::now()).to_std().ok()) {
            debug!(envelope.id = %envelope.id, wait_ms = wait.as_millis() as u64, "等待 eta");
            tokio::select! {
                _ = self.abort.cancelled() => {
                    self.requeue(&delivery).await;
                    return Ok(DeliveryOutcome::Abandoned);
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }

        let claim = self
            .store
            .begin_attempt(envelope, &self.worker_id, delivery.redelivered, Utc::now())
            .await?;
        let attempt = match claim {
            AttemptClaim::Started { attempt } => attempt,
            AttemptClaim::Revoked => {
                StructuredLogger::log_task_revoked(&envelope.id, &envelope.task_name, false);
                self.ack(&delivery).await;
                return Ok(DeliveryOutcome::Revoked);
            }
            AttemptClaim::AlreadyTerminal(status) => {
                StructuredLogger::log_duplicate_delivery(envelope, status.as_str());
                self.ack(&delivery).await;
                return Ok(DeliveryOutcome::Duplicate);
            }
            AttemptClaim::InFlightElsewhere { worker_id } => {
                debug!(envelope.id = %envelope.id, owner = ?worker_id, "尝试正在其他 worker 上执行");
                StructuredLogger::log_duplicate_delivery(envelope, "in_flight_elsewhere");
                self.ack(&delivery).await;
                return Ok(DeliveryOutcome::Duplicate);
            }
            AttemptClaim::Superseded { republish } => {
                if let Some(latest) = republish {
                    self.publish_next(&latest).await;
                }
                StructuredLogger::log_duplicate_delivery(envelope, "superseded");
                self.ack(&delivery).await;
                return Ok(DeliveryOutcome::Superseded);
            }
        };

        StructuredLogger::log_task_started(envelope, attempt, &self.worker_id);
        let started = Instant::now();

        let outcome = match self.registry.resolve(&envelope.task_name) {
            Ok(definition) => {
                self.running.write().await.insert(envelope.id.clone());
                let run = self.run_handler(definition, envelope, attempt).await;
                self.running.write().await.remove(&envelope.id);

                match run {
                    HandlerRun::Aborted => {
                        warn!(envelope.id = %envelope.id, attempt, "关闭时中止执行，投递退回代理");
                        self.requeue(&delivery).await;
                        return Ok(DeliveryOutcome::Abandoned);
                    }
                    run => self.outcome_for(definition, envelope, run)?,
                }
            }
            Err(e) => AttemptOutcome::Failure(ErrorPayload::from(&e)),
        };

        let status = outcome.status();
        let recorded = self
            .store
            .finish_attempt(&envelope.id, attempt, &self.worker_id, &outcome, Utc::now())
            .await?;
        if !recorded {
            warn!(
                envelope.id = %envelope.id,
                attempt,
                worker_id = %self.worker_id,
                "尝试已被其他 worker 接管，丢弃本次结果"
            );
            self.ack(&delivery).await;
            return Ok(DeliveryOutcome::Stale);
        }

        let elapsed = started.elapsed();
        match &outcome {
            AttemptOutcome::Success(_) => StructuredLogger::log_task_succeeded(
                envelope,
                attempt,
                &self.worker_id,
                elapsed.as_millis() as u64,
            ),
            AttemptOutcome::Retry { error, next } => {
                self.publish_next(next).await;
                self.metrics.record_task_retry(&envelope.task_name);
                StructuredLogger::log_task_retry(envelope, error, next.eta.unwrap_or_else(Utc::now));
            }
            AttemptOutcome::Failure(error) => {
                StructuredLogger::log_task_failed(envelope, attempt, &self.worker_id, error)
            }
            AttemptOutcome::Revoked(_) => {
                StructuredLogger::log_task_revoked(&envelope.id, &envelope.task_name, true)
            }
        }
        self.metrics.record_task_execution(
            &envelope.task_name,
            status.as_str(),
            elapsed.as_secs_f64(),
        );

        self.ack(&delivery).await;
        Ok(DeliveryOutcome::Completed(status))
    }

    async fn run_handler(
        &self,
        definition: &TaskDefinition,
        envelope: &TaskEnvelope,
        attempt: u32,
    ) -> HandlerRun {
        let cancel = self.abort.child_token();
        let revoked = Arc::new(AtomicBool::new(false));
        let ctx = TaskContext::new(
            envelope.id.clone(),
            envelope.task_name.clone(),
            envelope.args.clone(),
            attempt,
            envelope.retries_done,
            envelope.max_retries,
            self.worker_id.clone(),
            cancel.clone(),
        );

        let handler = Arc::clone(&definition.handler);
        let mut task = tokio::spawn(async move { handler.handle(&ctx).await });
        let watcher = self.watch_revocation(envelope.id.clone(), cancel.clone(), revoked.clone());

        let timeout = envelope
            .timeout_seconds
            .map(Duration::from_secs)
            .or(definition.timeout)
            .unwrap_or(self.settings.default_timeout);
        let joined = tokio::time::timeout(timeout, &mut task).await;
        watcher.abort();

        match joined {
            Err(_) => {
                cancel.cancel();
                task.abort();
                HandlerRun::TimedOut(timeout.as_secs())
            }
            Ok(Err(join_error)) => {
                let message = if join_error.is_panic() {
                    panic_message(join_error.into_panic())
                } else {
                    join_error.to_string()
                };
                error!(envelope.id = %envelope.id, attempt, panic = %message, "处理器异常退出");
                HandlerRun::Panicked(message)
            }
            Ok(Ok(Err(_))) if revoked.load(Ordering::SeqCst) => HandlerRun::Revoked,
            Ok(Ok(Err(_))) if self.abort.is_cancelled() => HandlerRun::Aborted,
            Ok(Ok(result)) => HandlerRun::Completed(result),
        }
    }

    /// 轮询撤销标志，发现撤销请求后取消处理器
    fn watch_revocation(
        &self,
        envelope_id: String,
        cancel: CancellationToken,
        revoked: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let poll = self.settings.revocation_poll;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                match store.is_revoke_requested(&envelope_id).await {
                    Ok(true) => {
                        debug!(envelope.id = %envelope_id, "收到撤销请求，取消处理器");
                        revoked.store(true, Ordering::SeqCst);
                        cancel.cancel();
                        return;
                    }
                    Ok(false) => {}
                    Err(e) => warn!(envelope.id = %envelope_id, error = %e, "查询撤销标志失败"),
                }
            }
        })
    }

    fn outcome_for(
        &self,
        definition: &TaskDefinition,
        envelope: &TaskEnvelope,
        run: HandlerRun,
    ) -> Result<AttemptOutcome> {
        let error = match run {
            HandlerRun::Completed(Ok(value)) => return Ok(AttemptOutcome::Success(value)),
            HandlerRun::Revoked => {
                return Ok(AttemptOutcome::Revoked(ErrorPayload::from(
                    &TaskbeatError::Revoked {
                        id: envelope.id.clone(),
                    },
                )))
            }
            HandlerRun::Panicked(message) => {
                return Ok(AttemptOutcome::Failure(ErrorPayload::new(
                    "HandlerPanic",
                    message,
                )))
            }
            HandlerRun::Completed(Err(e)) => e,
            HandlerRun::TimedOut(seconds) => TaskbeatError::TaskTimeout { seconds },
            HandlerRun::Aborted => {
                return Err(TaskbeatError::Internal("中止的执行没有结果".to_string()))
            }
        };

        let payload = ErrorPayload::from(&error);
        if error.is_retryable() && !envelope.retries_exhausted() {
            let eta = definition
                .retry_policy
                .next_eta(envelope.retries_done, Utc::now());
            Ok(AttemptOutcome::Retry {
                error: payload,
                next: envelope.next_retry(eta)?,
            })
        } else {
            Ok(AttemptOutcome::Failure(payload))
        }
    }

    /// 发布下一份副本；失败时留给恢复扫描补发
    async fn publish_next(&self, next: &TaskEnvelope) {
        match self.broker.publish(&next.queue, next).await {
            Ok(PublishReceipt::Confirmed) => {
                if let Err(e) = self
                    .store
                    .mark_published(&next.id, next.retries_done, Utc::now())
                    .await
                {
                    warn!(envelope.id = %next.id, error = %e, "记录发布状态失败");
                }
            }
            Ok(PublishReceipt::Buffered) => {
                debug!(envelope.id = %next.id, "重试副本已进入发布缓冲区");
            }
            Err(e) => {
                warn!(envelope.id = %next.id, error = %e, "发布重试副本失败，等待恢复扫描补发");
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) {
        if let Err(e) = self.broker.ack(delivery).await {
            warn!(envelope.id = %delivery.envelope.id, error = %e, "确认投递失败，将被重新投递");
        }
    }

    async fn requeue(&self, delivery: &Delivery) {
        if let Err(e) = self.broker.requeue(delivery).await {
            warn!(envelope.id = %delivery.envelope.id, error = %e, "退回投递失败，等待可见性超时");
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "处理器 panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use taskbeat_core::{FnHandler, RetryPolicy};
    use taskbeat_infrastructure::{InMemoryBroker, MemoryStore};

    fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay_ms: 10,
            max_delay_ms: 10,
            multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }

    async fn deliver(broker: &InMemoryBroker, store: &MemoryStore, envelope: TaskEnvelope) -> Delivery {
        store.insert_pending(&envelope, Utc::now()).await.unwrap();
        broker.publish(&envelope.queue, &envelope).await.unwrap();
        broker.fetch(&envelope.queue, 1).await.unwrap().remove(0)
    }

    fn manager(
        registry: TaskRegistry,
        broker: Arc<InMemoryBroker>,
        store: Arc<MemoryStore>,
    ) -> ExecutionManager {
        ExecutionManager::new(
            "worker-1",
            Arc::new(registry),
            broker,
            store,
            ExecutionSettings {
                default_timeout: Duration::from_secs(5),
                revocation_poll: Duration::from_millis(20),
            },
        )
    }

    #[tokio::test]
    async fn test_retryable_error_publishes_next_copy() {
        let broker = Arc::new(InMemoryBroker::new());
        let store = Arc::new(MemoryStore::new());
        let mut registry = TaskRegistry::new();
        registry
            .register(
                TaskDefinition::new(
                    "flaky",
                    Arc::new(FnHandler::new(|_ctx| async {
                        Err(TaskbeatError::TaskExecution("boom".to_string()))
                    })),
                )
                .with_retry_policy(fast_retry(1)),
            )
            .unwrap();
        let manager = manager(registry, broker.clone(), store.clone());

        let envelope = TaskEnvelope::new("flaky", json!({}), "default", 1);
        let delivery = deliver(&broker, &store, envelope.clone()).await;
        assert_eq!(
            manager.process(delivery).await.unwrap(),
            DeliveryOutcome::Completed(TaskStatus::Retry)
        );

        tokio::time::sleep(Duration::from_millis(30)).await;
        let retry = broker.fetch("default", 1).await.unwrap().remove(0);
        assert_eq!(retry.envelope.id, envelope.id);
        assert_eq!(retry.envelope.retries_done, 1);
        assert_eq!(
            manager.process(retry).await.unwrap(),
            DeliveryOutcome::Completed(TaskStatus::Failure)
        );
        assert_eq!(store.list_attempts(&envelope.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_immediately() {
        let broker = Arc::new(InMemoryBroker::new());
        let store = Arc::new(MemoryStore::new());
        let mut registry = TaskRegistry::new();
        registry
            .register(TaskDefinition::new(
                "strict",
                Arc::new(FnHandler::new(|_ctx| async {
                    Err(TaskbeatError::InvalidTaskParams("bad".to_string()))
                })),
            ))
            .unwrap();
        let manager = manager(registry, broker.clone(), store.clone());

        let delivery = deliver(&broker, &store, TaskEnvelope::new("strict", json!({}), "default", 3)).await;
        assert_eq!(
            manager.process(delivery).await.unwrap(),
            DeliveryOutcome::Completed(TaskStatus::Failure)
        );
        assert_eq!(broker.queue_len("default").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unknown_task_is_recorded_as_failure() {
        let broker = Arc::new(InMemoryBroker::new());
        let store = Arc::new(MemoryStore::new());
        let manager = manager(TaskRegistry::new(), broker.clone(), store.clone());

        let envelope = TaskEnvelope::new("ghost", json!({}), "default", 3);
        let delivery = deliver(&broker, &store, envelope.clone()).await;
        assert_eq!(
            manager.process(delivery).await.unwrap(),
            DeliveryOutcome::Completed(TaskStatus::Failure)
        );
        let attempts = store.list_attempts(&envelope.id).await.unwrap();
        assert_eq!(
            attempts[0].error.as_ref().map(|e| e.kind.as_str()),
            Some("UnknownTaskError")
        );
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let broker = Arc::new(InMemoryBroker::new());
        let store = Arc::new(MemoryStore::new());
        let mut registry = TaskRegistry::new();
        registry
            .register(TaskDefinition::new(
                "explode",
                Arc::new(FnHandler::new(|_ctx| async {
                    if true {
                        panic!("handler exploded");
                    }
                    Ok(json!(null))
                })),
            ))
            .unwrap();
        let manager = manager(registry, broker.clone(), store.clone());

        let envelope = TaskEnvelope::new("explode", json!({}), "default", 3);
        let delivery = deliver(&broker, &store, envelope.clone()).await;
        assert_eq!(
            manager.process(delivery).await.unwrap(),
            DeliveryOutcome::Completed(TaskStatus::Failure)
        );
        let attempts = store.list_attempts(&envelope.id).await.unwrap();
        let error = attempts[0].error.clone().unwrap();
        assert_eq!(error.kind, "HandlerPanic");
        assert!(error.message.contains("handler exploded"));
    }

    #[tokio::test]
    async fn test_timeout_goes_through_retry_path() {
        let broker = Arc::new(InMemoryBroker::new());
        let store = Arc::new(MemoryStore::new());
        let mut registry = TaskRegistry::new();
        registry
            .register(
                TaskDefinition::new(
                    "slow",
                    Arc::new(FnHandler::new(|_ctx| async {
                        tokio::time::sleep(Duration::from_secs(10)).await;
                        Ok(json!(null))
                    })),
                )
                .with_timeout(Duration::from_millis(50))
                .with_retry_policy(fast_retry(1)),
            )
            .unwrap();
        let manager = manager(registry, broker.clone(), store.clone());

        let envelope = TaskEnvelope::new("slow", json!({}), "default", 1);
        let delivery = deliver(&broker, &store, envelope.clone()).await;
        assert_eq!(
            manager.process(delivery).await.unwrap(),
            DeliveryOutcome::Completed(TaskStatus::Retry)
        );
        let attempts = store.list_attempts(&envelope.id).await.unwrap();
        assert_eq!(
            attempts[0].error.as_ref().map(|e| e.kind.as_str()),
            Some("TaskTimeoutError")
        );
    }

    #[tokio::test]
    async fn test_revoke_during_execution_cancels_handler() {
        let broker = Arc::new(InMemoryBroker::new());
        let store = Arc::new(MemoryStore::new());
        let polls = Arc::new(AtomicU32::new(0));
        let seen = polls.clone();
        let mut registry = TaskRegistry::new();
        registry
            .register(TaskDefinition::new(
                "long_poll",
                Arc::new(FnHandler::new(move |ctx: TaskContext| {
                    let seen = seen.clone();
                    async move {
                        loop {
                            ctx.checkpoint()?;
                            seen.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                        }
                    }
                })),
            ))
            .unwrap();
        let manager = Arc::new(manager(registry, broker.clone(), store.clone()));

        let envelope = TaskEnvelope::new("long_poll", json!({}), "default", 3);
        let delivery = deliver(&broker, &store, envelope.clone()).await;
        let running = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.process(delivery).await })
        };

        while polls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        store.revoke(&envelope.id, Utc::now()).await.unwrap();

        assert_eq!(
            running.await.unwrap().unwrap(),
            DeliveryOutcome::Completed(TaskStatus::Revoked)
        );
        let state = store.get_state(&envelope.id).await.unwrap().unwrap();
        assert_eq!(state.status, TaskStatus::Revoked);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_of_finished_envelope_is_acked() {
        let broker = Arc::new(InMemoryBroker::new());
        let store = Arc::new(MemoryStore::new());
        let mut registry = TaskRegistry::new();
        registry
            .register(TaskDefinition::new(
                "ok",
                Arc::new(FnHandler::new(|_ctx| async { Ok(json!("done")) })),
            ))
            .unwrap();
        let manager = manager(registry, broker.clone(), store.clone());

        let envelope = TaskEnvelope::new("ok", json!({}), "default", 0);
        let delivery = deliver(&broker, &store, envelope.clone()).await;
        assert_eq!(
            manager.process(delivery).await.unwrap(),
            DeliveryOutcome::Completed(TaskStatus::Success)
        );

        broker.publish("default", &envelope).await.unwrap();
        let duplicate = broker.fetch("default", 1).await.unwrap().remove(0);
        assert_eq!(
            manager.process(duplicate).await.unwrap(),
            DeliveryOutcome::Duplicate
        );
        assert_eq!(store.list_attempts(&envelope.id).await.unwrap().len(), 1);
    }
}
