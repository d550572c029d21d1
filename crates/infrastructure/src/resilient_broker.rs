use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use taskbeat_core::{
    Backoff, Broker, Delivery, PublishReceipt, Result, ResultStore, TaskEnvelope, TaskbeatError,
};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::observability::{MetricsCollector, StructuredLogger};

#[derive(Debug, Clone)]
pub struct ResilientBrokerConfig {
    /// 本地缓冲区容量，0 表示代理不可用时直接返回错误
    pub buffer_capacity: usize,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
}

impl Default for ResilientBrokerConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 1_000,
            reconnect_initial: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(30),
        }
    }
}

/// 代理不可用期间在本地缓冲发布请求的包装
///
/// 缓冲非空时新的发布也进入缓冲区，保持发布顺序。后台刷新任务以指数退避
/// 重试，成功后调用 `ResultStore::mark_published`。其余操作直接委托给内部代理。
pub struct ResilientBroker {
    inner: Arc<dyn Broker>,
    config: ResilientBrokerConfig,
    buffer: Mutex<VecDeque<(String, TaskEnvelope)>>,
    store: Option<Arc<dyn ResultStore>>,
    wakeup: Notify,
    metrics: MetricsCollector,
}

impl ResilientBroker {
    pub fn new(inner: Arc<dyn Broker>, config: ResilientBrokerConfig) -> Self {
        Self {
            inner,
            config,
            buffer: Mutex::new(VecDeque::new()),
            store: None,
            wakeup: Notify::new(),
            metrics: MetricsCollector::new(),
        }
    }

    /// 刷新成功后把状态行标记为已发布
    pub fn with_store(mut self, store: Arc<dyn ResultStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub async fn buffered_len(&self) -> usize {
        self.buffer.lock().await.len()
    }

    fn buffer_and_report(
        &self,
        buffer: &mut VecDeque<(String, TaskEnvelope)>,
        queue: &str,
        envelope: &TaskEnvelope,
    ) -> Result<PublishReceipt> {
        // 补发扫描会重复提交同一条尚未刷新的信封
        let already_buffered = buffer.iter().any(|(_, pending)| {
            pending.id == envelope.id && pending.retries_done == envelope.retries_done
        });
        if already_buffered {
            debug!(envelope.id = %envelope.id, "信封已在本地缓冲区中");
            return Ok(PublishReceipt::Buffered);
        }
        if buffer.len() >= self.config.buffer_capacity {
            return Err(TaskbeatError::PublishBackpressure {
                capacity: self.config.buffer_capacity,
            });
        }
        buffer.push_back((queue.to_string(), envelope.clone()));
        self.metrics.update_publish_buffer_depth(buffer.len());
        self.wakeup.notify_one();
        Ok(PublishReceipt::Buffered)
    }

    /// 按顺序发布缓冲区中的信封，返回发布成功的数量
    ///
    /// 遇到代理不可用时停止并保留剩余内容。
    pub async fn flush(&self) -> Result<usize> {
        let mut flushed = 0;
        loop {
            let next = self.buffer.lock().await.front().cloned();
            let Some((queue, envelope)) = next else {
                break;
            };

            match self.inner.publish(&queue, &envelope).await {
                Ok(_) => {
                    let mut buffer = self.buffer.lock().await;
                    buffer.pop_front();
                    self.metrics.update_publish_buffer_depth(buffer.len());
                    drop(buffer);
                    flushed += 1;
                    self.metrics
                        .record_broker_operation(self.inner.kind(), "flush", true);

                    if let Some(store) = &self.store {
                        if let Err(e) = store
                            .mark_published(&envelope.id, envelope.retries_done, Utc::now())
                            .await
                        {
                            // 未标记的信封会被恢复扫描再次发布，由 worker 去重
                            warn!(envelope.id = %envelope.id, error = %e, "标记已发布失败");
                        }
                    }
                }
                Err(e) => {
                    self.metrics
                        .record_broker_operation(self.inner.kind(), "flush", false);
                    if flushed > 0 {
                        StructuredLogger::log_broker_recovered(self.inner.kind(), flushed);
                    }
                    return Err(e);
                }
            }
        }

        if flushed > 0 {
            StructuredLogger::log_broker_recovered(self.inner.kind(), flushed);
        }
        Ok(flushed)
    }

    /// 启动后台刷新任务，`shutdown` 取消后退出
    pub fn start_flusher(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            let mut backoff = Backoff::new(broker.config.reconnect_initial, broker.config.reconnect_max);
            loop {
                let delay = if broker.buffered_len().await == 0 {
                    backoff.reset();
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = broker.wakeup.notified() => {}
                    }
                    // 给代理一次恢复的机会再刷新
                    broker.config.reconnect_initial
                } else {
                    match broker.flush().await {
                        Ok(_) => {
                            backoff.reset();
                            continue;
                        }
                        Err(e) => {
                            let delay = backoff.next_delay();
                            debug!(error = %e, retry_in_ms = delay.as_millis() as u64, "刷新发布缓冲区失败");
                            delay
                        }
                    }
                };

                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            debug!("发布缓冲区刷新任务退出");
        })
    }
}

#[async_trait]
impl Broker for ResilientBroker {
    fn kind(&self) -> &'static str {
        self.inner.kind()
    }

    async fn declare_queue(&self, queue: &str) -> Result<()> {
        self.inner.declare_queue(queue).await
    }

    async fn publish(&self, queue: &str, envelope: &TaskEnvelope) -> Result<PublishReceipt> {
        let mut buffer = self.buffer.lock().await;
        if !buffer.is_empty() {
            return self.buffer_and_report(&mut buffer, queue, envelope);
        }
        drop(buffer);

        match self.inner.publish(queue, envelope).await {
            Ok(receipt) => {
                self.metrics
                    .record_broker_operation(self.inner.kind(), "publish", true);
                Ok(receipt)
            }
            Err(TaskbeatError::BrokerUnavailable(message)) if self.config.buffer_capacity > 0 => {
                self.metrics
                    .record_broker_operation(self.inner.kind(), "publish", false);
                let mut buffer = self.buffer.lock().await;
                let receipt = self.buffer_and_report(&mut buffer, queue, envelope)?;
                StructuredLogger::log_broker_outage(self.inner.kind(), &message, buffer.len());
                Ok(receipt)
            }
            Err(e) => {
                self.metrics
                    .record_broker_operation(self.inner.kind(), "publish", false);
                Err(e)
            }
        }
    }

    async fn fetch(&self, queue: &str, max: usize) -> Result<Vec<Delivery>> {
        self.inner.fetch(queue, max).await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.inner.ack(delivery).await
    }

    async fn requeue(&self, delivery: &Delivery) -> Result<()> {
        self.inner.requeue(delivery).await
    }

    async fn queue_len(&self, queue: &str) -> Result<u64> {
        self.inner.queue_len(queue).await
    }

    async fn ping(&self) -> Result<()> {
        self.inner.ping().await
    }
}
