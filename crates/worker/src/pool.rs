use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use taskbeat_core::config::WorkerConfig;
use taskbeat_core::{Broker, ConsumeOptions, Consumer, Result, ResultStore, TaskRegistry};
use taskbeat_infrastructure::MetricsCollector;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::execution::{DeliveryOutcome, ExecutionManager, ExecutionSettings};

/// `<hostname>-<随机后缀>`
pub fn default_worker_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "worker".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{host}-{}", &suffix[..8])
}

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub concurrency: usize,
    /// 按优先级从高到低排列
    pub queues: Vec<String>,
    pub poll_interval: Duration,
    pub prefetch: usize,
    pub shutdown_grace: Duration,
    pub execution: ExecutionSettings,
}

impl From<&WorkerConfig> for WorkerPoolConfig {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            queues: config.queues.clone(),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            prefetch: config.prefetch,
            shutdown_grace: Duration::from_secs(config.shutdown_grace_seconds),
            execution: ExecutionSettings {
                default_timeout: Duration::from_secs(config.task_timeout_seconds),
                revocation_poll: Duration::from_millis(config.revocation_poll_ms),
            },
        }
    }
}

/// 固定数量的执行器，从同一组队列中竞争消费
pub struct WorkerPool {
    broker: Arc<dyn Broker>,
    manager: Arc<ExecutionManager>,
    config: WorkerPoolConfig,
    metrics: MetricsCollector,
}

impl WorkerPool {
    pub fn new(
        worker_id: impl Into<String>,
        registry: Arc<TaskRegistry>,
        broker: Arc<dyn Broker>,
        store: Arc<dyn ResultStore>,
        config: WorkerPoolConfig,
    ) -> Self {
        let manager = Arc::new(ExecutionManager::new(
            worker_id,
            registry,
            Arc::clone(&broker),
            store,
            config.execution.clone(),
        ));
        Self {
            broker,
            manager,
            config,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn worker_id(&self) -> &str {
        self.manager.worker_id()
    }

    pub fn manager(&self) -> &Arc<ExecutionManager> {
        &self.manager
    }

    /// 运行直到 `shutdown` 被取消
    ///
    /// 关闭时先停止拉取，等待进行中的任务至多 `shutdown_grace`，超时后协作式取消，
    /// 仍未结束的投递交给代理重新投递。
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        for queue in &self.config.queues {
            self.broker.declare_queue(queue).await?;
        }

        info!(
            worker_id = %self.worker_id(),
            concurrency = self.config.concurrency,
            queues = ?self.config.queues,
            "Worker pool started"
        );

        let mut executors: Vec<JoinHandle<()>> = (0..self.config.concurrency)
            .map(|index| self.spawn_executor(index, shutdown.clone()))
            .collect();

        shutdown.cancelled().await;
        info!(worker_id = %self.worker_id(), "停止拉取新任务，等待进行中的任务完成");

        let grace = self.config.shutdown_grace;
        if tokio::time::timeout(grace, join_all(executors.iter_mut()))
            .await
            .is_err()
        {
            let in_flight = self.manager.in_flight().await;
            warn!(in_flight, "宽限期已过，取消仍在执行的任务");
            self.manager.abort_all();
            // 已完成的 JoinHandle 不能再次 poll
            executors.retain(|executor| !executor.is_finished());
            if tokio::time::timeout(grace, join_all(executors.iter_mut()))
                .await
                .is_err()
            {
                error!("执行器未能在取消后退出，强制终止");
                for executor in &executors {
                    executor.abort();
                }
            }
        }

        info!(worker_id = %self.worker_id(), "Worker pool stopped");
        Ok(())
    }

    fn spawn_executor(&self, index: usize, shutdown: CancellationToken) -> JoinHandle<()> {
        let broker = Arc::clone(&self.broker);
        let manager = Arc::clone(&self.manager);
        let metrics = self.metrics.clone();
        let queues = self.config.queues.clone();
        let options = ConsumeOptions {
            poll_interval: self.config.poll_interval,
            batch_size: self.config.prefetch,
        };

        tokio::spawn(async move {
            let mut consumer = Consumer::new(Arc::clone(&broker), queues, options);
            loop {
                let next = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    next = consumer.next_delivery() => next,
                };

                let delivery = match next {
                    Ok(delivery) => delivery,
                    Err(e) => {
                        warn!(executor = index, error = %e, "拉取任务失败");
                        continue;
                    }
                };

                match manager.process(delivery.clone()).await {
                    Ok(DeliveryOutcome::Completed(status)) => {
                        debug!(executor = index, envelope.id = %delivery.envelope.id, %status, "投递处理完成")
                    }
                    Ok(outcome) => {
                        debug!(executor = index, envelope.id = %delivery.envelope.id, ?outcome, "投递未执行")
                    }
                    Err(e) => {
                        error!(executor = index, envelope.id = %delivery.envelope.id, error = %e, "处理投递失败，退回代理");
                        if let Err(e) = broker.requeue(&delivery).await {
                            warn!(envelope.id = %delivery.envelope.id, error = %e, "退回投递失败");
                        }
                    }
                }
                metrics.update_tasks_in_flight(manager.in_flight().await);

                if shutdown.is_cancelled() {
                    break;
                }
            }

            // 预取但未开始执行的投递立即退回，不等可见性超时
            for delivery in consumer.drain_buffered() {
                if let Err(e) = broker.requeue(&delivery).await {
                    warn!(envelope.id = %delivery.envelope.id, error = %e, "退回预取投递失败");
                }
            }
            debug!(executor = index, "执行器退出");
        })
    }
}
