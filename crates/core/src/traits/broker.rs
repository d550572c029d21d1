use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};

use crate::models::TaskEnvelope;
use crate::Result;

/// 从代理取出、尚未确认的一次投递
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub envelope: TaskEnvelope,
    pub queue: String,
    /// 代理侧的投递标识（RabbitMQ delivery tag、Redis 条目ID等）
    pub tag: String,
    /// 可见性超时后的重复投递
    pub redelivered: bool,
}

/// 发布回执
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishReceipt {
    /// 代理已持久化
    Confirmed,
    /// 代理不可用，暂存在本地缓冲区等待补发
    Buffered,
}

/// 消息代理抽象接口
///
/// 投递在确认前对其他消费者不可见；未确认的投递在可见性超时后重新投递。
#[async_trait]
pub trait Broker: Send + Sync {
    /// 实现名称，用于日志
    fn kind(&self) -> &'static str;

    /// 声明队列（幂等）
    async fn declare_queue(&self, queue: &str) -> Result<()>;

    /// 发布信封，返回时已持久化或已缓冲
    async fn publish(&self, queue: &str, envelope: &TaskEnvelope) -> Result<PublishReceipt>;

    /// 从队列中取出至多 `max` 个已到期的投递
    async fn fetch(&self, queue: &str, max: usize) -> Result<Vec<Delivery>>;

    /// 确认投递处理完成
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// 放弃投递，使其立即重新可见
    async fn requeue(&self, delivery: &Delivery) -> Result<()>;

    /// 队列中待处理的消息数
    async fn queue_len(&self, queue: &str) -> Result<u64>;

    async fn ping(&self) -> Result<()>;
}

/// `consume` 的拉取参数
#[derive(Debug, Clone)]
pub struct ConsumeOptions {
    /// 所有队列都为空时的等待间隔
    pub poll_interval: Duration,
    pub batch_size: usize,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            batch_size: 1,
        }
    }
}

/// 按优先级顺序轮询队列的消费者
///
/// 每次拉取都从第一个队列开始，前面的队列有消息时后面的队列不会被拉取。
/// 一次拉取的批量投递先缓存在本地，逐个交给调用方；停止消费时
/// 必须用 [`Consumer::drain_buffered`] 取回尚未交出的投递并退回代理。
pub struct Consumer {
    broker: Arc<dyn Broker>,
    queues: Vec<String>,
    options: ConsumeOptions,
    buffer: VecDeque<Delivery>,
}

impl Consumer {
    pub fn new(broker: Arc<dyn Broker>, queues: Vec<String>, options: ConsumeOptions) -> Self {
        Self {
            broker,
            queues,
            options,
            buffer: VecDeque::new(),
        }
    }

    /// 取下一个投递，队列都为空时按 `poll_interval` 等待
    ///
    /// 取消安全：批量结果在同一次 poll 中放入缓冲区。
    pub async fn next_delivery(&mut self) -> Result<Delivery> {
        loop {
            if let Some(delivery) = self.buffer.pop_front() {
                return Ok(delivery);
            }

            let mut failure = None;
            for queue in &self.queues {
                match self
                    .broker
                    .fetch(queue, self.options.batch_size.max(1))
                    .await
                {
                    Ok(batch) if !batch.is_empty() => {
                        self.buffer.extend(batch);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }

            if let Some(e) = failure {
                tokio::time::sleep(self.options.poll_interval).await;
                return Err(e);
            }
            if self.buffer.is_empty() {
                tokio::time::sleep(self.options.poll_interval).await;
            }
        }
    }

    /// 已从代理取出但尚未交给调用方的投递
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn drain_buffered(&mut self) -> Vec<Delivery> {
        self.buffer.drain(..).collect()
    }
}

/// 基于 [`Consumer`] 的惰性投递流
///
/// 流不会结束，也不能重启；代理错误作为 `Err` 项产出，由调用方决定是否继续。
/// 丢弃流会丢失本地缓冲的投递（只能等可见性超时），需要干净停止时直接使用 [`Consumer`]。
pub fn consume(
    broker: Arc<dyn Broker>,
    queues: Vec<String>,
    options: ConsumeOptions,
) -> BoxStream<'static, Result<Delivery>> {
    stream::unfold(Consumer::new(broker, queues, options), |mut consumer| async move {
        let next = consumer.next_delivery().await;
        Some((next, consumer))
    })
    .boxed()
}
