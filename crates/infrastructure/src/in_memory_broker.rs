use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use taskbeat_core::{Broker, Delivery, PublishReceipt, Result, TaskEnvelope, TaskbeatError};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct InMemoryBrokerConfig {
    /// 每个队列（就绪 + 延迟）的最大消息数
    pub capacity: usize,
    /// 未确认投递重新可见前的时间
    pub visibility_timeout: Duration,
}

impl Default for InMemoryBrokerConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            visibility_timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Debug)]
struct Ready {
    envelope: TaskEnvelope,
    redelivered: bool,
}

#[derive(Debug)]
struct InFlight {
    envelope: TaskEnvelope,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Ready>,
    /// eta 尚未到达的信封，按 eta 升序
    delayed: Vec<TaskEnvelope>,
    in_flight: HashMap<String, InFlight>,
}

impl QueueState {
    fn pending(&self) -> usize {
        self.ready.len() + self.delayed.len()
    }

    /// 回收超时的投递并提升已到期的延迟信封
    fn reclaim(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, item)| item.deadline <= now)
            .map(|(tag, _)| tag.clone())
            .collect();
        for tag in expired {
            if let Some(item) = self.in_flight.remove(&tag) {
                debug!(envelope.id = %item.envelope.id, "投递可见性超时，重新入队");
                self.ready.push_front(Ready {
                    envelope: item.envelope,
                    redelivered: true,
                });
            }
        }

        let wall_now = Utc::now();
        let due = self
            .delayed
            .iter()
            .take_while(|envelope| envelope.is_due(wall_now))
            .count();
        for envelope in self.delayed.drain(..due) {
            self.ready.push_back(Ready {
                envelope,
                redelivered: false,
            });
        }
    }
}

/// 进程内消息代理
///
/// 语义与外部代理一致：投递在确认前不可见，超时后以 `redelivered` 标记重新投递。
/// 只在单进程部署和测试中使用。
#[derive(Debug)]
pub struct InMemoryBroker {
    queues: Mutex<HashMap<String, QueueState>>,
    config: InMemoryBrokerConfig,
    available: AtomicBool,
    next_tag: AtomicU64,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_config(InMemoryBrokerConfig::default())
    }

    pub fn with_config(config: InMemoryBrokerConfig) -> Self {
        info!(
            capacity = config.capacity,
            visibility_timeout_ms = config.visibility_timeout.as_millis() as u64,
            "创建内存消息代理"
        );
        Self {
            queues: Mutex::new(HashMap::new()),
            config,
            available: AtomicBool::new(true),
            next_tag: AtomicU64::new(1),
        }
    }

    /// 故障注入：模拟代理宕机与恢复
    pub fn set_available(&self, available: bool) {
        if !available {
            warn!("内存消息代理被标记为不可用");
        }
        self.available.store(available, Ordering::SeqCst);
    }

    pub async fn in_flight_len(&self, queue: &str) -> usize {
        self.queues
            .lock()
            .await
            .get(queue)
            .map_or(0, |state| state.in_flight.len())
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TaskbeatError::BrokerUnavailable(
                "内存消息代理不可用".to_string(),
            ))
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn declare_queue(&self, queue: &str) -> Result<()> {
        self.queues
            .lock()
            .await
            .entry(queue.to_string())
            .or_default();
        Ok(())
    }

    async fn publish(&self, queue: &str, envelope: &TaskEnvelope) -> Result<PublishReceipt> {
        self.ensure_available()?;

        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();
        if state.pending() >= self.config.capacity {
            return Err(TaskbeatError::PublishBackpressure {
                capacity: self.config.capacity,
            });
        }

        if envelope.is_due(Utc::now()) {
            state.ready.push_back(Ready {
                envelope: envelope.clone(),
                redelivered: false,
            });
        } else {
            let position = state
                .delayed
                .partition_point(|existing| existing.eta <= envelope.eta);
            state.delayed.insert(position, envelope.clone());
        }

        debug!(envelope.id = %envelope.id, queue, "消息已发布");
        Ok(PublishReceipt::Confirmed)
    }

    async fn fetch(&self, queue: &str, max: usize) -> Result<Vec<Delivery>> {
        self.ensure_available()?;

        let now = Instant::now();
        let mut queues = self.queues.lock().await;
        let Some(state) = queues.get_mut(queue) else {
            return Ok(Vec::new());
        };
        state.reclaim(now);

        let mut deliveries = Vec::new();
        while deliveries.len() < max {
            let Some(item) = state.ready.pop_front() else {
                break;
            };
            let tag = self.next_tag.fetch_add(1, Ordering::Relaxed).to_string();
            state.in_flight.insert(
                tag.clone(),
                InFlight {
                    envelope: item.envelope.clone(),
                    deadline: now + self.config.visibility_timeout,
                },
            );
            deliveries.push(Delivery {
                envelope: item.envelope,
                queue: queue.to_string(),
                tag,
                redelivered: item.redelivered,
            });
        }
        Ok(deliveries)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.ensure_available()?;

        let mut queues = self.queues.lock().await;
        let removed = queues
            .get_mut(&delivery.queue)
            .and_then(|state| state.in_flight.remove(&delivery.tag));
        if removed.is_none() {
            // 投递已超时并被重新投递，旧标签的确认无效
            debug!(tag = %delivery.tag, envelope.id = %delivery.envelope.id, "确认了已失效的投递");
        }
        Ok(())
    }

    async fn requeue(&self, delivery: &Delivery) -> Result<()> {
        self.ensure_available()?;

        let mut queues = self.queues.lock().await;
        if let Some(state) = queues.get_mut(&delivery.queue) {
            if let Some(item) = state.in_flight.remove(&delivery.tag) {
                state.ready.push_back(Ready {
                    envelope: item.envelope,
                    redelivered: true,
                });
            }
        }
        Ok(())
    }

    async fn queue_len(&self, queue: &str) -> Result<u64> {
        self.ensure_available()?;
        Ok(self
            .queues
            .lock()
            .await
            .get(queue)
            .map_or(0, |state| state.pending() as u64))
    }

    async fn ping(&self) -> Result<()> {
        self.ensure_available()
    }
}
