use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::streams::{StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadReply};
use redis::{Client, RedisError, Script};
use taskbeat_core::{
    Backoff, Broker, Delivery, PublishReceipt, Result, TaskEnvelope, TaskbeatError,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const ENVELOPE_FIELD: &str = "envelope";
/// 重新入队的条目带此字段，再次领取时视为重复投递
const REDELIVERED_FIELD: &str = "redelivered";

/// 把已到期的延迟信封从有序集合原子地移入流
const PROMOTE_DUE_SCRIPT: &str = r#"
local items = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
for _, item in ipairs(items) do
    redis.call('XADD', KEYS[2], '*', 'envelope', item)
    redis.call('ZREM', KEYS[1], item)
end
return #items
"#;

#[derive(Debug, Clone)]
pub struct RedisStreamConfig {
    pub url: String,
    pub consumer_group: String,
    /// 本进程在消费者组中的名称
    pub consumer_name: String,
    pub visibility_timeout: Duration,
    pub connect_attempts: u32,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
}

impl Default for RedisStreamConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/0".to_string(),
            consumer_group: "taskbeat".to_string(),
            consumer_name: format!("consumer-{}", uuid::Uuid::new_v4()),
            visibility_timeout: Duration::from_secs(600),
            connect_attempts: 5,
            reconnect_initial: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(30),
        }
    }
}

/// Redis Streams 消息代理
///
/// 每个队列一条流加一个消费者组。`eta` 在未来的信封先放入 `<queue>:delayed`
/// 有序集合；闲置超过可见性超时的待确认条目通过 XPENDING/XCLAIM 回收；
/// 无法解码的条目转入 `<queue>:dead` 死信流。
pub struct RedisStreamBroker {
    conn: ConnectionManager,
    config: RedisStreamConfig,
    declared: Mutex<HashSet<String>>,
    promote: Script,
}

fn map_redis_error(context: &str, e: RedisError) -> TaskbeatError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
    {
        TaskbeatError::BrokerUnavailable(format!("{context}: {e}"))
    } else {
        TaskbeatError::MessageQueue(format!("{context}: {e}"))
    }
}

fn delayed_key(queue: &str) -> String {
    format!("{queue}:delayed")
}

fn dead_letter_key(queue: &str) -> String {
    format!("{queue}:dead")
}

impl RedisStreamBroker {
    pub async fn connect(config: RedisStreamConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())
            .map_err(|e| TaskbeatError::Configuration(format!("无效的Redis URL: {e}")))?;

        let mut backoff = Backoff::new(config.reconnect_initial, config.reconnect_max);
        let mut attempt = 0;
        let conn = loop {
            attempt += 1;
            match client.get_connection_manager().await {
                Ok(conn) => break conn,
                Err(e) if attempt < config.connect_attempts => {
                    let delay = backoff.next_delay();
                    warn!(
                        "Failed to connect to Redis (attempt {}/{}): {}. Retrying in {:?}...",
                        attempt, config.connect_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(map_redis_error(
                        &format!("连接Redis失败（已尝试{attempt}次）"),
                        e,
                    ))
                }
            }
        };

        let broker = Self {
            conn,
            config,
            declared: Mutex::new(HashSet::new()),
            promote: Script::new(PROMOTE_DUE_SCRIPT),
        };
        broker.ping().await?;
        info!(
            consumer_group = %broker.config.consumer_group,
            consumer = %broker.config.consumer_name,
            "Connected to Redis Streams broker"
        );
        Ok(broker)
    }

    async fn ensure_declared(&self, queue: &str) -> Result<()> {
        if self.declared.lock().await.contains(queue) {
            return Ok(());
        }
        self.declare_queue(queue).await
    }

    fn decode(&self, entry: &StreamId) -> std::result::Result<TaskEnvelope, String> {
        let raw: String = entry
            .get(ENVELOPE_FIELD)
            .ok_or_else(|| format!("条目 {} 缺少 {ENVELOPE_FIELD} 字段", entry.id))?;
        TaskEnvelope::from_json(&raw).map_err(|e| e.to_string())
    }

    /// 无法解码的条目写入死信流并从原流中移除
    async fn dead_letter(&self, queue: &str, entry: &StreamId, reason: &str) -> Result<()> {
        let raw: Option<String> = entry.get(ENVELOPE_FIELD);
        warn!(queue, entry.id = %entry.id, reason, "Moving undecodable entry to dead-letter stream");

        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .cmd("XADD")
            .arg(dead_letter_key(queue))
            .arg("*")
            .arg("source_id")
            .arg(&entry.id)
            .arg("raw")
            .arg(raw.unwrap_or_default())
            .arg("reason")
            .arg(reason)
            .ignore()
            .cmd("XACK")
            .arg(queue)
            .arg(&self.config.consumer_group)
            .arg(&entry.id)
            .ignore()
            .cmd("XDEL")
            .arg(queue)
            .arg(&entry.id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| map_redis_error("写入死信流失败", e))
    }

    async fn to_deliveries(
        &self,
        queue: &str,
        entries: Vec<StreamId>,
        redelivered: bool,
    ) -> Result<Vec<Delivery>> {
        let mut deliveries = Vec::with_capacity(entries.len());
        for entry in entries {
            match self.decode(&entry) {
                Ok(envelope) => deliveries.push(Delivery {
                    envelope,
                    queue: queue.to_string(),
                    tag: entry.id.clone(),
                    redelivered: redelivered || entry.contains_key(REDELIVERED_FIELD),
                }),
                Err(reason) => self.dead_letter(queue, &entry, &reason).await?,
            }
        }
        Ok(deliveries)
    }

    async fn promote_due(&self, queue: &str, max: usize) -> Result<()> {
        let mut conn = self.conn.clone();
        let promoted: i64 = self
            .promote
            .key(delayed_key(queue))
            .key(queue)
            .arg(Utc::now().timestamp_millis())
            .arg(max.max(1))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("提升延迟消息失败", e))?;
        if promoted > 0 {
            debug!(queue, promoted, "Promoted delayed envelopes");
        }
        Ok(())
    }

    /// 回收闲置超过可见性超时的待确认条目
    async fn reclaim_stale(&self, queue: &str, max: usize) -> Result<Vec<Delivery>> {
        let idle_ms = self.config.visibility_timeout.as_millis() as u64;
        let mut conn = self.conn.clone();

        let pending: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(queue)
            .arg(&self.config.consumer_group)
            .arg("IDLE")
            .arg(idle_ms)
            .arg("-")
            .arg("+")
            .arg(max)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("查询待确认消息失败", e))?;
        if pending.ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut claim = redis::cmd("XCLAIM");
        claim
            .arg(queue)
            .arg(&self.config.consumer_group)
            .arg(&self.config.consumer_name)
            .arg(idle_ms);
        for item in &pending.ids {
            claim.arg(&item.id);
        }
        let claimed: StreamClaimReply = claim
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("回收待确认消息失败", e))?;

        debug!(queue, reclaimed = claimed.ids.len(), "Reclaimed stale deliveries");
        self.to_deliveries(queue, claimed.ids, true).await
    }
}

#[async_trait]
impl Broker for RedisStreamBroker {
    fn kind(&self) -> &'static str {
        "redis_stream"
    }

    async fn declare_queue(&self, queue: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let created: std::result::Result<String, RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(queue)
            .arg(&self.config.consumer_group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(_) => debug!(queue, group = %self.config.consumer_group, "Created consumer group"),
            Err(e) if e.to_string().contains("BUSYGROUP") => {}
            Err(e) => return Err(map_redis_error(&format!("创建消费者组失败 {queue}"), e)),
        }
        self.declared.lock().await.insert(queue.to_string());
        Ok(())
    }

    async fn publish(&self, queue: &str, envelope: &TaskEnvelope) -> Result<PublishReceipt> {
        self.ensure_declared(queue).await?;
        let payload = envelope.to_json()?;
        let mut conn = self.conn.clone();

        match envelope.eta.filter(|eta| *eta > Utc::now()) {
            Some(eta) => {
                let _: i64 = redis::cmd("ZADD")
                    .arg(delayed_key(queue))
                    .arg(eta.timestamp_millis())
                    .arg(&payload)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| map_redis_error("发布延迟消息失败", e))?;
            }
            None => {
                let _: String = redis::cmd("XADD")
                    .arg(queue)
                    .arg("*")
                    .arg(ENVELOPE_FIELD)
                    .arg(&payload)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| map_redis_error(&format!("发布消息到队列 {queue} 失败"), e))?;
            }
        }

        debug!(envelope.id = %envelope.id, queue, "Published envelope");
        Ok(PublishReceipt::Confirmed)
    }

    async fn fetch(&self, queue: &str, max: usize) -> Result<Vec<Delivery>> {
        self.ensure_declared(queue).await?;
        self.promote_due(queue, max).await?;

        let mut deliveries = self.reclaim_stale(queue, max).await?;
        if deliveries.len() >= max {
            return Ok(deliveries);
        }

        let mut conn = self.conn.clone();
        let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.config.consumer_group)
            .arg(&self.config.consumer_name)
            .arg("COUNT")
            .arg(max - deliveries.len())
            .arg("STREAMS")
            .arg(queue)
            .arg(">")
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(&format!("从队列 {queue} 读取消息失败"), e))?;

        if let Some(reply) = reply {
            for key in reply.keys {
                let fresh = self.to_deliveries(queue, key.ids, false).await?;
                deliveries.extend(fresh);
            }
        }
        Ok(deliveries)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .cmd("XACK")
            .arg(&delivery.queue)
            .arg(&self.config.consumer_group)
            .arg(&delivery.tag)
            .ignore()
            .cmd("XDEL")
            .arg(&delivery.queue)
            .arg(&delivery.tag)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| map_redis_error("确认消息失败", e))
    }

    async fn requeue(&self, delivery: &Delivery) -> Result<()> {
        let payload = delivery.envelope.to_json()?;
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .cmd("XADD")
            .arg(&delivery.queue)
            .arg("*")
            .arg(ENVELOPE_FIELD)
            .arg(&payload)
            .arg(REDELIVERED_FIELD)
            .arg("1")
            .ignore()
            .cmd("XACK")
            .arg(&delivery.queue)
            .arg(&self.config.consumer_group)
            .arg(&delivery.tag)
            .ignore()
            .cmd("XDEL")
            .arg(&delivery.queue)
            .arg(&delivery.tag)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| map_redis_error("重新入队失败", e))
    }

    async fn queue_len(&self, queue: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let (stream_len, delayed_len): (u64, u64) = redis::pipe()
            .cmd("XLEN")
            .arg(queue)
            .cmd("ZCARD")
            .arg(delayed_key(queue))
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("获取队列长度失败", e))?;
        Ok(stream_len + delayed_len)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("Redis PING失败", e))?;
        if pong != "PONG" {
            return Err(TaskbeatError::MessageQueue(format!(
                "Unexpected PING response: {pong}"
            )));
        }
        Ok(())
    }
}
