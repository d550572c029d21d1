use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use lapin::{
    options::*,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use taskbeat_core::{
    Broker, Delivery, PublishReceipt, Result, TaskEnvelope, TaskbeatError,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct RabbitMqConfig {
    pub url: String,
    pub connection_timeout: Duration,
}

struct Session {
    connection: Connection,
    channel: Channel,
    /// 每次重连递增；投递标签只在所属通道内有效
    generation: u64,
    declared: HashSet<String>,
}

/// RabbitMQ 消息代理
///
/// 使用发布确认模式；`eta` 在未来的信封发往带 TTL 的延迟队列，到期后经默认交换机
/// 死信路由回目标队列。连接断开后在下一次操作时惰性重连。
pub struct RabbitMqBroker {
    config: RabbitMqConfig,
    session: Mutex<Option<Session>>,
    generation: std::sync::atomic::AtomicU64,
}

fn delay_queue_name(queue: &str, delay_ms: u64) -> String {
    format!("{queue}.delay.{delay_ms}")
}

fn encode_tag(generation: u64, delivery_tag: u64) -> String {
    format!("{generation}:{delivery_tag}")
}

fn decode_tag(tag: &str) -> Result<(u64, u64)> {
    let parse = || -> Option<(u64, u64)> {
        let (generation, delivery_tag) = tag.split_once(':')?;
        Some((generation.parse().ok()?, delivery_tag.parse().ok()?))
    };
    parse().ok_or_else(|| TaskbeatError::MessageQueue(format!("无效的投递标签: {tag}")))
}

impl RabbitMqBroker {
    pub async fn connect(config: RabbitMqConfig) -> Result<Self> {
        let broker = Self {
            config,
            session: Mutex::new(None),
            generation: std::sync::atomic::AtomicU64::new(0),
        };
        let mut session = broker.session.lock().await;
        *session = Some(broker.open_session().await?);
        drop(session);
        Ok(broker)
    }

    async fn open_session(&self) -> Result<Session> {
        let connect = Connection::connect(&self.config.url, ConnectionProperties::default());
        let connection = tokio::time::timeout(self.config.connection_timeout, connect)
            .await
            .map_err(|_| {
                TaskbeatError::BrokerUnavailable(format!(
                    "连接RabbitMQ超时（{}秒）",
                    self.config.connection_timeout.as_secs()
                ))
            })?
            .map_err(|e| TaskbeatError::BrokerUnavailable(format!("连接RabbitMQ失败: {e}")))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| TaskbeatError::BrokerUnavailable(format!("创建通道失败: {e}")))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| TaskbeatError::MessageQueue(format!("开启发布确认失败: {e}")))?;

        let generation = self
            .generation
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            + 1;
        info!(generation, "成功连接到RabbitMQ");
        Ok(Session {
            connection,
            channel,
            generation,
            declared: HashSet::new(),
        })
    }

    /// 取得可用会话，断开时重连
    async fn session(&self) -> Result<tokio::sync::MappedMutexGuard<'_, Session>> {
        let mut guard = self.session.lock().await;
        let healthy = guard.as_ref().is_some_and(|session| {
            session.connection.status().connected() && session.channel.status().connected()
        });
        if !healthy {
            if guard.is_some() {
                warn!("RabbitMQ连接已断开，尝试重连");
            }
            *guard = None;
            *guard = Some(self.open_session().await?);
        }
        tokio::sync::MutexGuard::try_map(guard, Option::as_mut).map_err(|_| {
            TaskbeatError::Internal("RabbitMQ会话不存在".to_string())
        })
    }

    /// 操作失败时区分连接故障与其他错误
    fn map_error(session: &Session, context: &str, e: lapin::Error) -> TaskbeatError {
        if session.connection.status().connected() && session.channel.status().connected() {
            TaskbeatError::MessageQueue(format!("{context}: {e}"))
        } else {
            TaskbeatError::BrokerUnavailable(format!("{context}: {e}"))
        }
    }

    async fn declare(
        session: &mut Session,
        queue: &str,
        arguments: FieldTable,
        remember: bool,
    ) -> Result<()> {
        if remember && session.declared.contains(queue) {
            return Ok(());
        }
        session
            .channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    ..Default::default()
                },
                arguments,
            )
            .await
            .map_err(|e| Self::map_error(session, &format!("声明队列 {queue} 失败"), e))?;
        if remember {
            session.declared.insert(queue.to_string());
        }
        debug!("队列 {} 声明成功", queue);
        Ok(())
    }

    fn delay_arguments(queue: &str, delay_ms: u64) -> FieldTable {
        let mut arguments = FieldTable::default();
        arguments.insert(
            ShortString::from("x-message-ttl"),
            AMQPValue::LongLongInt(delay_ms as i64),
        );
        arguments.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString(LongString::from("")),
        );
        arguments.insert(
            ShortString::from("x-dead-letter-routing-key"),
            AMQPValue::LongString(LongString::from(queue)),
        );
        // 空闲的延迟队列自动删除
        arguments.insert(
            ShortString::from("x-expires"),
            AMQPValue::LongLongInt((delay_ms + 60_000) as i64),
        );
        arguments
    }
}

#[async_trait]
impl Broker for RabbitMqBroker {
    fn kind(&self) -> &'static str {
        "rabbitmq"
    }

    async fn declare_queue(&self, queue: &str) -> Result<()> {
        let mut session = self.session().await?;
        Self::declare(&mut session, queue, FieldTable::default(), true).await
    }

    async fn publish(&self, queue: &str, envelope: &TaskEnvelope) -> Result<PublishReceipt> {
        let payload = envelope.to_bytes()?;
        let mut session = self.session().await?;
        Self::declare(&mut session, queue, FieldTable::default(), true).await?;

        // 延迟按秒向上取整，减少延迟队列数量
        let delay_ms = envelope
            .eta
            .map(|eta| (eta - Utc::now()).num_milliseconds())
            .filter(|ms| *ms > 0)
            .map(|ms| (ms as u64).div_ceil(1000) * 1000);
        let routing_key = match delay_ms {
            Some(delay_ms) => {
                let delay_queue = delay_queue_name(queue, delay_ms);
                Self::declare(
                    &mut session,
                    &delay_queue,
                    Self::delay_arguments(queue, delay_ms),
                    // 延迟队列空闲后会被删除，每次发布前都重新声明
                    false,
                )
                .await?;
                delay_queue
            }
            None => queue.to_string(),
        };

        let confirm = session
            .channel
            .basic_publish(
                "",
                &routing_key,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default().with_delivery_mode(2), // 2 = persistent
            )
            .await
            .map_err(|e| {
                Self::map_error(&session, &format!("发布消息到队列 {routing_key} 失败"), e)
            })?;

        let confirmation = confirm
            .await
            .map_err(|e| Self::map_error(&session, "消息发布确认失败", e))?;
        if confirmation.is_nack() {
            return Err(TaskbeatError::MessageQueue(format!(
                "RabbitMQ拒绝了消息 {}",
                envelope.id
            )));
        }

        debug!(envelope.id = %envelope.id, queue = %routing_key, "消息已发布");
        Ok(PublishReceipt::Confirmed)
    }

    async fn fetch(&self, queue: &str, max: usize) -> Result<Vec<Delivery>> {
        let mut session = self.session().await?;
        Self::declare(&mut session, queue, FieldTable::default(), true).await?;

        let mut deliveries = Vec::new();
        while deliveries.len() < max {
            let message = session
                .channel
                .basic_get(queue, BasicGetOptions { no_ack: false })
                .await
                .map_err(|e| Self::map_error(&session, &format!("从队列 {queue} 获取消息失败"), e))?;
            let Some(message) = message else {
                break;
            };

            let delivery_tag = message.delivery.delivery_tag;
            match TaskEnvelope::from_bytes(&message.delivery.data) {
                Ok(envelope) => deliveries.push(Delivery {
                    envelope,
                    queue: queue.to_string(),
                    tag: encode_tag(session.generation, delivery_tag),
                    redelivered: message.delivery.redelivered,
                }),
                Err(e) => {
                    // 无法解码的消息丢弃；队列若配置了死信交换机则由其接收
                    warn!(queue, error = %e, "丢弃无法解码的消息");
                    session
                        .channel
                        .basic_reject(delivery_tag, BasicRejectOptions { requeue: false })
                        .await
                        .map_err(|e| Self::map_error(&session, "拒绝消息失败", e))?;
                }
            }
        }
        Ok(deliveries)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let (generation, delivery_tag) = decode_tag(&delivery.tag)?;
        let session = self.session().await?;
        if session.generation != generation {
            // 原通道已关闭，消息会由 RabbitMQ 重新投递
            debug!(envelope.id = %delivery.envelope.id, "忽略旧通道上的确认");
            return Ok(());
        }
        session
            .channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| Self::map_error(&session, "确认消息失败", e))
    }

    async fn requeue(&self, delivery: &Delivery) -> Result<()> {
        let (generation, delivery_tag) = decode_tag(&delivery.tag)?;
        let session = self.session().await?;
        if session.generation != generation {
            return Ok(());
        }
        session
            .channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue: true,
                },
            )
            .await
            .map_err(|e| Self::map_error(&session, "重新入队失败", e))
    }

    async fn queue_len(&self, queue: &str) -> Result<u64> {
        let session = self.session().await?;
        let declared = session
            .channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await;

        match declared {
            Ok(queue_info) => Ok(queue_info.message_count() as u64),
            Err(e) => {
                let error_msg = e.to_string();
                if error_msg.contains("NOT_FOUND") || error_msg.contains("404") {
                    // 被动声明失败会关闭通道，下一次操作时重连
                    Ok(0)
                } else {
                    Err(Self::map_error(&session, "获取队列长度失败", e))
                }
            }
        }
    }

    async fn ping(&self) -> Result<()> {
        let session = self.session().await?;
        if session.connection.status().connected() {
            Ok(())
        } else {
            Err(TaskbeatError::BrokerUnavailable(
                "RabbitMQ连接未就绪".to_string(),
            ))
        }
    }
}
