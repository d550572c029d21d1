use std::sync::Arc;
use std::time::Duration;

use taskbeat_core::config::{BrokerConfig, BrokerType, StoreConfig, StoreType};
use taskbeat_core::{Broker, LeaseStore, Result, ResultStore, ScheduleStore, TaskbeatError};
use tracing::{debug, info};

use crate::database::SqliteStore;
use crate::in_memory_broker::{InMemoryBroker, InMemoryBrokerConfig};
use crate::memory_store::MemoryStore;
use crate::rabbitmq::{RabbitMqBroker, RabbitMqConfig};
use crate::redis_stream::{RedisStreamBroker, RedisStreamConfig};
use crate::resilient_broker::{ResilientBroker, ResilientBrokerConfig};

pub struct BrokerFactory;

impl BrokerFactory {
    /// 按配置创建消息代理；`consumer_name` 用于 Redis Streams 消费者组
    pub async fn create(config: &BrokerConfig, consumer_name: &str) -> Result<Arc<dyn Broker>> {
        Self::validate_config(config)?;
        debug!("Creating broker with type: {:?}", config.r#type);

        match config.r#type {
            BrokerType::Memory => {
                info!("Initializing in-memory broker");
                Ok(Arc::new(InMemoryBroker::with_config(InMemoryBrokerConfig {
                    capacity: config.capacity,
                    visibility_timeout: Duration::from_secs(config.visibility_timeout_seconds),
                })))
            }
            BrokerType::RedisStream => {
                info!("Initializing Redis Stream broker");
                let broker = RedisStreamBroker::connect(Self::build_redis_config(config, consumer_name))
                    .await?;
                Ok(Arc::new(broker))
            }
            BrokerType::Rabbitmq => {
                info!("Initializing RabbitMQ broker");
                let broker = RabbitMqBroker::connect(RabbitMqConfig {
                    url: config.url.clone(),
                    connection_timeout: Duration::from_secs(config.connection_timeout_seconds),
                })
                .await?;
                Ok(Arc::new(broker))
            }
        }
    }

    /// 为 `inner` 加上发布缓冲
    pub fn resilient(
        inner: Arc<dyn Broker>,
        config: &BrokerConfig,
        store: Arc<dyn ResultStore>,
    ) -> Arc<ResilientBroker> {
        Arc::new(
            ResilientBroker::new(
                inner,
                ResilientBrokerConfig {
                    buffer_capacity: config.publish_buffer_capacity,
                    reconnect_initial: Duration::from_millis(config.reconnect_initial_ms),
                    reconnect_max: Duration::from_millis(config.reconnect_max_ms),
                },
            )
            .with_store(store),
        )
    }

    pub fn build_redis_config(config: &BrokerConfig, consumer_name: &str) -> RedisStreamConfig {
        RedisStreamConfig {
            url: config.url.clone(),
            consumer_group: config.consumer_group.clone(),
            consumer_name: consumer_name.to_string(),
            visibility_timeout: Duration::from_secs(config.visibility_timeout_seconds),
            connect_attempts: 5,
            reconnect_initial: Duration::from_millis(config.reconnect_initial_ms),
            reconnect_max: Duration::from_millis(config.reconnect_max_ms),
        }
    }

    pub fn validate_config(config: &BrokerConfig) -> Result<()> {
        config
            .validate()
            .map_err(|e| TaskbeatError::Configuration(e.to_string()))
    }
}

/// 同一个后端实现的三个存储接口
#[derive(Clone)]
pub struct Stores {
    pub results: Arc<dyn ResultStore>,
    pub schedules: Arc<dyn ScheduleStore>,
    pub leases: Arc<dyn LeaseStore>,
}

impl Stores {
    pub fn from_backend<S>(backend: Arc<S>) -> Self
    where
        S: ResultStore + ScheduleStore + LeaseStore + 'static,
    {
        Self {
            results: backend.clone(),
            schedules: backend.clone(),
            leases: backend,
        }
    }

    pub fn in_memory() -> Self {
        Self::from_backend(Arc::new(MemoryStore::new()))
    }
}

pub struct StoreFactory;

impl StoreFactory {
    pub async fn create(config: &StoreConfig) -> Result<Stores> {
        config
            .validate()
            .map_err(|e| TaskbeatError::Configuration(e.to_string()))?;

        match config.r#type {
            StoreType::Memory => {
                info!("Initializing in-memory store");
                Ok(Stores::in_memory())
            }
            StoreType::Sqlite => {
                info!("Initializing SQLite store");
                let store = SqliteStore::connect(
                    &config.url,
                    config.max_connections,
                    Duration::from_secs(config.connection_timeout_seconds),
                )
                .await?;
                Ok(Stores::from_backend(Arc::new(store)))
            }
        }
    }
}
