use serde::{Deserialize, Serialize};

/// 消息代理类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BrokerType {
    /// 进程内代理，只适用于单进程（`--mode all`）和测试
    #[default]
    Memory,
    RedisStream,
    Rabbitmq,
}

/// 消息代理配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    #[serde(rename = "type")]
    pub r#type: BrokerType,
    pub url: String,
    /// Redis Streams 消费者组名称
    pub consumer_group: String,
    /// 未确认投递重新可见前的时间
    pub visibility_timeout_seconds: u64,
    /// 进程内代理每个队列的容量
    pub capacity: usize,
    /// 代理不可用时本地发布缓冲区容量，0 表示不缓冲
    pub publish_buffer_capacity: usize,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub connection_timeout_seconds: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            r#type: BrokerType::Memory,
            url: String::new(),
            consumer_group: "taskbeat".to_string(),
            visibility_timeout_seconds: 600,
            capacity: 10_000,
            publish_buffer_capacity: 1_000,
            reconnect_initial_ms: 500,
            reconnect_max_ms: 30_000,
            connection_timeout_seconds: 30,
        }
    }
}

impl BrokerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        match self.r#type {
            BrokerType::Memory => {
                if self.capacity == 0 {
                    return Err(anyhow::anyhow!("内存代理队列容量必须大于0"));
                }
            }
            BrokerType::RedisStream => {
                if !self.url.starts_with("redis://") && !self.url.starts_with("rediss://") {
                    return Err(anyhow::anyhow!("Redis URL必须是redis://格式: {}", self.url));
                }
                if self.consumer_group.is_empty() {
                    return Err(anyhow::anyhow!("消费者组名称不能为空"));
                }
            }
            BrokerType::Rabbitmq => {
                if !self.url.starts_with("amqp://") && !self.url.starts_with("amqps://") {
                    return Err(anyhow::anyhow!("RabbitMQ URL必须是AMQP格式: {}", self.url));
                }
            }
        }

        if self.visibility_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("可见性超时必须大于0"));
        }

        if self.reconnect_initial_ms == 0 || self.reconnect_max_ms < self.reconnect_initial_ms {
            return Err(anyhow::anyhow!(
                "重连退避配置无效: initial={}ms max={}ms",
                self.reconnect_initial_ms,
                self.reconnect_max_ms
            ));
        }

        if self.connection_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("连接超时时间必须大于0"));
        }

        Ok(())
    }
}
