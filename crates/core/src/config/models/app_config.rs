use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    broker::BrokerConfig,
    dispatch_worker::{BeatConfig, DispatchConfig, WorkerConfig},
    observability::ObservabilityConfig,
    store::StoreConfig,
};

/// 默认配置文件路径，按顺序查找
pub const DEFAULT_CONFIG_PATHS: [&str; 3] = [
    "config/taskbeat.toml",
    "taskbeat.toml",
    "/etc/taskbeat/config.toml",
];

/// 环境变量前缀，形如 `TASKBEAT__WORKER__CONCURRENCY=8`
pub const ENV_PREFIX: &str = "TASKBEAT";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    pub store: StoreConfig,
    pub dispatch: DispatchConfig,
    pub worker: WorkerConfig,
    pub beat: BeatConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// Load configuration from config file and environment variables
    ///
    /// Load order:
    /// 1. Built-in defaults (`#[serde(default)]` on every section)
    /// 2. Config file (TOML format)
    /// 3. Environment variable overrides (prefix: TASKBEAT__)
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else if let Some(path) = DEFAULT_CONFIG_PATHS
            .iter()
            .find(|path| Path::new(path).exists())
        {
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("worker.queues")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;

        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    pub fn validate(&self) -> Result<()> {
        self.broker.validate().context("消息代理配置验证失败")?;
        self.store.validate().context("存储配置验证失败")?;
        self.dispatch.validate().context("分发配置验证失败")?;
        self.worker.validate().context("Worker配置验证失败")?;
        self.beat.validate().context("Beat配置验证失败")?;
        self.observability
            .validate()
            .context("可观测性配置验证失败")?;

        // 执行中的投递不能在超时取消之前重新可见
        if self.worker.task_timeout_seconds >= self.broker.visibility_timeout_seconds {
            return Err(anyhow::anyhow!(
                "任务超时({}s)必须小于消息代理可见性超时({}s)",
                self.worker.task_timeout_seconds,
                self.broker.visibility_timeout_seconds
            ));
        }

        Ok(())
    }
}
