use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::future::join_all;
use taskbeat_core::config::AppConfig;
use taskbeat_core::{Broker, TaskRegistry};
use taskbeat_dispatcher::{BeatScheduler, DispatchCore, RecoveryConfig};
use taskbeat_infrastructure::{BrokerFactory, ResilientBroker, StoreFactory, Stores};
use taskbeat_worker::{builtin_definitions, default_worker_id, WorkerPool, WorkerPoolConfig};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// 仅运行 Worker 池
    Worker,
    /// 仅运行 beat 调度器
    Beat,
    /// 同一进程内运行全部组件
    All,
}

impl AppMode {
    pub fn runs_worker(&self) -> bool {
        matches!(self, AppMode::Worker | AppMode::All)
    }

    pub fn runs_beat(&self) -> bool {
        matches!(self, AppMode::Beat | AppMode::All)
    }
}

impl FromStr for AppMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "worker" => Ok(AppMode::Worker),
            "beat" => Ok(AppMode::Beat),
            "all" => Ok(AppMode::All),
            _ => Err(anyhow::anyhow!("不支持的运行模式: {s}")),
        }
    }
}

/// 注册内置 `shell` 与 `http` 任务
pub fn builtin_registry(config: &AppConfig) -> Result<TaskRegistry> {
    let mut registry = TaskRegistry::new();
    for definition in builtin_definitions(&config.dispatch.default_queue, &config.dispatch.retry) {
        registry.register(definition)?;
    }
    Ok(registry)
}

/// 进程内共享的组件
#[derive(Clone)]
pub struct Components {
    pub registry: Arc<TaskRegistry>,
    pub broker: Arc<ResilientBroker>,
    pub stores: Stores,
    pub dispatch: Arc<DispatchCore>,
}

impl Components {
    /// 按配置连接存储和消息代理
    pub async fn build(config: &AppConfig, node_id: &str, registry: TaskRegistry) -> Result<Self> {
        let stores = StoreFactory::create(&config.store)
            .await
            .context("初始化存储失败")?;
        let inner = BrokerFactory::create(&config.broker, node_id)
            .await
            .context("连接消息代理失败")?;
        Ok(Self::from_parts(config, registry, inner, stores))
    }

    pub fn from_parts(
        config: &AppConfig,
        registry: TaskRegistry,
        inner: Arc<dyn Broker>,
        stores: Stores,
    ) -> Self {
        let registry = Arc::new(registry);
        let broker = BrokerFactory::resilient(inner, &config.broker, Arc::clone(&stores.results));
        let recovery = RecoveryConfig {
            grace: chrono::Duration::seconds(
                i64::try_from(config.beat.recovery_grace_seconds).unwrap_or(i64::MAX / 1_000),
            ),
            batch: config.beat.recovery_batch,
        };
        let dispatch = Arc::new(
            DispatchCore::new(
                Arc::clone(&registry),
                broker.clone(),
                Arc::clone(&stores.results),
            )
            .with_recovery(recovery),
        );

        Self {
            registry,
            broker,
            stores,
            dispatch,
        }
    }
}

/// 主应用程序
pub struct Application {
    config: AppConfig,
    mode: AppMode,
    worker_id: String,
    scheduler_id: String,
    components: Components,
}

impl Application {
    pub async fn new(config: AppConfig, mode: AppMode, registry: TaskRegistry) -> Result<Self> {
        info!("初始化应用程序，模式: {:?}", mode);
        let worker_id = config.worker.worker_id.clone().unwrap_or_else(default_worker_id);
        let components = Components::build(&config, &worker_id, registry).await?;
        Ok(Self::with_components(config, mode, worker_id, components))
    }

    pub fn with_components(
        config: AppConfig,
        mode: AppMode,
        worker_id: String,
        components: Components,
    ) -> Self {
        let scheduler_id = config
            .beat
            .scheduler_id
            .clone()
            .unwrap_or_else(|| worker_id.clone());
        Self {
            config,
            mode,
            worker_id,
            scheduler_id,
            components,
        }
    }

    pub fn components(&self) -> &Components {
        &self.components
    }

    pub fn dispatch(&self) -> &Arc<DispatchCore> {
        &self.components.dispatch
    }

    /// 运行直到 `shutdown` 被取消
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!("启动应用程序，模式: {:?}", self.mode);
        let mut handles = Vec::new();

        let flusher = self.components.broker.start_flusher(shutdown.clone());

        if self.mode.runs_beat() {
            if self.config.beat.enabled {
                let beat = BeatScheduler::from_config(
                    &self.config.beat,
                    self.scheduler_id.clone(),
                    Arc::clone(&self.components.stores.schedules),
                    Arc::clone(&self.components.stores.leases),
                    Arc::clone(&self.components.dispatch),
                );
                beat.sync_entries(&self.config.beat.entries)
                    .await
                    .context("同步调度条目失败")?;
                handles.push(tokio::spawn(beat.run(shutdown.clone())));
            } else {
                warn!("beat 已在配置中禁用，跳过调度器");
            }
        }

        if self.mode.runs_worker() {
            let pool = WorkerPool::new(
                self.worker_id.clone(),
                Arc::clone(&self.components.registry),
                self.components.broker.clone(),
                Arc::clone(&self.components.stores.results),
                WorkerPoolConfig::from(&self.config.worker),
            );
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                if let Err(e) = pool.run(shutdown).await {
                    error!("Worker池运行失败: {e}");
                }
            }));
        }

        for result in join_all(handles).await {
            if let Err(e) = result {
                error!("组件任务异常退出: {e}");
            }
        }
        if let Err(e) = flusher.await {
            error!("发布缓冲刷新任务异常退出: {e}");
        }

        let remaining = self.components.broker.buffered_len().await;
        if remaining > 0 {
            warn!(remaining, "关闭时发布缓冲区仍有信封，将由恢复扫描补发");
        }

        info!("应用程序已停止");
        Ok(())
    }
}
