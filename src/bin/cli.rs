use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use taskbeat::app::{builtin_registry, Components};
use taskbeat_core::config::AppConfig;
use taskbeat_dispatcher::SubmitOptions;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = CliApp::parse();
    cli.run().await
}

/// taskbeat 命令行管理工具
#[derive(Parser, Debug)]
#[command(name = "taskbeat-cli")]
#[command(version)]
#[command(about = "taskbeat 命令行管理工具：提交任务、查询状态、撤销任务、管理调度条目")]
struct CliApp {
    #[command(subcommand)]
    command: Commands,

    /// 配置文件路径，未指定时按默认路径查找
    #[arg(short, long)]
    config: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 提交任务
    Submit {
        /// 任务名称
        task: String,
        /// 任务参数 (JSON格式)
        #[arg(short, long, default_value = "{}")]
        args: String,
        /// 目标队列
        #[arg(short, long)]
        queue: Option<String>,
        /// 延迟执行 (秒)
        #[arg(long)]
        countdown: Option<u64>,
        /// 最大重试次数
        #[arg(long)]
        max_retries: Option<u32>,
        /// 超时时间 (秒)
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// 查看任务当前状态
    Status {
        /// 信封ID
        id: String,
    },
    /// 列出任务的全部尝试记录
    Attempts {
        /// 信封ID
        id: String,
    },
    /// 撤销任务
    Revoke {
        /// 信封ID
        id: String,
    },
    /// 调度条目管理
    Schedules(ScheduleCommands),
}

#[derive(Args, Debug)]
struct ScheduleCommands {
    #[command(subcommand)]
    action: ScheduleActions,
}

#[derive(Subcommand, Debug)]
enum ScheduleActions {
    /// 列出调度条目
    List,
    /// 启用调度条目
    Enable { name: String },
    /// 禁用调度条目
    Disable { name: String },
}

impl CliApp {
    async fn run(self) -> Result<()> {
        let config = AppConfig::load(self.config.as_deref()).context("加载配置失败")?;
        let registry = builtin_registry(&config)?;
        let components = Components::build(&config, "taskbeat-cli", registry).await?;

        let output = match self.command {
            Commands::Submit {
                task,
                args,
                queue,
                countdown,
                max_retries,
                timeout,
            } => {
                let args: Value = serde_json::from_str(&args).context("任务参数不是有效的JSON")?;
                let options = SubmitOptions {
                    queue,
                    countdown: countdown.map(Duration::from_secs),
                    max_retries,
                    timeout: timeout.map(Duration::from_secs),
                    ..Default::default()
                };
                let id = components.dispatch.submit(&task, args, options).await?;
                // 缓冲中的发布需要在退出前送达
                let flushed = components.broker.flush().await.unwrap_or(0);
                json!({ "id": id, "flushed": flushed })
            }
            Commands::Status { id } => serde_json::to_value(components.dispatch.get_status(&id).await?)?,
            Commands::Attempts { id } => {
                serde_json::to_value(components.dispatch.attempts(&id).await?)?
            }
            Commands::Revoke { id } => {
                let accepted = components.dispatch.revoke(&id).await?;
                json!({ "id": id, "accepted": accepted })
            }
            Commands::Schedules(ScheduleCommands { action }) => match action {
                ScheduleActions::List => {
                    serde_json::to_value(components.stores.schedules.list_entries().await?)?
                }
                ScheduleActions::Enable { name } => {
                    let updated = components.stores.schedules.set_enabled(&name, true).await?;
                    json!({ "name": name, "enabled": true, "updated": updated })
                }
                ScheduleActions::Disable { name } => {
                    let updated = components.stores.schedules.set_enabled(&name, false).await?;
                    json!({ "name": name, "enabled": false, "updated": updated })
                }
            },
        };

        println!("{}", serde_json::to_string_pretty(&output)?);
        Ok(())
    }
}
