use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use taskbeat_core::{
    ArgsSchema, Result, RetryPolicy, TaskContext, TaskDefinition, TaskHandler, TaskbeatError,
};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{info, warn};

/// `shell` 任务参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellTaskParams {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
}

/// `http` 任务参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpTaskParams {
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

/// Shell 命令处理器
///
/// 退出码非零时返回可重试的执行错误；撤销时终止子进程。
#[derive(Debug, Default)]
pub struct ShellHandler;

impl ShellHandler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TaskHandler for ShellHandler {
    async fn handle(&self, ctx: &TaskContext) -> Result<serde_json::Value> {
        let params: ShellTaskParams = ctx.args_as()?;
        let start_time = Instant::now();

        info!(
            envelope.id = %ctx.envelope_id,
            command = %params.command,
            args = ?params.args,
            "执行Shell任务"
        );

        let mut cmd = Command::new(&params.command);
        cmd.args(&params.args)
            .envs(&params.env_vars)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &params.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| TaskbeatError::TaskExecution(format!("启动Shell命令失败: {e}")))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| TaskbeatError::TaskExecution("无法获取stdout".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| TaskbeatError::TaskExecution("无法获取stderr".to_string()))?;

        let mut out = String::new();
        let mut err = String::new();
        let finished = async {
            let (read_out, read_err) =
                tokio::join!(stdout.read_to_string(&mut out), stderr.read_to_string(&mut err));
            match read_out.and(read_err) {
                Ok(_) => child.wait().await,
                Err(e) => Err(e),
            }
        };

        let status = tokio::select! {
            status = finished => status
                .map_err(|e| TaskbeatError::TaskExecution(format!("等待进程结束失败: {e}")))?,
            _ = ctx.cancelled() => {
                warn!(envelope.id = %ctx.envelope_id, "任务已撤销，终止Shell进程");
                return Err(TaskbeatError::Revoked { id: ctx.envelope_id.clone() });
            }
        };

        let duration_ms = start_time.elapsed().as_millis() as u64;
        info!(
            envelope.id = %ctx.envelope_id,
            exit_code = ?status.code(),
            duration_ms,
            "Shell任务执行完成"
        );

        if !status.success() {
            let detail = if err.trim().is_empty() {
                format!("退出码: {:?}", status.code())
            } else {
                err.trim_end().to_string()
            };
            return Err(TaskbeatError::TaskExecution(format!("命令执行失败，{detail}")));
        }

        Ok(json!({
            "exit_code": status.code(),
            "stdout": out.trim_end(),
            "stderr": err.trim_end(),
            "duration_ms": duration_ms,
        }))
    }
}

/// HTTP 请求处理器
#[derive(Debug, Clone, Default)]
pub struct HttpHandler {
    client: reqwest::Client,
}

impl HttpHandler {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskHandler for HttpHandler {
    async fn handle(&self, ctx: &TaskContext) -> Result<serde_json::Value> {
        let params: HttpTaskParams = ctx.args_as()?;
        let method = params.method.as_deref().unwrap_or("GET").to_uppercase();
        let start_time = Instant::now();

        let mut request = match method.as_str() {
            "GET" => self.client.get(&params.url),
            "POST" => self.client.post(&params.url),
            "PUT" => self.client.put(&params.url),
            "DELETE" => self.client.delete(&params.url),
            "PATCH" => self.client.patch(&params.url),
            "HEAD" => self.client.head(&params.url),
            _ => {
                return Err(TaskbeatError::InvalidTaskParams(format!(
                    "不支持的HTTP方法: {method}"
                )));
            }
        };
        if let Some(seconds) = params.timeout_seconds {
            request = request.timeout(Duration::from_secs(seconds));
        }
        for (key, value) in &params.headers {
            request = request.header(key, value);
        }
        if let Some(body) = params.body {
            request = request.body(body);
        }

        info!(envelope.id = %ctx.envelope_id, %method, url = %params.url, "执行HTTP任务");

        let response = tokio::select! {
            response = request.send() => response
                .map_err(|e| TaskbeatError::TaskExecution(format!("HTTP请求失败: {e}")))?,
            _ = ctx.cancelled() => {
                return Err(TaskbeatError::Revoked { id: ctx.envelope_id.clone() });
            }
        };

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TaskbeatError::TaskExecution(format!("读取响应体失败: {e}")))?;
        let duration_ms = start_time.elapsed().as_millis() as u64;
        info!(
            envelope.id = %ctx.envelope_id,
            status = status.as_u16(),
            duration_ms,
            "HTTP任务执行完成"
        );

        if !status.is_success() {
            return Err(TaskbeatError::TaskExecution(format!(
                "HTTP请求失败，状态码: {}",
                status.as_u16()
            )));
        }

        Ok(json!({
            "status": status.as_u16(),
            "body": body,
            "duration_ms": duration_ms,
        }))
    }
}

/// 内置 `shell` 和 `http` 任务定义
pub fn builtin_definitions(queue: &str, retry_policy: &RetryPolicy) -> Vec<TaskDefinition> {
    vec![
        TaskDefinition::new("shell", Arc::new(ShellHandler::new()))
            .with_schema(ArgsSchema::object(["command"]))
            .with_default_queue(queue)
            .with_retry_policy(retry_policy.clone()),
        TaskDefinition::new("http", Arc::new(HttpHandler::new()))
            .with_schema(ArgsSchema::object(["url"]))
            .with_default_queue(queue)
            .with_retry_policy(retry_policy.clone()),
    ]
}
