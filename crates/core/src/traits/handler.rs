use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::{Result, TaskbeatError};

/// 处理器执行时可见的上下文
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub envelope_id: String,
    pub task_name: String,
    pub args: serde_json::Value,
    /// 当前尝试序号，从1开始
    pub attempt: u32,
    pub retries_done: u32,
    pub max_retries: u32,
    pub worker_id: String,
    cancel: CancellationToken,
}

impl TaskContext {
    pub fn new(
        envelope_id: impl Into<String>,
        task_name: impl Into<String>,
        args: serde_json::Value,
        attempt: u32,
        retries_done: u32,
        max_retries: u32,
        worker_id: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            envelope_id: envelope_id.into(),
            task_name: task_name.into(),
            args,
            attempt,
            retries_done,
            max_retries,
            worker_id: worker_id.into(),
            cancel,
        }
    }

    /// 撤销标志，处理器应在合适的位置轮询
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 已撤销时返回 `Revoked` 错误，便于在循环中使用 `?`
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(TaskbeatError::Revoked {
                id: self.envelope_id.clone(),
            });
        }
        Ok(())
    }

    /// 等待撤销，可与处理器自身的 future 一起 `select!`
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn is_last_attempt(&self) -> bool {
        self.retries_done >= self.max_retries
    }

    pub fn args_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.args.clone())
            .map_err(|e| TaskbeatError::InvalidTaskParams(format!("{}: {e}", self.task_name)))
    }
}

/// 任务处理器
///
/// 返回值作为执行结果写入存储；错误经 `TaskbeatError::is_retryable` 分类决定是否重试。
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, ctx: &TaskContext) -> Result<serde_json::Value>;
}

/// 把异步闭包包装成处理器
pub struct FnHandler<F, Fut> {
    f: F,
    _marker: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnHandler<F, Fut>
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value>> + Send,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F, Fut>
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value>> + Send,
{
    async fn handle(&self, ctx: &TaskContext) -> Result<serde_json::Value> {
        (self.f)(ctx.clone()).await
    }
}
