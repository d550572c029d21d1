use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::TaskEnvelope;
use crate::{Result, TaskbeatError};

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Started,
    Success,
    Failure,
    Retry,
    Revoked,
}

impl TaskStatus {
    /// 终态：之后不会再有任何尝试
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failure | TaskStatus::Revoked
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Started => "STARTED",
            TaskStatus::Success => "SUCCESS",
            TaskStatus::Failure => "FAILURE",
            TaskStatus::Retry => "RETRY",
            TaskStatus::Revoked => "REVOKED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = TaskbeatError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(TaskStatus::Pending),
            "STARTED" => Ok(TaskStatus::Started),
            "SUCCESS" => Ok(TaskStatus::Success),
            "FAILURE" => Ok(TaskStatus::Failure),
            "RETRY" => Ok(TaskStatus::Retry),
            "REVOKED" => Ok(TaskStatus::Revoked),
            other => Err(TaskbeatError::Serialization(format!(
                "未知的任务状态: {other}"
            ))),
        }
    }
}

/// 写入执行记录的错误载荷
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: String,
    pub message: String,
}

impl ErrorPayload {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl From<&TaskbeatError> for ErrorPayload {
    fn from(e: &TaskbeatError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

/// 一次执行尝试的记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub envelope_id: String,
    /// 尝试序号，从1开始严格递增；0 表示尚未开始任何尝试
    pub attempt: u32,
    pub status: TaskStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<ErrorPayload>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
}

impl ExecutionRecord {
    pub fn started(
        envelope_id: impl Into<String>,
        attempt: u32,
        worker_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            envelope_id: envelope_id.into(),
            attempt,
            status: TaskStatus::Started,
            result: None,
            error: None,
            started_at: Some(now),
            finished_at: None,
            worker_id: Some(worker_id.into()),
        }
    }

    /// 将尝试结果写入记录（仅在 STARTED 时合法）
    pub fn close(&mut self, outcome: &AttemptOutcome, now: DateTime<Utc>) {
        self.status = outcome.status();
        self.finished_at = Some(now);
        match outcome {
            AttemptOutcome::Success(result) => self.result = Some(result.clone()),
            AttemptOutcome::Retry { error, .. }
            | AttemptOutcome::Failure(error)
            | AttemptOutcome::Revoked(error) => self.error = Some(error.clone()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// 信封级状态行，是所有状态转换的 CAS 目标
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeState {
    /// 最近一次发布（或待发布）的信封副本
    pub envelope: TaskEnvelope,
    pub status: TaskStatus,
    /// 已开始的尝试次数
    pub attempts: u32,
    pub retries_done: u32,
    pub revoke_requested: bool,
    pub worker_id: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EnvelopeState {
    pub fn pending(envelope: &TaskEnvelope, now: DateTime<Utc>) -> Self {
        Self {
            envelope: envelope.clone(),
            status: TaskStatus::Pending,
            attempts: 0,
            retries_done: envelope.retries_done,
            revoke_requested: false,
            worker_id: None,
            published_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// 面向轮询调用方的状态视图
    ///
    /// 尚未开始的尝试（PENDING、开始前被撤销）以下一次尝试序号合成一条记录。
    pub fn status_record(&self, latest: Option<&ExecutionRecord>) -> ExecutionRecord {
        match latest {
            Some(record) if record.status == self.status => record.clone(),
            _ => ExecutionRecord {
                envelope_id: self.envelope.id.clone(),
                attempt: self.attempts + 1,
                status: self.status,
                result: None,
                error: None,
                started_at: None,
                finished_at: None,
                worker_id: None,
            },
        }
    }
}

/// `begin_attempt` 的决策，存储实现据此执行带守卫条件的更新
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimPlan {
    /// PENDING/RETRY → STARTED，新建尝试记录
    Start { attempt: u32 },
    /// 重新投递时接管仍处于 STARTED 的同一尝试
    TakeOver { attempt: u32 },
    /// 已有撤销请求，转为 REVOKED；若有未结束的尝试一并关闭
    Revoke { open_attempt: Option<u32> },
    /// 不需要写入，直接回复
    Reply(AttemptClaim),
}

impl EnvelopeState {
    pub fn plan_claim(&self, envelope: &TaskEnvelope, redelivered: bool) -> ClaimPlan {
        if self.status.is_terminal() {
            return ClaimPlan::Reply(AttemptClaim::AlreadyTerminal(self.status));
        }

        if envelope.retries_done < self.retries_done {
            let republish = (self.status == TaskStatus::Retry && self.published_at.is_none())
                .then(|| self.envelope.clone());
            return ClaimPlan::Reply(AttemptClaim::Superseded { republish });
        }

        match self.status {
            TaskStatus::Started if !redelivered => {
                ClaimPlan::Reply(AttemptClaim::InFlightElsewhere {
                    worker_id: self.worker_id.clone(),
                })
            }
            TaskStatus::Started if self.revoke_requested => ClaimPlan::Revoke {
                open_attempt: Some(self.attempts),
            },
            TaskStatus::Started => ClaimPlan::TakeOver {
                attempt: self.attempts,
            },
            _ if self.revoke_requested => ClaimPlan::Revoke { open_attempt: None },
            _ => ClaimPlan::Start {
                attempt: self.attempts + 1,
            },
        }
    }
}

/// 尝试的结束方式
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Success(serde_json::Value),
    /// 失败但仍有重试额度，`next` 是待重新发布的副本
    Retry {
        error: ErrorPayload,
        next: TaskEnvelope,
    },
    /// 终态失败
    Failure(ErrorPayload),
    /// 执行中被协作式撤销
    Revoked(ErrorPayload),
}

impl AttemptOutcome {
    pub fn status(&self) -> TaskStatus {
        match self {
            AttemptOutcome::Success(_) => TaskStatus::Success,
            AttemptOutcome::Retry { .. } => TaskStatus::Retry,
            AttemptOutcome::Failure(_) => TaskStatus::Failure,
            AttemptOutcome::Revoked(_) => TaskStatus::Revoked,
        }
    }
}

/// worker 领取一次尝试的结果
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptClaim {
    /// 已进入 STARTED，返回尝试序号
    Started { attempt: u32 },
    /// 开始前已被撤销，状态已转为 REVOKED
    Revoked,
    /// 信封已是终态，重复投递
    AlreadyTerminal(TaskStatus),
    /// 同一尝试正在另一个 worker 上执行
    InFlightElsewhere { worker_id: Option<String> },
    /// 旧副本：存储中的 retries_done 已经更大
    Superseded {
        /// 存储中的最新副本尚未确认发布时需要补发
        republish: Option<TaskEnvelope>,
    },
}

/// revoke 的结果
#[derive(Debug, Clone, PartialEq)]
pub enum RevokeOutcome {
    /// 尚未开始，已标记 REVOKED
    Revoked,
    /// 正在执行，已设置协作式取消标志
    Requested,
    AlreadyTerminal(TaskStatus),
    NotFound,
}

impl RevokeOutcome {
    pub fn accepted(&self) -> bool {
        matches!(self, RevokeOutcome::Revoked | RevokeOutcome::Requested)
    }
}
