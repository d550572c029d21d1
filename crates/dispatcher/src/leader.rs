use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use taskbeat_core::{Lease, LeaseStore};
use taskbeat_infrastructure::StructuredLogger;
use tracing::{debug, warn};

/// beat 领导者租约的持有与续期
///
/// 每次 tick 调用 [`LeaderElector::ensure`]。续期失败、存储出错或租约被他人
/// 接管时立即放弃领导权，本次 tick 不发布任何内容。
pub struct LeaderElector {
    leases: Arc<dyn LeaseStore>,
    name: String,
    owner: String,
    ttl: Duration,
    current: Option<Lease>,
}

impl LeaderElector {
    pub fn new(
        leases: Arc<dyn LeaseStore>,
        name: impl Into<String>,
        owner: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            leases,
            name: name.into(),
            owner: owner.into(),
            ttl,
            current: None,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn lease(&self) -> Option<&Lease> {
        self.current.as_ref()
    }

    /// 续期已持有的租约或尝试获取；返回本次 tick 可用的租约
    pub async fn ensure(&mut self, now: DateTime<Utc>) -> Option<Lease> {
        if let Some(held) = self.current.take() {
            match self.leases.renew(&held, self.ttl, now).await {
                Ok(Some(renewed)) => {
                    debug!(lease = %self.name, token = renewed.token, "租约已续期");
                    self.current = Some(renewed.clone());
                    return Some(renewed);
                }
                Ok(None) => {
                    StructuredLogger::log_leadership_lost(&self.name, &self.owner, "renew_rejected");
                }
                Err(e) => {
                    StructuredLogger::log_leadership_lost(&self.name, &self.owner, "store_error");
                    warn!(lease = %self.name, error = %e, "续期租约失败");
                    return None;
                }
            }
        }

        match self
            .leases
            .try_acquire(&self.name, &self.owner, self.ttl, now)
            .await
        {
            Ok(Some(lease)) => {
                StructuredLogger::log_leadership_acquired(&self.name, &self.owner, lease.token);
                self.current = Some(lease.clone());
                Some(lease)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(lease = %self.name, error = %e, "获取租约失败");
                None
            }
        }
    }

    /// 存储报告租约已失效时调用
    pub fn invalidate(&mut self, reason: &str) {
        if self.current.take().is_some() {
            StructuredLogger::log_leadership_lost(&self.name, &self.owner, reason);
        }
    }

    /// 关闭时释放租约，其他实例无需等待过期
    pub async fn release(&mut self) {
        if let Some(lease) = self.current.take() {
            match self.leases.release(&lease).await {
                Ok(()) => debug!(lease = %self.name, owner = %self.owner, "租约已释放"),
                Err(e) => warn!(lease = %self.name, error = %e, "释放租约失败"),
            }
        }
    }
}
