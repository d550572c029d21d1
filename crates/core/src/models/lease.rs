use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 带 TTL 的领导者租约
///
/// `token` 是防护令牌，每次所有权变更时递增。持有旧令牌的写入会被存储拒绝。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub name: String,
    pub owner: String,
    pub token: u64,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_held_by(&self, owner: &str, now: DateTime<Utc>) -> bool {
        self.owner == owner && !self.is_expired(now)
    }
}
