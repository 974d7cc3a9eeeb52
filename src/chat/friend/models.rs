//! 好友与好友请求视图模型

use crate::chat::store::types::{FriendRequestRow, ProfileRow};
use chrono::{DateTime, Utc};

/// 好友同步器配置
#[derive(Debug, Clone)]
pub struct FriendSyncerConfig {
    /// 当前用户 ID
    pub user_id: String,
}

/// 好友条目（双向关系合并后，`friend` 是对方的资料）
#[derive(Debug, Clone)]
pub struct FriendEntry {
    /// 好友关系行 ID
    pub id: String,
    pub user_id: String,
    pub friend_id: String,
    pub friend: ProfileRow,
    pub created_at: DateTime<Utc>,
}

/// 收到的好友请求（带发起者资料）
#[derive(Debug, Clone)]
pub struct FriendRequestView {
    pub id: String,
    pub from_user_id: String,
    pub to_user_id: String,
    pub status: String,
    pub from_name: Option<String>,
    pub from_email: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FriendRequestView {
    pub fn from_row(row: FriendRequestRow, from: Option<&ProfileRow>) -> Self {
        Self {
            id: row.id,
            from_user_id: row.from_user_id,
            to_user_id: row.to_user_id,
            status: row.status,
            from_name: from.and_then(|p| p.name.clone()),
            from_email: from.and_then(|p| p.email.clone()),
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}
