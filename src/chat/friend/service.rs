//! 好友同步器
//!
//! 好友关系是双向合并的：我加的人和加我的人都算好友，按对方 ID 去重。
//! 好友请求只展示发给我的待处理项。两者都靠实时事件触发整表重载

use crate::chat::friend::listener::{EmptyFriendListener, FriendListener};
use crate::chat::friend::models::{FriendEntry, FriendRequestView, FriendSyncerConfig};
use crate::chat::realtime::{ChannelHandle, ChannelHandler, ChannelSpec, PgBinding, RealtimeClient};
use crate::chat::store::api::RestStore;
use crate::chat::store::types::{FriendshipRow, ProfileRow};
use crate::chat::types::{is_rest_code, ChangeEvent, ChannelState};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// 双向好友关系合并：正向（我加的）优先，反向按对方 ID 去重补充
///
/// 没有资料的对端直接跳过（资料表缺行时不显示半截条目）
fn merge_friendships(
    me: &str,
    mine: Vec<FriendshipRow>,
    of_me: Vec<FriendshipRow>,
    profiles: &HashMap<String, ProfileRow>,
) -> Vec<FriendEntry> {
    let mut entries: Vec<FriendEntry> = Vec::new();
    for row in mine {
        if let Some(profile) = profiles.get(&row.friend_id) {
            entries.push(FriendEntry {
                id: row.id,
                user_id: me.to_string(),
                friend_id: row.friend_id,
                friend: profile.clone(),
                created_at: row.created_at,
            });
        }
    }
    for row in of_me {
        if entries.iter().any(|e| e.friend_id == row.user_id) {
            continue;
        }
        if let Some(profile) = profiles.get(&row.user_id) {
            entries.push(FriendEntry {
                id: row.id,
                user_id: row.user_id.clone(),
                friend_id: me.to_string(),
                friend: profile.clone(),
                created_at: row.created_at,
            });
        }
    }
    entries
}

/// 好友同步器
pub struct FriendSyncer {
    config: FriendSyncerConfig,
    store: Arc<RestStore>,
    listener: RwLock<Arc<dyn FriendListener>>,
    friends: StdMutex<Vec<FriendEntry>>,
    requests: StdMutex<Vec<FriendRequestView>>,
    channel: tokio::sync::Mutex<Option<ChannelHandle>>,
}

struct FriendFeedHandler {
    syncer: Weak<FriendSyncer>,
}

#[async_trait]
impl ChannelHandler for FriendFeedHandler {
    async fn on_event(&self, _event: ChangeEvent) {
        // 任何好友相关变更都整表重载（请求被接受、关系增删）
        if let Some(syncer) = self.syncer.upgrade() {
            syncer.load_all().await;
        }
    }

    async fn on_state(&self, state: ChannelState) {
        // 好友数据变化低频，不做轮询降级
        debug!("[FriendSync] 通道状态: {:?}", state);
    }
}

impl FriendSyncer {
    pub fn new(config: FriendSyncerConfig, store: Arc<RestStore>) -> Self {
        Self {
            config,
            store,
            listener: RwLock::new(Arc::new(EmptyFriendListener)),
            friends: StdMutex::new(Vec::new()),
            requests: StdMutex::new(Vec::new()),
            channel: tokio::sync::Mutex::new(None),
        }
    }

    pub fn set_listener(&self, listener: Arc<dyn FriendListener>) {
        let mut slot = self
            .listener
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *slot = listener;
    }

    fn listener(&self) -> Arc<dyn FriendListener> {
        self.listener
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn friends(&self) -> Vec<FriendEntry> {
        self.friends
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn requests(&self) -> Vec<FriendRequestView> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// 好友列表 + 请求列表各载一遍
    pub async fn load_all(&self) {
        self.listener().on_loading_changed(true).await;
        self.load_friends().await;
        self.load_requests().await;
        self.listener().on_loading_changed(false).await;
    }

    async fn load_friends(&self) {
        if !self.store.is_configured() {
            self.set_friends(Vec::new()).await;
            return;
        }

        let mine = match self.store.friendships_of(&self.config.user_id).await {
            Ok(rows) => rows,
            Err(e) => {
                if is_rest_code(&e, "PGRST205") {
                    warn!("[FriendSync] ⚠️ friendships 表不存在，返回空列表");
                } else {
                    warn!("[FriendSync] ⚠️ 好友关系查询失败: {}", e);
                }
                self.set_friends(Vec::new()).await;
                return;
            }
        };
        let of_me = match self.store.friendships_with(&self.config.user_id).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!("[FriendSync] ⚠️ 反向好友关系查询失败: {}", e);
                self.set_friends(Vec::new()).await;
                return;
            }
        };

        let mut friend_ids = HashSet::new();
        for row in &mine {
            friend_ids.insert(row.friend_id.clone());
        }
        for row in &of_me {
            friend_ids.insert(row.user_id.clone());
        }
        if friend_ids.is_empty() {
            self.set_friends(Vec::new()).await;
            return;
        }

        let ids: Vec<String> = friend_ids.into_iter().collect();
        let profiles: HashMap<String, ProfileRow> = match self.store.profiles_by_ids(&ids).await {
            Ok(rows) => rows.into_iter().map(|p| (p.id.clone(), p)).collect(),
            Err(e) => {
                warn!("[FriendSync] ⚠️ 好友资料批量查询失败: {}", e);
                HashMap::new()
            }
        };

        let entries = merge_friendships(&self.config.user_id, mine, of_me, &profiles);
        info!("[FriendSync] ✅ 好友列表加载完成，共 {} 人", entries.len());
        self.set_friends(entries).await;
    }

    async fn load_requests(&self) {
        if !self.store.is_configured() {
            self.set_requests(Vec::new()).await;
            return;
        }

        let rows = match self.store.pending_requests_to(&self.config.user_id).await {
            Ok(rows) => rows,
            Err(e) => {
                if is_rest_code(&e, "PGRST205") {
                    warn!("[FriendSync] ⚠️ friend_requests 表不存在，返回空列表");
                } else {
                    warn!("[FriendSync] ⚠️ 好友请求查询失败: {}", e);
                }
                self.set_requests(Vec::new()).await;
                return;
            }
        };

        let from_ids: Vec<String> = {
            let mut seen = HashSet::new();
            rows.iter()
                .map(|r| r.from_user_id.clone())
                .filter(|id| seen.insert(id.clone()))
                .collect()
        };
        let profiles: HashMap<String, ProfileRow> = if from_ids.is_empty() {
            HashMap::new()
        } else {
            match self.store.profiles_by_ids(&from_ids).await {
                Ok(rows) => rows.into_iter().map(|p| (p.id.clone(), p)).collect(),
                Err(e) => {
                    warn!("[FriendSync] ⚠️ 请求发起者资料查询失败: {}", e);
                    HashMap::new()
                }
            }
        };

        let views: Vec<FriendRequestView> = rows
            .into_iter()
            .map(|row| {
                let from = profiles.get(&row.from_user_id);
                FriendRequestView::from_row(row, from)
            })
            .collect();
        self.set_requests(views).await;
    }

    async fn set_friends(&self, entries: Vec<FriendEntry>) {
        *self
            .friends
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = entries;
        let snapshot = self.friends();
        self.listener().on_friends_changed(snapshot).await;
    }

    async fn set_requests(&self, views: Vec<FriendRequestView>) {
        *self
            .requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = views;
        let snapshot = self.requests();
        self.listener().on_requests_changed(snapshot).await;
    }

    /// 按邮箱直接加好友（单向行，反向由对方的查询合并出来）
    pub async fn add_friend(&self, email: &str) -> Result<()> {
        let profile = match self.store.profile_by_email(email).await {
            Ok(Some(profile)) => profile,
            Ok(None) => anyhow::bail!("找不到该邮箱的用户，请确认对方已注册"),
            Err(e) => {
                if is_rest_code(&e, "PGRST205") {
                    anyhow::bail!("数据库表未初始化");
                }
                anyhow::bail!("找不到该邮箱的用户，请确认对方已注册");
            }
        };

        if profile.id == self.config.user_id {
            anyhow::bail!("不能把自己加为好友");
        }
        if self
            .store
            .friendship_exists(&self.config.user_id, &profile.id)
            .await
            .unwrap_or(false)
        {
            anyhow::bail!("对方已经是好友");
        }

        self.store
            .insert_friendship(&self.config.user_id, &profile.id)
            .await?;
        info!("[FriendSync] ✅ 已添加好友: {}", profile.id);
        self.load_friends().await;
        Ok(())
    }

    /// 发送好友请求
    pub async fn send_request(&self, email: &str) -> Result<()> {
        let profile = match self.store.profile_by_email(email).await {
            Ok(Some(profile)) => profile,
            Ok(None) => anyhow::bail!("找不到该邮箱的用户，请确认对方已注册"),
            Err(e) => {
                if is_rest_code(&e, "PGRST205") {
                    anyhow::bail!("数据库表未初始化");
                }
                anyhow::bail!("找不到该邮箱的用户，请确认对方已注册");
            }
        };

        if profile.id == self.config.user_id {
            anyhow::bail!("不能向自己发送好友请求");
        }
        if self
            .store
            .friendship_between(&self.config.user_id, &profile.id)
            .await
            .unwrap_or(false)
        {
            anyhow::bail!("对方已经是好友");
        }
        if let Ok(Some(existing)) = self
            .store
            .request_between(&self.config.user_id, &profile.id)
            .await
        {
            if existing.status == "pending" {
                anyhow::bail!("已经发送过好友请求");
            }
        }

        self.store
            .insert_request(&self.config.user_id, &profile.id)
            .await?;
        info!("[FriendSync] 📝 好友请求已发送: {}", profile.id);
        Ok(())
    }

    /// 接受请求：双向建立好友关系（反向失败只记日志），再标记已接受
    pub async fn accept_request(&self, request_id: &str) -> Result<()> {
        let request = self
            .store
            .request_addressed_to(request_id, &self.config.user_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("找不到该好友请求"))?;

        self.store
            .insert_friendship(&self.config.user_id, &request.from_user_id)
            .await?;
        if let Err(e) = self
            .store
            .insert_friendship(&request.from_user_id, &self.config.user_id)
            .await
        {
            warn!("[FriendSync] ⚠️ 反向好友关系建立失败: {}", e);
        }

        self.store
            .update_request_status(request_id, "accepted", None)
            .await?;
        info!("[FriendSync] ✅ 已接受好友请求: {}", request_id);
        self.load_all().await;
        Ok(())
    }

    /// 拒绝请求
    pub async fn decline_request(&self, request_id: &str) -> Result<()> {
        self.store
            .update_request_status(request_id, "declined", Some(&self.config.user_id))
            .await?;
        info!("[FriendSync] 🚫 已拒绝好友请求: {}", request_id);
        self.load_requests().await;
        Ok(())
    }

    /// 订阅好友相关变更（双向关系 + 发给我的请求）
    pub async fn attach(self: &Arc<Self>, realtime: &RealtimeClient) -> Result<()> {
        let me = &self.config.user_id;
        let spec = ChannelSpec {
            name: format!("friends_updates_{}", me),
            broadcast_self: true,
            join_timeout: Duration::from_secs(10),
            bindings: vec![
                PgBinding::with_filter("*", "friendships", format!("user_id=eq.{}", me)),
                PgBinding::with_filter("*", "friendships", format!("friend_id=eq.{}", me)),
                PgBinding::with_filter("*", "friend_requests", format!("to_user_id=eq.{}", me)),
            ],
        };
        let handler = Arc::new(FriendFeedHandler {
            syncer: Arc::downgrade(self),
        });
        let handle = realtime.subscribe(spec, handler).await?;
        *self.channel.lock().await = Some(handle);
        Ok(())
    }

    pub async fn detach(&self) {
        let handle = self.channel.lock().await.take();
        if let Some(handle) = handle {
            handle.leave().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn friendship(id: &str, user_id: &str, friend_id: &str) -> FriendshipRow {
        FriendshipRow {
            id: id.to_string(),
            user_id: user_id.to_string(),
            friend_id: friend_id.to_string(),
            created_at: Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap(),
        }
    }

    fn profile(id: &str, name: &str) -> ProfileRow {
        ProfileRow {
            id: id.to_string(),
            name: Some(name.to_string()),
            email: Some(format!("{}@example.com", id)),
            ..Default::default()
        }
    }

    #[test]
    fn test_merge_bidirectional_dedup() {
        let mine = vec![friendship("f1", "me", "u2")];
        let of_me = vec![
            friendship("f2", "u2", "me"), // 同一对端，反向重复
            friendship("f3", "u3", "me"),
        ];
        let profiles: HashMap<String, ProfileRow> = [
            ("u2".to_string(), profile("u2", "Mina")),
            ("u3".to_string(), profile("u3", "Jun")),
        ]
        .into_iter()
        .collect();

        let entries = merge_friendships("me", mine, of_me, &profiles);
        assert_eq!(entries.len(), 2);
        // 正向条目优先保留
        assert_eq!(entries[0].id, "f1");
        assert_eq!(entries[0].friend_id, "u2");
        // 反向条目的对端是 user_id
        assert_eq!(entries[1].friend_id, "u3");
        assert_eq!(entries[1].user_id, "u3");
        assert_eq!(entries[1].friend.name.as_deref(), Some("Jun"));
    }

    #[test]
    fn test_merge_skips_missing_profiles() {
        let mine = vec![friendship("f1", "me", "ghost")];
        let entries = merge_friendships("me", mine, Vec::new(), &HashMap::new());
        assert!(entries.is_empty());
    }

    #[test]
    fn test_request_view_carries_sender_profile() {
        let row = crate::chat::store::types::FriendRequestRow {
            id: "r1".to_string(),
            from_user_id: "u2".to_string(),
            to_user_id: "me".to_string(),
            status: "pending".to_string(),
            created_at: Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap(),
            updated_at: Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap(),
        };
        let sender = profile("u2", "Mina");
        let view = FriendRequestView::from_row(row, Some(&sender));
        assert_eq!(view.from_name.as_deref(), Some("Mina"));
        assert_eq!(view.from_email.as_deref(), Some("u2@example.com"));
        assert_eq!(view.status, "pending");
    }
}
