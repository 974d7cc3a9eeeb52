//! 客户端核心
//!
//! 持有存储客户端、实时连接与各同步器，负责会话生命周期的组装与收尾。
//! 所有依赖都在连接时显式构造注入，没有进程级全局句柄

use crate::chat::auth::{login_async, Session};
use crate::chat::config::ClientConfig;
use crate::chat::friend::{
    EmptyFriendListener, FriendEntry, FriendListener, FriendRequestView, FriendSyncer,
    FriendSyncerConfig,
};
use crate::chat::msg::{
    EmptyMessageListener, MessageListener, MessageSyncer, MessageView, MsgSyncerConfig,
};
use crate::chat::notify::{EmptyNotificationListener, MessageNotifier, NotificationListener};
use crate::chat::profile::{EmptyProfileListener, ProfileListener, ProfileSyncer};
use crate::chat::realtime::RealtimeClient;
use crate::chat::room::{
    EmptyRoomListener, RoomListener, RoomSyncer, RoomSyncerConfig, RoomWithMeta,
};
use crate::chat::store::api::RestStore;
use crate::chat::store::types::{ProfileRow, RoomKind, RoomRow};
use crate::chat::translate::{TranslateApi, TranslateOutcome};
use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

/// 聊天客户端
pub struct ChatClient {
    config: ClientConfig,
    session: Option<Session>,
    store: Option<Arc<RestStore>>,
    realtime: Option<Arc<RealtimeClient>>,
    room_syncer: Option<Arc<RoomSyncer>>,
    msg_syncer: Option<Arc<MessageSyncer>>,
    friend_syncer: Option<Arc<FriendSyncer>>,
    profile_syncer: Option<Arc<ProfileSyncer>>,
    notifier: Option<Arc<MessageNotifier>>,
    translate: Option<TranslateApi>,
    /// 输入框聚焦标记（UI 置位，轮询据此避让）
    composing: Arc<AtomicBool>,
    room_listener: Arc<dyn RoomListener>,
    msg_listener: Arc<dyn MessageListener>,
    friend_listener: Arc<dyn FriendListener>,
    profile_listener: Arc<dyn ProfileListener>,
    notification_listener: Arc<dyn NotificationListener>,
}

impl ChatClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            session: None,
            store: None,
            realtime: None,
            room_syncer: None,
            msg_syncer: None,
            friend_syncer: None,
            profile_syncer: None,
            notifier: None,
            translate: None,
            composing: Arc::new(AtomicBool::new(false)),
            room_listener: Arc::new(EmptyRoomListener),
            msg_listener: Arc::new(EmptyMessageListener),
            friend_listener: Arc::new(EmptyFriendListener),
            profile_listener: Arc::new(EmptyProfileListener),
            notification_listener: Arc::new(EmptyNotificationListener),
        }
    }

    // 监听器可在连接前后任意时刻注册；已有同步器时立即生效

    pub fn set_room_listener(&mut self, listener: Arc<dyn RoomListener>) {
        if let Some(syncer) = &self.room_syncer {
            syncer.set_listener(listener.clone());
        }
        self.room_listener = listener;
    }

    pub fn set_message_listener(&mut self, listener: Arc<dyn MessageListener>) {
        if let Some(syncer) = &self.msg_syncer {
            syncer.set_listener(listener.clone());
        }
        self.msg_listener = listener;
    }

    pub fn set_friend_listener(&mut self, listener: Arc<dyn FriendListener>) {
        if let Some(syncer) = &self.friend_syncer {
            syncer.set_listener(listener.clone());
        }
        self.friend_listener = listener;
    }

    pub fn set_profile_listener(&mut self, listener: Arc<dyn ProfileListener>) {
        if let Some(syncer) = &self.profile_syncer {
            syncer.set_listener(listener.clone());
        }
        self.profile_listener = listener;
    }

    pub fn set_notification_listener(&mut self, listener: Arc<dyn NotificationListener>) {
        if let Some(notifier) = &self.notifier {
            notifier.set_listener(listener.clone());
        }
        self.notification_listener = listener;
    }

    /// 密码登录
    pub async fn login(&mut self, email: &str, password: &str) -> Result<()> {
        let session = login_async(&self.config, email, password).await?;
        self.session = Some(session);
        Ok(())
    }

    /// 直接注入已有会话（令牌持久化恢复等场景）
    pub fn set_session(&mut self, session: Session) {
        self.session = Some(session);
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// 建立存储与实时连接，组装并启动各同步器
    pub async fn connect(&mut self) -> Result<()> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("请先登录"))?
            .clone();
        let user_id = session.user_id()?;
        info!("[Client] 🔗 开始连接，用户ID: {}", user_id);

        let store = Arc::new(
            RestStore::new(&self.config, &session.access_token).context("创建存储客户端失败")?,
        );
        self.store = Some(store.clone());

        // 实时连接失败不阻断会话：同步器降级轮询
        let realtime = if self.config.is_configured() {
            match RealtimeClient::connect(&self.config, &session.access_token).await {
                Ok(client) => Some(Arc::new(client)),
                Err(e) => {
                    warn!("[Client] ⚠️ 实时连接失败，全部降级轮询: {}", e);
                    None
                }
            }
        } else {
            None
        };
        self.realtime = realtime.clone();

        // 房间同步器
        let room_syncer = Arc::new(RoomSyncer::new(
            RoomSyncerConfig {
                user_id: user_id.clone(),
                watchdog_secs: self.config.room_watchdog_secs,
                poll_secs: self.config.room_poll_secs,
            },
            store.clone(),
            self.composing.clone(),
        ));
        room_syncer.set_listener(self.room_listener.clone());
        match &realtime {
            Some(rt) => {
                if let Err(e) = room_syncer.attach(rt).await {
                    error!("[Client] ❌ 房间订阅失败: {}", e);
                    room_syncer.start_polling();
                }
            }
            None => {
                if self.config.is_configured() {
                    room_syncer.start_polling();
                }
            }
        }
        self.room_syncer = Some(room_syncer.clone());

        // 消息同步器（激活房间前保持空闲）
        let msg_syncer = Arc::new(MessageSyncer::new(
            MsgSyncerConfig::for_device(user_id.clone(), self.config.device),
            store.clone(),
            self.composing.clone(),
        ));
        msg_syncer.set_listener(self.msg_listener.clone());
        self.msg_syncer = Some(msg_syncer);

        // 好友同步器
        let friend_syncer = Arc::new(FriendSyncer::new(
            FriendSyncerConfig {
                user_id: user_id.clone(),
            },
            store.clone(),
        ));
        friend_syncer.set_listener(self.friend_listener.clone());
        if let Some(rt) = &realtime {
            if let Err(e) = friend_syncer.attach(rt).await {
                error!("[Client] ❌ 好友订阅失败: {}", e);
            }
        }
        self.friend_syncer = Some(friend_syncer.clone());

        // 本人资料
        let profile_syncer = Arc::new(ProfileSyncer::new(
            user_id.clone(),
            session.user.email.clone(),
            store.clone(),
        ));
        profile_syncer.set_listener(self.profile_listener.clone());
        if let Some(rt) = &realtime {
            if let Err(e) = profile_syncer.attach(rt).await {
                error!("[Client] ❌ 资料订阅失败: {}", e);
            }
        }
        self.profile_syncer = Some(profile_syncer.clone());

        // 跨房间通知
        let notifier = Arc::new(MessageNotifier::new(user_id.clone(), store.clone()));
        notifier.set_listener(self.notification_listener.clone());
        if let Some(rt) = &realtime {
            if let Err(e) = notifier.attach(rt).await {
                error!("[Client] ❌ 通知订阅失败: {}", e);
            }
        }
        self.notifier = Some(notifier);

        self.translate = Some(TranslateApi::new(&self.config, &session.access_token)?);

        // 初始加载并行跑，不阻塞连接完成
        tokio::spawn(async move {
            info!("[Client] 🔄 启动房间列表初始加载");
            room_syncer.load().await;
        });
        tokio::spawn(async move {
            info!("[Client] 🔄 启动好友初始加载");
            friend_syncer.load_all().await;
        });
        tokio::spawn(async move {
            profile_syncer.load().await;
        });

        info!("[Client] ✅ 连接完成");
        Ok(())
    }

    fn room_syncer(&self) -> Result<&Arc<RoomSyncer>> {
        self.room_syncer
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("客户端未连接"))
    }

    fn msg_syncer(&self) -> Result<&Arc<MessageSyncer>> {
        self.msg_syncer
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("客户端未连接"))
    }

    fn friend_syncer(&self) -> Result<&Arc<FriendSyncer>> {
        self.friend_syncer
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("客户端未连接"))
    }

    // ── 房间操作 ───────────────────────────────────────────

    pub fn rooms(&self) -> Vec<RoomWithMeta> {
        self.room_syncer
            .as_ref()
            .map(|s| s.rooms())
            .unwrap_or_default()
    }

    pub async fn create_room(
        &self,
        name: &str,
        friend_id: Option<&str>,
        kind: RoomKind,
    ) -> Result<RoomRow> {
        self.room_syncer()?.create_room(name, friend_id, kind).await
    }

    /// 退出房间；正看着这个房间时顺带停用消息同步
    pub async fn leave_room(&self, room_id: i64) -> Result<()> {
        self.room_syncer()?.leave_room(room_id).await?;
        if let Some(msg_syncer) = &self.msg_syncer {
            if msg_syncer.current_room() == Some(room_id) {
                msg_syncer.deactivate().await;
                if let Some(notifier) = &self.notifier {
                    notifier.set_active_room(None);
                }
            }
        }
        Ok(())
    }

    // ── 消息操作 ───────────────────────────────────────────

    /// 切换激活房间
    pub async fn activate_room(&self, room_id: i64) -> Result<()> {
        let syncer = self.msg_syncer()?;
        syncer.activate(self.realtime.as_deref(), room_id).await?;
        if let Some(notifier) = &self.notifier {
            notifier.set_active_room(Some(room_id));
        }
        Ok(())
    }

    pub async fn deactivate_room(&self) -> Result<()> {
        self.msg_syncer()?.deactivate().await;
        if let Some(notifier) = &self.notifier {
            notifier.set_active_room(None);
        }
        Ok(())
    }

    pub fn messages(&self) -> Vec<MessageView> {
        self.msg_syncer
            .as_ref()
            .map(|s| s.messages())
            .unwrap_or_default()
    }

    pub async fn send_message(&self, text: &str) -> Result<MessageView> {
        self.msg_syncer()?.send(text).await
    }

    pub async fn refresh_messages(&self) -> Result<()> {
        self.msg_syncer()?.refresh().await;
        Ok(())
    }

    /// 触发整房翻译；当前房间命中时随后刷新消息列表
    pub async fn translate_room(&self, room_id: i64) -> Result<TranslateOutcome> {
        let api = self
            .translate
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("客户端未连接"))?;
        let outcome = api.translate_room(room_id).await?;
        if let Some(msg_syncer) = &self.msg_syncer {
            if msg_syncer.current_room() == Some(room_id) {
                msg_syncer.refresh().await;
            }
        }
        Ok(outcome)
    }

    // ── 好友操作 ───────────────────────────────────────────

    pub fn friends(&self) -> Vec<FriendEntry> {
        self.friend_syncer
            .as_ref()
            .map(|s| s.friends())
            .unwrap_or_default()
    }

    pub fn friend_requests(&self) -> Vec<FriendRequestView> {
        self.friend_syncer
            .as_ref()
            .map(|s| s.requests())
            .unwrap_or_default()
    }

    pub async fn add_friend(&self, email: &str) -> Result<()> {
        self.friend_syncer()?.add_friend(email).await
    }

    pub async fn send_friend_request(&self, email: &str) -> Result<()> {
        self.friend_syncer()?.send_request(email).await
    }

    pub async fn accept_friend_request(&self, request_id: &str) -> Result<()> {
        self.friend_syncer()?.accept_request(request_id).await
    }

    pub async fn decline_friend_request(&self, request_id: &str) -> Result<()> {
        self.friend_syncer()?.decline_request(request_id).await
    }

    // ── 资料 ───────────────────────────────────────────────

    pub fn profile(&self) -> Option<ProfileRow> {
        self.profile_syncer.as_ref().and_then(|s| s.profile())
    }

    pub async fn update_profile(
        &self,
        name: Option<String>,
        status_msg: Option<String>,
    ) -> Result<ProfileRow> {
        self.profile_syncer
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("客户端未连接"))?
            .update(name, status_msg)
            .await
    }

    // ── UI 状态回传 ────────────────────────────────────────

    /// 输入框聚焦状态（轮询避让）
    pub fn set_composing(&self, composing: bool) {
        self.composing.store(composing, Ordering::SeqCst);
    }

    /// 应用前台/后台状态（通知避让）
    pub fn set_focused(&self, focused: bool) {
        if let Some(notifier) = &self.notifier {
            notifier.set_focused(focused);
        }
    }

    /// 会话收尾：撤订阅、停轮询、断开实时连接
    pub async fn shutdown(&mut self) {
        info!("[Client] 🧹 会话收尾");
        if let Some(syncer) = &self.msg_syncer {
            syncer.detach().await;
        }
        if let Some(syncer) = &self.room_syncer {
            syncer.detach().await;
        }
        if let Some(syncer) = &self.friend_syncer {
            syncer.detach().await;
        }
        if let Some(syncer) = &self.profile_syncer {
            syncer.detach().await;
        }
        if let Some(notifier) = &self.notifier {
            notifier.detach().await;
        }
        if let Some(realtime) = &self.realtime {
            realtime.shutdown().await;
        }
        self.realtime = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_operations_require_connect() {
        let client = ChatClient::new(ClientConfig::new(String::new(), String::new()));
        assert!(client.send_message("hi").await.is_err());
        assert!(client.activate_room(1).await.is_err());
        assert!(client.add_friend("a@b.c").await.is_err());
        assert!(client.rooms().is_empty());
        assert!(client.messages().is_empty());
    }

    #[tokio::test]
    async fn test_connect_requires_login() {
        let mut client = ChatClient::new(ClientConfig::new(String::new(), String::new()));
        assert!(client.connect().await.is_err());
    }
}
