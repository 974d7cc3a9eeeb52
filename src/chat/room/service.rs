//! 房间同步器
//!
//! 维护当前用户的房间列表及派生展示字段，响应实时事件做局部更新或
//! 全量刷新；订阅未确认时降级为周期性全量轮询

use crate::chat::realtime::{ChannelHandle, ChannelHandler, ChannelSpec, PgBinding, RealtimeClient};
use crate::chat::room::listener::{EmptyRoomListener, RoomListener};
use crate::chat::room::models::{RoomSyncerConfig, RoomWithMeta};
use crate::chat::store::api::RestStore;
use crate::chat::store::types::{MessageRow, ParticipantChange, RoomKind, RoomRow};
use crate::chat::types::{ChangeEvent, ChannelState, EventKind};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// 消息插入事件的本地补丁：房间在列表里则更新预览并置顶
///
/// 返回 false 表示房间不在本地列表（调用方应全量刷新）
fn apply_message_insert(rooms: &mut Vec<RoomWithMeta>, msg: &MessageRow) -> bool {
    let Some(pos) = rooms.iter().position(|r| r.id == msg.room_id) else {
        return false;
    };
    let mut room = rooms.remove(pos);
    room.last_msg = msg.content_ko.clone();
    room.time_label = Some("just now".to_string());
    rooms.insert(0, room);
    true
}

/// 从本地列表移除房间（退出时无需刷新，目标房间是确切已知的）
fn remove_room(rooms: &mut Vec<RoomWithMeta>, room_id: i64) -> bool {
    let before = rooms.len();
    rooms.retain(|r| r.id != room_id);
    rooms.len() != before
}

/// 房间同步器
pub struct RoomSyncer {
    config: RoomSyncerConfig,
    store: Arc<RestStore>,
    listener: RwLock<Arc<dyn RoomListener>>,
    rooms: StdMutex<Vec<RoomWithMeta>>,
    loading: AtomicBool,
    /// 输入框聚焦时跳过轮询（由 UI 置位）
    composing: Arc<AtomicBool>,
    /// 实时订阅是否已确认
    live_ok: Arc<AtomicBool>,
    poll_task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
    channel: tokio::sync::Mutex<Option<ChannelHandle>>,
}

struct RoomFeedHandler {
    syncer: Weak<RoomSyncer>,
}

#[async_trait]
impl ChannelHandler for RoomFeedHandler {
    async fn on_event(&self, event: ChangeEvent) {
        if let Some(syncer) = self.syncer.upgrade() {
            syncer.handle_event(&event).await;
        }
    }

    async fn on_state(&self, state: ChannelState) {
        if let Some(syncer) = self.syncer.upgrade() {
            syncer.handle_state(state).await;
        }
    }
}

impl RoomSyncer {
    pub fn new(
        config: RoomSyncerConfig,
        store: Arc<RestStore>,
        composing: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            store,
            listener: RwLock::new(Arc::new(EmptyRoomListener)),
            rooms: StdMutex::new(Vec::new()),
            loading: AtomicBool::new(false),
            composing,
            live_ok: Arc::new(AtomicBool::new(false)),
            poll_task: StdMutex::new(None),
            channel: tokio::sync::Mutex::new(None),
        }
    }

    /// 注册监听器（任意时刻可替换）
    pub fn set_listener(&self, listener: Arc<dyn RoomListener>) {
        let mut slot = self
            .listener
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *slot = listener;
    }

    fn listener(&self) -> Arc<dyn RoomListener> {
        self.listener
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn rooms_lock(&self) -> std::sync::MutexGuard<'_, Vec<RoomWithMeta>> {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 当前房间列表快照
    pub fn rooms(&self) -> Vec<RoomWithMeta> {
        self.rooms_lock().clone()
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::SeqCst)
    }

    async fn set_loading(&self, loading: bool) {
        self.loading.store(loading, Ordering::SeqCst);
        self.listener().on_loading_changed(loading).await;
    }

    async fn notify_rooms(&self) {
        let snapshot = self.rooms();
        self.listener().on_rooms_changed(snapshot).await;
    }

    /// 全量加载房间列表
    ///
    /// 任何查询失败都软降级为空列表（房间可见性对客户端不是安全关键）
    pub async fn load(&self) {
        if !self.store.is_configured() {
            debug!("[RoomSync] 后端未配置，跳过加载");
            *self.rooms_lock() = Vec::new();
            self.set_loading(false).await;
            self.notify_rooms().await;
            return;
        }

        self.set_loading(true).await;
        match self.fetch_rooms().await {
            Ok(rooms) => {
                info!("[RoomSync] ✅ 房间列表加载完成，共 {} 个", rooms.len());
                *self.rooms_lock() = rooms;
            }
            Err(e) => {
                warn!("[RoomSync] ⚠️ 房间列表加载失败，给出空列表: {}", e);
                *self.rooms_lock() = Vec::new();
            }
        }
        self.set_loading(false).await;
        self.notify_rooms().await;
    }

    async fn fetch_rooms(&self) -> Result<Vec<RoomWithMeta>> {
        let room_ids = self
            .store
            .participant_room_ids(&self.config.user_id)
            .await?;
        if room_ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows = self.store.rooms_by_ids(&room_ids).await?;
        let now = Utc::now();
        let mut rooms = Vec::with_capacity(rows.len());
        for row in rows {
            // 单个房间的元数据失败不拖垮整个列表
            let participant_ids = self
                .store
                .participant_user_ids(row.id)
                .await
                .unwrap_or_default();
            let last = self.store.latest_message(row.id).await.unwrap_or(None);
            rooms.push(RoomWithMeta::from_row(row, participant_ids, last, now));
        }
        Ok(rooms)
    }

    /// 创建房间：插入房间行、把自己（和可选的好友）加为参与者，然后刷新
    pub async fn create_room(
        &self,
        name: &str,
        friend_id: Option<&str>,
        kind: RoomKind,
    ) -> Result<RoomRow> {
        let name = name.trim();
        if name.is_empty() {
            anyhow::bail!("房间名不能为空");
        }

        let room = self
            .store
            .insert_room(name, kind, &self.config.user_id)
            .await?;

        if let Err(e) = self
            .store
            .add_participant(room.id, &self.config.user_id)
            .await
        {
            error!("[RoomSync] ❌ 自己加入房间失败: room={}, {}", room.id, e);
        }
        if let Some(friend_id) = friend_id {
            if let Err(e) = self.store.add_participant(room.id, friend_id).await {
                error!(
                    "[RoomSync] ❌ 好友加入房间失败: room={}, friend={}, {}",
                    room.id, friend_id, e
                );
            }
        }

        self.load().await;
        Ok(room)
    }

    /// 退出房间：删除自己的参与记录后刷新
    ///
    /// 调用方负责清掉指向该房间的激活选择
    pub async fn leave_room(&self, room_id: i64) -> Result<()> {
        self.store
            .delete_participant(room_id, &self.config.user_id)
            .await?;
        info!("[RoomSync] 👋 已退出房间: {}", room_id);
        self.load().await;
        Ok(())
    }

    /// 处理实时变更事件
    pub async fn handle_event(&self, event: &ChangeEvent) {
        match (event.table.as_str(), event.kind) {
            ("messages", EventKind::Insert) => {
                let row: MessageRow = match event.decode_new() {
                    Ok(row) => row,
                    Err(e) => {
                        warn!("[RoomSync] 消息事件解析失败: {}", e);
                        return;
                    }
                };
                let patched = apply_message_insert(&mut self.rooms_lock(), &row);
                if patched {
                    debug!("[RoomSync] 📨 房间 {} 预览已更新并置顶", row.room_id);
                    self.notify_rooms().await;
                } else {
                    // 房间不在列表里（多半是刚创建的），全量刷新
                    debug!("[RoomSync] 房间 {} 不在列表，触发全量刷新", row.room_id);
                    self.load().await;
                }
            }
            ("rooms", EventKind::Insert) => {
                self.load().await;
            }
            ("room_participants", EventKind::Insert) => {
                let change: ParticipantChange = match event.decode_new() {
                    Ok(c) => c,
                    Err(e) => {
                        warn!("[RoomSync] 参与者事件解析失败: {}", e);
                        return;
                    }
                };
                // 自己被重新加入（退出后再进）才需要刷新
                if change.user_id == self.config.user_id {
                    self.load().await;
                }
            }
            ("room_participants", EventKind::Delete) => {
                let change: ParticipantChange = match event.decode_old() {
                    Ok(c) => c,
                    Err(e) => {
                        warn!("[RoomSync] 参与者删除事件解析失败: {}", e);
                        return;
                    }
                };
                if change.user_id == self.config.user_id {
                    let removed = remove_room(&mut self.rooms_lock(), change.room_id);
                    if removed {
                        info!("[RoomSync] 🚪 已从列表移除房间: {}", change.room_id);
                        self.notify_rooms().await;
                    }
                }
            }
            _ => {}
        }
    }

    /// 订阅房间相关的实时变更
    pub async fn attach(self: &Arc<Self>, realtime: &RealtimeClient) -> Result<()> {
        let spec = ChannelSpec {
            name: format!("rooms_updates_{}", self.config.user_id),
            broadcast_self: true,
            join_timeout: Duration::from_secs(self.config.watchdog_secs),
            bindings: vec![
                PgBinding::new("INSERT", "messages"),
                PgBinding::new("INSERT", "rooms"),
                PgBinding::new("INSERT", "room_participants"),
                PgBinding::new("DELETE", "room_participants"),
            ],
        };
        let handler = Arc::new(RoomFeedHandler {
            syncer: Arc::downgrade(self),
        });
        let handle = realtime.subscribe(spec, handler).await?;
        *self.channel.lock().await = Some(handle);
        Ok(())
    }

    async fn handle_state(self: &Arc<Self>, state: ChannelState) {
        match state {
            ChannelState::Subscribed => {
                self.live_ok.store(true, Ordering::SeqCst);
                self.stop_polling();
                info!("[RoomSync] ✅ 实时订阅生效，停用轮询");
            }
            ChannelState::ChannelError | ChannelState::TimedOut | ChannelState::Closed => {
                self.live_ok.store(false, Ordering::SeqCst);
                self.start_polling();
            }
        }
    }

    /// 启动降级轮询（已在轮询则不重复启动）
    pub(crate) fn start_polling(self: &Arc<Self>) {
        let mut slot = self
            .poll_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return;
        }
        info!(
            "[RoomSync] 🔄 实时订阅不可用，启动 {} 秒轮询",
            self.config.poll_secs
        );
        let weak = Arc::downgrade(self);
        let poll_secs = self.config.poll_secs;
        *slot = Some(tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(poll_secs));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(syncer) = weak.upgrade() else {
                    break;
                };
                if syncer.live_ok.load(Ordering::SeqCst) {
                    break;
                }
                if syncer.composing.load(Ordering::SeqCst) {
                    debug!("[RoomSync] ⌨️ 输入中，跳过本次轮询");
                    continue;
                }
                syncer.load().await;
            }
        }));
    }

    fn stop_polling(&self) {
        let task = {
            let mut slot = self
                .poll_task
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            slot.take()
        };
        if let Some(task) = task {
            task.abort();
        }
    }

    /// 退订并停止轮询
    pub async fn detach(&self) {
        self.stop_polling();
        let handle = self.channel.lock().await.take();
        if let Some(handle) = handle {
            handle.leave().await;
        }
    }

    #[cfg(test)]
    pub(crate) fn set_rooms_for_test(&self, rooms: Vec<RoomWithMeta>) {
        *self.rooms_lock() = rooms;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::config::ClientConfig;
    use chrono::TimeZone;

    fn meta(id: i64, last: &str) -> RoomWithMeta {
        RoomWithMeta {
            id,
            name: format!("room-{}", id),
            kind: Some(RoomKind::Topic),
            created_by: Some("u1".to_string()),
            created_at: Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap(),
            last_msg: Some(last.to_string()),
            time_label: Some("5 min ago".to_string()),
            unread: 0,
            participant_ids: vec!["u1".to_string()],
        }
    }

    fn message(room_id: i64, text: &str) -> MessageRow {
        MessageRow {
            id: "m1".to_string(),
            room_id,
            user_id: Some("u2".to_string()),
            content_ko: Some(text.to_string()),
            content_en: None,
            created_at: Utc.with_ymd_and_hms(2026, 3, 1, 0, 1, 0).unwrap(),
        }
    }

    fn test_syncer() -> Arc<RoomSyncer> {
        let cfg = ClientConfig::new(String::new(), String::new());
        let store = Arc::new(RestStore::new(&cfg, "").unwrap());
        Arc::new(RoomSyncer::new(
            RoomSyncerConfig {
                user_id: "me".to_string(),
                watchdog_secs: 10,
                poll_secs: 30,
            },
            store,
            Arc::new(AtomicBool::new(false)),
        ))
    }

    #[test]
    fn test_apply_message_insert_patches_and_reorders() {
        let mut rooms = vec![meta(1, "old-1"), meta(2, "old-2"), meta(3, "old-3")];
        let patched = apply_message_insert(&mut rooms, &message(2, "hello"));
        assert!(patched);
        assert_eq!(rooms[0].id, 2);
        assert_eq!(rooms[0].last_msg.as_deref(), Some("hello"));
        assert_eq!(rooms[0].time_label.as_deref(), Some("just now"));
        // 其他房间顺序不变
        assert_eq!(rooms[1].id, 1);
        assert_eq!(rooms[2].id, 3);
    }

    #[test]
    fn test_apply_message_insert_front_room_stays_front() {
        let mut rooms = vec![meta(1, "old")];
        assert!(apply_message_insert(&mut rooms, &message(1, "new")));
        assert_eq!(rooms[0].id, 1);
        assert_eq!(rooms[0].last_msg.as_deref(), Some("new"));
    }

    #[test]
    fn test_apply_message_insert_unknown_room() {
        let mut rooms = vec![meta(1, "old")];
        assert!(!apply_message_insert(&mut rooms, &message(9, "new")));
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[0].last_msg.as_deref(), Some("old"));
    }

    #[test]
    fn test_remove_room() {
        let mut rooms = vec![meta(1, "a"), meta(2, "b")];
        assert!(remove_room(&mut rooms, 1));
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[0].id, 2);
        assert!(!remove_room(&mut rooms, 99));
    }

    #[tokio::test]
    async fn test_participant_delete_event_removes_without_reload() {
        let syncer = test_syncer();
        syncer.set_rooms_for_test(vec![meta(1, "a"), meta(2, "b")]);

        let event = ChangeEvent {
            kind: EventKind::Delete,
            table: "room_participants".to_string(),
            new: None,
            old: Some(serde_json::json!({"room_id": 1, "user_id": "me"})),
        };
        syncer.handle_event(&event).await;
        let rooms = syncer.rooms();
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[0].id, 2);
    }

    #[tokio::test]
    async fn test_participant_delete_for_other_user_is_ignored() {
        let syncer = test_syncer();
        syncer.set_rooms_for_test(vec![meta(1, "a")]);

        let event = ChangeEvent {
            kind: EventKind::Delete,
            table: "room_participants".to_string(),
            new: None,
            old: Some(serde_json::json!({"room_id": 1, "user_id": "someone-else"})),
        };
        syncer.handle_event(&event).await;
        assert_eq!(syncer.rooms().len(), 1);
    }

    #[tokio::test]
    async fn test_message_event_for_unknown_room_triggers_reload() {
        // 未配置的后端下，全量刷新会软降级为空列表
        let syncer = test_syncer();
        syncer.set_rooms_for_test(vec![meta(1, "a")]);

        let event = ChangeEvent {
            kind: EventKind::Insert,
            table: "messages".to_string(),
            new: Some(serde_json::to_value(message(9, "new")).unwrap()),
            old: None,
        };
        syncer.handle_event(&event).await;
        assert!(syncer.rooms().is_empty());
    }

    #[tokio::test]
    async fn test_create_room_rejects_blank_name() {
        let syncer = test_syncer();
        let result = syncer.create_room("   ", None, RoomKind::Topic).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_load_unconfigured_store_yields_empty() {
        let syncer = test_syncer();
        syncer.set_rooms_for_test(vec![meta(1, "a")]);
        syncer.load().await;
        assert!(syncer.rooms().is_empty());
        assert!(!syncer.is_loading());
    }
}
