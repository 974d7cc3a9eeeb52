//! 消息同步器
//!
//! 一次只服务一个激活房间：历史加载 + 实时插入/更新事件合并 + 降级
//! 增量轮询。消息按到达顺序追加，按 ID 去重；切房时立即清空并通过
//! 激活代数丢弃过期的在途结果

use crate::chat::msg::listener::{EmptyMessageListener, MessageListener};
use crate::chat::msg::models::{MessageView, MsgSyncerConfig, SenderRole, SyncPhase, Transport};
use crate::chat::realtime::{ChannelHandle, ChannelHandler, ChannelSpec, PgBinding, RealtimeClient};
use crate::chat::store::api::RestStore;
use crate::chat::store::types::{MessageRow, NewMessage};
use crate::chat::types::{display_name, ChangeEvent, ChannelState, EventKind};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// 追加一条消息：清掉不属于当前房间的残留，按 ID 去重
///
/// 返回 false 表示该 ID 已存在（实时回声或轮询补拉的重复）
fn apply_insert(messages: &mut Vec<MessageView>, room_id: i64, view: MessageView) -> bool {
    messages.retain(|m| m.room_id == room_id);
    if messages.iter().any(|m| m.id == view.id) {
        return false;
    }
    messages.push(view);
    true
}

/// 更新事件只用于补挂译文，其他字段不可变
fn apply_translation(messages: &mut Vec<MessageView>, room_id: i64, row: &MessageRow) -> bool {
    messages.retain(|m| m.room_id == room_id);
    let mut changed = false;
    for m in messages.iter_mut() {
        if m.id == row.id {
            m.text_en = row.content_en.clone();
            changed = true;
        }
    }
    changed
}

/// 合并轮询结果，返回新增条数
fn merge_polled(messages: &mut Vec<MessageView>, room_id: i64, incoming: Vec<MessageView>) -> usize {
    messages.retain(|m| m.room_id == room_id);
    let existing: HashSet<String> = messages.iter().map(|m| m.id.clone()).collect();
    let mut added = 0;
    for view in incoming {
        if view.room_id != room_id || existing.contains(&view.id) {
            continue;
        }
        messages.push(view);
        added += 1;
    }
    added
}

#[derive(Default)]
struct MsgState {
    room_id: Option<i64>,
    messages: Vec<MessageView>,
    phase: SyncPhase,
    transport: Transport,
    /// 已知最新消息时刻（增量轮询游标）
    last_seen: Option<DateTime<Utc>>,
}

/// 消息同步器
pub struct MessageSyncer {
    config: MsgSyncerConfig,
    store: Arc<RestStore>,
    listener: RwLock<Arc<dyn MessageListener>>,
    state: StdMutex<MsgState>,
    /// 激活代数：切房/停用时递增，旧代的在途结果一律丢弃
    epoch: AtomicU64,
    /// 发信者显示名缓存（历史加载时批量填充）
    profile_names: StdMutex<HashMap<String, String>>,
    loading: AtomicBool,
    composing: Arc<AtomicBool>,
    live_ok: Arc<AtomicBool>,
    poll_task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
    channel: tokio::sync::Mutex<Option<ChannelHandle>>,
}

struct MsgFeedHandler {
    syncer: Weak<MessageSyncer>,
}

#[async_trait]
impl ChannelHandler for MsgFeedHandler {
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

impl MessageSyncer {
    pub fn new(
        config: MsgSyncerConfig,
        store: Arc<RestStore>,
        composing: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            store,
            listener: RwLock::new(Arc::new(EmptyMessageListener)),
            state: StdMutex::new(MsgState::default()),
            epoch: AtomicU64::new(0),
            profile_names: StdMutex::new(HashMap::new()),
            loading: AtomicBool::new(false),
            composing,
            live_ok: Arc::new(AtomicBool::new(false)),
            poll_task: StdMutex::new(None),
            channel: tokio::sync::Mutex::new(None),
        }
    }

    pub fn set_listener(&self, listener: Arc<dyn MessageListener>) {
        let mut slot = self
            .listener
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *slot = listener;
    }

    fn listener(&self) -> Arc<dyn MessageListener> {
        self.listener
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn state_lock(&self) -> std::sync::MutexGuard<'_, MsgState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn names_lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.profile_names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// 当前消息列表快照
    pub fn messages(&self) -> Vec<MessageView> {
        self.state_lock().messages.clone()
    }

    pub fn current_room(&self) -> Option<i64> {
        self.state_lock().room_id
    }

    pub fn phase(&self) -> SyncPhase {
        self.state_lock().phase
    }

    pub fn transport(&self) -> Transport {
        self.state_lock().transport
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::SeqCst)
    }

    async fn set_loading(&self, loading: bool) {
        self.loading.store(loading, Ordering::SeqCst);
        self.listener().on_loading_changed(loading).await;
    }

    async fn notify_messages(&self) {
        let snapshot = self.messages();
        self.listener().on_messages_changed(snapshot).await;
    }

    /// 激活房间：立即清空旧列表，同时开订阅并做一次历史加载
    pub async fn activate(
        self: &Arc<Self>,
        realtime: Option<&RealtimeClient>,
        room_id: i64,
    ) -> Result<()> {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        info!("[MsgSync] 🚪 激活房间: {} (第 {} 代)", room_id, epoch);

        self.teardown_transport().await;
        {
            let mut state = self.state_lock();
            state.room_id = Some(room_id);
            state.messages.clear();
            state.phase = SyncPhase::Loading;
            state.transport = Transport::Live;
            state.last_seen = None;
        }
        self.notify_messages().await;
        self.set_loading(true).await;

        if let Some(realtime) = realtime {
            let spec = ChannelSpec {
                // 代数入名，保证每次激活都是全新通道
                name: format!("messages:{}:{}", room_id, epoch),
                broadcast_self: true,
                join_timeout: Duration::from_secs(self.config.watchdog_secs),
                bindings: vec![
                    PgBinding::with_filter("INSERT", "messages", format!("room_id=eq.{}", room_id)),
                    PgBinding::with_filter("UPDATE", "messages", format!("room_id=eq.{}", room_id)),
                ],
            };
            let handler = Arc::new(MsgFeedHandler {
                syncer: Arc::downgrade(self),
            });
            match realtime.subscribe(spec, handler).await {
                Ok(handle) => *self.channel.lock().await = Some(handle),
                Err(e) => {
                    // 订阅失败走轮询，历史加载照常
                    warn!("[MsgSync] ⚠️ 订阅失败，降级轮询: {}", e);
                    self.live_ok.store(false, Ordering::SeqCst);
                    self.start_polling();
                }
            }
        } else if self.store.is_configured() {
            // 实时连接整体不可用，只能靠轮询
            self.start_polling();
        }

        self.load_history(room_id, epoch).await;
        Ok(())
    }

    /// 停用：撤订阅、停轮询、清状态
    pub async fn deactivate(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.teardown_transport().await;
        {
            let mut state = self.state_lock();
            state.room_id = None;
            state.messages.clear();
            state.phase = SyncPhase::Idle;
            state.last_seen = None;
        }
        self.set_loading(false).await;
        self.notify_messages().await;
    }

    /// 按需重跑历史加载（批量翻译完成后由调用方触发）
    pub async fn refresh(&self) {
        let (room_id, epoch) = {
            let state = self.state_lock();
            (state.room_id, self.epoch.load(Ordering::SeqCst))
        };
        if let Some(room_id) = room_id {
            self.load_history(room_id, epoch).await;
        }
    }

    fn epoch_is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    async fn load_history(&self, room_id: i64, epoch: u64) {
        if !self.store.is_configured() {
            debug!("[MsgSync] 后端未配置，跳过历史加载");
            {
                let mut state = self.state_lock();
                if !self.epoch_is_current(epoch) || state.room_id != Some(room_id) {
                    return;
                }
                state.messages.clear();
                state.phase = SyncPhase::Synced;
            }
            self.set_loading(false).await;
            self.notify_messages().await;
            return;
        }

        let rows = match self.store.messages_for_room(room_id).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!("[MsgSync] ⚠️ 历史消息加载失败: room={}, {}", room_id, e);
                self.set_loading(false).await;
                return;
            }
        };
        if !self.epoch_is_current(epoch) {
            debug!("[MsgSync] 丢弃过期代的历史加载结果: room={}", room_id);
            return;
        }

        // 批量解析发信者显示名
        let author_ids: Vec<String> = {
            let mut seen = HashSet::new();
            rows.iter()
                .filter_map(|r| r.user_id.clone())
                .filter(|id| seen.insert(id.clone()))
                .collect()
        };
        let names = self.resolve_names(author_ids).await;

        let views: Vec<MessageView> = rows
            .into_iter()
            .map(|row| {
                let name = row
                    .user_id
                    .as_ref()
                    .and_then(|id| names.get(id).cloned());
                MessageView::from_row(row, &self.config.user_id, name)
            })
            .collect();

        {
            let mut state = self.state_lock();
            // 加载期间可能已切房
            if !self.epoch_is_current(epoch) || state.room_id != Some(room_id) {
                debug!("[MsgSync] 历史加载结果与当前房间不符，丢弃");
                return;
            }
            state.last_seen = views.iter().map(|v| v.created_at).max();
            state.messages = views;
            state.phase = SyncPhase::Synced;
        }
        info!("[MsgSync] ✅ 历史消息加载完成: room={}", room_id);
        self.set_loading(false).await;
        self.notify_messages().await;
    }

    /// 批量解析显示名（缓存优先，缺的一次性补）
    async fn resolve_names(&self, ids: Vec<String>) -> HashMap<String, String> {
        let mut resolved = HashMap::new();
        let mut missing = Vec::new();
        {
            let cache = self.names_lock();
            for id in ids {
                match cache.get(&id) {
                    Some(name) => {
                        resolved.insert(id, name.clone());
                    }
                    None => missing.push(id),
                }
            }
        }
        if missing.is_empty() || !self.store.is_configured() {
            return resolved;
        }
        match self.store.profiles_by_ids(&missing).await {
            Ok(profiles) => {
                let mut cache = self.names_lock();
                for profile in profiles {
                    let name = display_name(profile.name.as_deref(), profile.email.as_deref());
                    cache.insert(profile.id.clone(), name.clone());
                    resolved.insert(profile.id, name);
                }
            }
            Err(e) => warn!("[MsgSync] ⚠️ 发信者资料批量查询失败: {}", e),
        }
        resolved
    }

    /// 解析单个发信者显示名（实时事件路径）
    async fn resolve_name(&self, user_id: &str) -> Option<String> {
        if let Some(name) = self.names_lock().get(user_id).cloned() {
            return Some(name);
        }
        if !self.store.is_configured() {
            return None;
        }
        match self.store.profile_by_id(user_id).await {
            Ok(Some(profile)) => {
                let name = display_name(profile.name.as_deref(), profile.email.as_deref());
                self.names_lock().insert(user_id.to_string(), name.clone());
                Some(name)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("[MsgSync] ⚠️ 发信者资料查询失败: {}, {}", user_id, e);
                None
            }
        }
    }

    /// 处理实时变更事件
    pub async fn handle_event(&self, event: &ChangeEvent) {
        if event.table != "messages" {
            return;
        }
        match event.kind {
            EventKind::Insert => match event.decode_new::<MessageRow>() {
                Ok(row) => self.handle_insert(row).await,
                Err(e) => warn!("[MsgSync] 消息插入事件解析失败: {}", e),
            },
            EventKind::Update => match event.decode_new::<MessageRow>() {
                Ok(row) => self.handle_update(row).await,
                Err(e) => warn!("[MsgSync] 消息更新事件解析失败: {}", e),
            },
            EventKind::Delete => {}
        }
    }

    async fn handle_insert(&self, row: MessageRow) {
        // 订阅虽带服务端过滤，房间号仍再查一次
        if self.current_room() != Some(row.room_id) {
            debug!("[MsgSync] 忽略非当前房间的消息: room={}", row.room_id);
            return;
        }

        let own = row.user_id.as_deref() == Some(self.config.user_id.as_str());
        let name = match (&row.user_id, own) {
            (Some(user_id), false) => self.resolve_name(user_id).await,
            _ => None,
        };

        let room_id = row.room_id;
        let created_at = row.created_at;
        let view = MessageView::from_row(row, &self.config.user_id, name);
        let added = {
            let mut state = self.state_lock();
            if state.room_id != Some(room_id) {
                return;
            }
            let added = apply_insert(&mut state.messages, room_id, view);
            if added {
                state.last_seen = state.last_seen.max(Some(created_at));
            }
            added
        };
        if added {
            debug!("[MsgSync] 📨 实时消息追加: room={}", room_id);
            self.notify_messages().await;
        }
    }

    async fn handle_update(&self, row: MessageRow) {
        if self.current_room() != Some(row.room_id) {
            return;
        }
        let changed = {
            let mut state = self.state_lock();
            apply_translation(&mut state.messages, row.room_id, &row)
        };
        if changed {
            debug!("[MsgSync] 🔄 译文已挂接: id={}", row.id);
            self.notify_messages().await;
        }
    }

    /// 发送消息：先做参与者修复，插入成功后立即乐观追加
    ///
    /// 插入失败向调用方抛错；已追加的本地消息不回滚
    pub async fn send(&self, text: &str) -> Result<MessageView> {
        let room_id = self
            .current_room()
            .ok_or_else(|| anyhow::anyhow!("没有激活的房间"))?;

        self.repair_participants(room_id).await;

        let row = self
            .store
            .insert_message(&NewMessage {
                room_id,
                user_id: &self.config.user_id,
                content_ko: text,
                content_en: None,
            })
            .await
            .with_context(|| format!("消息发送失败: room={}", room_id))?;

        let created_at = row.created_at;
        let view = MessageView::from_row(row, &self.config.user_id, None);
        debug_assert_eq!(view.role, SenderRole::Me);

        let added = {
            let mut state = self.state_lock();
            // 发送期间切了房就不追加，回到该房时历史加载会带回来
            if state.room_id != Some(room_id) {
                false
            } else {
                let added = apply_insert(&mut state.messages, room_id, view.clone());
                if added {
                    state.last_seen = state.last_seen.max(Some(created_at));
                }
                added
            }
        };
        if added {
            info!("[MsgSync] ✉️ 消息已发送并本地追加: room={}", room_id);
            self.notify_messages().await;
        }
        Ok(view)
    }

    /// 参与者修复：房间内发过言的人加上自己，逐个确保在参与表里
    ///
    /// 幂等且尽力而为（退出过的用户也能继续收到后续消息），失败只记日志
    async fn repair_participants(&self, room_id: i64) {
        let mut user_ids = match self.store.message_author_ids(room_id).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!("[MsgSync] ⚠️ 参与者修复跳过（发信者查询失败）: {}", e);
                return;
            }
        };
        if !user_ids.iter().any(|id| id == &self.config.user_id) {
            user_ids.push(self.config.user_id.clone());
        }
        for user_id in user_ids {
            if let Err(e) = self.store.add_participant(room_id, &user_id).await {
                debug!(
                    "[MsgSync] 参与者修复失败: room={}, user={}, {}",
                    room_id, user_id, e
                );
            }
        }
    }

    async fn handle_state(self: &Arc<Self>, state: ChannelState) {
        match state {
            ChannelState::Subscribed => {
                self.live_ok.store(true, Ordering::SeqCst);
                self.stop_polling();
                self.state_lock().transport = Transport::Live;
                info!("[MsgSync] ✅ 实时订阅生效，停用轮询");
            }
            ChannelState::ChannelError | ChannelState::TimedOut | ChannelState::Closed => {
                self.live_ok.store(false, Ordering::SeqCst);
                self.start_polling();
            }
        }
    }

    /// 启动增量轮询（只拉上次已知时刻之后的消息）
    fn start_polling(self: &Arc<Self>) {
        let mut slot = self
            .poll_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return;
        }
        info!(
            "[MsgSync] 🔄 实时订阅不可用，启动 {} 秒增量轮询",
            self.config.poll_secs
        );
        self.state_lock().transport = Transport::Polling;
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
                    debug!("[MsgSync] ⌨️ 输入中，跳过本次轮询");
                    continue;
                }
                syncer.poll_once().await;
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

    async fn poll_once(&self) {
        let (room_id, last_seen) = {
            let state = self.state_lock();
            (state.room_id, state.last_seen)
        };
        let Some(room_id) = room_id else { return };
        if !self.store.is_configured() {
            return;
        }

        let rows = match last_seen {
            Some(after) => self.store.messages_after(room_id, after).await,
            None => self.store.messages_for_room(room_id).await,
        };
        let rows = match rows {
            Ok(rows) => rows,
            Err(e) => {
                warn!("[MsgSync] ⚠️ 轮询失败: room={}, {}", room_id, e);
                return;
            }
        };
        if rows.is_empty() {
            return;
        }

        let author_ids: Vec<String> = {
            let mut seen = HashSet::new();
            rows.iter()
                .filter_map(|r| r.user_id.clone())
                .filter(|id| seen.insert(id.clone()))
                .collect()
        };
        let names = self.resolve_names(author_ids).await;
        let views: Vec<MessageView> = rows
            .into_iter()
            .map(|row| {
                let name = row
                    .user_id
                    .as_ref()
                    .and_then(|id| names.get(id).cloned());
                MessageView::from_row(row, &self.config.user_id, name)
            })
            .collect();

        let added = {
            let mut state = self.state_lock();
            if state.room_id != Some(room_id) {
                return;
            }
            let newest = views.iter().map(|v| v.created_at).max();
            let added = merge_polled(&mut state.messages, room_id, views);
            if added > 0 {
                state.last_seen = state.last_seen.max(newest);
            }
            added
        };
        if added > 0 {
            info!("[MsgSync] 📨 轮询补到 {} 条新消息: room={}", added, room_id);
            self.notify_messages().await;
        }
    }

    async fn teardown_transport(&self) {
        self.stop_polling();
        self.live_ok.store(false, Ordering::SeqCst);
        let handle = self.channel.lock().await.take();
        if let Some(handle) = handle {
            handle.leave().await;
        }
    }

    /// 等同 teardown，对外的停用入口之外也给客户端收尾用
    pub async fn detach(&self) {
        self.teardown_transport().await;
    }

    #[cfg(test)]
    pub(crate) fn seed_for_test(&self, room_id: i64, messages: Vec<MessageView>) {
        let mut state = self.state_lock();
        state.room_id = Some(room_id);
        state.phase = SyncPhase::Synced;
        state.last_seen = messages.iter().map(|m| m.created_at).max();
        state.messages = messages;
    }

    #[cfg(test)]
    pub(crate) fn prime_name_for_test(&self, user_id: &str, name: &str) {
        self.names_lock()
            .insert(user_id.to_string(), name.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::config::ClientConfig;
    use chrono::TimeZone;

    fn row(id: &str, room_id: i64, user: Option<&str>, secs: u32) -> MessageRow {
        MessageRow {
            id: id.to_string(),
            room_id,
            user_id: user.map(|s| s.to_string()),
            content_ko: Some(format!("본문-{}", id)),
            content_en: None,
            created_at: Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, secs).unwrap(),
        }
    }

    fn view(id: &str, room_id: i64, secs: u32) -> MessageView {
        MessageView::from_row(row(id, room_id, Some("me"), secs), "me", None)
    }

    fn test_syncer() -> Arc<MessageSyncer> {
        let cfg = ClientConfig::new(String::new(), String::new());
        let store = Arc::new(RestStore::new(&cfg, "").unwrap());
        Arc::new(MessageSyncer::new(
            MsgSyncerConfig {
                user_id: "me".to_string(),
                watchdog_secs: 10,
                poll_secs: 30,
            },
            store,
            Arc::new(AtomicBool::new(false)),
        ))
    }

    #[test]
    fn test_apply_insert_dedups_by_id() {
        let mut messages = vec![view("m1", 1, 0)];
        assert!(apply_insert(&mut messages, 1, view("m2", 1, 1)));
        assert!(!apply_insert(&mut messages, 1, view("m2", 1, 1)));
        assert_eq!(messages.len(), 2);
    }

    #[test]
    fn test_apply_insert_drops_stale_rooms() {
        // 快速切房后残留的旧房消息在下一次追加时被清除
        let mut messages = vec![view("a1", 1, 0), view("b1", 2, 1)];
        assert!(apply_insert(&mut messages, 2, view("b2", 2, 2)));
        assert!(messages.iter().all(|m| m.room_id == 2));
        assert_eq!(messages.len(), 2);
    }

    #[test]
    fn test_apply_translation_only_touches_translation() {
        let mut messages = vec![view("m1", 1, 0)];
        let original_text = messages[0].text.clone();
        let mut update = row("m1", 1, Some("me"), 0);
        update.content_en = Some("hello".to_string());
        update.content_ko = Some("변조된 원문".to_string());
        assert!(apply_translation(&mut messages, 1, &update));
        assert_eq!(messages[0].text_en.as_deref(), Some("hello"));
        assert_eq!(messages[0].text, original_text);
        // 未知 ID 无效果
        let unknown = row("mX", 1, Some("me"), 0);
        assert!(!apply_translation(&mut messages, 1, &unknown));
    }

    #[test]
    fn test_merge_polled_skips_duplicates_and_foreign_rooms() {
        let mut messages = vec![view("m1", 1, 0)];
        let added = merge_polled(
            &mut messages,
            1,
            vec![view("m1", 1, 0), view("m2", 1, 1), view("x1", 9, 2)],
        );
        assert_eq!(added, 1);
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().all(|m| m.room_id == 1));
    }

    #[tokio::test]
    async fn test_insert_event_appends_once() {
        let syncer = test_syncer();
        syncer.seed_for_test(1, vec![]);
        syncer.prime_name_for_test("u2", "Mina");

        let event = ChangeEvent {
            kind: EventKind::Insert,
            table: "messages".to_string(),
            new: Some(serde_json::to_value(row("m1", 1, Some("u2"), 0)).unwrap()),
            old: None,
        };
        syncer.handle_event(&event).await;
        syncer.handle_event(&event).await;

        let messages = syncer.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].sender_name.as_deref(), Some("Mina"));
        assert_eq!(messages[0].role, SenderRole::Friend);
    }

    #[tokio::test]
    async fn test_insert_event_for_other_room_ignored() {
        let syncer = test_syncer();
        syncer.seed_for_test(1, vec![view("m1", 1, 0)]);

        let event = ChangeEvent {
            kind: EventKind::Insert,
            table: "messages".to_string(),
            new: Some(serde_json::to_value(row("m9", 7, Some("me"), 5)).unwrap()),
            old: None,
        };
        syncer.handle_event(&event).await;
        let messages = syncer.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, "m1");
    }

    #[tokio::test]
    async fn test_update_event_attaches_translation() {
        let syncer = test_syncer();
        syncer.seed_for_test(1, vec![view("m1", 1, 0)]);

        let mut updated = row("m1", 1, Some("me"), 0);
        updated.content_en = Some("translated".to_string());
        let event = ChangeEvent {
            kind: EventKind::Update,
            table: "messages".to_string(),
            new: Some(serde_json::to_value(updated).unwrap()),
            old: None,
        };
        syncer.handle_event(&event).await;
        assert_eq!(
            syncer.messages()[0].text_en.as_deref(),
            Some("translated")
        );
    }

    #[tokio::test]
    async fn test_own_insert_event_skips_name_lookup() {
        // 自己的消息不查资料也不带显示名
        let syncer = test_syncer();
        syncer.seed_for_test(1, vec![]);
        let event = ChangeEvent {
            kind: EventKind::Insert,
            table: "messages".to_string(),
            new: Some(serde_json::to_value(row("m1", 1, Some("me"), 0)).unwrap()),
            old: None,
        };
        syncer.handle_event(&event).await;
        let messages = syncer.messages();
        assert_eq!(messages[0].role, SenderRole::Me);
        assert_eq!(messages[0].sender_name, None);
    }

    #[tokio::test]
    async fn test_send_without_active_room_fails() {
        let syncer = test_syncer();
        assert!(syncer.send("hi").await.is_err());
    }

    #[tokio::test]
    async fn test_deactivate_clears_state() {
        let syncer = test_syncer();
        syncer.seed_for_test(1, vec![view("m1", 1, 0)]);
        syncer.deactivate().await;
        assert!(syncer.messages().is_empty());
        assert_eq!(syncer.current_room(), None);
        assert_eq!(syncer.phase(), SyncPhase::Idle);
    }

    #[tokio::test]
    async fn test_activate_clears_previous_room_immediately() {
        let syncer = test_syncer();
        syncer.seed_for_test(1, vec![view("m1", 1, 0)]);
        // 未配置后端：激活只清空并进入 Synced 空列表
        syncer.activate(None, 2).await.unwrap();
        assert!(syncer.messages().is_empty());
        assert_eq!(syncer.current_room(), Some(2));
        assert_eq!(syncer.phase(), SyncPhase::Synced);
    }

    #[tokio::test]
    async fn test_stale_epoch_history_is_discarded() {
        let syncer = test_syncer();
        syncer.seed_for_test(2, vec![view("m2", 2, 0)]);
        // 用过期代号跑历史加载：结果必须被丢弃
        let stale_epoch = syncer.epoch.load(Ordering::SeqCst) + 1;
        syncer.epoch.store(stale_epoch + 5, Ordering::SeqCst);
        syncer.load_history(2, stale_epoch).await;
        assert_eq!(syncer.messages().len(), 1);
    }
}
