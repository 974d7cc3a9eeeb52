//! 跨房间新消息通知
//!
//! 订阅整个消息表的插入事件，过滤掉自己的消息和"正看着的房间"，
//! 组装成通知载荷交给上层（权限申请与实际展示是 UI 壳层的事）

use crate::chat::realtime::{ChannelHandle, ChannelHandler, ChannelSpec, PgBinding, RealtimeClient};
use crate::chat::store::api::RestStore;
use crate::chat::store::types::MessageRow;
use crate::chat::types::{display_name, ChangeEvent, ChannelState, EventKind};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock, Weak};
use std::time::Duration;
use tracing::{debug, warn};

/// 预览截断长度（字符数）
const PREVIEW_CHARS: usize = 50;

/// 通知载荷
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationPayload {
    /// 标题（发信者显示名）
    pub title: String,
    /// 正文预览（超长截断加省略号）
    pub body: String,
    /// 同房间通知合并用标签
    pub tag: String,
    pub room_id: i64,
}

/// 通知回调
#[async_trait]
pub trait NotificationListener: Send + Sync {
    async fn on_notification(&self, payload: NotificationPayload);
}

/// 空实现（默认监听器）
pub struct EmptyNotificationListener;

#[async_trait]
impl NotificationListener for EmptyNotificationListener {
    async fn on_notification(&self, _payload: NotificationPayload) {}
}

/// 是否应产生通知：自己的消息不通知；前台盯着的房间不通知
fn should_notify(
    viewer_id: &str,
    author_id: Option<&str>,
    focused: bool,
    active_room: Option<i64>,
    room_id: i64,
) -> bool {
    if author_id == Some(viewer_id) {
        return false;
    }
    if focused && active_room == Some(room_id) {
        return false;
    }
    true
}

/// 正文预览截断（按字符，不切半个字）
fn clip_preview(content: &str, max_chars: usize) -> String {
    if content.chars().count() <= max_chars {
        return content.to_string();
    }
    let clipped: String = content.chars().take(max_chars).collect();
    format!("{}...", clipped)
}

/// 消息通知器
pub struct MessageNotifier {
    user_id: String,
    store: Arc<RestStore>,
    listener: RwLock<Arc<dyn NotificationListener>>,
    active_room: StdMutex<Option<i64>>,
    focused: AtomicBool,
    channel: tokio::sync::Mutex<Option<ChannelHandle>>,
}

struct NotifyFeedHandler {
    notifier: Weak<MessageNotifier>,
}

#[async_trait]
impl ChannelHandler for NotifyFeedHandler {
    async fn on_event(&self, event: ChangeEvent) {
        if event.kind != EventKind::Insert || event.table != "messages" {
            return;
        }
        let Some(notifier) = self.notifier.upgrade() else {
            return;
        };
        match event.decode_new::<MessageRow>() {
            Ok(row) => notifier.handle_insert(row).await,
            Err(e) => warn!("[Notify] 消息事件解析失败: {}", e),
        }
    }

    async fn on_state(&self, state: ChannelState) {
        debug!("[Notify] 通道状态: {:?}", state);
    }
}

impl MessageNotifier {
    pub fn new(user_id: String, store: Arc<RestStore>) -> Self {
        Self {
            user_id,
            store,
            listener: RwLock::new(Arc::new(EmptyNotificationListener)),
            active_room: StdMutex::new(None),
            focused: AtomicBool::new(true),
            channel: tokio::sync::Mutex::new(None),
        }
    }

    pub fn set_listener(&self, listener: Arc<dyn NotificationListener>) {
        let mut slot = self
            .listener
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *slot = listener;
    }

    fn listener(&self) -> Arc<dyn NotificationListener> {
        self.listener
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// UI 侧同步当前激活房间
    pub fn set_active_room(&self, room_id: Option<i64>) {
        *self
            .active_room
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = room_id;
    }

    /// UI 侧同步应用前台/后台状态
    pub fn set_focused(&self, focused: bool) {
        self.focused.store(focused, Ordering::SeqCst);
    }

    async fn handle_insert(&self, row: MessageRow) {
        let active_room = *self
            .active_room
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let focused = self.focused.load(Ordering::SeqCst);
        if !should_notify(
            &self.user_id,
            row.user_id.as_deref(),
            focused,
            active_room,
            row.room_id,
        ) {
            debug!("[Notify] 跳过通知: room={}", row.room_id);
            return;
        }

        // 房间已不存在（可能刚被清理）就不打扰
        let Ok(Some(_room)) = self.store.room_by_id(row.room_id).await else {
            return;
        };

        let sender_name = match &row.user_id {
            Some(user_id) => match self.store.profile_by_id(user_id).await {
                Ok(Some(profile)) => {
                    display_name(profile.name.as_deref(), profile.email.as_deref())
                }
                _ => "Unknown".to_string(),
            },
            None => "Unknown".to_string(),
        };

        let content = row
            .content_ko
            .or(row.content_en)
            .unwrap_or_else(|| "New message".to_string());
        let payload = NotificationPayload {
            title: sender_name,
            body: clip_preview(&content, PREVIEW_CHARS),
            tag: format!("room-{}", row.room_id),
            room_id: row.room_id,
        };
        self.listener().on_notification(payload).await;
    }

    /// 订阅全表消息插入（服务端不过滤，判断逻辑都在客户端）
    pub async fn attach(self: &Arc<Self>, realtime: &RealtimeClient) -> Result<()> {
        let spec = ChannelSpec {
            name: format!("notifications:{}", self.user_id),
            broadcast_self: false,
            join_timeout: Duration::from_secs(10),
            bindings: vec![PgBinding::new("INSERT", "messages")],
        };
        let handler = Arc::new(NotifyFeedHandler {
            notifier: Arc::downgrade(self),
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

    #[test]
    fn test_should_notify_skips_own_messages() {
        assert!(!should_notify("me", Some("me"), false, None, 1));
        assert!(should_notify("me", Some("u2"), false, None, 1));
        assert!(should_notify("me", None, false, None, 1));
    }

    #[test]
    fn test_should_notify_skips_focused_active_room() {
        assert!(!should_notify("me", Some("u2"), true, Some(1), 1));
        // 后台时当前房间也通知
        assert!(should_notify("me", Some("u2"), false, Some(1), 1));
        // 前台但在别的房间
        assert!(should_notify("me", Some("u2"), true, Some(2), 1));
    }

    #[test]
    fn test_clip_preview_char_boundaries() {
        let short = "짧은 메시지";
        assert_eq!(clip_preview(short, 50), short);

        let long: String = "가".repeat(60);
        let clipped = clip_preview(&long, 50);
        assert_eq!(clipped.chars().count(), 53);
        assert!(clipped.ends_with("..."));
    }
}
