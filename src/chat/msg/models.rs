//! 消息视图模型与同步状态

use crate::chat::config::DeviceProfile;
use crate::chat::store::types::MessageRow;
use chrono::{DateTime, Local, Utc};

/// 消息同步器配置
#[derive(Debug, Clone)]
pub struct MsgSyncerConfig {
    /// 当前用户 ID
    pub user_id: String,
    /// 订阅确认看门狗（秒）
    pub watchdog_secs: u64,
    /// 增量轮询间隔（秒）
    pub poll_secs: u64,
}

impl MsgSyncerConfig {
    /// 按设备档位取间隔：移动端更激进
    pub fn for_device(user_id: String, device: DeviceProfile) -> Self {
        Self {
            user_id,
            watchdog_secs: device.msg_watchdog_secs(),
            poll_secs: device.msg_poll_secs(),
        }
    }
}

/// 消息相对查看者的角色
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderRole {
    Me,
    Friend,
}

/// 渲染用消息视图
#[derive(Debug, Clone)]
pub struct MessageView {
    pub id: String,
    pub room_id: i64,
    pub sender_id: Option<String>,
    pub role: SenderRole,
    /// 原文（缺失时为空串）
    pub text: String,
    /// 译文（翻译完成前为 None）
    pub text_en: Option<String>,
    /// 本地时刻（HH:MM）
    pub time: String,
    /// 发信者显示名；自己的消息不带
    pub sender_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl MessageView {
    /// 从存储行构造视图；`sender_name` 只对他人消息生效
    pub fn from_row(row: MessageRow, viewer_id: &str, sender_name: Option<String>) -> Self {
        let role = if row.user_id.as_deref() == Some(viewer_id) {
            SenderRole::Me
        } else {
            SenderRole::Friend
        };
        Self {
            id: row.id,
            room_id: row.room_id,
            sender_id: row.user_id,
            role,
            text: row.content_ko.unwrap_or_default(),
            text_en: row.content_en,
            time: format_clock(row.created_at),
            sender_name: match role {
                SenderRole::Me => None,
                SenderRole::Friend => sender_name,
            },
            created_at: row.created_at,
        }
    }
}

/// 本地时钟格式（两位时:分）
pub fn format_clock(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%H:%M").to_string()
}

/// 同步阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncPhase {
    #[default]
    Idle,
    Loading,
    Synced,
}

/// Synced 阶段的传输方式（同一时刻二选一，可随连接状态切换）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
    #[default]
    Live,
    Polling,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn row(user_id: Option<&str>) -> MessageRow {
        MessageRow {
            id: "m1".to_string(),
            room_id: 4,
            user_id: user_id.map(|s| s.to_string()),
            content_ko: Some("안녕하세요".to_string()),
            content_en: None,
            created_at: Utc.with_ymd_and_hms(2026, 3, 1, 9, 5, 0).unwrap(),
        }
    }

    #[test]
    fn test_own_message_has_no_sender_name() {
        let view = MessageView::from_row(row(Some("me")), "me", Some("ignored".to_string()));
        assert_eq!(view.role, SenderRole::Me);
        assert_eq!(view.sender_name, None);
        assert_eq!(view.text, "안녕하세요");
    }

    #[test]
    fn test_friend_message_keeps_sender_name() {
        let view = MessageView::from_row(row(Some("u2")), "me", Some("Mina".to_string()));
        assert_eq!(view.role, SenderRole::Friend);
        assert_eq!(view.sender_name.as_deref(), Some("Mina"));
    }

    #[test]
    fn test_null_author_is_friend() {
        let view = MessageView::from_row(row(None), "me", None);
        assert_eq!(view.role, SenderRole::Friend);
        assert_eq!(view.sender_id, None);
    }

    #[test]
    fn test_missing_body_becomes_empty() {
        let mut r = row(Some("me"));
        r.content_ko = None;
        let view = MessageView::from_row(r, "me", None);
        assert_eq!(view.text, "");
    }

    #[test]
    fn test_config_for_device() {
        let desktop = MsgSyncerConfig::for_device("u".into(), DeviceProfile::Desktop);
        assert_eq!(
            (desktop.watchdog_secs, desktop.poll_secs),
            (10, 30)
        );
        let mobile = MsgSyncerConfig::for_device("u".into(), DeviceProfile::Mobile);
        assert_eq!((mobile.watchdog_secs, mobile.poll_secs), (5, 15));
    }
}
