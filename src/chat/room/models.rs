//! 房间列表视图模型

use crate::chat::store::types::{LastMessageRow, RoomKind, RoomRow};
use chrono::{DateTime, Utc};

/// 房间同步器配置
#[derive(Debug, Clone)]
pub struct RoomSyncerConfig {
    /// 当前用户 ID
    pub user_id: String,
    /// 订阅确认看门狗（秒）
    pub watchdog_secs: u64,
    /// 降级全量轮询间隔（秒）
    pub poll_secs: u64,
}

/// 带派生展示字段的房间
#[derive(Debug, Clone)]
pub struct RoomWithMeta {
    pub id: i64,
    pub name: String,
    pub kind: Option<RoomKind>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    /// 最新消息预览
    pub last_msg: Option<String>,
    /// 相对时间标签（"just now" / "5 min ago" / …）
    pub time_label: Option<String>,
    /// 未读数（未实现计算，恒为 0）
    pub unread: i32,
    /// 参与者 ID 集合
    pub participant_ids: Vec<String>,
}

impl RoomWithMeta {
    pub fn from_row(
        row: RoomRow,
        participant_ids: Vec<String>,
        last: Option<LastMessageRow>,
        now: DateTime<Utc>,
    ) -> Self {
        let (last_msg, time_label) = match last {
            Some(last) => (
                last.content_ko,
                Some(relative_time_label(now, last.created_at)),
            ),
            None => (None, None),
        };
        Self {
            id: row.id,
            name: row.name,
            kind: row.kind,
            created_by: row.created_by,
            created_at: row.created_at,
            last_msg,
            time_label,
            unread: 0,
            participant_ids,
        }
    }
}

/// 相对时间标签
///
/// 分桶：<1 分钟 → "just now"；<60 分钟 → "N min ago"；<24 小时 →
/// "N h ago"；满 1 天 → "yesterday"；<7 天 → "N days ago"；更早给短日期
pub fn relative_time_label(now: DateTime<Utc>, then: DateTime<Utc>) -> String {
    let diff = now.signed_duration_since(then);
    let mins = diff.num_minutes();
    let hours = diff.num_hours();
    let days = diff.num_days();

    if mins < 1 {
        "just now".to_string()
    } else if mins < 60 {
        format!("{} min ago", mins)
    } else if hours < 24 {
        format!("{} h ago", hours)
    } else if days == 1 {
        "yesterday".to_string()
    } else if days < 7 {
        format!("{} days ago", days)
    } else {
        then.format("%b %-d").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs_ago: i64) -> (DateTime<Utc>, DateTime<Utc>) {
        let now = Utc.with_ymd_and_hms(2026, 3, 15, 12, 0, 0).unwrap();
        (now, now - chrono::Duration::seconds(secs_ago))
    }

    #[test]
    fn test_label_just_now() {
        let (now, then) = at(30);
        assert_eq!(relative_time_label(now, then), "just now");
    }

    #[test]
    fn test_label_minutes() {
        let (now, then) = at(60);
        assert_eq!(relative_time_label(now, then), "1 min ago");
        let (now, then) = at(59 * 60 + 59);
        assert_eq!(relative_time_label(now, then), "59 min ago");
    }

    #[test]
    fn test_label_hours() {
        let (now, then) = at(3600);
        assert_eq!(relative_time_label(now, then), "1 h ago");
        let (now, then) = at(23 * 3600 + 59 * 60);
        assert_eq!(relative_time_label(now, then), "23 h ago");
    }

    #[test]
    fn test_label_yesterday() {
        let (now, then) = at(24 * 3600);
        assert_eq!(relative_time_label(now, then), "yesterday");
        let (now, then) = at(47 * 3600);
        assert_eq!(relative_time_label(now, then), "yesterday");
    }

    #[test]
    fn test_label_days() {
        let (now, then) = at(2 * 24 * 3600);
        assert_eq!(relative_time_label(now, then), "2 days ago");
        let (now, then) = at(6 * 24 * 3600 + 3600);
        assert_eq!(relative_time_label(now, then), "6 days ago");
    }

    #[test]
    fn test_label_short_date() {
        let now = Utc.with_ymd_and_hms(2026, 3, 15, 12, 0, 0).unwrap();
        let then = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(relative_time_label(now, then), "Mar 1");
    }

    #[test]
    fn test_from_row_without_message() {
        let now = Utc.with_ymd_and_hms(2026, 3, 15, 12, 0, 0).unwrap();
        let row = RoomRow {
            id: 1,
            name: "study".to_string(),
            kind: Some(RoomKind::Topic),
            created_by: Some("u1".to_string()),
            created_at: now,
        };
        let meta = RoomWithMeta::from_row(row, vec!["u1".to_string()], None, now);
        assert_eq!(meta.last_msg, None);
        assert_eq!(meta.time_label, None);
        assert_eq!(meta.unread, 0);
        assert_eq!(meta.participant_ids, vec!["u1".to_string()]);
    }
}
