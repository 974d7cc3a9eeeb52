//! 存储层行类型
//!
//! 字段名与远端表列名一致（snake_case），时间戳为 RFC 3339

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 房间类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RoomKind {
    Private,
    #[default]
    Topic,
}

/// rooms 表行
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomRow {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: Option<RoomKind>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// rooms 插入体
#[derive(Debug, Serialize)]
pub struct NewRoom<'a> {
    pub name: &'a str,
    #[serde(rename = "type")]
    pub kind: RoomKind,
    pub created_by: &'a str,
}

/// messages 表行
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: String,
    pub room_id: i64,
    pub user_id: Option<String>,
    pub content_ko: Option<String>,
    pub content_en: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// messages 插入体（译文恒为空，由翻译流程后补）
#[derive(Debug, Serialize)]
pub struct NewMessage<'a> {
    pub room_id: i64,
    pub user_id: &'a str,
    pub content_ko: &'a str,
    pub content_en: Option<&'a str>,
}

/// room_participants 变更记录（实时事件里只保证这两列可用）
#[derive(Debug, Clone, Deserialize)]
pub struct ParticipantChange {
    pub room_id: i64,
    pub user_id: String,
}

/// profiles 表行（查询可能只选取部分列，缺失列反序列化为 None）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ProfileRow {
    pub id: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
    pub status_msg: Option<String>,
}

/// profiles 插入体
#[derive(Debug, Serialize)]
pub struct NewProfile<'a> {
    pub id: &'a str,
    pub email: Option<&'a str>,
    pub name: &'a str,
}

/// profiles 更新体
#[derive(Debug, Serialize, Default)]
pub struct ProfileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_msg: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// friendships 表行
#[derive(Debug, Clone, Deserialize)]
pub struct FriendshipRow {
    pub id: String,
    pub user_id: String,
    pub friend_id: String,
    pub created_at: DateTime<Utc>,
}

/// friend_requests 表行
#[derive(Debug, Clone, Deserialize)]
pub struct FriendRequestRow {
    pub id: String,
    pub from_user_id: String,
    pub to_user_id: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// 单列投影用的小结构

#[derive(Debug, Deserialize)]
pub struct RoomIdRow {
    pub room_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct UserIdRow {
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LastMessageRow {
    pub content_ko: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct IdRow {
    pub id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_kind_serde() {
        assert_eq!(
            serde_json::to_string(&RoomKind::Private).unwrap(),
            r#""private""#
        );
        let kind: RoomKind = serde_json::from_str(r#""topic""#).unwrap();
        assert_eq!(kind, RoomKind::Topic);
    }

    #[test]
    fn test_message_row_deserializes_store_shape() {
        let row: MessageRow = serde_json::from_str(
            r#"{
                "id": "9c0d",
                "room_id": 7,
                "user_id": null,
                "content_ko": "안녕",
                "content_en": null,
                "created_at": "2026-03-01T09:30:00+00:00"
            }"#,
        )
        .unwrap();
        assert_eq!(row.room_id, 7);
        assert_eq!(row.user_id, None);
        assert_eq!(row.content_ko.as_deref(), Some("안녕"));
        assert_eq!(row.content_en, None);
    }

    #[test]
    fn test_profile_row_partial_columns() {
        // select=id,name,email 的投影：缺 avatar_url / status_msg
        let row: ProfileRow =
            serde_json::from_str(r#"{"id":"u1","name":null,"email":"u1@x.y"}"#).unwrap();
        assert_eq!(row.id, "u1");
        assert_eq!(row.avatar_url, None);
        assert_eq!(row.status_msg, None);
    }

    #[test]
    fn test_new_message_serializes_null_translation() {
        let body = serde_json::to_value(NewMessage {
            room_id: 3,
            user_id: "u1",
            content_ko: "hi",
            content_en: None,
        })
        .unwrap();
        assert_eq!(body["content_en"], serde_json::Value::Null);
        assert_eq!(body["room_id"], 3);
    }
}
