//! 共享类型与响应处理
//!
//! 变更事件、REST 错误类型以及通用的响应解析辅助函数

use anyhow::Result;
use serde::de::DeserializeOwned;
use std::fmt;

/// 变更事件类型：对应数据库行级变更
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Insert,
    Update,
    Delete,
}

impl EventKind {
    /// 从服务器事件名解析（"INSERT" / "UPDATE" / "DELETE"）
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INSERT" => Some(EventKind::Insert),
            "UPDATE" => Some(EventKind::Update),
            "DELETE" => Some(EventKind::Delete),
            _ => None,
        }
    }
}

/// 实时变更事件
///
/// `new` 为变更后的行（INSERT/UPDATE），`old` 为变更前的行（DELETE，
/// 以及 UPDATE 的旧值，取决于服务器的 replica identity 配置）
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub kind: EventKind,
    pub table: String,
    pub new: Option<serde_json::Value>,
    pub old: Option<serde_json::Value>,
}

impl ChangeEvent {
    /// 将 `new` 反序列化为行类型
    pub fn decode_new<T: DeserializeOwned>(&self) -> Result<T> {
        let value = self
            .new
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("事件缺少 new 记录: table={}", self.table))?;
        Ok(serde_json::from_value(value.clone())?)
    }

    /// 将 `old` 反序列化为行类型
    pub fn decode_old<T: DeserializeOwned>(&self) -> Result<T> {
        let value = self
            .old
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("事件缺少 old 记录: table={}", self.table))?;
        Ok(serde_json::from_value(value.clone())?)
    }
}

/// 订阅通道的连接状态回调
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// 订阅已确认，实时推送生效
    Subscribed,
    /// 通道错误
    ChannelError,
    /// 加入超时（约定时间内未收到确认）
    TimedOut,
    /// 连接关闭
    Closed,
}

/// REST 存储层错误
///
/// 保留服务端返回的错误码（如 PGRST116 / PGRST202 / PGRST205 / 23505），
/// 调用方可通过 [`rest_error_code`] 按码分支处理
#[derive(Debug, Clone)]
pub struct RestError {
    pub status: u16,
    pub code: Option<String>,
    pub message: String,
}

impl fmt::Display for RestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "HTTP {} [{}]: {}", self.status, code, self.message),
            None => write!(f, "HTTP {}: {}", self.status, self.message),
        }
    }
}

impl std::error::Error for RestError {}

/// 取出 anyhow 错误链中的 REST 错误码
pub fn rest_error_code(err: &anyhow::Error) -> Option<&str> {
    err.downcast_ref::<RestError>()
        .and_then(|e| e.code.as_deref())
}

/// 判断错误是否为指定错误码
pub fn is_rest_code(err: &anyhow::Error, code: &str) -> bool {
    rest_error_code(err) == Some(code)
}

/// 解析 REST 错误响应体，构造 [`RestError`]
///
/// PostgREST 错误体形如 `{"code":"PGRST205","message":"...","details":...,"hint":...}`
pub fn parse_rest_error(status: u16, body: &str) -> RestError {
    let parsed: Option<serde_json::Value> = serde_json::from_str(body).ok();
    let code = parsed
        .as_ref()
        .and_then(|v| v.get("code"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let message = parsed
        .as_ref()
        .and_then(|v| {
            v.get("message")
                .or_else(|| v.get("msg"))
                .or_else(|| v.get("error_description"))
                .or_else(|| v.get("error"))
        })
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| body.to_string());
    RestError {
        status,
        code,
        message,
    }
}

/// 解析显示名：优先 profile.name，其次邮箱 @ 前缀，兜底 "User"
pub fn display_name(name: Option<&str>, email: Option<&str>) -> String {
    if let Some(name) = name {
        if !name.is_empty() {
            return name.to_string();
        }
    }
    if let Some(email) = email {
        if let Some(local) = email.split('@').next() {
            if !local.is_empty() {
                return local.to_string();
            }
        }
    }
    "User".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_parse() {
        assert_eq!(EventKind::parse("INSERT"), Some(EventKind::Insert));
        assert_eq!(EventKind::parse("UPDATE"), Some(EventKind::Update));
        assert_eq!(EventKind::parse("DELETE"), Some(EventKind::Delete));
        assert_eq!(EventKind::parse("TRUNCATE"), None);
    }

    #[test]
    fn test_parse_rest_error_with_code() {
        let err = parse_rest_error(
            404,
            r#"{"code":"PGRST205","message":"Could not find the table","details":null,"hint":null}"#,
        );
        assert_eq!(err.code.as_deref(), Some("PGRST205"));
        assert_eq!(err.status, 404);

        let anyhow_err: anyhow::Error = err.into();
        assert_eq!(rest_error_code(&anyhow_err), Some("PGRST205"));
        assert!(is_rest_code(&anyhow_err, "PGRST205"));
        assert!(!is_rest_code(&anyhow_err, "PGRST116"));
    }

    #[test]
    fn test_parse_rest_error_plain_body() {
        let err = parse_rest_error(500, "internal error");
        assert_eq!(err.code, None);
        assert_eq!(err.message, "internal error");
    }

    #[test]
    fn test_display_name_fallbacks() {
        assert_eq!(display_name(Some("Mina"), Some("mina@example.com")), "Mina");
        assert_eq!(display_name(None, Some("mina@example.com")), "mina");
        assert_eq!(display_name(Some(""), Some("mina@example.com")), "mina");
        assert_eq!(display_name(None, None), "User");
        assert_eq!(display_name(None, Some("")), "User");
    }

    #[test]
    fn test_change_event_decode() {
        let ev = ChangeEvent {
            kind: EventKind::Insert,
            table: "messages".to_string(),
            new: Some(serde_json::json!({"id": "m1", "room_id": 3})),
            old: None,
        };
        #[derive(serde::Deserialize)]
        struct Partial {
            id: String,
            room_id: i64,
        }
        let p: Partial = ev.decode_new().unwrap();
        assert_eq!(p.id, "m1");
        assert_eq!(p.room_id, 3);
        assert!(ev.decode_old::<Partial>().is_err());
    }
}
