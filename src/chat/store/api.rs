//! 远端存储 REST 客户端
//!
//! 按表封装行查询/插入/更新/删除，以及幂等加入房间的 RPC（函数缺失时
//! 回退为直接插入）。鉴权头在构造时注入，所有调用共享一个 HTTP 客户端

use crate::chat::config::ClientConfig;
use crate::chat::store::types::{
    FriendRequestRow, FriendshipRow, IdRow, LastMessageRow, MessageRow, NewMessage, NewProfile,
    NewRoom, ProfileRow, ProfileUpdate, RoomIdRow, RoomKind, RoomRow, UserIdRow,
};
use crate::chat::types::{parse_rest_error, rest_error_code};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// RPC 函数缺失时服务端可能返回的错误码
const RPC_MISSING_CODES: [&str; 3] = ["PGRST202", "42883", "42809"];
/// 唯一约束冲突（重复加入视为成功）
const DUPLICATE_ROW_CODE: &str = "23505";

/// 构造 `in.(a,b,c)` 过滤值
pub(crate) fn in_list<T: ToString>(values: &[T]) -> String {
    let joined = values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(",");
    format!("in.({})", joined)
}

/// 远端存储客户端
pub struct RestStore {
    http: reqwest::Client,
    rest_base: String,
    configured: bool,
}

impl RestStore {
    /// 创建客户端；`access_token` 为登录会话的访问令牌
    pub fn new(config: &ClientConfig, access_token: &str) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        if config.is_configured() {
            headers.insert(
                reqwest::header::HeaderName::from_static("apikey"),
                reqwest::header::HeaderValue::from_str(&config.anon_key)
                    .context("无效的 anon key")?,
            );
            headers.insert(
                reqwest::header::AUTHORIZATION,
                reqwest::header::HeaderValue::from_str(&format!("Bearer {}", access_token))
                    .context("无效的访问令牌")?,
            );
        }
        let http = reqwest::ClientBuilder::new()
            .default_headers(headers)
            .build()
            .context("创建 HTTP 客户端失败")?;
        Ok(Self {
            http,
            rest_base: config.rest_endpoint(),
            configured: config.is_configured(),
        })
    }

    /// 连接参数是否齐全（未配置时读操作应直接给空结果）
    pub fn is_configured(&self) -> bool {
        self.configured
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/{}", self.rest_base, table)
    }

    async fn get_rows<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &[(&str, &str)],
        what: &str,
    ) -> Result<Vec<T>> {
        let response = self
            .http
            .get(self.table_url(table))
            .query(query)
            .send()
            .await
            .with_context(|| format!("{}请求失败", what))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .with_context(|| format!("读取{}响应失败", what))?;
        if !status.is_success() {
            let err = parse_rest_error(status.as_u16(), &text);
            debug!("[Store] {}失败: {}", what, err);
            return Err(anyhow::Error::new(err).context(format!("{}失败", what)));
        }
        serde_json::from_str(&text).with_context(|| format!("{}响应解析失败", what))
    }

    async fn insert_returning<B: Serialize, T: DeserializeOwned>(
        &self,
        table: &str,
        body: &B,
        what: &str,
    ) -> Result<T> {
        let operation_id = Uuid::new_v4().to_string();
        debug!("[Store] 📡 插入 {} (操作ID: {})", table, operation_id);

        let response = self
            .http
            .post(self.table_url(table))
            .header("Prefer", "return=representation")
            .json(body)
            .send()
            .await
            .with_context(|| format!("{}请求失败", what))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .with_context(|| format!("读取{}响应失败", what))?;
        if !status.is_success() {
            let err = parse_rest_error(status.as_u16(), &text);
            warn!("[Store] {}失败: {}", what, err);
            return Err(anyhow::Error::new(err).context(format!("{}失败", what)));
        }
        let mut rows: Vec<T> =
            serde_json::from_str(&text).with_context(|| format!("{}响应解析失败", what))?;
        if rows.is_empty() {
            anyhow::bail!("{}未返回行", what);
        }
        Ok(rows.remove(0))
    }

    async fn execute_no_content(
        &self,
        request: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<()> {
        let response = request
            .send()
            .await
            .with_context(|| format!("{}请求失败", what))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let err = parse_rest_error(status.as_u16(), &text);
            return Err(anyhow::Error::new(err).context(format!("{}失败", what)));
        }
        Ok(())
    }

    // ── 房间 ───────────────────────────────────────────────

    /// 用户参与的所有房间 ID
    pub async fn participant_room_ids(&self, user_id: &str) -> Result<Vec<i64>> {
        let filter = format!("eq.{}", user_id);
        let rows: Vec<RoomIdRow> = self
            .get_rows(
                "room_participants",
                &[("select", "room_id"), ("user_id", &filter)],
                "参与房间查询",
            )
            .await?;
        Ok(rows.into_iter().map(|r| r.room_id).collect())
    }

    /// 按 ID 批量取房间（创建时间倒序）
    pub async fn rooms_by_ids(&self, ids: &[i64]) -> Result<Vec<RoomRow>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let filter = in_list(ids);
        self.get_rows(
            "rooms",
            &[
                ("select", "*"),
                ("id", &filter),
                ("order", "created_at.desc"),
            ],
            "房间列表查询",
        )
        .await
    }

    /// 单个房间
    pub async fn room_by_id(&self, room_id: i64) -> Result<Option<RoomRow>> {
        let filter = format!("eq.{}", room_id);
        let mut rows: Vec<RoomRow> = self
            .get_rows(
                "rooms",
                &[("select", "*"), ("id", &filter), ("limit", "1")],
                "房间查询",
            )
            .await?;
        Ok(if rows.is_empty() {
            None
        } else {
            Some(rows.remove(0))
        })
    }

    /// 房间的参与者 ID 列表
    pub async fn participant_user_ids(&self, room_id: i64) -> Result<Vec<String>> {
        let filter = format!("eq.{}", room_id);
        let rows: Vec<UserIdRow> = self
            .get_rows(
                "room_participants",
                &[("select", "user_id"), ("room_id", &filter)],
                "参与者查询",
            )
            .await?;
        Ok(rows.into_iter().filter_map(|r| r.user_id).collect())
    }

    /// 房间的最新一条消息（用于列表预览）
    pub async fn latest_message(&self, room_id: i64) -> Result<Option<LastMessageRow>> {
        let filter = format!("eq.{}", room_id);
        let mut rows: Vec<LastMessageRow> = self
            .get_rows(
                "messages",
                &[
                    ("select", "content_ko,created_at"),
                    ("room_id", &filter),
                    ("order", "created_at.desc"),
                    ("limit", "1"),
                ],
                "最新消息查询",
            )
            .await?;
        Ok(if rows.is_empty() {
            None
        } else {
            Some(rows.remove(0))
        })
    }

    /// 创建房间
    pub async fn insert_room(
        &self,
        name: &str,
        kind: RoomKind,
        created_by: &str,
    ) -> Result<RoomRow> {
        let room: RoomRow = self
            .insert_returning(
                "rooms",
                &NewRoom {
                    name,
                    kind,
                    created_by,
                },
                "房间创建",
            )
            .await?;
        info!("[Store] ✅ 房间已创建: id={}, name={}", room.id, room.name);
        Ok(room)
    }

    /// 幂等加入房间：优先 RPC，函数缺失时回退直接插入
    pub async fn add_participant(&self, room_id: i64, user_id: &str) -> Result<()> {
        let rpc_result = self
            .execute_no_content(
                self.http
                    .post(format!("{}/rpc/add_room_participant", self.rest_base))
                    .json(&serde_json::json!({
                        "p_room_id": room_id,
                        "p_user_id": user_id,
                    })),
                "加入房间 RPC",
            )
            .await;

        match rpc_result {
            Ok(()) => Ok(()),
            Err(err) => {
                let code = rest_error_code(&err).map(|s| s.to_string());
                if code
                    .as_deref()
                    .is_some_and(|c| RPC_MISSING_CODES.contains(&c))
                {
                    debug!(
                        "[Store] 🔄 加入房间 RPC 不可用（{}），回退直接插入",
                        code.as_deref().unwrap_or("?")
                    );
                    self.insert_participant(room_id, user_id).await
                } else {
                    Err(err)
                }
            }
        }
    }

    /// 直接插入参与记录（已存在视为成功）
    pub async fn insert_participant(&self, room_id: i64, user_id: &str) -> Result<()> {
        let result = self
            .execute_no_content(
                self.http.post(self.table_url("room_participants")).json(
                    &serde_json::json!({ "room_id": room_id, "user_id": user_id }),
                ),
                "参与记录插入",
            )
            .await;
        match result {
            Err(err) if rest_error_code(&err) == Some(DUPLICATE_ROW_CODE) => Ok(()),
            other => other,
        }
    }

    /// 删除参与记录（退出房间）
    pub async fn delete_participant(&self, room_id: i64, user_id: &str) -> Result<()> {
        let room_filter = format!("eq.{}", room_id);
        let user_filter = format!("eq.{}", user_id);
        self.execute_no_content(
            self.http
                .delete(self.table_url("room_participants"))
                .query(&[("room_id", &room_filter), ("user_id", &user_filter)]),
            "参与记录删除",
        )
        .await
    }

    // ── 消息 ───────────────────────────────────────────────

    /// 房间全部消息（创建时间升序）
    pub async fn messages_for_room(&self, room_id: i64) -> Result<Vec<MessageRow>> {
        let filter = format!("eq.{}", room_id);
        self.get_rows(
            "messages",
            &[
                ("select", "*"),
                ("room_id", &filter),
                ("order", "created_at.asc"),
            ],
            "历史消息查询",
        )
        .await
    }

    /// 某时刻之后的消息（增量轮询用）
    pub async fn messages_after(
        &self,
        room_id: i64,
        after: DateTime<Utc>,
    ) -> Result<Vec<MessageRow>> {
        let room_filter = format!("eq.{}", room_id);
        let time_filter = format!("gt.{}", after.to_rfc3339());
        self.get_rows(
            "messages",
            &[
                ("select", "*"),
                ("room_id", &room_filter),
                ("created_at", &time_filter),
                ("order", "created_at.asc"),
            ],
            "增量消息查询",
        )
        .await
    }

    /// 房间内出现过的所有发信者 ID（去重）
    pub async fn message_author_ids(&self, room_id: i64) -> Result<Vec<String>> {
        let filter = format!("eq.{}", room_id);
        let rows: Vec<UserIdRow> = self
            .get_rows(
                "messages",
                &[("select", "user_id"), ("room_id", &filter)],
                "发信者查询",
            )
            .await?;
        let mut seen = HashSet::new();
        Ok(rows
            .into_iter()
            .filter_map(|r| r.user_id)
            .filter(|id| seen.insert(id.clone()))
            .collect())
    }

    /// 发送消息（返回服务端落库后的行）
    pub async fn insert_message(&self, new: &NewMessage<'_>) -> Result<MessageRow> {
        self.insert_returning("messages", new, "消息发送").await
    }

    // ── 个人资料 ───────────────────────────────────────────

    /// 按 ID 批量取资料
    pub async fn profiles_by_ids(&self, ids: &[String]) -> Result<Vec<ProfileRow>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let filter = in_list(ids);
        self.get_rows(
            "profiles",
            &[("select", "id,email,name,avatar_url"), ("id", &filter)],
            "资料批量查询",
        )
        .await
    }

    /// 单个资料
    pub async fn profile_by_id(&self, id: &str) -> Result<Option<ProfileRow>> {
        let filter = format!("eq.{}", id);
        let mut rows: Vec<ProfileRow> = self
            .get_rows(
                "profiles",
                &[("select", "*"), ("id", &filter), ("limit", "1")],
                "资料查询",
            )
            .await?;
        Ok(if rows.is_empty() {
            None
        } else {
            Some(rows.remove(0))
        })
    }

    /// 按邮箱找资料
    pub async fn profile_by_email(&self, email: &str) -> Result<Option<ProfileRow>> {
        let filter = format!("eq.{}", email);
        let mut rows: Vec<ProfileRow> = self
            .get_rows(
                "profiles",
                &[("select", "id,email,name"), ("email", &filter), ("limit", "1")],
                "资料邮箱查询",
            )
            .await?;
        Ok(if rows.is_empty() {
            None
        } else {
            Some(rows.remove(0))
        })
    }

    /// 创建资料
    pub async fn insert_profile(&self, new: &NewProfile<'_>) -> Result<ProfileRow> {
        self.insert_returning("profiles", new, "资料创建").await
    }

    /// 更新资料
    pub async fn update_profile(&self, id: &str, update: &ProfileUpdate) -> Result<ProfileRow> {
        let filter = format!("eq.{}", id);
        let response = self
            .http
            .patch(self.table_url("profiles"))
            .query(&[("id", &filter)])
            .header("Prefer", "return=representation")
            .json(update)
            .send()
            .await
            .context("资料更新请求失败")?;
        let status = response.status();
        let text = response.text().await.context("读取资料更新响应失败")?;
        if !status.is_success() {
            let err = parse_rest_error(status.as_u16(), &text);
            return Err(anyhow::Error::new(err).context("资料更新失败"));
        }
        let mut rows: Vec<ProfileRow> =
            serde_json::from_str(&text).context("资料更新响应解析失败")?;
        if rows.is_empty() {
            anyhow::bail!("资料更新未返回行");
        }
        Ok(rows.remove(0))
    }

    // ── 好友 ───────────────────────────────────────────────

    /// 我添加的好友关系
    pub async fn friendships_of(&self, user_id: &str) -> Result<Vec<FriendshipRow>> {
        let filter = format!("eq.{}", user_id);
        self.get_rows(
            "friendships",
            &[("select", "*"), ("user_id", &filter)],
            "好友关系查询",
        )
        .await
    }

    /// 把我加为好友的关系
    pub async fn friendships_with(&self, friend_id: &str) -> Result<Vec<FriendshipRow>> {
        let filter = format!("eq.{}", friend_id);
        self.get_rows(
            "friendships",
            &[("select", "*"), ("friend_id", &filter)],
            "反向好友关系查询",
        )
        .await
    }

    /// 两人之间是否已有任一方向的好友关系
    pub async fn friendship_between(&self, a: &str, b: &str) -> Result<bool> {
        let or_filter = format!(
            "(and(user_id.eq.{a},friend_id.eq.{b}),and(user_id.eq.{b},friend_id.eq.{a}))",
            a = a,
            b = b
        );
        let rows: Vec<IdRow> = self
            .get_rows(
                "friendships",
                &[("select", "id"), ("or", &or_filter), ("limit", "1")],
                "好友关系存在性查询",
            )
            .await?;
        Ok(!rows.is_empty())
    }

    /// 单向好友关系是否已存在
    pub async fn friendship_exists(&self, user_id: &str, friend_id: &str) -> Result<bool> {
        let user_filter = format!("eq.{}", user_id);
        let friend_filter = format!("eq.{}", friend_id);
        let rows: Vec<IdRow> = self
            .get_rows(
                "friendships",
                &[
                    ("select", "id"),
                    ("user_id", &user_filter),
                    ("friend_id", &friend_filter),
                    ("limit", "1"),
                ],
                "单向好友关系查询",
            )
            .await?;
        Ok(!rows.is_empty())
    }

    /// 建立好友关系
    pub async fn insert_friendship(&self, user_id: &str, friend_id: &str) -> Result<()> {
        self.execute_no_content(
            self.http.post(self.table_url("friendships")).json(
                &serde_json::json!({ "user_id": user_id, "friend_id": friend_id }),
            ),
            "好友关系插入",
        )
        .await
    }

    /// 发给我的待处理好友请求（新到旧）
    pub async fn pending_requests_to(&self, user_id: &str) -> Result<Vec<FriendRequestRow>> {
        let filter = format!("eq.{}", user_id);
        self.get_rows(
            "friend_requests",
            &[
                ("select", "*"),
                ("to_user_id", &filter),
                ("status", "eq.pending"),
                ("order", "created_at.desc"),
            ],
            "好友请求查询",
        )
        .await
    }

    /// 两人之间的既有请求（from → to 方向）
    pub async fn request_between(
        &self,
        from: &str,
        to: &str,
    ) -> Result<Option<FriendRequestRow>> {
        let from_filter = format!("eq.{}", from);
        let to_filter = format!("eq.{}", to);
        let mut rows: Vec<FriendRequestRow> = self
            .get_rows(
                "friend_requests",
                &[
                    ("select", "*"),
                    ("from_user_id", &from_filter),
                    ("to_user_id", &to_filter),
                    ("limit", "1"),
                ],
                "既有请求查询",
            )
            .await?;
        Ok(if rows.is_empty() {
            None
        } else {
            Some(rows.remove(0))
        })
    }

    /// 按 ID 取发给我的请求
    pub async fn request_addressed_to(
        &self,
        request_id: &str,
        to_user_id: &str,
    ) -> Result<Option<FriendRequestRow>> {
        let id_filter = format!("eq.{}", request_id);
        let to_filter = format!("eq.{}", to_user_id);
        let mut rows: Vec<FriendRequestRow> = self
            .get_rows(
                "friend_requests",
                &[
                    ("select", "*"),
                    ("id", &id_filter),
                    ("to_user_id", &to_filter),
                    ("limit", "1"),
                ],
                "请求查询",
            )
            .await?;
        Ok(if rows.is_empty() {
            None
        } else {
            Some(rows.remove(0))
        })
    }

    /// 发送好友请求
    pub async fn insert_request(&self, from: &str, to: &str) -> Result<FriendRequestRow> {
        self.insert_returning(
            "friend_requests",
            &serde_json::json!({
                "from_user_id": from,
                "to_user_id": to,
                "status": "pending",
            }),
            "好友请求发送",
        )
        .await
    }

    /// 更新请求状态；`only_if_to` 给定时附加收件人过滤
    pub async fn update_request_status(
        &self,
        request_id: &str,
        status: &str,
        only_if_to: Option<&str>,
    ) -> Result<()> {
        let id_filter = format!("eq.{}", request_id);
        let mut query: Vec<(&str, String)> = vec![("id", id_filter)];
        if let Some(to) = only_if_to {
            query.push(("to_user_id", format!("eq.{}", to)));
        }
        self.execute_no_content(
            self.http
                .patch(self.table_url("friend_requests"))
                .query(&query)
                .json(&serde_json::json!({
                    "status": status,
                    "updated_at": Utc::now().to_rfc3339(),
                })),
            "请求状态更新",
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_list_formatting() {
        assert_eq!(in_list(&[1i64, 2, 3]), "in.(1,2,3)");
        assert_eq!(in_list(&["a".to_string(), "b".to_string()]), "in.(a,b)");
        assert_eq!(in_list::<i64>(&[]), "in.()");
    }

    #[test]
    fn test_store_construction_without_config() {
        let cfg = ClientConfig::new(String::new(), String::new());
        let store = RestStore::new(&cfg, "").unwrap();
        assert!(!store.is_configured());
    }

    #[test]
    fn test_rpc_missing_codes_cover_observed_backends() {
        for code in ["PGRST202", "42883", "42809"] {
            assert!(RPC_MISSING_CODES.contains(&code));
        }
        assert!(!RPC_MISSING_CODES.contains(&DUPLICATE_ROW_CODE));
    }
}
