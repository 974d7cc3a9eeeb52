//! 实时变更订阅客户端
//!
//! 在一条 WebSocket 连接上复用多个订阅通道：按 phoenix 协议加入主题、
//! 定时心跳、把行级变更事件分发给各通道的处理器，并向处理器回调连接
//! 生命周期（确认 / 错误 / 超时 / 关闭）

use crate::chat::config::ClientConfig;
use crate::chat::types::{ChangeEvent, ChannelState, EventKind};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{interval, sleep};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

/// WebSocket 写入端类型别名
pub type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

/// WebSocket 读取端类型别名
pub type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// phoenix 协议帧
#[derive(Debug, Serialize, Deserialize)]
struct PhxMessage {
    topic: String,
    event: String,
    payload: serde_json::Value,
    #[serde(rename = "ref")]
    reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    join_ref: Option<String>,
}

/// 行级变更绑定：表 + 事件类型 + 可选服务端过滤
#[derive(Debug, Clone)]
pub struct PgBinding {
    /// "INSERT" / "UPDATE" / "DELETE" / "*"
    pub event: &'static str,
    pub table: String,
    pub filter: Option<String>,
}

impl PgBinding {
    pub fn new(event: &'static str, table: &str) -> Self {
        Self {
            event,
            table: table.to_string(),
            filter: None,
        }
    }

    pub fn with_filter(event: &'static str, table: &str, filter: String) -> Self {
        Self {
            event,
            table: table.to_string(),
            filter: Some(filter),
        }
    }

    fn to_config(&self) -> serde_json::Value {
        let mut obj = serde_json::json!({
            "event": self.event,
            "schema": "public",
            "table": self.table,
        });
        if let Some(filter) = &self.filter {
            obj["filter"] = serde_json::Value::String(filter.clone());
        }
        obj
    }
}

/// 订阅通道说明
#[derive(Debug, Clone)]
pub struct ChannelSpec {
    /// 通道名（主题为 `realtime:<name>`）
    pub name: String,
    /// 是否回送自己触发的广播
    pub broadcast_self: bool,
    /// 加入确认看门狗时长
    pub join_timeout: Duration,
    pub bindings: Vec<PgBinding>,
}

/// 通道事件处理器
#[async_trait]
pub trait ChannelHandler: Send + Sync {
    async fn on_event(&self, event: ChangeEvent);
    async fn on_state(&self, state: ChannelState);
}

struct ChannelEntry {
    handler: Arc<dyn ChannelHandler>,
    confirmed: Arc<AtomicBool>,
}

type ChannelMap = Arc<StdMutex<HashMap<String, ChannelEntry>>>;

fn lock_channels(map: &ChannelMap) -> std::sync::MutexGuard<'_, HashMap<String, ChannelEntry>> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 从 postgres_changes 事件载荷解析行级变更
fn decode_change(data: &serde_json::Value) -> Option<ChangeEvent> {
    let kind_str = data
        .get("type")
        .or_else(|| data.get("eventType"))
        .and_then(|v| v.as_str())?;
    let kind = EventKind::parse(kind_str)?;
    let table = data.get("table").and_then(|v| v.as_str())?.to_string();
    let pick = |keys: [&str; 2]| -> Option<serde_json::Value> {
        for key in keys {
            match data.get(key) {
                Some(serde_json::Value::Null) | None => continue,
                Some(value) => return Some(value.clone()),
            }
        }
        None
    };
    Some(ChangeEvent {
        kind,
        table,
        new: pick(["record", "new"]),
        old: pick(["old_record", "old"]),
    })
}

/// 构造 phx_join 载荷
fn build_join_payload(spec: &ChannelSpec, access_token: &str) -> serde_json::Value {
    serde_json::json!({
        "config": {
            "broadcast": { "self": spec.broadcast_self },
            "postgres_changes": spec
                .bindings
                .iter()
                .map(|b| b.to_config())
                .collect::<Vec<_>>(),
        },
        "access_token": access_token,
    })
}

/// 实时订阅客户端
pub struct RealtimeClient {
    writer: Arc<Mutex<WsWriter>>,
    channels: ChannelMap,
    ref_seq: AtomicU64,
    access_token: String,
    tasks: StdMutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl RealtimeClient {
    /// 建立连接并启动心跳/读取任务
    pub async fn connect(config: &ClientConfig, access_token: &str) -> Result<Self> {
        let url = config.realtime_url();
        info!("[Realtime] 🔗 连接实时服务");
        debug!("[Realtime]   URL: {}", url);

        let (ws_stream, response) = connect_async(&url).await.context("实时服务连接失败")?;
        info!("[Realtime] ✅ 连接成功，状态: {}", response.status());

        let (write, read) = ws_stream.split();
        let writer = Arc::new(Mutex::new(write));
        let channels: ChannelMap = Arc::new(StdMutex::new(HashMap::new()));

        let client = Self {
            writer: writer.clone(),
            channels: channels.clone(),
            ref_seq: AtomicU64::new(0),
            access_token: access_token.to_string(),
            tasks: StdMutex::new(Vec::new()),
        };

        // 心跳：发送失败即认为连接断开，通知所有通道
        let heartbeat_writer = writer.clone();
        let heartbeat_channels = channels.clone();
        let heartbeat_secs = config.heartbeat_secs;
        let heartbeat = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(heartbeat_secs));
            let mut seq: u64 = 0;
            loop {
                ticker.tick().await;
                seq += 1;
                let frame = PhxMessage {
                    topic: "phoenix".to_string(),
                    event: "heartbeat".to_string(),
                    payload: serde_json::json!({}),
                    reference: Some(format!("hb-{}", seq)),
                    join_ref: None,
                };
                let text = match serde_json::to_string(&frame) {
                    Ok(t) => t,
                    Err(_) => continue,
                };
                let mut w = heartbeat_writer.lock().await;
                if w.send(WsMessage::Text(text)).await.is_err() {
                    warn!("[Realtime] 💔 心跳发送失败，连接视为断开");
                    drop(w);
                    notify_all(&heartbeat_channels, ChannelState::Closed).await;
                    break;
                }
            }
        });

        // 读取分发
        let reader_channels = channels.clone();
        let reader = tokio::spawn(async move {
            let mut read = read;
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => {
                        dispatch_frame(&reader_channels, &text).await;
                    }
                    Ok(WsMessage::Close(_)) => {
                        warn!("[Realtime] 🔴 服务器关闭连接");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("[Realtime] ❌ 读取失败: {}", e);
                        break;
                    }
                }
            }
            notify_all(&reader_channels, ChannelState::Closed).await;
        });

        {
            let mut tasks = client
                .tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            tasks.push(heartbeat);
            tasks.push(reader);
        }
        Ok(client)
    }

    fn next_ref(&self) -> String {
        format!("{}", self.ref_seq.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn send_frame(&self, frame: &PhxMessage) -> Result<()> {
        let text = serde_json::to_string(frame).context("帧序列化失败")?;
        let mut w = self.writer.lock().await;
        w.send(WsMessage::Text(text)).await.context("帧发送失败")
    }

    /// 订阅一个通道；确认前由看门狗计时，超时回调 `TimedOut`
    pub async fn subscribe(
        &self,
        spec: ChannelSpec,
        handler: Arc<dyn ChannelHandler>,
    ) -> Result<ChannelHandle> {
        let topic = format!("realtime:{}", spec.name);
        let confirmed = Arc::new(AtomicBool::new(false));
        {
            let mut channels = lock_channels(&self.channels);
            channels.insert(
                topic.clone(),
                ChannelEntry {
                    handler: handler.clone(),
                    confirmed: confirmed.clone(),
                },
            );
        }

        let reference = self.next_ref();
        let join = PhxMessage {
            topic: topic.clone(),
            event: "phx_join".to_string(),
            payload: build_join_payload(&spec, &self.access_token),
            reference: Some(reference.clone()),
            join_ref: Some(reference),
        };
        info!(
            "[Realtime] 📺 加入通道: {}（绑定 {} 个）",
            topic,
            spec.bindings.len()
        );
        self.send_frame(&join).await?;

        // 加入确认看门狗
        let watchdog_confirmed = confirmed.clone();
        let watchdog_handler = handler.clone();
        let watchdog_topic = topic.clone();
        let timeout = spec.join_timeout;
        tokio::spawn(async move {
            sleep(timeout).await;
            if !watchdog_confirmed.load(Ordering::SeqCst) {
                warn!("[Realtime] ⏱️ 通道加入超时: {}", watchdog_topic);
                watchdog_handler.on_state(ChannelState::TimedOut).await;
            }
        });

        Ok(ChannelHandle {
            topic,
            writer: self.writer.clone(),
            channels: self.channels.clone(),
            ref_seq: Arc::new(AtomicU64::new(1000)),
        })
    }

    /// 关闭连接并停止后台任务
    pub async fn shutdown(&self) {
        info!("[Realtime] 🧹 关闭实时连接");
        {
            let mut w = self.writer.lock().await;
            let _ = w.send(WsMessage::Close(None)).await;
        }
        let tasks = {
            let mut guard = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *guard)
        };
        for task in tasks {
            task.abort();
        }
    }
}

/// 已加入通道的句柄，用于退订
pub struct ChannelHandle {
    topic: String,
    writer: Arc<Mutex<WsWriter>>,
    channels: ChannelMap,
    ref_seq: Arc<AtomicU64>,
}

impl ChannelHandle {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// 退出通道并移除路由
    pub async fn leave(&self) {
        debug!("[Realtime] 👋 退出通道: {}", self.topic);
        {
            let mut channels = lock_channels(&self.channels);
            channels.remove(&self.topic);
        }
        let reference = format!("lv-{}", self.ref_seq.fetch_add(1, Ordering::SeqCst));
        let frame = PhxMessage {
            topic: self.topic.clone(),
            event: "phx_leave".to_string(),
            payload: serde_json::json!({}),
            reference: Some(reference),
            join_ref: None,
        };
        if let Ok(text) = serde_json::to_string(&frame) {
            let mut w = self.writer.lock().await;
            let _ = w.send(WsMessage::Text(text)).await;
        }
    }
}

async fn notify_all(channels: &ChannelMap, state: ChannelState) {
    let handlers: Vec<Arc<dyn ChannelHandler>> = {
        let map = lock_channels(channels);
        map.values()
            .map(|entry| {
                entry.confirmed.store(false, Ordering::SeqCst);
                entry.handler.clone()
            })
            .collect()
    };
    for handler in handlers {
        handler.on_state(state).await;
    }
}

async fn dispatch_frame(channels: &ChannelMap, text: &str) {
    let frame: PhxMessage = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            debug!("[Realtime] 帧解析失败: {} ({})", e, text);
            return;
        }
    };

    // 心跳回复不关联任何通道
    if frame.topic == "phoenix" {
        return;
    }

    let (handler, confirmed) = {
        let map = lock_channels(channels);
        match map.get(&frame.topic) {
            Some(entry) => (entry.handler.clone(), entry.confirmed.clone()),
            None => return,
        }
    };

    match frame.event.as_str() {
        "phx_reply" => {
            let status = frame
                .payload
                .get("status")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            if status == "ok" {
                if !confirmed.swap(true, Ordering::SeqCst) {
                    info!("[Realtime] ✅ 通道订阅确认: {}", frame.topic);
                    handler.on_state(ChannelState::Subscribed).await;
                }
            } else {
                error!(
                    "[Realtime] ❌ 通道加入被拒: {} ({})",
                    frame.topic, frame.payload
                );
                handler.on_state(ChannelState::ChannelError).await;
            }
        }
        "postgres_changes" => {
            let data = frame.payload.get("data").unwrap_or(&frame.payload);
            match decode_change(data) {
                Some(event) => {
                    debug!(
                        "[Realtime] 📨 变更事件: topic={}, table={}, kind={:?}",
                        frame.topic, event.table, event.kind
                    );
                    handler.on_event(event).await;
                }
                None => debug!("[Realtime] 忽略无法解析的变更载荷: {}", frame.payload),
            }
        }
        "phx_error" => {
            error!("[Realtime] ❌ 通道错误: {}", frame.topic);
            confirmed.store(false, Ordering::SeqCst);
            handler.on_state(ChannelState::ChannelError).await;
        }
        "phx_close" => {
            warn!("[Realtime] 🔴 通道关闭: {}", frame.topic);
            confirmed.store(false, Ordering::SeqCst);
            handler.on_state(ChannelState::Closed).await;
        }
        "system" => {
            let status = frame
                .payload
                .get("status")
                .and_then(|v| v.as_str())
                .unwrap_or("ok");
            if status == "error" {
                error!("[Realtime] ❌ 系统消息报错: {}", frame.payload);
                handler.on_state(ChannelState::ChannelError).await;
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phx_message_roundtrip() {
        let frame = PhxMessage {
            topic: "realtime:messages:3:1".to_string(),
            event: "phx_join".to_string(),
            payload: serde_json::json!({"a": 1}),
            reference: Some("1".to_string()),
            join_ref: Some("1".to_string()),
        };
        let text = serde_json::to_string(&frame).unwrap();
        let parsed: PhxMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.topic, frame.topic);
        assert_eq!(parsed.reference.as_deref(), Some("1"));
        assert_eq!(parsed.join_ref.as_deref(), Some("1"));
    }

    #[test]
    fn test_incoming_frame_without_join_ref() {
        let parsed: PhxMessage = serde_json::from_str(
            r#"{"topic":"phoenix","event":"phx_reply","payload":{"status":"ok"},"ref":"hb-1"}"#,
        )
        .unwrap();
        assert_eq!(parsed.join_ref, None);
    }

    #[test]
    fn test_decode_change_insert() {
        let data = serde_json::json!({
            "type": "INSERT",
            "table": "messages",
            "record": {"id": "m1", "room_id": 5},
            "old_record": null
        });
        let event = decode_change(&data).unwrap();
        assert_eq!(event.kind, EventKind::Insert);
        assert_eq!(event.table, "messages");
        assert!(event.new.is_some());
        assert!(event.old.is_none());
    }

    #[test]
    fn test_decode_change_delete_event_type_alias() {
        let data = serde_json::json!({
            "eventType": "DELETE",
            "table": "room_participants",
            "old": {"room_id": 2, "user_id": "u1"}
        });
        let event = decode_change(&data).unwrap();
        assert_eq!(event.kind, EventKind::Delete);
        assert!(event.new.is_none());
        assert_eq!(event.old.unwrap()["room_id"], 2);
    }

    #[test]
    fn test_decode_change_rejects_unknown_kind() {
        let data = serde_json::json!({"type": "TRUNCATE", "table": "messages"});
        assert!(decode_change(&data).is_none());
    }

    #[test]
    fn test_join_payload_shape() {
        let spec = ChannelSpec {
            name: "messages:7:1".to_string(),
            broadcast_self: true,
            join_timeout: Duration::from_secs(10),
            bindings: vec![
                PgBinding::with_filter("INSERT", "messages", "room_id=eq.7".to_string()),
                PgBinding::new("UPDATE", "messages"),
            ],
        };
        let payload = build_join_payload(&spec, "tok");
        assert_eq!(payload["access_token"], "tok");
        assert_eq!(payload["config"]["broadcast"]["self"], true);
        let bindings = payload["config"]["postgres_changes"].as_array().unwrap();
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[0]["filter"], "room_id=eq.7");
        assert_eq!(bindings[0]["schema"], "public");
        assert!(bindings[1].get("filter").is_none());
    }
}
