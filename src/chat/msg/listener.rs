//! 消息列表监听器回调接口

use crate::chat::msg::models::MessageView;
use async_trait::async_trait;

/// 当前房间消息列表变化回调
#[async_trait]
pub trait MessageListener: Send + Sync {
    /// 消息列表变化（全量快照，时间升序）
    async fn on_messages_changed(&self, messages: Vec<MessageView>);

    /// 加载状态变化
    async fn on_loading_changed(&self, loading: bool);
}

/// 空实现（默认监听器）
pub struct EmptyMessageListener;

#[async_trait]
impl MessageListener for EmptyMessageListener {
    async fn on_messages_changed(&self, _messages: Vec<MessageView>) {}
    async fn on_loading_changed(&self, _loading: bool) {}
}
