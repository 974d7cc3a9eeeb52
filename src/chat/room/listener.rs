//! 房间列表监听器回调接口

use crate::chat::room::models::RoomWithMeta;
use async_trait::async_trait;

/// 房间列表变化回调
#[async_trait]
pub trait RoomListener: Send + Sync {
    /// 房间列表整体变化（全量快照）
    async fn on_rooms_changed(&self, rooms: Vec<RoomWithMeta>);

    /// 加载状态变化
    async fn on_loading_changed(&self, loading: bool);
}

/// 空实现（默认监听器）
pub struct EmptyRoomListener;

#[async_trait]
impl RoomListener for EmptyRoomListener {
    async fn on_rooms_changed(&self, _rooms: Vec<RoomWithMeta>) {}
    async fn on_loading_changed(&self, _loading: bool) {}
}
