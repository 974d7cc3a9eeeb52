//! 好友监听器回调接口

use crate::chat::friend::models::{FriendEntry, FriendRequestView};
use async_trait::async_trait;

/// 好友列表 / 好友请求变化回调
#[async_trait]
pub trait FriendListener: Send + Sync {
    async fn on_friends_changed(&self, friends: Vec<FriendEntry>);
    async fn on_requests_changed(&self, requests: Vec<FriendRequestView>);
    async fn on_loading_changed(&self, loading: bool);
}

/// 空实现（默认监听器）
pub struct EmptyFriendListener;

#[async_trait]
impl FriendListener for EmptyFriendListener {
    async fn on_friends_changed(&self, _friends: Vec<FriendEntry>) {}
    async fn on_requests_changed(&self, _requests: Vec<FriendRequestView>) {}
    async fn on_loading_changed(&self, _loading: bool) {}
}
