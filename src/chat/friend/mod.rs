pub mod listener;
pub mod models;
pub mod service;

pub use listener::{EmptyFriendListener, FriendListener};
pub use models::{FriendEntry, FriendRequestView, FriendSyncerConfig};
pub use service::FriendSyncer;
