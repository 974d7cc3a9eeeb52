pub mod auth;
pub mod client;
pub mod config;
pub mod friend;
pub mod msg;
pub mod notify;
pub mod profile;
pub mod realtime;
pub mod room;
pub mod store;
pub mod translate;
pub mod types;

// 重新导出常用入口
pub use auth::{login_async, Session};
pub use client::ChatClient;
pub use config::{ClientConfig, DeviceProfile};
pub use msg::{MessageSyncer, MessageView, SenderRole};
pub use room::{RoomSyncer, RoomWithMeta};
