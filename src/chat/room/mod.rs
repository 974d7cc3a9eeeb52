pub mod listener;
pub mod models;
pub mod service;

pub use listener::{EmptyRoomListener, RoomListener};
pub use models::{relative_time_label, RoomSyncerConfig, RoomWithMeta};
pub use service::RoomSyncer;
