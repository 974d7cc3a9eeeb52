pub mod chat;

// 重新导出常用类型和函数，方便外部使用
pub use chat::{
    client::ChatClient,
    config::{ClientConfig, DeviceProfile},
    login_async,
    msg::{MessageSyncer, MessageView, SenderRole},
    room::{RoomSyncer, RoomWithMeta},
};
