pub mod listener;
pub mod models;
pub mod service;

pub use listener::{EmptyMessageListener, MessageListener};
pub use models::{MessageView, MsgSyncerConfig, SenderRole, SyncPhase, Transport};
pub use service::MessageSyncer;
