pub mod api;
pub mod types;

pub use api::RestStore;
pub use types::{
    FriendRequestRow, FriendshipRow, LastMessageRow, MessageRow, NewMessage, NewProfile,
    ParticipantChange, ProfileRow, ProfileUpdate, RoomKind, RoomRow,
};
