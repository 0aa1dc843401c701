use shared::domain::RoomId;

pub mod auth;
pub mod config;
pub mod error;
pub mod protocol_client;
mod session;
pub mod timeline;
pub mod transport;
mod typing;

pub use auth::{AuthContext, AuthProvider};
pub use config::{ClientSettings, SessionTiming};
pub use error::ChatError;
pub use protocol_client::{ChatApi, HttpChatApi};
pub use session::{ChatSession, HistoryView, RoomListView};
pub use timeline::TimelineEntry;
pub use transport::{RealtimeTransport, TransportEvent, WsTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// What happened to the active room's message sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimelineChange {
    PendingAdded { index: usize, client_temp_ts: i64 },
    Confirmed { index: usize },
    Appended { index: usize },
    Failed { index: usize },
}

#[derive(Debug, Clone)]
pub enum ChatEvent {
    ConnectionChanged(ConnectionState),
    RoomsChanged(RoomListView),
    HistoryLoaded { room_id: RoomId, count: usize },
    TimelineUpdated { room_id: RoomId, change: TimelineChange },
    TypingChanged { room_id: RoomId, typing: bool },
    Error(String),
}
