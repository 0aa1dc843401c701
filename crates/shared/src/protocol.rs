use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{MessageId, MessageStatus, RoomId, UserId},
    error::ApiError,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderSummary {
    pub id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl SenderSummary {
    pub fn new(id: UserId) -> Self {
        Self {
            id,
            username: None,
            avatar: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastMessageSummary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<SenderSummary>,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSummary {
    pub id: RoomId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<LastMessageSummary>,
}

impl RoomSummary {
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or("Chat")
    }

    pub fn preview(&self) -> &str {
        self.last_message
            .as_ref()
            .map(|last| last.content.as_str())
            .filter(|content| !content.is_empty())
            .unwrap_or("Say hello 👋")
    }
}

/// Message identifier as it appears on the wire.
///
/// Confirmed messages carry a numeric id. Unconfirmed ones carry either the
/// `-1` sentinel or a temporary string such as `temp-1700000000000-42`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireMessageId {
    Numeric(i64),
    Temporary(String),
}

impl WireMessageId {
    pub const PENDING_SENTINEL: i64 = -1;

    pub fn pending() -> Self {
        Self::Numeric(Self::PENDING_SENTINEL)
    }

    pub fn confirmed(&self) -> Option<MessageId> {
        match self {
            Self::Numeric(id) if *id != Self::PENDING_SENTINEL => Some(MessageId(*id)),
            _ => None,
        }
    }
}

impl fmt::Display for WireMessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numeric(id) => write!(f, "{id}"),
            Self::Temporary(id) => f.write_str(id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: WireMessageId,
    pub room_id: RoomId,
    pub sender: SenderSummary,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: MessageStatus,
}

impl MessagePayload {
    pub fn is_confirmed(&self) -> bool {
        self.id.confirmed().is_some()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomListResponse {
    #[serde(default)]
    pub rooms: Vec<RoomSummary>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageHistoryResponse {
    #[serde(default)]
    pub messages: Vec<MessagePayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRoomRequest {
    pub other_user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CreateRoomResponse {
    Wrapped { room: RoomSummary },
    Bare(RoomSummary),
}

impl CreateRoomResponse {
    pub fn into_room(self) -> RoomSummary {
        match self {
            Self::Wrapped { room } | Self::Bare(room) => room,
        }
    }
}

/// Events the client pushes over the realtime channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEmit {
    SendMessage {
        room: RoomId,
        content: String,
        client_temp_ts: i64,
    },
    Typing {
        room: RoomId,
    },
}

/// Events the server pushes over the realtime channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    ReceiveMessage(MessagePayload),
    Typing {
        room_id: RoomId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<UserId>,
    },
    Error(ApiError),
}
