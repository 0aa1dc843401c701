use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(RoomId);
id_newtype!(MessageId);

/// Delivery state of a chat message as shown next to the bubble.
///
/// `Failed` never comes from the server; the client sets it when an optimistic
/// message gives up waiting for its confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sending,
    #[default]
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    /// Tick marks rendered for the author's own messages.
    pub fn ticks(self) -> &'static str {
        match self {
            MessageStatus::Sending => "…",
            MessageStatus::Sent => "✓",
            MessageStatus::Delivered | MessageStatus::Read => "✓✓",
            MessageStatus::Failed => "!",
        }
    }
}
