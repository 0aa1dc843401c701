use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("realtime channel is not connected")]
    NotConnected,
    #[error("no active room selected")]
    NoActiveRoom,
    #[error("room history is still loading")]
    HistoryLoading,
    #[error("message content must not be empty")]
    EmptyMessage,
    #[error("not authenticated: {0}")]
    Unauthenticated(String),
    #[error("invalid access token: {0}")]
    InvalidToken(String),
    #[error("unauthorized (status {status})")]
    Unauthorized { status: u16 },
    #[error("server returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid server url: {0}")]
    InvalidUrl(String),
    #[error("malformed payload: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ChatError {
    /// Errors that mean the stored credentials are no longer usable.
    pub fn requires_reauth(&self) -> bool {
        matches!(
            self,
            ChatError::Unauthenticated(_) | ChatError::InvalidToken(_) | ChatError::Unauthorized { .. }
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ChatError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        ChatError::Transport(value.to_string())
    }
}
