use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    NotFound,
    Validation,
    RateLimited,
    #[serde(other)]
    Internal,
}

/// Error pushed by the realtime channel as an `error` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

/// Loose shape of a REST error body. Backends answer with `error`, `msg`
/// (JWT middleware) or `message`, so every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ErrorBody {
    pub fn into_message(self) -> Option<String> {
        self.error.or(self.msg).or(self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_body_prefers_error_then_msg_then_message() {
        let body: ErrorBody =
            serde_json::from_str(r#"{"msg":"Token has expired","message":"ignored"}"#)
                .expect("body");
        assert_eq!(body.into_message().as_deref(), Some("Token has expired"));

        let body: ErrorBody = serde_json::from_str(r#"{"status":"nope"}"#).expect("body");
        assert_eq!(body.into_message(), None);
    }

    #[test]
    fn unknown_error_codes_fall_back_to_internal() {
        let err: ApiError =
            serde_json::from_str(r#"{"code":"room_closed","message":"gone"}"#).expect("error");
        assert_eq!(err.code, ErrorCode::Internal);
        assert_eq!(err.message, "gone");
    }
}
