use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use shared::domain::UserId;

use crate::error::ChatError;

/// Identity accessor handed to every component that needs to know who is
/// talking to the server.
pub trait AuthProvider: Send + Sync {
    fn access_token(&self) -> Option<String>;
    fn current_user_id(&self) -> Option<UserId>;
    fn username(&self) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthContext {
    access_token: Option<String>,
    user_id: Option<UserId>,
    username: Option<String>,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct TokenClaims {
    #[serde(default)]
    sub: Option<Value>,
    #[serde(default)]
    identity: Option<Value>,
    #[serde(default)]
    exp: Option<i64>,
    #[serde(default)]
    username: Option<String>,
}

impl AuthContext {
    pub fn new(access_token: impl Into<String>, user_id: UserId) -> Self {
        Self {
            access_token: Some(access_token.into()),
            user_id: Some(user_id),
            username: None,
            expires_at: None,
        }
    }

    /// Reads the identity out of a JWT access token.
    ///
    /// Only the payload segment is decoded; the signature is the server's
    /// concern. The user id comes from `sub`, or `identity` when `sub` is absent.
    pub fn from_access_token(token: &str) -> Result<Self, ChatError> {
        let token = token.trim();
        let payload = token
            .split('.')
            .nth(1)
            .filter(|segment| !segment.is_empty())
            .ok_or_else(|| {
                ChatError::InvalidToken("expected three dot-separated segments".into())
            })?;
        let bytes = URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .map_err(|err| ChatError::InvalidToken(format!("payload is not base64url: {err}")))?;
        let claims: TokenClaims = serde_json::from_slice(&bytes)
            .map_err(|err| ChatError::InvalidToken(format!("payload is not a claim set: {err}")))?;

        let user_id = claims
            .sub
            .as_ref()
            .and_then(user_id_from_claim)
            .or_else(|| claims.identity.as_ref().and_then(user_id_from_claim))
            .ok_or_else(|| {
                ChatError::InvalidToken("token carries no numeric sub or identity claim".into())
            })?;

        Ok(Self {
            access_token: Some(token.to_string()),
            user_id: Some(user_id),
            username: claims.username,
            expires_at: claims.exp.and_then(|exp| Utc.timestamp_opt(exp, 0).single()),
        })
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }
}

fn user_id_from_claim(value: &Value) -> Option<UserId> {
    match value {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse().ok(),
        Value::Object(fields) => fields.get("id").and_then(|id| match id {
            Value::Number(number) => number.as_i64(),
            Value::String(text) => text.trim().parse().ok(),
            _ => None,
        }),
        _ => None,
    }
    .map(UserId)
}

impl AuthProvider for AuthContext {
    fn access_token(&self) -> Option<String> {
        self.access_token.clone()
    }

    fn current_user_id(&self) -> Option<UserId> {
        self.user_id
    }

    fn username(&self) -> Option<String> {
        self.username.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_with(payload: &str) -> String {
        format!(
            "{}.{}.signature",
            URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#),
            URL_SAFE_NO_PAD.encode(payload)
        )
    }

    #[test]
    fn reads_string_sub_and_expiry() {
        let auth = AuthContext::from_access_token(&token_with(
            r#"{"sub":"42","exp":1700000000,"username":"arsalan"}"#,
        ))
        .expect("token");
        assert_eq!(auth.current_user_id(), Some(UserId(42)));
        assert_eq!(auth.username().as_deref(), Some("arsalan"));

        let before = Utc.timestamp_opt(1_699_999_999, 0).single().expect("time");
        let after = Utc.timestamp_opt(1_700_000_000, 0).single().expect("time");
        assert!(!auth.is_expired(before));
        assert!(auth.is_expired(after));
    }

    #[test]
    fn falls_back_to_identity_claim() {
        let auth = AuthContext::from_access_token(&token_with(r#"{"identity":{"id":9}}"#))
            .expect("token");
        assert_eq!(auth.current_user_id(), Some(UserId(9)));
        assert!(!auth.is_expired(Utc::now()));
    }

    #[test]
    fn rejects_tokens_without_identity() {
        let err = AuthContext::from_access_token(&token_with(r#"{"sub":"alice"}"#))
            .expect_err("non-numeric sub");
        assert!(matches!(err, ChatError::InvalidToken(_)));
        assert!(err.requires_reauth());

        let err = AuthContext::from_access_token("not-a-jwt").expect_err("garbage");
        assert!(matches!(err, ChatError::InvalidToken(_)));
    }
}
