use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use shared::{
    domain::{RoomId, UserId},
    error::ErrorBody,
    protocol::{
        CreateRoomRequest, CreateRoomResponse, MessageHistoryResponse, MessagePayload,
        RoomListResponse, RoomSummary,
    },
};
use tracing::debug;

use crate::{auth::AuthProvider, error::ChatError};

/// REST side of the chat backend.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn list_rooms(&self) -> Result<Vec<RoomSummary>, ChatError>;
    async fn fetch_history(&self, room_id: RoomId) -> Result<Vec<MessagePayload>, ChatError>;
    async fn create_room(&self, other_user_id: UserId) -> Result<RoomSummary, ChatError>;
}

pub struct HttpChatApi {
    http: Client,
    server_url: String,
    auth: Arc<dyn AuthProvider>,
}

impl HttpChatApi {
    pub fn new(
        server_url: impl Into<String>,
        auth: Arc<dyn AuthProvider>,
        timeout: Duration,
    ) -> Result<Self, ChatError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            server_url: server_url.into().trim_end_matches('/').to_string(),
            auth,
        })
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match self.auth.access_token() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ChatError> {
        let url = format!("{}{path}", self.server_url);
        debug!(%url, "chat api: GET");
        let response = self.authorized(self.http.get(&url)).send().await?;
        decode_response(response).await
    }
}

async fn decode_response<T: DeserializeOwned>(response: Response) -> Result<T, ChatError> {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(ChatError::Unauthorized {
            status: status.as_u16(),
        });
    }
    if !status.is_success() {
        let raw = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&raw)
            .ok()
            .and_then(ErrorBody::into_message)
            .unwrap_or_else(|| {
                status
                    .canonical_reason()
                    .unwrap_or("request failed")
                    .to_string()
            });
        return Err(ChatError::Api {
            status: status.as_u16(),
            message,
        });
    }
    let bytes = response.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn list_rooms(&self) -> Result<Vec<RoomSummary>, ChatError> {
        let body: RoomListResponse = self.get_json("/api/chats").await?;
        Ok(body.rooms)
    }

    async fn fetch_history(&self, room_id: RoomId) -> Result<Vec<MessagePayload>, ChatError> {
        let body: MessageHistoryResponse = self
            .get_json(&format!("/api/chats/{}/messages", room_id.0))
            .await?;
        Ok(body.messages)
    }

    async fn create_room(&self, other_user_id: UserId) -> Result<RoomSummary, ChatError> {
        let url = format!("{}/api/chats/create_room", self.server_url);
        let response = self
            .authorized(self.http.post(&url))
            .json(&CreateRoomRequest { other_user_id })
            .send()
            .await?;
        let body: CreateRoomResponse = decode_response(response).await?;
        Ok(body.into_room())
    }
}

#[cfg(test)]
#[path = "tests/protocol_client_tests.rs"]
mod tests;
