use std::sync::Arc;

use async_trait::async_trait;
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use shared::protocol::{ClientEmit, ServerEvent};
use tokio::{
    net::TcpStream,
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{config::ReconnectPolicy, error::ChatError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

#[derive(Debug, Clone)]
pub enum TransportEvent {
    Server(ServerEvent),
    /// The link dropped and is being redialed; emits fail until `Reconnected`.
    Reconnecting,
    /// The link dropped and was re-established without caller involvement.
    Reconnected,
    /// The link is gone for good; the caller has to connect again.
    Closed { reason: Option<String> },
}

/// Bidirectional event channel to the chat backend.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    async fn connect(&self, access_token: Option<String>) -> Result<(), ChatError>;
    async fn emit(&self, event: &ClientEmit) -> Result<(), ChatError>;
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
    async fn disconnect(&self) -> Result<(), ChatError>;
}

/// Maps the REST base url onto the realtime endpoint (`http → ws`, `https → wss`, `/ws`).
pub fn realtime_url(server_url: &str) -> Result<Url, ChatError> {
    let mut url = Url::parse(server_url)
        .map_err(|err| ChatError::InvalidUrl(format!("{server_url}: {err}")))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(ChatError::InvalidUrl(format!(
                "unsupported scheme '{other}' in {server_url}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|()| ChatError::InvalidUrl(format!("cannot switch {server_url} to {scheme}")))?;
    let path = format!("{}/ws", url.path().trim_end_matches('/'));
    url.set_path(&path);
    Ok(url)
}

struct WsShared {
    writer: Mutex<Option<WsWriter>>,
    events: broadcast::Sender<TransportEvent>,
}

pub struct WsTransport {
    url: Url,
    reconnect: ReconnectPolicy,
    shared: Arc<WsShared>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl WsTransport {
    pub fn new(server_url: &str, reconnect: ReconnectPolicy) -> Result<Self, ChatError> {
        let (events, _) = broadcast::channel(1024);
        Ok(Self {
            url: realtime_url(server_url)?,
            reconnect,
            shared: Arc::new(WsShared {
                writer: Mutex::new(None),
                events,
            }),
            reader_task: Mutex::new(None),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    async fn stop_reader(&self) {
        if let Some(task) = self.reader_task.lock().await.take() {
            task.abort();
        }
    }
}

async fn dial(url: &Url, access_token: Option<&str>) -> Result<WsStream, ChatError> {
    let mut request = url.as_str().into_client_request()?;
    if let Some(token) = access_token {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|err| ChatError::Transport(format!("invalid authorization header: {err}")))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }
    let (stream, _) = connect_async(request).await?;
    Ok(stream)
}

enum ReadEnd {
    ClosedByServer(Option<String>),
    Dropped(String),
}

async fn pump(shared: &WsShared, reader: &mut WsReader) -> ReadEnd {
    while let Some(frame) = reader.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                Ok(event) => {
                    let _ = shared.events.send(TransportEvent::Server(event));
                }
                Err(err) => warn!(%err, "realtime: ignoring malformed server event"),
            },
            Ok(Message::Close(frame)) => {
                let reason = frame
                    .map(|frame| frame.reason.to_string())
                    .filter(|reason| !reason.is_empty());
                return ReadEnd::ClosedByServer(reason);
            }
            Ok(_) => {}
            Err(err) => return ReadEnd::Dropped(err.to_string()),
        }
    }
    ReadEnd::Dropped("stream ended".into())
}

async fn redial(url: &Url, access_token: Option<&str>, policy: ReconnectPolicy) -> Option<WsStream> {
    for attempt in 1..=policy.attempts {
        tokio::time::sleep(policy.delay).await;
        match dial(url, access_token).await {
            Ok(stream) => {
                info!(attempt, "realtime: reconnected");
                return Some(stream);
            }
            Err(err) => warn!(attempt, %err, "realtime: reconnect attempt failed"),
        }
    }
    None
}

async fn run_reader(
    shared: Arc<WsShared>,
    mut reader: WsReader,
    url: Url,
    access_token: Option<String>,
    policy: ReconnectPolicy,
) {
    loop {
        match pump(&shared, &mut reader).await {
            ReadEnd::ClosedByServer(reason) => {
                info!(reason = reason.as_deref().unwrap_or(""), "realtime: server closed the connection");
                shared.writer.lock().await.take();
                let _ = shared.events.send(TransportEvent::Closed { reason });
                return;
            }
            ReadEnd::Dropped(reason) => {
                warn!(%reason, "realtime: connection dropped");
                shared.writer.lock().await.take();
                if policy.attempts > 0 {
                    let _ = shared.events.send(TransportEvent::Reconnecting);
                }
                let Some(stream) = redial(&url, access_token.as_deref(), policy).await else {
                    let _ = shared.events.send(TransportEvent::Closed {
                        reason: Some(reason),
                    });
                    return;
                };
                let (writer, next_reader) = stream.split();
                *shared.writer.lock().await = Some(writer);
                reader = next_reader;
                let _ = shared.events.send(TransportEvent::Reconnected);
            }
        }
    }
}

#[async_trait]
impl RealtimeTransport for WsTransport {
    async fn connect(&self, access_token: Option<String>) -> Result<(), ChatError> {
        self.stop_reader().await;
        let stream = dial(&self.url, access_token.as_deref()).await?;
        let (writer, reader) = stream.split();
        *self.shared.writer.lock().await = Some(writer);

        let task = tokio::spawn(run_reader(
            Arc::clone(&self.shared),
            reader,
            self.url.clone(),
            access_token,
            self.reconnect,
        ));
        *self.reader_task.lock().await = Some(task);
        info!(url = %self.url, "realtime: connected");
        Ok(())
    }

    async fn emit(&self, event: &ClientEmit) -> Result<(), ChatError> {
        let payload = serde_json::to_string(event)?;
        let mut guard = self.shared.writer.lock().await;
        let writer = guard.as_mut().ok_or(ChatError::NotConnected)?;
        writer.send(Message::Text(payload)).await?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.shared.events.subscribe()
    }

    async fn disconnect(&self) -> Result<(), ChatError> {
        self.stop_reader().await;
        if let Some(mut writer) = self.shared.writer.lock().await.take() {
            if let Err(err) = writer.send(Message::Close(None)).await {
                debug!(%err, "realtime: close frame not delivered");
            }
            let _ = writer.close().await;
        }
        info!(url = %self.url, "realtime: disconnected");
        Ok(())
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
