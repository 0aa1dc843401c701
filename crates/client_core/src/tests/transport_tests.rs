use std::{
    borrow::Cow,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use super::*;
use anyhow::Result;
use axum::{
    extract::{
        ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde_json::{json, Value};
use shared::domain::RoomId;
use tokio::{net::TcpListener, sync::mpsc};

#[derive(Clone, Copy)]
enum Script {
    /// Pushes one message, then echoes client frames to the test.
    Chat,
    /// Sends a close frame right away.
    CloseWithReason,
    /// Drops the first connection without a close frame.
    DropFirst,
}

#[derive(Clone)]
struct ServerState {
    script: Script,
    connections: Arc<AtomicUsize>,
    received: mpsc::UnboundedSender<Value>,
}

async fn handle_ws(
    State(state): State<ServerState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let authorized = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        == Some("Bearer tok");
    if !authorized {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(move |socket| run_socket(state, socket))
}

async fn run_socket(state: ServerState, mut socket: WebSocket) {
    let connection = state.connections.fetch_add(1, Ordering::SeqCst);
    match state.script {
        Script::Chat => {
            let push = json!({
                "event": "receive_message",
                "data": {"id": 501, "room_id": 42, "sender": {"id": 7}, "content": "hello"}
            });
            if socket
                .send(WsMessage::Text(push.to_string()))
                .await
                .is_err()
            {
                return;
            }
            while let Some(Ok(frame)) = socket.recv().await {
                if let WsMessage::Text(text) = frame {
                    if let Ok(value) = serde_json::from_str(&text) {
                        let _ = state.received.send(value);
                    }
                }
            }
        }
        Script::CloseWithReason => {
            let _ = socket
                .send(WsMessage::Close(Some(CloseFrame {
                    code: 1000,
                    reason: Cow::from("server shutdown"),
                })))
                .await;
            while let Some(Ok(_)) = socket.recv().await {}
        }
        Script::DropFirst => {
            if connection == 0 {
                return;
            }
            while let Some(Ok(_)) = socket.recv().await {}
        }
    }
}

struct TestServer {
    server_url: String,
    connections: Arc<AtomicUsize>,
    received: mpsc::UnboundedReceiver<Value>,
}

async fn spawn_ws_server(script: Script) -> Result<TestServer> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (received_tx, received) = mpsc::unbounded_channel();
    let connections = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route("/ws", get(handle_ws))
        .with_state(ServerState {
            script,
            connections: Arc::clone(&connections),
            received: received_tx,
        });
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(TestServer {
        server_url: format!("http://{addr}"),
        connections,
        received,
    })
}

fn policy(attempts: u32) -> ReconnectPolicy {
    ReconnectPolicy {
        attempts,
        delay: Duration::from_millis(20),
    }
}

async fn next_event(events: &mut broadcast::Receiver<TransportEvent>) -> TransportEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("event within timeout")
        .expect("event")
}

#[test]
fn realtime_url_switches_scheme_and_appends_ws_path() {
    assert_eq!(
        realtime_url("http://localhost:5000").expect("url").as_str(),
        "ws://localhost:5000/ws"
    );
    assert_eq!(
        realtime_url("https://chat.example.com/backend/").expect("url").as_str(),
        "wss://chat.example.com/backend/ws"
    );
    assert_eq!(
        realtime_url("ws://127.0.0.1:9000").expect("url").as_str(),
        "ws://127.0.0.1:9000/ws"
    );
    assert!(matches!(
        realtime_url("ftp://example.com"),
        Err(ChatError::InvalidUrl(_))
    ));
    assert!(matches!(
        realtime_url("not a url"),
        Err(ChatError::InvalidUrl(_))
    ));
}

#[tokio::test]
async fn server_events_are_broadcast_and_emits_use_envelope() {
    let mut server = spawn_ws_server(Script::Chat).await.expect("spawn server");
    let transport = WsTransport::new(&server.server_url, policy(0)).expect("transport");
    let mut events = transport.subscribe();

    transport.connect(Some("tok".into())).await.expect("connect");

    match next_event(&mut events).await {
        TransportEvent::Server(ServerEvent::ReceiveMessage(message)) => {
            assert_eq!(message.room_id, RoomId(42));
            assert_eq!(message.content, "hello");
            assert!(message.is_confirmed());
        }
        other => panic!("unexpected event: {other:?}"),
    }

    transport
        .emit(&ClientEmit::Typing { room: RoomId(42) })
        .await
        .expect("emit");
    let frame = tokio::time::timeout(Duration::from_secs(5), server.received.recv())
        .await
        .expect("frame within timeout")
        .expect("frame");
    assert_eq!(frame, json!({"event": "typing", "data": {"room": 42}}));

    transport.disconnect().await.expect("disconnect");
    assert!(matches!(
        transport.emit(&ClientEmit::Typing { room: RoomId(42) }).await,
        Err(ChatError::NotConnected)
    ));
}

#[tokio::test]
async fn emit_before_connect_is_rejected() {
    let transport = WsTransport::new("http://127.0.0.1:1", policy(0)).expect("transport");
    assert!(matches!(
        transport.emit(&ClientEmit::Typing { room: RoomId(1) }).await,
        Err(ChatError::NotConnected)
    ));
}

#[tokio::test]
async fn handshake_without_token_is_refused() {
    let server = spawn_ws_server(Script::Chat).await.expect("spawn server");
    let transport = WsTransport::new(&server.server_url, policy(0)).expect("transport");

    let err = transport.connect(None).await.expect_err("must be refused");

    assert!(matches!(err, ChatError::Transport(_)));
    assert_eq!(server.connections.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn server_close_frame_ends_the_session() {
    let server = spawn_ws_server(Script::CloseWithReason)
        .await
        .expect("spawn server");
    let transport = WsTransport::new(&server.server_url, policy(3)).expect("transport");
    let mut events = transport.subscribe();

    transport.connect(Some("tok".into())).await.expect("connect");

    match next_event(&mut events).await {
        TransportEvent::Closed { reason } => {
            assert_eq!(reason.as_deref(), Some("server shutdown"));
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(server.connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn dropped_connection_is_redialed() {
    let server = spawn_ws_server(Script::DropFirst).await.expect("spawn server");
    let transport = WsTransport::new(&server.server_url, policy(3)).expect("transport");
    let mut events = transport.subscribe();

    transport.connect(Some("tok".into())).await.expect("connect");

    assert!(matches!(
        next_event(&mut events).await,
        TransportEvent::Reconnecting
    ));
    assert!(matches!(
        next_event(&mut events).await,
        TransportEvent::Reconnected
    ));
    assert_eq!(server.connections.load(Ordering::SeqCst), 2);
    transport
        .emit(&ClientEmit::Typing { room: RoomId(1) })
        .await
        .expect("emit after reconnect");
}
