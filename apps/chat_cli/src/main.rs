mod command;

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use client_core::{
    config::load_settings, AuthContext, ChatError, ChatEvent, ChatSession, HistoryView, HttpChatApi,
    RoomListView, TimelineChange, TimelineEntry, WsTransport,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::command::Command;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "chat.toml")]
    config: PathBuf,
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    token: Option<String>,
    /// Room to open right after connecting.
    #[arg(long)]
    room: Option<i64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut settings = load_settings(Some(args.config.as_path()))?;
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }
    if let Some(token) = args.token {
        settings.access_token = Some(token);
    }
    let token = settings
        .access_token
        .clone()
        .context("no access token; pass --token or set CHAT_ACCESS_TOKEN")?;

    let auth = Arc::new(AuthContext::from_access_token(&token)?);
    if auth.is_expired(Utc::now()) {
        warn!("access token has expired; the server will likely reject it");
    }
    let api = Arc::new(HttpChatApi::new(
        settings.server_url.clone(),
        auth.clone(),
        settings.request_timeout(),
    )?);
    let transport = Arc::new(WsTransport::new(
        &settings.server_url,
        settings.reconnect_policy(),
    )?);
    info!(server_url = %settings.server_url, realtime_url = %transport.url(), "starting chat client");

    let session = ChatSession::new(api, transport, auth, settings.session_timing());
    let printer = tokio::spawn(print_events(Arc::clone(&session)));

    if let Err(err) = session.open().await {
        warn!(%err, "realtime channel unavailable; sending is disabled");
        hint_reauth(&err);
    }
    print_rooms(&session.load_rooms().await);
    if let Some(room) = args.room {
        if let Err(err) = session.select_room(shared::domain::RoomId(room)).await {
            hint_reauth(&err);
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let command = match Command::parse(&line) {
            Ok(command) => command,
            Err(err) => {
                println!("! {err}");
                continue;
            }
        };
        match command {
            Command::Blank => {}
            Command::Quit => break,
            Command::Rooms => print_rooms(&session.load_rooms().await),
            Command::Open(room_id) => {
                if let Err(err) = session.select_room(room_id).await {
                    hint_reauth(&err);
                }
            }
            Command::With(user_id) => match session.open_room_with(user_id).await {
                Ok(room) => println!("opened {} (#{})", room.display_name(), room.id),
                Err(err) => hint_reauth(&err),
            },
            Command::History => print_history(&session).await,
            Command::Typing => {
                if let Err(err) = session.notify_typing().await {
                    println!("! {err}");
                }
            }
            Command::Send(text) => {
                if let Err(err) = session.send_message(&text).await {
                    println!("! {err}");
                    hint_reauth(&err);
                }
            }
        }
    }

    session.close().await;
    printer.abort();
    Ok(())
}

/// Failures are already reported through session events; this only adds the
/// next step when the stored token is the problem.
fn hint_reauth(err: &ChatError) {
    if err.requires_reauth() {
        println!("! your session has expired; restart with a fresh --token");
    }
}

async fn print_events(session: Arc<ChatSession>) {
    let mut events = session.subscribe_events();
    let me = session.current_user_id();
    while let Ok(event) = events.recv().await {
        match event {
            ChatEvent::ConnectionChanged(state) => println!("* connection: {state:?}"),
            ChatEvent::RoomsChanged(_) => {}
            ChatEvent::HistoryLoaded { .. } => print_history(&session).await,
            ChatEvent::TimelineUpdated { change, .. } => {
                let index = match change {
                    TimelineChange::PendingAdded { index, .. }
                    | TimelineChange::Confirmed { index }
                    | TimelineChange::Appended { index }
                    | TimelineChange::Failed { index } => index,
                };
                if let Some(entry) = session.messages().await.get(index) {
                    println!("{}", render_entry(entry, me));
                }
            }
            ChatEvent::TypingChanged { typing: true, .. } => println!("* typing…"),
            ChatEvent::TypingChanged { typing: false, .. } => {}
            ChatEvent::Error(message) => println!("! {message}"),
        }
    }
}

fn print_rooms(view: &RoomListView) {
    match view {
        RoomListView::Loading => println!("* loading rooms…"),
        RoomListView::Empty => println!("* no chats yet"),
        RoomListView::Ready(rooms) => {
            for room in rooms {
                println!("#{:<6} {:<20} {}", room.id, room.display_name(), room.preview());
            }
        }
    }
}

async fn print_history(session: &ChatSession) {
    match session.history_view().await {
        HistoryView::NoRoom => println!("* select a chat with /open <room>"),
        HistoryView::Loading(room_id) => println!("* loading #{room_id}…"),
        HistoryView::Empty(room_id) => println!("* #{room_id}: no messages yet"),
        HistoryView::Ready(room_id) => {
            println!("* #{room_id}");
            let me = session.current_user_id();
            for entry in session.messages().await {
                println!("{}", render_entry(&entry, me));
            }
        }
    }
}

fn render_entry(entry: &TimelineEntry, me: Option<shared::domain::UserId>) -> String {
    let message = &entry.message;
    let time = message
        .created_at
        .map(|at| at.format("%H:%M").to_string())
        .unwrap_or_default();
    if entry.is_mine(me) {
        format!(
            "{time:>5} me: {} {}",
            message.content,
            message.status.ticks()
        )
    } else {
        let sender = message
            .sender
            .username
            .clone()
            .unwrap_or_else(|| format!("user {}", message.sender.id));
        format!("{time:>5} {sender}: {}", message.content)
    }
}
