use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Weak},
    time::Duration,
};

use chrono::Utc;
use shared::{
    domain::{MessageId, RoomId, UserId},
    protocol::{ClientEmit, MessagePayload, RoomSummary, SenderSummary, ServerEvent},
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, error, info, warn};

use crate::{
    auth::AuthProvider,
    config::SessionTiming,
    error::ChatError,
    protocol_client::ChatApi,
    timeline::{MergeOutcome, MessageTimeline, TimelineEntry},
    transport::{RealtimeTransport, TransportEvent},
    typing::{TypingIndicator, TypingThrottle},
    ChatEvent, ConnectionState, TimelineChange,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomListView {
    /// Request in flight; render skeleton rows.
    Loading,
    Empty,
    Ready(Vec<RoomSummary>),
}

impl RoomListView {
    fn from_rooms(rooms: Vec<RoomSummary>) -> Self {
        if rooms.is_empty() {
            Self::Empty
        } else {
            Self::Ready(rooms)
        }
    }

    pub fn rooms(&self) -> &[RoomSummary] {
        match self {
            Self::Ready(rooms) => rooms,
            Self::Loading | Self::Empty => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryView {
    NoRoom,
    Loading(RoomId),
    Empty(RoomId),
    Ready(RoomId),
}

/// Inbound listener bound to one active-room scope. Dropping it stops the
/// listener, so replacing the session's subscription never leaves two alive.
struct RoomSubscription {
    room_id: Option<RoomId>,
    task: JoinHandle<()>,
}

impl RoomSubscription {
    fn open(
        session: &Arc<ChatSession>,
        room_id: Option<RoomId>,
        mut events: broadcast::Receiver<TransportEvent>,
    ) -> Self {
        let session = Arc::downgrade(session);
        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let Some(session) = session.upgrade() else {
                            break;
                        };
                        session.handle_transport_event(event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "chat: realtime listener lagged behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        debug!(room_id = ?room_id.map(|room| room.0), "chat: realtime subscription opened");
        Self { room_id, task }
    }
}

impl Drop for RoomSubscription {
    fn drop(&mut self) {
        self.task.abort();
        debug!(room_id = ?self.room_id.map(|room| room.0), "chat: realtime subscription closed");
    }
}

struct SessionState {
    connection: ConnectionState,
    mounted: bool,
    rooms: RoomListView,
    active_room: Option<RoomId>,
    /// Bumped on every room selection; responses and timers from an older
    /// generation are ignored.
    generation: u64,
    history_loading: bool,
    /// Active-room messages received while its history is in flight.
    buffered: Vec<MessagePayload>,
    timeline: MessageTimeline,
    typing: TypingIndicator,
    typing_throttle: TypingThrottle,
    pending_timers: HashMap<i64, JoinHandle<()>>,
    subscription: Option<RoomSubscription>,
}

impl SessionState {
    fn new(timing: &SessionTiming) -> Self {
        Self {
            connection: ConnectionState::Disconnected,
            mounted: true,
            rooms: RoomListView::Loading,
            active_room: None,
            generation: 0,
            history_loading: false,
            buffered: Vec::new(),
            timeline: MessageTimeline::new(),
            typing: TypingIndicator::default(),
            typing_throttle: TypingThrottle::new(timing.typing_throttle),
            pending_timers: HashMap::new(),
            subscription: None,
        }
    }

    fn abort_pending_timers(&mut self) {
        for (_, timer) in self.pending_timers.drain() {
            timer.abort();
        }
    }

    /// Installs the loaded history and folds in what arrived meanwhile.
    /// Buffered messages already present in the snapshot are skipped.
    fn finish_history(&mut self, messages: Vec<MessagePayload>) -> usize {
        self.history_loading = false;
        let known: HashSet<MessageId> = messages
            .iter()
            .filter_map(|message| message.id.confirmed())
            .collect();
        self.timeline.replace_history(messages);
        let mut replayed = 0;
        for message in std::mem::take(&mut self.buffered) {
            if message.id.confirmed().is_some_and(|id| known.contains(&id)) {
                continue;
            }
            self.timeline.merge_incoming(message);
            replayed += 1;
        }
        replayed
    }

    /// Leaves the previous room: sequence, typing state and timers go.
    /// Returns the room whose typing flag was switched off, if any.
    fn leave_room(&mut self) -> Option<RoomId> {
        self.generation += 1;
        self.active_room = None;
        self.history_loading = false;
        self.buffered.clear();
        self.timeline.clear();
        self.typing_throttle.reset();
        self.abort_pending_timers();
        self.typing.reset()
    }
}

/// Client side of one chat view: room list, active room history, realtime
/// subscription, optimistic sends and typing indicators.
pub struct ChatSession {
    api: Arc<dyn ChatApi>,
    transport: Arc<dyn RealtimeTransport>,
    auth: Arc<dyn AuthProvider>,
    timing: SessionTiming,
    inner: Mutex<SessionState>,
    events: broadcast::Sender<ChatEvent>,
}

impl ChatSession {
    pub fn new(
        api: Arc<dyn ChatApi>,
        transport: Arc<dyn RealtimeTransport>,
        auth: Arc<dyn AuthProvider>,
        timing: SessionTiming,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            api,
            transport,
            auth,
            inner: Mutex::new(SessionState::new(&timing)),
            timing,
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    pub fn current_user_id(&self) -> Option<UserId> {
        self.auth.current_user_id()
    }

    fn publish(&self, event: ChatEvent) {
        let _ = self.events.send(event);
    }

    /// Connects the realtime channel. A failure is logged and leaves the
    /// session inert until the next `open`.
    pub async fn open(self: &Arc<Self>) -> Result<(), ChatError> {
        {
            let mut guard = self.inner.lock().await;
            guard.mounted = true;
            if guard.connection != ConnectionState::Disconnected {
                return Ok(());
            }
            guard.connection = ConnectionState::Connecting;
        }
        self.publish(ChatEvent::ConnectionChanged(ConnectionState::Connecting));

        let events = self.transport.subscribe();
        let result = self.transport.connect(self.auth.access_token()).await;

        let mut guard = self.inner.lock().await;
        match result {
            Ok(()) if !guard.mounted => {
                guard.connection = ConnectionState::Disconnected;
                drop(guard);
                debug!("chat: session closed while connecting; dropping connection");
                let _ = self.transport.disconnect().await;
                self.publish(ChatEvent::ConnectionChanged(ConnectionState::Disconnected));
                Ok(())
            }
            Ok(()) => {
                guard.connection = ConnectionState::Connected;
                guard.subscription = Some(RoomSubscription::open(self, guard.active_room, events));
                drop(guard);
                info!("chat: realtime channel connected");
                self.publish(ChatEvent::ConnectionChanged(ConnectionState::Connected));
                Ok(())
            }
            Err(err) => {
                guard.connection = ConnectionState::Disconnected;
                drop(guard);
                error!(%err, "chat: realtime channel failed to connect");
                self.publish(ChatEvent::ConnectionChanged(ConnectionState::Disconnected));
                self.publish(ChatEvent::Error(format!("realtime connect failed: {err}")));
                Err(err)
            }
        }
    }

    /// Tears the view down: listener, timers and connection. `open` may be
    /// called again afterwards.
    pub async fn close(&self) {
        let previous = {
            let mut guard = self.inner.lock().await;
            guard.mounted = false;
            guard.subscription = None;
            guard.leave_room();
            guard.rooms = RoomListView::Loading;
            std::mem::replace(&mut guard.connection, ConnectionState::Disconnected)
        };
        if let Err(err) = self.transport.disconnect().await {
            warn!(%err, "chat: realtime disconnect failed");
        }
        if previous != ConnectionState::Disconnected {
            self.publish(ChatEvent::ConnectionChanged(ConnectionState::Disconnected));
        }
        info!("chat: session closed");
    }

    pub async fn load_rooms(&self) -> RoomListView {
        self.inner.lock().await.rooms = RoomListView::Loading;
        self.publish(ChatEvent::RoomsChanged(RoomListView::Loading));

        let result = self.api.list_rooms().await;

        let mut guard = self.inner.lock().await;
        if !guard.mounted {
            debug!("chat: discarding room list for a closed session");
            return guard.rooms.clone();
        }
        let view = match result {
            Ok(rooms) => {
                info!(count = rooms.len(), "chat: rooms loaded");
                RoomListView::from_rooms(rooms)
            }
            Err(err) => {
                error!(%err, "chat: failed to load rooms");
                self.publish(ChatEvent::Error(format!("failed to load rooms: {err}")));
                RoomListView::Empty
            }
        };
        guard.rooms = view.clone();
        drop(guard);
        self.publish(ChatEvent::RoomsChanged(view.clone()));
        view
    }

    /// Makes `room_id` the active room and loads its full history, replacing
    /// whatever the previous room showed.
    pub async fn select_room(self: &Arc<Self>, room_id: RoomId) -> Result<(), ChatError> {
        let (generation, typing_cleared) = {
            let mut guard = self.inner.lock().await;
            let typing_cleared = guard.leave_room();
            guard.active_room = Some(room_id);
            guard.history_loading = true;
            if guard.connection == ConnectionState::Connected {
                guard.subscription = None;
                guard.subscription = Some(RoomSubscription::open(
                    self,
                    Some(room_id),
                    self.transport.subscribe(),
                ));
            }
            (guard.generation, typing_cleared)
        };
        if let Some(previous) = typing_cleared {
            self.publish(ChatEvent::TypingChanged {
                room_id: previous,
                typing: false,
            });
        }
        info!(room_id = room_id.0, "chat: room selected");

        let result = self.api.fetch_history(room_id).await;

        let mut guard = self.inner.lock().await;
        if guard.generation != generation {
            debug!(room_id = room_id.0, "chat: discarding stale history response");
            return Ok(());
        }
        match result {
            Ok(messages) => {
                let replayed = guard.finish_history(messages);
                let count = guard.timeline.len();
                drop(guard);
                if replayed > 0 {
                    debug!(
                        room_id = room_id.0,
                        replayed, "chat: replayed messages received during load"
                    );
                }
                self.publish(ChatEvent::HistoryLoaded { room_id, count });
                Ok(())
            }
            Err(err) => {
                let count = guard.finish_history(Vec::new());
                drop(guard);
                error!(room_id = room_id.0, %err, "chat: failed to load history");
                self.publish(ChatEvent::Error(format!(
                    "failed to load messages for room {}: {err}",
                    room_id.0
                )));
                self.publish(ChatEvent::HistoryLoaded { room_id, count });
                Err(err)
            }
        }
    }

    /// Creates (or fetches) the direct room with another user and opens it.
    pub async fn open_room_with(
        self: &Arc<Self>,
        other_user_id: UserId,
    ) -> Result<RoomSummary, ChatError> {
        let room = match self.api.create_room(other_user_id).await {
            Ok(room) => room,
            Err(err) => {
                error!(other_user_id = other_user_id.0, %err, "chat: failed to create room");
                self.publish(ChatEvent::Error(format!("failed to open chat: {err}")));
                return Err(err);
            }
        };

        let view = {
            let mut guard = self.inner.lock().await;
            let mut rooms = guard.rooms.rooms().to_vec();
            if !rooms.iter().any(|existing| existing.id == room.id) {
                rooms.insert(0, room.clone());
            }
            guard.rooms = RoomListView::Ready(rooms);
            guard.rooms.clone()
        };
        self.publish(ChatEvent::RoomsChanged(view));

        self.select_room(room.id).await?;
        Ok(room)
    }

    /// Appends an optimistic entry and emits it to the server. Returns the
    /// entry's local timestamp.
    pub async fn send_message(self: &Arc<Self>, text: &str) -> Result<i64, ChatError> {
        if text.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let user_id = self
            .auth
            .current_user_id()
            .ok_or_else(|| ChatError::Unauthenticated("no current user".into()))?;

        let (room_id, index, client_temp_ts) = {
            let mut guard = self.inner.lock().await;
            if guard.connection != ConnectionState::Connected {
                return Err(ChatError::NotConnected);
            }
            let room_id = guard.active_room.ok_or(ChatError::NoActiveRoom)?;
            if guard.history_loading {
                return Err(ChatError::HistoryLoading);
            }
            let sender = SenderSummary {
                username: self.auth.username(),
                ..SenderSummary::new(user_id)
            };
            let (index, client_temp_ts) =
                guard
                    .timeline
                    .push_pending(room_id, sender, text.to_string(), Utc::now());
            if let Some(timeout) = self.timing.pending_timeout {
                let timer = self.spawn_pending_timeout(guard.generation, client_temp_ts, timeout);
                guard.pending_timers.insert(client_temp_ts, timer);
            }
            (room_id, index, client_temp_ts)
        };
        self.publish(ChatEvent::TimelineUpdated {
            room_id,
            change: TimelineChange::PendingAdded {
                index,
                client_temp_ts,
            },
        });

        let emitted = self
            .transport
            .emit(&ClientEmit::SendMessage {
                room: room_id,
                content: text.to_string(),
                client_temp_ts,
            })
            .await;

        if let Err(err) = emitted {
            warn!(room_id = room_id.0, client_temp_ts, %err, "chat: send_message emit failed");
            let failed = {
                let mut guard = self.inner.lock().await;
                if let Some(timer) = guard.pending_timers.remove(&client_temp_ts) {
                    timer.abort();
                }
                if guard.active_room == Some(room_id) {
                    guard.timeline.fail_pending(client_temp_ts)
                } else {
                    None
                }
            };
            if let Some(index) = failed {
                self.publish(ChatEvent::TimelineUpdated {
                    room_id,
                    change: TimelineChange::Failed { index },
                });
            }
            return Err(err);
        }

        debug!(room_id = room_id.0, client_temp_ts, "chat: message emitted");
        Ok(client_temp_ts)
    }

    /// Keystroke hook. Emits `typing` for the active room at most once per
    /// throttle interval; returns whether it emitted.
    pub async fn notify_typing(&self) -> Result<bool, ChatError> {
        let room_id = {
            let mut guard = self.inner.lock().await;
            if guard.connection != ConnectionState::Connected {
                return Ok(false);
            }
            let Some(room_id) = guard.active_room else {
                return Ok(false);
            };
            if !guard.typing_throttle.try_acquire(Instant::now()) {
                return Ok(false);
            }
            room_id
        };
        self.transport
            .emit(&ClientEmit::Typing { room: room_id })
            .await?;
        Ok(true)
    }

    pub async fn handle_server_event(self: &Arc<Self>, event: ServerEvent) {
        match event {
            ServerEvent::ReceiveMessage(message) => self.receive_message(message).await,
            ServerEvent::Typing { room_id, user_id } => {
                if user_id.is_some() && user_id == self.auth.current_user_id() {
                    return;
                }
                self.receive_typing(room_id).await;
            }
            ServerEvent::Error(err) => {
                warn!(code = ?err.code, message = %err.message, "chat: server reported an error");
                self.publish(ChatEvent::Error(err.message));
            }
        }
    }

    async fn handle_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Server(event) => self.handle_server_event(event).await,
            TransportEvent::Reconnecting => {
                if self
                    .move_connection(ConnectionState::Connected, ConnectionState::Connecting)
                    .await
                {
                    warn!("chat: realtime channel dropped; reconnecting");
                }
            }
            TransportEvent::Reconnected => {
                if self
                    .move_connection(ConnectionState::Connecting, ConnectionState::Connected)
                    .await
                {
                    info!("chat: realtime channel reconnected");
                }
            }
            TransportEvent::Closed { reason } => {
                let changed = {
                    let mut guard = self.inner.lock().await;
                    std::mem::replace(&mut guard.connection, ConnectionState::Disconnected)
                        != ConnectionState::Disconnected
                };
                warn!(
                    reason = reason.as_deref().unwrap_or("unknown"),
                    "chat: realtime channel closed"
                );
                if changed {
                    self.publish(ChatEvent::ConnectionChanged(ConnectionState::Disconnected));
                }
            }
        }
    }

    /// Switches `from → to` and publishes the change. Anything else (a closed
    /// session, a connect still in progress) is left alone.
    async fn move_connection(&self, from: ConnectionState, to: ConnectionState) -> bool {
        {
            let mut guard = self.inner.lock().await;
            if guard.connection != from || guard.subscription.is_none() {
                return false;
            }
            guard.connection = to;
        }
        self.publish(ChatEvent::ConnectionChanged(to));
        true
    }

    async fn receive_message(&self, message: MessagePayload) {
        let room_id = message.room_id;
        let change = {
            let mut guard = self.inner.lock().await;
            if guard.active_room != Some(room_id) {
                debug!(room_id = room_id.0, "chat: dropping message for inactive room");
                return;
            }
            if guard.history_loading {
                debug!(room_id = room_id.0, "chat: buffering message until history is loaded");
                guard.buffered.push(message);
                return;
            }
            match guard.timeline.merge_incoming(message) {
                MergeOutcome::Confirmed {
                    index,
                    client_temp_ts,
                } => {
                    if let Some(timer) =
                        client_temp_ts.and_then(|stamp| guard.pending_timers.remove(&stamp))
                    {
                        timer.abort();
                    }
                    TimelineChange::Confirmed { index }
                }
                MergeOutcome::Appended { index } => TimelineChange::Appended { index },
                MergeOutcome::EchoSuppressed => {
                    debug!(room_id = room_id.0, "chat: ignoring echo of a pending message");
                    return;
                }
            }
        };
        self.publish(ChatEvent::TimelineUpdated { room_id, change });
    }

    async fn receive_typing(self: &Arc<Self>, room_id: RoomId) {
        let turned_on = {
            let mut guard = self.inner.lock().await;
            if guard.active_room != Some(room_id) {
                debug!(room_id = room_id.0, "chat: ignoring typing for inactive room");
                return;
            }
            let (epoch, turned_on) = guard.typing.signal(room_id);
            let timer = self.spawn_typing_clear(epoch);
            guard.typing.arm(timer);
            turned_on
        };
        if turned_on {
            self.publish(ChatEvent::TypingChanged {
                room_id,
                typing: true,
            });
        }
    }

    fn spawn_typing_clear(self: &Arc<Self>, epoch: u64) -> JoinHandle<()> {
        let session: Weak<Self> = Arc::downgrade(self);
        let delay = self.timing.typing_clear_after;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(session) = session.upgrade() else {
                return;
            };
            let cleared = session.inner.lock().await.typing.expire(epoch);
            if let Some(room_id) = cleared {
                session.publish(ChatEvent::TypingChanged {
                    room_id,
                    typing: false,
                });
            }
        })
    }

    fn spawn_pending_timeout(
        self: &Arc<Self>,
        generation: u64,
        client_temp_ts: i64,
        timeout: Duration,
    ) -> JoinHandle<()> {
        let session: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(session) = session.upgrade() else {
                return;
            };
            let failed = {
                let mut guard = session.inner.lock().await;
                if guard.generation != generation {
                    return;
                }
                guard.pending_timers.remove(&client_temp_ts);
                guard
                    .timeline
                    .fail_pending(client_temp_ts)
                    .zip(guard.active_room)
            };
            if let Some((index, room_id)) = failed {
                warn!(
                    room_id = room_id.0,
                    client_temp_ts, "chat: message unconfirmed after timeout"
                );
                session.publish(ChatEvent::TimelineUpdated {
                    room_id,
                    change: TimelineChange::Failed { index },
                });
            }
        })
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.inner.lock().await.connection
    }

    /// Whether the send action should be enabled.
    pub async fn can_send(&self) -> bool {
        let guard = self.inner.lock().await;
        guard.connection == ConnectionState::Connected
            && guard.active_room.is_some()
            && !guard.history_loading
    }

    pub async fn active_room(&self) -> Option<RoomId> {
        self.inner.lock().await.active_room
    }

    pub async fn rooms(&self) -> RoomListView {
        self.inner.lock().await.rooms.clone()
    }

    pub async fn history_view(&self) -> HistoryView {
        let guard = self.inner.lock().await;
        match guard.active_room {
            None => HistoryView::NoRoom,
            Some(room_id) if guard.history_loading => HistoryView::Loading(room_id),
            Some(room_id) if guard.timeline.is_empty() => HistoryView::Empty(room_id),
            Some(room_id) => HistoryView::Ready(room_id),
        }
    }

    pub async fn messages(&self) -> Vec<TimelineEntry> {
        self.inner.lock().await.timeline.entries().to_vec()
    }

    pub async fn unresolved_pending(&self) -> usize {
        self.inner.lock().await.timeline.unresolved_pending()
    }

    pub async fn is_other_user_typing(&self) -> bool {
        let guard = self.inner.lock().await;
        guard
            .active_room
            .is_some_and(|room_id| guard.typing.is_active_for(room_id))
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
