//! WebSocket client for a remote [`SyncServer`](crate::server::SyncServer).
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect)
//! - Request/reply correlation with per-request timeouts
//! - A local replica of the shared state, kept current by pushed snapshots
//!
//! Reads such as [`SyncClient::rooms`] are answered from the replica and
//! never touch the network. Writes always go to the server; the replica only
//! changes when the server pushes the resulting snapshot.

use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;

use teamsplit_core::{
    ContactChannel, EngineError, Match, MatchId, ParticipantId, Room, RoomId, SessionId,
};

use crate::admin::{NewParticipant, NewRoom, ParticipantPatch, RoomPatch};
use crate::lifecycle::JoinOutcome;
use crate::protocol::{ClientMessage, Operation, ProtocolError, Reply, ServerMessage};
use crate::store::Snapshot;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long to wait for the welcome frame and for each reply
    pub request_timeout: Duration,
    /// Buffered [`SyncEvent`]s. Snapshots that do not fit are folded into
    /// one [`SyncEvent::Resynced`] ahead of the next event that does.
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            event_capacity: 256,
        }
    }
}

impl ClientConfig {
    pub fn for_testing() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            event_capacity: 1024,
        }
    }
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Welcome received; the replica holds the server's current state
    Connected { session: SessionId },
    /// Server pushed the next snapshot
    Snapshot(Arc<Snapshot>),
    /// Server dropped `skipped` snapshots for us and sent the newest one
    Resynced { skipped: u64, version: u64 },
    /// Connection lost
    Disconnected,
}

type PendingReplies = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Reply, EngineError>>>>>;

/// The sync client.
pub struct SyncClient {
    server_url: String,
    config: ClientConfig,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Session assigned by the server's welcome
    session: Option<SessionId>,

    /// Local replica, replaced on every pushed snapshot
    replica: Option<watch::Receiver<Arc<Snapshot>>>,

    /// Requests waiting for their reply
    pending: PendingReplies,
    next_request_id: AtomicU64,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Message>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<SyncEvent>>,

    /// Event sender (held by the reader task)
    event_tx: mpsc::Sender<SyncEvent>,
}

impl SyncClient {
    /// Create a client for `server_url` (e.g. `ws://127.0.0.1:9090`).
    pub fn new(server_url: impl Into<String>) -> Self {
        Self::with_config(server_url, ClientConfig::default())
    }

    pub fn with_config(server_url: impl Into<String>, config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        Self {
            server_url: server_url.into(),
            config,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            session: None,
            replica: None,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_request_id: AtomicU64::new(1),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect and wait for the server's welcome.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<SessionId, ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let result = self.open().await;
        if result.is_err() {
            *self.state.write().await = ConnectionState::Disconnected;
        }
        result
    }

    async fn open(&mut self) -> Result<SessionId, ProtocolError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.server_url.as_str())
            .await
            .map_err(|e| {
                log::warn!("Failed to connect to {}: {e}", self.server_url);
                ProtocolError::ConnectionClosed
            })?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // The first binary frame must be the welcome
        let (session, snapshot) = tokio::time::timeout(self.config.request_timeout, async {
            loop {
                match ws_reader.next().await {
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        return match ServerMessage::decode(&bytes) {
                            Ok(ServerMessage::Welcome { session, snapshot }) => Ok((session, snapshot)),
                            Ok(_) => Err(ProtocolError::UnexpectedMessage("expected welcome")),
                            Err(e) => Err(e),
                        };
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                        return Err(ProtocolError::ConnectionClosed)
                    }
                    Some(Ok(_)) => {}
                }
            }
        })
        .await
        .map_err(|_| ProtocolError::Timeout)??;

        let (replica_tx, replica_rx) = watch::channel(snapshot);
        self.replica = Some(replica_rx);
        self.session = Some(session);

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if ws_writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        // Reader task: replies, snapshots and connection loss
        let mut events = EventOutbox::new(self.event_tx.clone());
        let state = self.state.clone();
        let pending = self.pending.clone();
        tokio::spawn(async move {
            events.deliver(SyncEvent::Connected { session });
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        let server_msg = match ServerMessage::decode(&bytes) {
                            Ok(m) => m,
                            Err(e) => {
                                log::warn!("Dropping undecodable frame: {e}");
                                continue;
                            }
                        };
                        match server_msg {
                            ServerMessage::Reply { request_id, result } => {
                                if let Some(tx) = pending.lock().await.remove(&request_id) {
                                    let _ = tx.send(result);
                                } else {
                                    log::debug!("Reply to abandoned request {request_id}");
                                }
                            }
                            ServerMessage::Snapshot(snapshot) => {
                                if advance(&replica_tx, snapshot.clone()) {
                                    events.deliver(SyncEvent::Snapshot(snapshot));
                                }
                            }
                            ServerMessage::Resync { skipped, snapshot } => {
                                let version = snapshot.version;
                                if advance(&replica_tx, snapshot) {
                                    events.deliver(SyncEvent::Resynced { skipped, version });
                                }
                            }
                            ServerMessage::Pong => log::trace!("Pong"),
                            ServerMessage::Welcome { .. } => {
                                log::warn!("Ignoring repeated welcome");
                            }
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            for (_, tx) in pending.lock().await.drain() {
                let _ = tx.send(Err(ProtocolError::ConnectionClosed.into()));
            }
            events.deliver(SyncEvent::Disconnected);
        });

        *self.state.write().await = ConnectionState::Connected;
        log::info!("Connected to {} as session {session}", self.server_url);
        Ok(session)
    }

    /// Close the connection. Pending requests fail once the server hangs up.
    pub async fn disconnect(&mut self) {
        if let Some(tx) = self.outgoing_tx.take() {
            let _ = tx.send(Message::Close(None)).await;
        }
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Send `op` and wait for its reply.
    ///
    /// Fails with `StoreUnavailable` when not connected, when the connection
    /// drops before the reply arrives, or after `request_timeout`.
    pub async fn request(&self, op: Operation) -> Result<Reply, EngineError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(EngineError::StoreUnavailable("not connected".into()));
        }
        let tx = self
            .outgoing_tx
            .as_ref()
            .ok_or_else(|| EngineError::StoreUnavailable("not connected".into()))?;

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let encoded = ClientMessage::Request { request_id, op }.encode()?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id, reply_tx);

        if tx.send(Message::Binary(encoded.into())).await.is_err() {
            self.pending.lock().await.remove(&request_id);
            return Err(ProtocolError::ConnectionClosed.into());
        }

        match tokio::time::timeout(self.config.request_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(EngineError::StoreUnavailable("connection lost".into())),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                Err(ProtocolError::Timeout.into())
            }
        }
    }

    /// Send a ping to the server.
    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        let encoded = ClientMessage::Ping.encode()?;
        if let Some(ref tx) = self.outgoing_tx {
            tx.send(Message::Binary(encoded.into()))
                .await
                .map_err(|_| ProtocolError::ConnectionClosed)?;
        }
        Ok(())
    }

    // ─── Presence ──────────────────────────────────────────────────

    pub async fn request_code(&self, participant: &ParticipantId) -> Result<ContactChannel, EngineError> {
        match self.request(Operation::RequestCode { participant: participant.clone() }).await? {
            Reply::CodeSent(channel) => Ok(channel),
            _ => Err(unexpected("request_code")),
        }
    }

    pub async fn verify_code(&self, participant: &ParticipantId, code: &str) -> Result<u64, EngineError> {
        let op = Operation::VerifyCode {
            participant: participant.clone(),
            code: code.to_string(),
        };
        self.ack(op).await
    }

    pub async fn claim(&self, participant: &ParticipantId) -> Result<u64, EngineError> {
        self.ack(Operation::Claim { participant: participant.clone() }).await
    }

    /// Release this session's claim, if any.
    pub async fn release(&self) -> Result<u64, EngineError> {
        self.ack(Operation::Release).await
    }

    pub async fn release_participant(&self, participant: &ParticipantId) -> Result<u64, EngineError> {
        self.ack(Operation::ReleaseParticipant { participant: participant.clone() })
            .await
    }

    /// Ask the server whether `participant` is claimed.
    pub async fn is_online(&self, participant: &ParticipantId) -> Result<bool, EngineError> {
        match self.request(Operation::IsOnline { participant: participant.clone() }).await? {
            Reply::Online(online) => Ok(online),
            _ => Err(unexpected("is_online")),
        }
    }

    // ─── Matches ───────────────────────────────────────────────────

    pub async fn create_match(&self, room: &RoomId) -> Result<Match, EngineError> {
        match self.request(Operation::CreateMatch { room: room.clone() }).await? {
            Reply::Match(entry) => Ok(entry),
            _ => Err(unexpected("create_match")),
        }
    }

    pub async fn join(
        &self,
        match_id: MatchId,
        participant: &ParticipantId,
    ) -> Result<(Match, JoinOutcome), EngineError> {
        let op = Operation::Join { match_id, participant: participant.clone() };
        match self.request(op).await? {
            Reply::Joined { entry, outcome } => Ok((entry, outcome)),
            _ => Err(unexpected("join")),
        }
    }

    pub async fn join_room(
        &self,
        room: &RoomId,
        participant: &ParticipantId,
    ) -> Result<(Match, JoinOutcome), EngineError> {
        let op = Operation::JoinRoom { room: room.clone(), participant: participant.clone() };
        match self.request(op).await? {
            Reply::Joined { entry, outcome } => Ok((entry, outcome)),
            _ => Err(unexpected("join_room")),
        }
    }

    pub async fn delete_room(&self, room: &RoomId) -> Result<usize, EngineError> {
        match self.request(Operation::DeleteRoom { room: room.clone() }).await? {
            Reply::RoomDeleted { matches_removed } => Ok(matches_removed),
            _ => Err(unexpected("delete_room")),
        }
    }

    // ─── Administration ────────────────────────────────────────────

    pub async fn add_participant(&self, new: NewParticipant) -> Result<ParticipantId, EngineError> {
        match self.request(Operation::AddParticipant(new)).await? {
            Reply::ParticipantAdded(id) => Ok(id),
            _ => Err(unexpected("add_participant")),
        }
    }

    pub async fn update_participant(
        &self,
        id: &ParticipantId,
        patch: ParticipantPatch,
    ) -> Result<u64, EngineError> {
        self.ack(Operation::UpdateParticipant { id: id.clone(), patch }).await
    }

    pub async fn delete_participant(&self, id: &ParticipantId) -> Result<u64, EngineError> {
        self.ack(Operation::DeleteParticipant { id: id.clone() }).await
    }

    pub async fn add_room(&self, new: NewRoom) -> Result<RoomId, EngineError> {
        match self.request(Operation::AddRoom(new)).await? {
            Reply::RoomAdded(id) => Ok(id),
            _ => Err(unexpected("add_room")),
        }
    }

    pub async fn update_room(&self, id: &RoomId, patch: RoomPatch) -> Result<u64, EngineError> {
        self.ack(Operation::UpdateRoom { id: id.clone(), patch }).await
    }

    pub async fn set_credential_hashes(
        &self,
        shared: Option<String>,
        admin: Option<String>,
    ) -> Result<u64, EngineError> {
        self.ack(Operation::SetCredentialHashes { shared, admin }).await
    }

    pub async fn export_state(&self) -> Result<String, EngineError> {
        match self.request(Operation::Export).await? {
            Reply::Exported(json) => Ok(json),
            _ => Err(unexpected("export")),
        }
    }

    pub async fn import_state(&self, json: impl Into<String>) -> Result<u64, EngineError> {
        self.ack(Operation::Import { json: json.into() }).await
    }

    async fn ack(&self, op: Operation) -> Result<u64, EngineError> {
        let name = op.name();
        match self.request(op).await? {
            Reply::Ack { version } => Ok(version),
            _ => Err(unexpected(name)),
        }
    }

    // ─── Local replica ─────────────────────────────────────────────

    /// Latest snapshot pushed by the server.
    pub fn snapshot(&self) -> Option<Arc<Snapshot>> {
        self.replica.as_ref().map(|rx| rx.borrow().clone())
    }

    /// Wait until the replica reaches `version`.
    pub async fn wait_for_version(&self, version: u64) -> Result<Arc<Snapshot>, EngineError> {
        let mut rx = self
            .replica
            .clone()
            .ok_or_else(|| EngineError::StoreUnavailable("not connected".into()))?;
        let waited = tokio::time::timeout(self.config.request_timeout, async {
            rx.wait_for(|s| s.version >= version).await.map(|s| s.clone())
        })
        .await;
        match waited {
            Ok(Ok(snapshot)) => Ok(snapshot),
            Ok(Err(_)) => Err(ProtocolError::ConnectionClosed.into()),
            Err(_) => Err(ProtocolError::Timeout.into()),
        }
    }

    pub fn rooms(&self) -> Vec<Room> {
        self.snapshot()
            .map(|s| s.state.rooms.clone())
            .unwrap_or_default()
    }

    pub fn matches(&self) -> Vec<Match> {
        self.snapshot()
            .map(|s| s.state.matches.clone())
            .unwrap_or_default()
    }

    pub fn active_match(&self, room: &RoomId) -> Option<Match> {
        self.snapshot()?.state.active_match(room).cloned()
    }

    pub fn find_match(&self, match_id: MatchId) -> Option<Match> {
        self.snapshot()?.state.find_match(match_id).cloned()
    }

    /// Presence as seen by the replica.
    pub fn is_online_local(&self, participant: &ParticipantId) -> bool {
        self.snapshot()
            .map(|s| s.state.is_online(participant))
            .unwrap_or(false)
    }

    // ─── Accessors ─────────────────────────────────────────────────

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn session(&self) -> Option<SessionId> {
        self.session
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub async fn pending_requests(&self) -> usize {
        self.pending.lock().await.len()
    }
}

/// Replace the replica if `snapshot` is newer. Returns whether it was.
fn advance(replica: &watch::Sender<Arc<Snapshot>>, snapshot: Arc<Snapshot>) -> bool {
    replica.send_if_modified(|current| {
        if snapshot.version > current.version {
            *current = snapshot;
            true
        } else {
            false
        }
    })
}

/// Hands events to the application without ever stalling the reader task.
///
/// Snapshots that find the queue full are counted. The next time there is
/// room, the application first gets one `Resynced` naming how many it missed
/// and the newest version among them; the replica already holds that state.
struct EventOutbox {
    tx: mpsc::Sender<SyncEvent>,
    /// Snapshots dropped since the last delivered event
    dropped: u64,
    /// Version of the newest dropped snapshot
    dropped_version: u64,
}

impl EventOutbox {
    fn new(tx: mpsc::Sender<SyncEvent>) -> Self {
        Self { tx, dropped: 0, dropped_version: 0 }
    }

    fn deliver(&mut self, event: SyncEvent) {
        if self.dropped > 0 {
            let catch_up = SyncEvent::Resynced {
                skipped: self.dropped - 1,
                version: self.dropped_version,
            };
            match self.tx.try_send(catch_up) {
                Ok(()) => self.dropped = 0,
                Err(TrySendError::Full(_)) => return self.drop_event(event),
                Err(TrySendError::Closed(_)) => return,
            }
        }
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => self.drop_event(event),
            // Nobody listens any more
            Err(TrySendError::Closed(_)) => {}
        }
    }

    fn drop_event(&mut self, event: SyncEvent) {
        match event {
            SyncEvent::Snapshot(snapshot) => {
                self.dropped += 1;
                self.dropped_version = snapshot.version;
            }
            SyncEvent::Resynced { skipped, version } => {
                self.dropped += skipped + 1;
                self.dropped_version = version;
            }
            other => log::warn!("Event queue full, dropped {other:?}"),
        }
    }
}

fn unexpected(op: &'static str) -> EngineError {
    log::error!("Server sent the wrong reply kind for {op}");
    ProtocolError::UnexpectedMessage(op).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use teamsplit_core::{ErrorKind, State};

    #[test]
    fn test_client_creation() {
        let client = SyncClient::new("ws://localhost:9090");
        assert_eq!(client.server_url(), "ws://localhost:9090");
        assert!(client.session().is_none());
        assert!(client.snapshot().is_none());
        assert!(client.rooms().is_empty());
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = SyncClient::new("ws://localhost:9090");
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(client.pending_requests().await, 0);
    }

    #[tokio::test]
    async fn test_request_when_disconnected_fails_closed() {
        let client = SyncClient::new("ws://localhost:9090");
        let err = client.claim(&"p1".into()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StoreUnavailable);
        assert_eq!(client.pending_requests().await, 0);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let mut client = SyncClient::with_config("ws://127.0.0.1:1", ClientConfig::for_testing());
        assert!(client.connect().await.is_err());
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let mut client = SyncClient::new("ws://localhost:9090");
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[test]
    fn test_replica_only_moves_forward() {
        let (tx, rx) = watch::channel(Arc::new(Snapshot::new(3, State::new())));
        assert!(!advance(&tx, Arc::new(Snapshot::new(2, State::new()))));
        assert!(!advance(&tx, Arc::new(Snapshot::new(3, State::new()))));
        assert!(advance(&tx, Arc::new(Snapshot::new(5, State::new()))));
        assert_eq!(rx.borrow().version, 5);
    }
}
