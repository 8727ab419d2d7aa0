//! WebSocket server exposing the coordinator to remote sessions.
//!
//! Architecture:
//! ```text
//! Client A ──┐                       ┌── PresenceRegistry
//!            ├── SyncServer ── Coordinator ── MatchLifecycle ──┐
//! Client B ──┘       ▲               └── RosterAdmin / Gate    │
//!                    │                                         ▼
//!                    │ Snapshot / Resync             SharedStateStore
//!                    │                                  │        │
//!                    └──────── BroadcastGroup ◄─────────┘        ▼
//!                                                         Backend (file)
//! ```
//!
//! Each connection is one session: it receives a `Welcome` with a fresh
//! `SessionId` and the current snapshot, then every accepted snapshot in
//! order. When the connection closes, the session's claim is released.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;

use teamsplit_core::SessionId;

use crate::broadcast::SessionInfo;
use crate::coordinator::Coordinator;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::storage::{Backend, MemoryBackend, SnapshotFile, StoreError};
use crate::store::{SharedStateStore, StoreConfig, Subscription, Update};
use crate::verification::{LogDispatcher, VerificationConfig, VerificationDispatcher};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Snapshots buffered per connection before it is resynced
    pub broadcast_capacity: usize,
    /// Optimistic write attempts before `WriteContention`
    pub max_write_attempts: u32,
    /// Refuse raw `Claim` requests; claims need a verification code
    pub require_verification: bool,
    /// Code lifetime and retry limits
    pub verification: VerificationConfig,
    /// Snapshot directory (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            max_write_attempts: 16,
            require_verification: true,
            verification: VerificationConfig::default(),
            storage_path: None,
        }
    }
}

impl ServerConfig {
    /// Ephemeral port, no persistence, raw claims allowed.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            broadcast_capacity: 64,
            require_verification: false,
            verification: VerificationConfig::for_testing(),
            ..Self::default()
        }
    }

    fn store_config(&self) -> StoreConfig {
        StoreConfig {
            max_attempts: self.max_write_attempts,
            broadcast_capacity: self.broadcast_capacity,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub snapshots_sent: u64,
    pub resyncs: u64,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    coordinator: Arc<Coordinator>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a server that logs verification codes.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        Self::with_dispatcher(config, Arc::new(LogDispatcher))
    }

    /// Create a server delivering codes through `dispatcher`.
    pub fn with_dispatcher(
        config: ServerConfig,
        dispatcher: Arc<dyn VerificationDispatcher>,
    ) -> Result<Self, StoreError> {
        let backend: Arc<dyn Backend> = match &config.storage_path {
            Some(path) => Arc::new(SnapshotFile::open_dir(path.clone())?),
            None => Arc::new(MemoryBackend::new()),
        };
        let store = Arc::new(SharedStateStore::open(backend, config.store_config())?);
        let coordinator = Arc::new(Coordinator::new(
            store,
            dispatcher,
            config.verification.clone(),
            config.require_verification,
        ));

        Ok(Self {
            config,
            coordinator,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        })
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections accepted on `listener`.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        let local = listener.local_addr()?;

        // No session from a previous run is still connected
        let (stale, snapshot) = self
            .coordinator
            .store()
            .mutate(|state| {
                let stale = state.presence.len();
                state.presence.clear();
                Ok(stale)
            })
            .await?;
        if stale > 0 {
            log::info!("Dropped {stale} claims left by a previous run");
        }
        log::info!("Sync server listening on {local} (state v{})", snapshot.version);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let coordinator = self.coordinator.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, coordinator, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle one WebSocket connection for its whole life.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        coordinator: Arc<Coordinator>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let session = SessionId::new();
        log::info!("Session {session} connected from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let store = coordinator.store().clone();
        let subscription = store
            .subscribe_session(SessionInfo::new(session, Some(addr)))
            .await;

        let result = Self::session_loop(ws_stream, session, subscription, &coordinator, &stats).await;

        // Cleanup runs however the loop ended
        store.broadcast().remove_session(&session).await;
        if let Err(e) = coordinator.end_session(session).await {
            log::error!("Failed to release claim of session {session}: {e}");
        }
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        log::info!("Session {session} from {addr} closed");

        result
    }

    async fn session_loop(
        ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
        session: SessionId,
        mut subscription: Subscription,
        coordinator: &Coordinator,
        stats: &RwLock<ServerStats>,
    ) -> Result<(), BoxError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let welcome = ServerMessage::Welcome {
            session,
            snapshot: subscription.initial().clone(),
        };
        ws_sender.send(Message::Binary(welcome.encode()?.into())).await?;

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }

                            match ClientMessage::decode(&bytes) {
                                Ok(ClientMessage::Request { request_id, op }) => {
                                    let name = op.name();
                                    let result = coordinator.execute(session, op).await;
                                    {
                                        let mut s = stats.write().await;
                                        s.total_requests += 1;
                                        if result.is_err() {
                                            s.failed_requests += 1;
                                        }
                                    }
                                    if let Err(ref e) = result {
                                        log::debug!("{name} from {session} failed: {e}");
                                    }
                                    let reply = ServerMessage::Reply { request_id, result };
                                    ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                }
                                Ok(ClientMessage::Ping) => {
                                    let pong = ServerMessage::Pong.encode()?;
                                    ws_sender.send(Message::Binary(pong.into())).await?;
                                }
                                Err(e) => {
                                    log::warn!("Failed to decode message from {session}: {e}");
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => break,

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {session}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Outgoing snapshot
                update = subscription.next() => {
                    let msg = match update {
                        Some(Update::Snapshot(snapshot)) => ServerMessage::Snapshot(snapshot),
                        Some(Update::Resync { skipped, snapshot }) => {
                            log::warn!("Session {session} lagged by {skipped} snapshots");
                            stats.write().await.resyncs += 1;
                            ServerMessage::Resync { skipped, snapshot }
                        }
                        None => break,
                    };
                    ws_sender.send(Message::Binary(msg.encode()?.into())).await?;
                    stats.write().await.snapshots_sent += 1;
                }
            }
        }

        Ok(())
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// In-process access to the engine behind the socket.
    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }
}
