//! Reference WebSocket wave server.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── WaveRoom (wave_id) ── WaveletContainer per wavelet
//! Client B ──┘        │                      │
//!                     │                      └── DeltaHistory (LZ4)
//!                     │
//!               BroadcastGroup
//!          ┌──────────┼───────────┐
//!          ▼          ▼           ▼
//!       Client A   Client B    Client C      (origin skipped, filter applied)
//! ```
//!
//! Each connection runs one `select!` loop over its socket and the
//! broadcast receiver of the wave it opened, so direct responses and
//! fan-out reach a client in a single ordered stream.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::{SinkExt, StreamExt};
use tidal_core::{HashedVersion, ParticipantId, WaveId, WaveletDelta, WaveletId};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{Broadcast, Subscriber};
use crate::container::{SubmitPolicy, WaveletContainer};
use crate::protocol::{
    ClientMessage, IdFilter, KnownWavelet, ServerMessage, SubmitRejection, SubmitResult,
};
use crate::room::{RoomManager, WaveRoom};

pub type ServerError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum connections subscribed to one wave
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per wave
    pub broadcast_capacity: usize,
    /// WebSocket ping interval in seconds; 0 disables it
    pub heartbeat_interval_secs: u64,
    pub submit_policy: SubmitPolicy,
    /// Deltas kept per wavelet (None = unbounded)
    pub history_limit: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
            submit_policy: SubmitPolicy::Transform,
            history_limit: None,
        }
    }
}

impl ServerConfig {
    /// Small buffers and no heartbeat.
    pub fn for_testing(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            max_peers_per_room: 10,
            broadcast_capacity: 64,
            heartbeat_interval_secs: 0,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub deltas_applied: u64,
    pub submissions_rejected: u64,
}

pub struct SyncServer {
    config: ServerConfig,
    room_manager: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        let room_manager = Arc::new(RoomManager::new(
            config.broadcast_capacity,
            config.submit_policy,
            config.history_limit,
        ));
        Self {
            config,
            room_manager,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind `bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        log::info!("Wave server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let session = Session::new(
                addr,
                self.config.clone(),
                self.room_manager.clone(),
                self.stats.clone(),
            );
            tokio::spawn(async move {
                if let Err(e) = session.run(stream).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn room_manager(&self) -> &Arc<RoomManager> {
        &self.room_manager
    }
}

/// The wave a connection has opened.
struct OpenWave {
    wave_id: WaveId,
    participant: ParticipantId,
    filter: IdFilter,
    room: Arc<WaveRoom>,
    rx: broadcast::Receiver<Arc<Broadcast>>,
}

/// Per-connection state.
struct Session {
    connection_id: Uuid,
    addr: SocketAddr,
    config: ServerConfig,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
    open: Option<OpenWave>,
}

impl Session {
    fn new(
        addr: SocketAddr,
        config: ServerConfig,
        rooms: Arc<RoomManager>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            addr,
            config,
            rooms,
            stats,
            open: None,
        }
    }

    async fn run(mut self, stream: TcpStream) -> Result<(), ServerError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let addr = self.addr;

        log::info!("WebSocket connection established from {addr}");
        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let heartbeat_secs = self.config.heartbeat_interval_secs;
        let mut heartbeat = tokio::time::interval(Duration::from_secs(heartbeat_secs.max(1)));

        let result: Result<(), ServerError> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                {
                                    let mut s = self.stats.write().await;
                                    s.total_messages += 1;
                                    s.total_bytes += data.len() as u64;
                                }
                                let replies = match ClientMessage::decode(&data) {
                                    Ok(message) => self.handle(message).await,
                                    Err(e) => {
                                        log::warn!("Failed to decode message from {addr}: {e}");
                                        vec![ServerMessage::Error { message: e.to_string() }]
                                    }
                                };
                                for reply in replies {
                                    ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                }
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    frame = async {
                        match self.open.as_mut() {
                            Some(open) => open.rx.recv().await,
                            // Nothing opened yet
                            None => std::future::pending().await,
                        }
                    } => {
                        match frame {
                            Ok(frame) => {
                                // Don't echo back to sender
                                if frame.origin == self.connection_id {
                                    continue;
                                }
                                let wanted = self
                                    .open
                                    .as_ref()
                                    .is_some_and(|open| open.filter.matches(&frame.wavelet_id));
                                if wanted {
                                    ws_sender.send(Message::Binary(frame.frame.clone().into())).await?;
                                }
                            }
                            Err(RecvError::Lagged(n)) => {
                                // The client has a gap it cannot fill from later
                                // deltas; make it reconnect and catch up.
                                log::warn!("Connection {addr} lagged by {n} frames, closing");
                                if let Some(open) = &self.open {
                                    open.room.broadcast.record_dropped(n);
                                }
                                break;
                            }
                            Err(RecvError::Closed) => break,
                        }
                    }

                    _ = heartbeat.tick(), if heartbeat_secs > 0 => {
                        ws_sender.send(Message::Ping(Vec::new().into())).await?;
                    }
                }
            }
            Ok(())
        }
        .await;

        self.leave().await;
        {
            let mut s = self.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            s.active_rooms = self.rooms.room_count().await;
        }
        result
    }

    /// Handle one client message, returning the direct replies in order.
    async fn handle(&mut self, message: ClientMessage) -> Vec<ServerMessage> {
        match message {
            ClientMessage::Open {
                wave_id,
                participant,
                filter,
                known,
            } => self.open(wave_id, participant, filter, known).await,

            ClientMessage::Submit {
                wave_id,
                wavelet_id,
                delta,
            } => vec![self.submit(wave_id, wavelet_id, delta).await],

            ClientMessage::FetchHistory {
                wave_id,
                wavelet_id,
                from,
                to,
            } => vec![self.fetch_history(wave_id, wavelet_id, from, to).await],

            ClientMessage::RequestSnapshot {
                wave_id,
                wavelet_id,
            } => vec![self.request_snapshot(wave_id, wavelet_id).await],

            ClientMessage::Ping { nonce } => vec![ServerMessage::Pong { nonce }],

            ClientMessage::Close { wave_id } => {
                if self.open.as_ref().is_some_and(|o| o.wave_id == wave_id) {
                    self.leave().await;
                }
                Vec::new()
            }
        }
    }

    async fn open(
        &mut self,
        wave_id: WaveId,
        participant: ParticipantId,
        filter: IdFilter,
        known: Vec<KnownWavelet>,
    ) -> Vec<ServerMessage> {
        self.leave().await;

        let room = self.rooms.get_or_create(&wave_id).await;
        if room.broadcast.peer_count().await >= self.config.max_peers_per_room {
            log::warn!("Wave {wave_id} is full, refusing {participant}");
            return vec![error(format!("wave {wave_id} is full"))];
        }
        // Subscribe before reading state: anything applied after the
        // snapshot arrives by broadcast, and overlap is deduplicated
        // by the client.
        let rx = room
            .broadcast
            .add_peer(Subscriber {
                connection_id: self.connection_id,
                participant: participant.clone(),
            })
            .await;

        let mut replies = Vec::new();
        {
            let wavelets = room.wavelets.lock().await;
            for (wavelet_id, container) in wavelets.iter() {
                if container.is_empty() || !filter.matches(wavelet_id) {
                    continue;
                }
                let known_version = known
                    .iter()
                    .find(|k| &k.wavelet_id == wavelet_id)
                    .map(|k| k.version);
                if let Some(reply) = catch_up(&wave_id, container, known_version) {
                    replies.push(reply);
                }
            }
        }
        replies.push(ServerMessage::OpenFinished {
            wave_id: wave_id.clone(),
        });
        log::info!(
            "{participant} opened {wave_id} from {} ({} wavelets sent)",
            self.addr,
            replies.len() - 1
        );

        {
            let mut s = self.stats.write().await;
            s.active_rooms = self.rooms.room_count().await;
        }
        self.open = Some(OpenWave {
            wave_id,
            participant,
            filter,
            room,
            rx,
        });
        replies
    }

    async fn submit(
        &mut self,
        wave_id: WaveId,
        wavelet_id: WaveletId,
        delta: WaveletDelta,
    ) -> ServerMessage {
        let result = match self.opened(&wave_id) {
            None => Err(SubmitRejection::PermissionDenied(format!(
                "{wave_id} is not open on this connection"
            ))),
            Some(open) if open.participant != delta.author => Err(
                SubmitRejection::PermissionDenied(delta.author.to_string()),
            ),
            Some(open) => {
                let room = open.room.clone();
                apply_and_broadcast(&room, self.connection_id, &wavelet_id, delta).await
            }
        };

        {
            let mut s = self.stats.write().await;
            match &result {
                Ok(_) => s.deltas_applied += 1,
                Err(_) => s.submissions_rejected += 1,
            }
        }
        if let Err(rejection) = &result {
            log::warn!("Rejected delta for {wave_id}/{wavelet_id}: {rejection}");
        }

        ServerMessage::SubmitResponse {
            wave_id,
            wavelet_id,
            result: result.unwrap_or_else(SubmitResult::Rejected),
        }
    }

    async fn fetch_history(
        &self,
        wave_id: WaveId,
        wavelet_id: WaveletId,
        from: HashedVersion,
        to: HashedVersion,
    ) -> ServerMessage {
        let Some(open) = self.opened(&wave_id) else {
            return error(format!("{wave_id} is not open on this connection"));
        };
        let wavelets = open.room.wavelets.lock().await;
        let Some(container) = wavelets.get(&wavelet_id) else {
            return error(format!("unknown wavelet {wavelet_id}"));
        };
        match container.history(&from, &to) {
            Ok(deltas) => ServerMessage::History {
                wave_id,
                wavelet_id,
                deltas,
            },
            Err(e) => error(format!("history of {wavelet_id}: {e}")),
        }
    }

    async fn request_snapshot(&self, wave_id: WaveId, wavelet_id: WaveletId) -> ServerMessage {
        let Some(open) = self.opened(&wave_id) else {
            return error(format!("{wave_id} is not open on this connection"));
        };
        let wavelets = open.room.wavelets.lock().await;
        match wavelets.get(&wavelet_id) {
            Some(container) if !container.is_empty() => snapshot_message(&wave_id, container),
            _ => error(format!("unknown wavelet {wavelet_id}")),
        }
    }

    fn opened(&self, wave_id: &WaveId) -> Option<&OpenWave> {
        self.open.as_ref().filter(|open| &open.wave_id == wave_id)
    }

    /// Unsubscribe from the open wave, if any.
    async fn leave(&mut self) {
        if let Some(open) = self.open.take() {
            open.room.broadcast.remove_peer(&self.connection_id).await;
            if self.rooms.remove_if_empty(&open.wave_id).await {
                log::info!("Room {} removed (empty)", open.wave_id);
            }
            log::debug!("{} left {}", open.participant, open.wave_id);
        }
    }
}

/// Apply a delta and announce it to the other subscribers.
///
/// Runs under the room lock so broadcasts follow application order.
async fn apply_and_broadcast(
    room: &WaveRoom,
    origin: Uuid,
    wavelet_id: &WaveletId,
    delta: WaveletDelta,
) -> Result<SubmitResult, SubmitRejection> {
    let mut wavelets = room.wavelets.lock().await;
    let container = wavelets
        .entry(wavelet_id.clone())
        .or_insert_with(|| room.new_container(wavelet_id.clone()));

    let submitted = match container.submit(delta, now_millis()) {
        Ok(submitted) => submitted,
        Err(rejection) => {
            if container.is_empty() {
                wavelets.remove(wavelet_id);
            }
            return Err(rejection);
        }
    };

    if let Some(applied) = submitted.applied {
        let announcement = if applied.applied_at.version == 0 {
            snapshot_message(room.wave_id(), container)
        } else {
            ServerMessage::Update {
                wave_id: room.wave_id().clone(),
                wavelet_id: wavelet_id.clone(),
                deltas: vec![applied],
                committed: Some(container.committed_version()),
            }
        };
        if let Err(e) = room
            .broadcast
            .broadcast(origin, wavelet_id.clone(), &announcement)
        {
            log::error!("Failed to broadcast delta for {wavelet_id}: {e}");
        }
    }
    Ok(submitted.ack.into())
}

/// What a client opening the wave needs for one wavelet, given the version
/// it already holds. `None` when it is up to date.
fn catch_up(
    wave_id: &WaveId,
    container: &WaveletContainer,
    known: Option<HashedVersion>,
) -> Option<ServerMessage> {
    match known {
        Some(version) if version == container.version() => None,
        Some(version) if container.knows_version(&version) => {
            match container.deltas_since(&version) {
                Ok(deltas) => Some(ServerMessage::Update {
                    wave_id: wave_id.clone(),
                    wavelet_id: container.wavelet_id().clone(),
                    deltas,
                    committed: Some(container.committed_version()),
                }),
                Err(e) => {
                    log::warn!("Catch-up for {} failed, sending snapshot: {e}", container.wavelet_id());
                    Some(snapshot_message(wave_id, container))
                }
            }
        }
        _ => Some(snapshot_message(wave_id, container)),
    }
}

fn snapshot_message(wave_id: &WaveId, container: &WaveletContainer) -> ServerMessage {
    match container.snapshot() {
        Ok(snapshot) => ServerMessage::Snapshot {
            wave_id: wave_id.clone(),
            snapshot,
        },
        Err(e) => error(format!("snapshot of {}: {e}", container.wavelet_id())),
    }
}

fn error(message: String) -> ServerMessage {
    ServerMessage::Error { message }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
