//! Shared test harness.
//!
//! [`LoopbackServer`] runs the same wavelet containers as the WebSocket
//! server without sockets, and [`Network`] wires views to it through
//! [`RecordingTransport`]s so a test decides exactly when each request is
//! handled and each reply delivered.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use tidal_collab::{
    ClientMessage, IdFilter, KnownWavelet, MultiplexerConfig, ServerConfig, ServerMessage,
    SubmitPolicy, SubmitResult, SyncServer, Transport, TransportError, WaveView,
    WaveViewListener, WaveletContainer,
};
use tidal_collab::ChannelError;
use tidal_core::{
    DocOp, DocumentId, HashedVersion, ParticipantId, WaveId, WaveletDelta, WaveletId,
};

pub fn wave() -> WaveId {
    WaveId::new("example.com/w+1")
}

pub fn root() -> WaveletId {
    WaveletId::new("conv+root")
}

pub fn body() -> DocumentId {
    DocumentId::new("b+root")
}

pub fn alice() -> ParticipantId {
    ParticipantId::new("alice@example.com").unwrap()
}

pub fn bob() -> ParticipantId {
    ParticipantId::new("bob@example.com").unwrap()
}

pub fn carol() -> ParticipantId {
    ParticipantId::new("carol@example.com").unwrap()
}

/// Insert `text` at `at` into a document of `len` items.
pub fn insert(at: usize, text: &str, len: usize) -> DocOp {
    let mut builder = DocOp::builder();
    if at > 0 {
        builder.retain(at);
    }
    builder.characters(text);
    if len > at {
        builder.retain(len - at);
    }
    builder.build().unwrap()
}

/// Delete `text`, found at `at`, from a document of `len` items.
pub fn delete(at: usize, text: &str, len: usize) -> DocOp {
    let mut builder = DocOp::builder();
    if at > 0 {
        builder.retain(at);
    }
    builder.delete_characters(text);
    let end = at + text.chars().count();
    if len > end {
        builder.retain(len - end);
    }
    builder.build().unwrap()
}

pub fn text_of<T: Transport>(view: &WaveView<T>, wavelet_id: &WaveletId) -> String {
    view.document(wavelet_id, &body())
        .map(|d| d.text())
        .unwrap_or_default()
}

pub fn server_text(container: &WaveletContainer) -> String {
    container
        .data()
        .document(&body())
        .map(|d| d.text())
        .unwrap_or_default()
}

// ============================================================================
// Transport
// ============================================================================

/// Transport that keeps every request for the test to inspect.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    pub sent: Vec<ClientMessage>,
    /// Refuse every request, as a dead connection would.
    pub offline: bool,
    /// Refuse every request, as a live connection with a full queue would.
    pub full: bool,
}

impl RecordingTransport {
    pub fn take(&mut self) -> Vec<ClientMessage> {
        std::mem::take(&mut self.sent)
    }

    fn record(&mut self, message: ClientMessage) -> Result<(), TransportError> {
        if self.offline {
            return Err(TransportError::Disconnected);
        }
        if self.full {
            return Err(TransportError::QueueFull);
        }
        self.sent.push(message);
        Ok(())
    }
}

impl Transport for RecordingTransport {
    fn open_stream(
        &mut self,
        wave_id: &WaveId,
        participant: &ParticipantId,
        filter: &IdFilter,
        known: Vec<KnownWavelet>,
    ) -> Result<(), TransportError> {
        self.record(ClientMessage::Open {
            wave_id: wave_id.clone(),
            participant: participant.clone(),
            filter: filter.clone(),
            known,
        })
    }

    fn submit_delta(
        &mut self,
        wave_id: &WaveId,
        wavelet_id: &WaveletId,
        delta: WaveletDelta,
    ) -> Result<(), TransportError> {
        self.record(ClientMessage::Submit {
            wave_id: wave_id.clone(),
            wavelet_id: wavelet_id.clone(),
            delta,
        })
    }

    fn fetch_history(
        &mut self,
        wave_id: &WaveId,
        wavelet_id: &WaveletId,
        from: HashedVersion,
        to: HashedVersion,
    ) -> Result<(), TransportError> {
        self.record(ClientMessage::FetchHistory {
            wave_id: wave_id.clone(),
            wavelet_id: wavelet_id.clone(),
            from,
            to,
        })
    }

    fn request_snapshot(
        &mut self,
        wave_id: &WaveId,
        wavelet_id: &WaveletId,
    ) -> Result<(), TransportError> {
        self.record(ClientMessage::RequestSnapshot {
            wave_id: wave_id.clone(),
            wavelet_id: wavelet_id.clone(),
        })
    }

    fn close(&mut self, wave_id: &WaveId) -> Result<(), TransportError> {
        self.record(ClientMessage::Close {
            wave_id: wave_id.clone(),
        })
    }
}

// ============================================================================
// Listener
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Seen {
    Added(WaveletId),
    Removed(WaveletId),
    Failed(WaveletId),
    Discarded(Option<WaveletId>, usize),
    OpenFinished,
}

/// Listener that records callbacks into a shared log.
#[derive(Debug, Clone, Default)]
pub struct RecordingListener {
    seen: Arc<Mutex<Vec<Seen>>>,
}

impl RecordingListener {
    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    pub fn count(&self, event: &Seen) -> usize {
        self.seen.lock().unwrap().iter().filter(|s| *s == event).count()
    }

    fn push(&self, event: Seen) {
        self.seen.lock().unwrap().push(event);
    }
}

impl WaveViewListener for RecordingListener {
    fn on_wavelet_added(&mut self, wavelet_id: &WaveletId) {
        self.push(Seen::Added(wavelet_id.clone()));
    }

    fn on_wavelet_removed(&mut self, wavelet_id: &WaveletId) {
        self.push(Seen::Removed(wavelet_id.clone()));
    }

    fn on_wavelet_failed(&mut self, error: &ChannelError) {
        self.push(Seen::Failed(error.wavelet_id().clone()));
    }

    fn on_operations_discarded(&mut self, wavelet_id: Option<&WaveletId>, count: usize) {
        self.push(Seen::Discarded(wavelet_id.cloned(), count));
    }

    fn on_open_finished(&mut self) {
        self.push(Seen::OpenFinished);
    }
}

// ============================================================================
// Loopback server
// ============================================================================

/// One wave's containers, answering requests the way the WebSocket server
/// does: direct replies to the requester, one announcement for everyone else.
pub struct LoopbackServer {
    wave_id: WaveId,
    policy: SubmitPolicy,
    containers: BTreeMap<WaveletId, WaveletContainer>,
    clock: u64,
}

impl LoopbackServer {
    pub fn new(policy: SubmitPolicy) -> Self {
        Self {
            wave_id: wave(),
            policy,
            containers: BTreeMap::new(),
            clock: 0,
        }
    }

    pub fn container(&self, wavelet_id: &WaveletId) -> Option<&WaveletContainer> {
        self.containers.get(wavelet_id)
    }

    pub fn text(&self, wavelet_id: &WaveletId) -> String {
        self.container(wavelet_id).map(server_text).unwrap_or_default()
    }

    pub fn handle(&mut self, message: ClientMessage) -> (Vec<ServerMessage>, Option<ServerMessage>) {
        match message {
            ClientMessage::Open { filter, known, .. } => {
                let mut replies = Vec::new();
                for (wavelet_id, container) in &self.containers {
                    if container.is_empty() || !filter.matches(wavelet_id) {
                        continue;
                    }
                    let held = known
                        .iter()
                        .find(|k| &k.wavelet_id == wavelet_id)
                        .map(|k| k.version);
                    match held {
                        Some(version) if version == container.version() => {}
                        Some(version) if container.knows_version(&version) => {
                            replies.push(ServerMessage::Update {
                                wave_id: self.wave_id.clone(),
                                wavelet_id: wavelet_id.clone(),
                                deltas: container.deltas_since(&version).unwrap(),
                                committed: Some(container.committed_version()),
                            })
                        }
                        _ => replies.push(self.snapshot(container)),
                    }
                }
                replies.push(ServerMessage::OpenFinished {
                    wave_id: self.wave_id.clone(),
                });
                (replies, None)
            }

            ClientMessage::Submit {
                wavelet_id, delta, ..
            } => {
                self.clock += 1;
                let (wave_id, policy) = (self.wave_id.clone(), self.policy);
                let container = self
                    .containers
                    .entry(wavelet_id.clone())
                    .or_insert_with(|| {
                        WaveletContainer::new(wave_id, wavelet_id.clone(), policy, None)
                    });
                match container.submit(delta, self.clock) {
                    Ok(submitted) => {
                        let announcement = submitted.applied.map(|applied| {
                            if applied.applied_at.version == 0 {
                                ServerMessage::Snapshot {
                                    wave_id: self.wave_id.clone(),
                                    snapshot: container.snapshot().unwrap(),
                                }
                            } else {
                                ServerMessage::Update {
                                    wave_id: self.wave_id.clone(),
                                    wavelet_id: wavelet_id.clone(),
                                    deltas: vec![applied],
                                    committed: Some(container.committed_version()),
                                }
                            }
                        });
                        let reply = ServerMessage::SubmitResponse {
                            wave_id: self.wave_id.clone(),
                            wavelet_id,
                            result: submitted.ack.into(),
                        };
                        (vec![reply], announcement)
                    }
                    Err(rejection) => {
                        if container.is_empty() {
                            self.containers.remove(&wavelet_id);
                        }
                        let reply = ServerMessage::SubmitResponse {
                            wave_id: self.wave_id.clone(),
                            wavelet_id,
                            result: SubmitResult::Rejected(rejection),
                        };
                        (vec![reply], None)
                    }
                }
            }

            ClientMessage::FetchHistory {
                wavelet_id,
                from,
                to,
                ..
            } => {
                let reply = match self.containers.get(&wavelet_id).map(|c| c.history(&from, &to)) {
                    Some(Ok(deltas)) => ServerMessage::History {
                        wave_id: self.wave_id.clone(),
                        wavelet_id,
                        deltas,
                    },
                    _ => ServerMessage::Error {
                        message: format!("no history for {wavelet_id}"),
                    },
                };
                (vec![reply], None)
            }

            ClientMessage::RequestSnapshot { wavelet_id, .. } => {
                let reply = match self.containers.get(&wavelet_id) {
                    Some(container) if !container.is_empty() => self.snapshot(container),
                    _ => ServerMessage::Error {
                        message: format!("unknown wavelet {wavelet_id}"),
                    },
                };
                (vec![reply], None)
            }

            ClientMessage::Ping { nonce } => (vec![ServerMessage::Pong { nonce }], None),
            ClientMessage::Close { .. } => (Vec::new(), None),
        }
    }

    fn snapshot(&self, container: &WaveletContainer) -> ServerMessage {
        ServerMessage::Snapshot {
            wave_id: self.wave_id.clone(),
            snapshot: container.snapshot().unwrap(),
        }
    }
}

// ============================================================================
// Network
// ============================================================================

pub struct Peer {
    pub view: WaveView<RecordingTransport>,
    pub listener: RecordingListener,
    pub inbox: VecDeque<ServerMessage>,
    /// The server's idea of this peer's subscription.
    pub subscribed: Option<IdFilter>,
}

/// Views connected to one loopback server. Nothing moves until the test
/// calls [`pump`](Self::pump), [`deliver`](Self::deliver) or
/// [`settle`](Self::settle).
pub struct Network {
    pub server: LoopbackServer,
    pub peers: Vec<Peer>,
}

impl Network {
    pub fn new(policy: SubmitPolicy) -> Self {
        Self {
            server: LoopbackServer::new(policy),
            peers: Vec::new(),
        }
    }

    /// Add a view and open it on the whole wave.
    pub fn join(&mut self, participant: ParticipantId) -> usize {
        self.join_with(participant, MultiplexerConfig::default(), IdFilter::All)
    }

    pub fn join_with(
        &mut self,
        participant: ParticipantId,
        config: MultiplexerConfig,
        filter: IdFilter,
    ) -> usize {
        let mut view = WaveView::new(wave(), participant, RecordingTransport::default(), config);
        let listener = RecordingListener::default();
        view.open_with_filter(listener.clone(), filter).unwrap();
        self.peers.push(Peer {
            view,
            listener,
            inbox: VecDeque::new(),
            subscribed: None,
        });
        self.peers.len() - 1
    }

    pub fn view(&mut self, peer: usize) -> &mut WaveView<RecordingTransport> {
        &mut self.peers[peer].view
    }

    /// Hand every queued request to the server, in peer order.
    pub fn pump(&mut self) -> bool {
        let mut moved = false;
        for i in 0..self.peers.len() {
            for message in self.peers[i].view.transport_mut().take() {
                moved = true;
                self.route(i, message);
            }
        }
        moved
    }

    /// Feed one peer everything in its inbox.
    pub fn deliver(&mut self, peer: usize) -> bool {
        let mut moved = false;
        while let Some(message) = self.peers[peer].inbox.pop_front() {
            moved = true;
            self.peers[peer].view.on_server_message(message);
        }
        moved
    }

    /// Feed one peer only the next message in its inbox.
    pub fn deliver_one(&mut self, peer: usize) -> Option<()> {
        let message = self.peers[peer].inbox.pop_front()?;
        self.peers[peer].view.on_server_message(message);
        Some(())
    }

    /// Pump and deliver until nothing moves.
    pub fn settle(&mut self) {
        for _ in 0..100 {
            let mut moved = self.pump();
            for i in 0..self.peers.len() {
                moved |= self.deliver(i);
            }
            if !moved {
                return;
            }
        }
        panic!("network did not settle");
    }

    /// Drop a peer's connection: undelivered replies and unsent requests
    /// are lost, and the server forgets the subscription.
    pub fn disconnect(&mut self, peer: usize) {
        let peer = &mut self.peers[peer];
        peer.inbox.clear();
        peer.view.transport_mut().take();
        peer.subscribed = None;
        peer.view.on_disconnected();
    }

    pub fn reconnect(&mut self, peer: usize) {
        self.peers[peer].view.reconnect().unwrap();
    }

    fn route(&mut self, from: usize, message: ClientMessage) {
        let wavelet_id = match &message {
            ClientMessage::Open { filter, .. } => {
                self.peers[from].subscribed = Some(filter.clone());
                None
            }
            ClientMessage::Close { .. } => {
                self.peers[from].subscribed = None;
                None
            }
            ClientMessage::Submit { wavelet_id, .. } => Some(wavelet_id.clone()),
            _ => None,
        };
        let (replies, announcement) = self.server.handle(message);
        self.peers[from].inbox.extend(replies);

        let (Some(announcement), Some(wavelet_id)) = (announcement, wavelet_id) else {
            return;
        };
        for (i, peer) in self.peers.iter_mut().enumerate() {
            let wanted = peer
                .subscribed
                .as_ref()
                .is_some_and(|filter| filter.matches(&wavelet_id));
            if i != from && wanted {
                peer.inbox.push_back(announcement.clone());
            }
        }
    }
}

// ============================================================================
// WebSocket server
// ============================================================================

/// Start a server on an ephemeral port and return its `ws://` URL.
pub async fn start_test_server() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = SyncServer::new(ServerConfig::for_testing(addr.to_string()));
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    format!("ws://{addr}")
}
