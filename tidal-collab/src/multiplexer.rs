//! Operation channel multiplexer.
//!
//! Owns one [`OperationChannel`] per wavelet of a wave, all sharing a single
//! transport connection.
//!
//! ```text
//!  Unopened ──open()──▶ Opening ──OpenFinished──▶ Open ──close()──▶ Closing ──▶ Closed
//!     ▲                    │                       │
//!     └──── on_disconnected() ◀────────────────────┘      reconnect(): Unopened ─▶ Opening
//! ```
//!
//! Channels may submit only once the open burst has finished; operations
//! submitted earlier are buffered in their channel. Everything the owner
//! needs to react to is queued as a [`MuxEvent`] and drained with
//! [`OperationMultiplexer::poll_event`].
//!
//! Transport failures never surface as errors from `submit`: the
//! multiplexer goes to the disconnected state, keeps the operations, and
//! reports [`MuxEvent::Disconnected`]. A full outgoing queue is not a
//! failure; the refused request is retried on the next flush.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use log::{debug, info, trace, warn};
use thiserror::Error;
use tidal_core::{
    HashedVersion, ParticipantId, TransformedDelta, WaveId, WaveletDelta, WaveletId,
    WaveletOperation, WaveletSnapshot,
};

use crate::channel::{ChannelError, NackAction, OperationChannel, RemoteOperation};
use crate::protocol::{IdFilter, KnownWavelet, ProtocolError, ServerMessage, SubmitResult};

/// Outgoing half of a connection to a wave server.
///
/// Calls only enqueue requests; responses come back as [`ServerMessage`]s
/// that the owner feeds to [`OperationMultiplexer::on_server_message`].
pub trait Transport {
    fn open_stream(
        &mut self,
        wave_id: &WaveId,
        participant: &ParticipantId,
        filter: &IdFilter,
        known: Vec<KnownWavelet>,
    ) -> Result<(), TransportError>;

    fn submit_delta(
        &mut self,
        wave_id: &WaveId,
        wavelet_id: &WaveletId,
        delta: WaveletDelta,
    ) -> Result<(), TransportError>;

    fn fetch_history(
        &mut self,
        wave_id: &WaveId,
        wavelet_id: &WaveletId,
        from: HashedVersion,
        to: HashedVersion,
    ) -> Result<(), TransportError>;

    fn request_snapshot(&mut self, wave_id: &WaveId, wavelet_id: &WaveletId)
        -> Result<(), TransportError>;

    fn close(&mut self, wave_id: &WaveId) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport is disconnected")]
    Disconnected,

    #[error("outgoing queue is full")]
    QueueFull,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxState {
    Unopened,
    Opening,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// Wait until every submitted and pending operation is acknowledged.
    Flush,
    /// Drop unacknowledged operations and report how many.
    Discard,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxEvent {
    /// A wavelet the multiplexer had not seen before.
    WaveletAdded(WaveletSnapshot),
    /// Fresh server state for a wavelet that failed or was no longer
    /// recognised. Local state for it must be rebuilt from the snapshot.
    WaveletReset {
        snapshot: WaveletSnapshot,
        discarded: usize,
    },
    /// Server operations are waiting in [`OperationMultiplexer::receive`].
    OperationsReceived(WaveletId),
    /// The wavelet's channel hit a fatal error and was dropped.
    WaveletFailed {
        error: ChannelError,
        discarded: usize,
    },
    Discarded {
        count: usize,
    },
    OpenFinished,
    Disconnected,
    Closed,
    ServerError(String),
}

/// Multiplexer configuration.
#[derive(Debug, Clone)]
pub struct MultiplexerConfig {
    /// Request a fresh snapshot after a wavelet fails
    pub resync_on_failure: bool,
    /// Submit as soon as a channel has something to send; otherwise the
    /// owner calls [`OperationMultiplexer::flush`]
    pub auto_flush: bool,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            resync_on_failure: true,
            auto_flush: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MuxError {
    #[error("cannot {operation} while {state:?}")]
    InvalidState {
        state: MuxState,
        operation: &'static str,
    },

    #[error("unknown wavelet {0}")]
    UnknownWavelet(WaveletId),

    #[error("wavelet {0} already exists")]
    WaveletExists(WaveletId),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// A request the transport refused with [`TransportError::QueueFull`].
#[derive(Debug, Clone)]
enum Deferred {
    History {
        wavelet_id: WaveletId,
        from: HashedVersion,
        to: HashedVersion,
    },
    Snapshot(WaveletId),
}

struct Slot {
    channel: OperationChannel,
    /// Closing once idle; accepts no new operations.
    closing: bool,
}

/// Demultiplexes one transport stream into per-wavelet channels.
pub struct OperationMultiplexer<T> {
    config: MultiplexerConfig,
    wave_id: WaveId,
    participant: ParticipantId,
    transport: T,
    state: MuxState,
    filter: IdFilter,
    has_opened: bool,
    connected: bool,
    /// An open request is out and its burst has not finished.
    awaiting_open: bool,
    channels: BTreeMap<WaveletId, Slot>,
    /// Failed wavelets waiting for a fresh snapshot.
    resyncing: BTreeSet<WaveletId>,
    /// Removed participants re-added by someone else, waiting for a snapshot.
    rejoining: BTreeSet<WaveletId>,
    /// Wavelets closed by the owner; late messages for them are ignored.
    closed: BTreeSet<WaveletId>,
    deferred: VecDeque<Deferred>,
    /// The transport refused something since the last full flush.
    backlogged: bool,
    events: VecDeque<MuxEvent>,
}

impl<T: Transport> OperationMultiplexer<T> {
    pub fn new(
        wave_id: WaveId,
        participant: ParticipantId,
        transport: T,
        config: MultiplexerConfig,
    ) -> Self {
        Self {
            config,
            wave_id,
            participant,
            transport,
            state: MuxState::Unopened,
            filter: IdFilter::All,
            has_opened: false,
            connected: false,
            awaiting_open: false,
            channels: BTreeMap::new(),
            resyncing: BTreeSet::new(),
            rejoining: BTreeSet::new(),
            closed: BTreeSet::new(),
            deferred: VecDeque::new(),
            backlogged: false,
            events: VecDeque::new(),
        }
    }

    pub fn state(&self) -> MuxState {
        self.state
    }

    pub fn wave_id(&self) -> &WaveId {
        &self.wave_id
    }

    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn channel(&self, wavelet_id: &WaveletId) -> Option<&OperationChannel> {
        self.channels.get(wavelet_id).map(|slot| &slot.channel)
    }

    pub fn wavelet_ids(&self) -> impl Iterator<Item = &WaveletId> {
        self.channels.keys()
    }

    /// No channel has anything submitted or pending.
    pub fn is_idle(&self) -> bool {
        self.channels.values().all(|slot| slot.channel.is_idle())
    }

    pub fn poll_event(&mut self) -> Option<MuxEvent> {
        self.events.pop_front()
    }

    // ------------------------------------------------------------------
    // Owner API
    // ------------------------------------------------------------------

    /// Start streaming the wavelets of this wave that match `filter`.
    pub fn open(&mut self, filter: IdFilter) -> Result<(), MuxError> {
        if self.state != MuxState::Unopened || self.has_opened {
            return Err(self.invalid("open"));
        }
        info!("Opening wave {} as {}", self.wave_id, self.participant);
        self.filter = filter;
        self.has_opened = true;
        self.start_open();
        Ok(())
    }

    /// Reopen after [`on_disconnected`](Self::on_disconnected), resuming
    /// every channel from the version it has reached.
    pub fn reconnect(&mut self) -> Result<(), MuxError> {
        if self.state != MuxState::Unopened || !self.has_opened {
            return Err(self.invalid("reconnect"));
        }
        info!("Reconnecting wave {}", self.wave_id);
        self.start_open();
        Ok(())
    }

    /// Create a channel for a wavelet that exists only locally so far.
    pub fn create_channel(&mut self, wavelet_id: WaveletId) -> Result<(), MuxError> {
        if matches!(self.state, MuxState::Closing | MuxState::Closed) {
            return Err(self.invalid("create a wavelet"));
        }
        if self.channels.contains_key(&wavelet_id) || self.closed.contains(&wavelet_id) {
            return Err(MuxError::WaveletExists(wavelet_id));
        }
        let mut channel =
            OperationChannel::new_local(&self.wave_id, wavelet_id.clone(), self.participant.clone());
        if self.connected && !self.awaiting_open {
            channel.on_connected();
        }
        debug!("Created local channel for {wavelet_id}");
        self.channels.insert(
            wavelet_id,
            Slot {
                channel,
                closing: false,
            },
        );
        Ok(())
    }

    /// Queue local operations on a wavelet.
    pub fn submit(
        &mut self,
        wavelet_id: &WaveletId,
        ops: Vec<WaveletOperation>,
    ) -> Result<(), MuxError> {
        if matches!(self.state, MuxState::Closing | MuxState::Closed) {
            return Err(self.invalid("submit"));
        }
        let slot = self
            .channels
            .get_mut(wavelet_id)
            .ok_or_else(|| MuxError::UnknownWavelet(wavelet_id.clone()))?;
        if slot.closing {
            return Err(ChannelError::Closed {
                wavelet_id: wavelet_id.clone(),
            }
            .into());
        }
        if let Err(error) = slot.channel.send(ops) {
            if matches!(error, ChannelError::Divergence { .. }) {
                self.fail_wavelet(error.clone());
            }
            return Err(error.into());
        }
        if self.config.auto_flush {
            self.flush_wavelet(wavelet_id);
        }
        Ok(())
    }

    /// Submit whatever every channel has ready, after retrying requests
    /// the transport refused earlier.
    pub fn flush(&mut self) {
        self.backlogged = false;
        self.retry_deferred();
        let ids: Vec<WaveletId> = self.channels.keys().cloned().collect();
        for id in &ids {
            self.flush_wavelet(id);
        }
    }

    /// Next server operation for a wavelet's document model.
    pub fn receive(&mut self, wavelet_id: &WaveletId) -> Option<RemoteOperation> {
        self.channels.get_mut(wavelet_id)?.channel.receive()
    }

    /// Stop tracking one wavelet. With [`CloseMode::Discard`] returns how
    /// many local operations were dropped.
    ///
    /// Server messages for it are ignored from then on, except those
    /// showing the participant added to it again: those bring it back as
    /// a new [`MuxEvent::WaveletAdded`].
    pub fn close_wavelet(
        &mut self,
        wavelet_id: &WaveletId,
        mode: CloseMode,
    ) -> Result<usize, MuxError> {
        let slot = self
            .channels
            .get_mut(wavelet_id)
            .ok_or_else(|| MuxError::UnknownWavelet(wavelet_id.clone()))?;
        match mode {
            CloseMode::Flush if !slot.channel.is_idle() => {
                slot.closing = true;
                Ok(0)
            }
            _ => {
                let discarded = slot.channel.close();
                self.channels.remove(wavelet_id);
                self.closed.insert(wavelet_id.clone());
                debug!("Closed wavelet {wavelet_id}");
                Ok(discarded)
            }
        }
    }

    /// Close the whole wave. A flushing close started while opening
    /// completes once the open burst has finished and everything is acked.
    /// Without a connection nothing can be flushed, so it discards.
    pub fn close(&mut self, mode: CloseMode) -> Result<(), MuxError> {
        if matches!(self.state, MuxState::Closing | MuxState::Closed) {
            return Err(self.invalid("close"));
        }
        match mode {
            CloseMode::Flush if self.connected => {
                self.state = MuxState::Closing;
                self.maybe_finish_close();
            }
            _ => {
                let count = self.discard_all();
                self.events.push_back(MuxEvent::Discarded { count });
                self.finish_close();
            }
        }
        Ok(())
    }

    /// The connection dropped. Channels keep their operations for the
    /// reconnect; a flushing close cannot complete and discards instead.
    pub fn on_disconnected(&mut self) {
        if !self.connected {
            return;
        }
        warn!("Wave {} disconnected", self.wave_id);
        self.connected = false;
        self.awaiting_open = false;
        self.deferred.clear();
        self.backlogged = false;
        for slot in self.channels.values_mut() {
            slot.channel.reset();
        }
        match self.state {
            MuxState::Opening | MuxState::Open => self.state = MuxState::Unopened,
            MuxState::Closing => {
                let count = self.discard_all();
                self.events.push_back(MuxEvent::Discarded { count });
                self.state = MuxState::Closed;
                self.events.push_back(MuxEvent::Closed);
                return;
            }
            MuxState::Unopened | MuxState::Closed => {}
        }
        self.events.push_back(MuxEvent::Disconnected);
    }

    /// Drop a wavelet after a fatal error found by the owner (for example
    /// its document model refusing a server operation) and resync it.
    pub fn fail_wavelet(&mut self, error: ChannelError) {
        let wavelet_id = error.wavelet_id().clone();
        let discarded = self
            .channels
            .remove(&wavelet_id)
            .map_or(0, |mut slot| slot.channel.close());
        warn!("Wavelet failed: {error}");
        self.events
            .push_back(MuxEvent::WaveletFailed { error, discarded });

        let active = !matches!(self.state, MuxState::Closing | MuxState::Closed);
        if self.config.resync_on_failure && active {
            self.resyncing.insert(wavelet_id.clone());
            self.request_snapshot(wavelet_id);
        } else {
            self.closed.insert(wavelet_id);
        }
        self.maybe_finish_close();
    }

    // ------------------------------------------------------------------
    // Server input
    // ------------------------------------------------------------------

    pub fn on_server_message(&mut self, message: ServerMessage) {
        if let Some(wave_id) = message.wave_id() {
            if wave_id != &self.wave_id {
                trace!("Ignoring message for wave {wave_id}");
                return;
            }
        }
        if self.state == MuxState::Closed {
            return;
        }

        match message {
            ServerMessage::Snapshot { snapshot, .. } => self.on_snapshot(snapshot),
            ServerMessage::Update {
                wavelet_id,
                deltas,
                committed,
                ..
            } => self.on_update(wavelet_id, deltas, committed),
            ServerMessage::OpenFinished { .. } => self.on_open_finished(),
            ServerMessage::SubmitResponse {
                wavelet_id, result, ..
            } => self.on_submit_response(wavelet_id, result),
            ServerMessage::History {
                wavelet_id, deltas, ..
            } => self.on_history(wavelet_id, deltas),
            ServerMessage::Error { message } => {
                warn!("Server error on wave {}: {message}", self.wave_id);
                self.events.push_back(MuxEvent::ServerError(message));
            }
            ServerMessage::Pong { .. } => {}
        }
        // The connection moved, so the outgoing queue may have room again.
        if self.backlogged && self.config.auto_flush {
            self.flush();
        }
        self.maybe_finish_close();
    }

    fn on_snapshot(&mut self, snapshot: WaveletSnapshot) {
        let wavelet_id = snapshot.wavelet_id.clone();
        if self.closed.contains(&wavelet_id) {
            if !snapshot.participants.contains(&self.participant) {
                trace!("Ignoring snapshot for closed wavelet {wavelet_id}");
                return;
            }
            // Added back while the update was missed, e.g. during a reconnect.
            self.closed.remove(&wavelet_id);
            self.rejoining.insert(wavelet_id.clone());
        }
        if self.rejoining.remove(&wavelet_id) {
            info!("Rejoined wavelet {wavelet_id} at {}", snapshot.version);
            self.insert_from_snapshot(&snapshot);
            self.events.push_back(MuxEvent::WaveletAdded(snapshot));
            return;
        }
        if self.resyncing.remove(&wavelet_id) {
            info!("Resynced wavelet {wavelet_id} at {}", snapshot.version);
            self.insert_from_snapshot(&snapshot);
            self.events.push_back(MuxEvent::WaveletReset {
                snapshot,
                discarded: 0,
            });
            return;
        }

        match self.channels.get_mut(&wavelet_id) {
            Some(slot) if slot.channel.is_expecting_snapshot() => {
                let result = slot.channel.on_snapshot(&snapshot);
                self.after_channel_input(&wavelet_id, result);
            }
            Some(slot) => {
                warn!(
                    "Server no longer recognises {wavelet_id} at {}, resetting",
                    slot.channel.server_version()
                );
                let discarded = slot.channel.close();
                self.insert_from_snapshot(&snapshot);
                self.events
                    .push_back(MuxEvent::WaveletReset { snapshot, discarded });
            }
            None => {
                debug!("New wavelet {wavelet_id} at {}", snapshot.version);
                self.insert_from_snapshot(&snapshot);
                self.events.push_back(MuxEvent::WaveletAdded(snapshot));
            }
        }
    }

    fn on_update(
        &mut self,
        wavelet_id: WaveletId,
        deltas: Vec<TransformedDelta>,
        committed: Option<u64>,
    ) {
        if self.closed.contains(&wavelet_id) {
            let readded = WaveletOperation::AddParticipant(self.participant.clone());
            if deltas.iter().any(|delta| delta.ops.contains(&readded)) {
                self.rejoin(wavelet_id);
            }
            return;
        }
        if self.resyncing.contains(&wavelet_id) || self.rejoining.contains(&wavelet_id) {
            return;
        }
        let Some(slot) = self.channels.get_mut(&wavelet_id) else {
            warn!("Update for unknown wavelet {wavelet_id}");
            return;
        };
        let result = slot.channel.on_server_deltas(deltas);
        if let Some(committed) = committed {
            slot.channel.on_commit(committed);
        }
        self.after_channel_input(&wavelet_id, result);
    }

    fn on_history(&mut self, wavelet_id: WaveletId, deltas: Vec<TransformedDelta>) {
        if self.closed.contains(&wavelet_id) {
            return;
        }
        if let Some(slot) = self.channels.get_mut(&wavelet_id) {
            let result = slot.channel.on_history(deltas);
            self.after_channel_input(&wavelet_id, result);
        }
    }

    fn on_submit_response(&mut self, wavelet_id: WaveletId, result: SubmitResult) {
        if self.closed.contains(&wavelet_id) {
            debug!("Ignoring late submit response for closed wavelet {wavelet_id}");
            return;
        }
        let Some(slot) = self.channels.get_mut(&wavelet_id) else {
            return;
        };
        match result {
            SubmitResult::Ack {
                ops_applied,
                version,
                ..
            } => {
                let result = slot.channel.on_ack(ops_applied, version);
                self.after_channel_input(&wavelet_id, result);
            }
            SubmitResult::Rejected(rejection) => match slot.channel.on_nack(rejection) {
                Ok(NackAction::FetchHistory { from, to }) => {
                    self.send_deferred(Deferred::History { wavelet_id, from, to });
                }
                Ok(NackAction::Resubmit) => self.flush_wavelet(&wavelet_id),
                Err(error) => self.fail_wavelet(error),
            },
        }
    }

    fn on_open_finished(&mut self) {
        if !self.awaiting_open {
            debug!("Unexpected open-finished while {:?}", self.state);
            return;
        }
        self.awaiting_open = false;
        info!(
            "Wave {} open with {} wavelets",
            self.wave_id,
            self.channels.len()
        );
        // A flushing close may have started meanwhile; it stays Closing.
        if self.state == MuxState::Opening {
            self.state = MuxState::Open;
        }
        for slot in self.channels.values_mut() {
            slot.channel.on_connected();
        }
        self.flush();
        self.events.push_back(MuxEvent::OpenFinished);
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn invalid(&self, operation: &'static str) -> MuxError {
        MuxError::InvalidState {
            state: self.state,
            operation,
        }
    }

    fn start_open(&mut self) {
        self.state = MuxState::Opening;
        self.connected = true;
        self.awaiting_open = true;
        let known = self
            .channels
            .iter()
            .map(|(id, slot)| KnownWavelet {
                wavelet_id: id.clone(),
                version: slot.channel.server_version(),
            })
            .collect();
        let result = self
            .transport
            .open_stream(&self.wave_id, &self.participant, &self.filter, known);
        self.check_transport(result);
    }

    fn insert_from_snapshot(&mut self, snapshot: &WaveletSnapshot) {
        let mut channel = OperationChannel::new(
            snapshot.wavelet_id.clone(),
            self.participant.clone(),
            snapshot.version,
        );
        channel.on_commit(snapshot.committed_version);
        if self.connected && !self.awaiting_open {
            channel.on_connected();
        }
        self.channels.insert(
            snapshot.wavelet_id.clone(),
            Slot {
                channel,
                closing: false,
            },
        );
    }

    fn after_channel_input(&mut self, wavelet_id: &WaveletId, result: Result<(), ChannelError>) {
        if let Err(error) = result {
            self.fail_wavelet(error);
            return;
        }
        let Some(slot) = self.channels.get(wavelet_id) else {
            return;
        };
        if slot.channel.has_received() {
            self.events
                .push_back(MuxEvent::OperationsReceived(wavelet_id.clone()));
        }
        if self.config.auto_flush {
            self.flush_wavelet(wavelet_id);
        }
        if let Some(slot) = self.channels.get(wavelet_id) {
            if slot.closing && slot.channel.is_idle() {
                self.channels.remove(wavelet_id);
                self.closed.insert(wavelet_id.clone());
                debug!("Closed wavelet {wavelet_id} after flush");
            }
        }
    }

    fn flush_wavelet(&mut self, wavelet_id: &WaveletId) {
        if !self.connected {
            return;
        }
        let delta = match self.channels.get_mut(wavelet_id) {
            Some(slot) => slot.channel.flush(),
            None => None,
        };
        let Some(delta) = delta else {
            return;
        };
        match self.transport.submit_delta(&self.wave_id, wavelet_id, delta) {
            Err(TransportError::QueueFull) => {
                debug!("Outgoing queue full, holding back {wavelet_id}");
                self.backlogged = true;
                if let Some(slot) = self.channels.get_mut(wavelet_id) {
                    slot.channel.unsend();
                }
            }
            result => self.check_transport(result),
        }
    }

    /// Treat a failed request as a lost connection. `QueueFull` is handled
    /// by the callers that can retry.
    fn check_transport(&mut self, result: Result<(), TransportError>) {
        if let Err(error) = result {
            warn!("Transport failed on wave {}: {error}", self.wave_id);
            self.on_disconnected();
        }
    }

    fn request_snapshot(&mut self, wavelet_id: WaveletId) {
        self.send_deferred(Deferred::Snapshot(wavelet_id));
    }

    /// Send a history or snapshot request, keeping it for a later flush
    /// if the queue is full.
    fn send_deferred(&mut self, request: Deferred) {
        if !self.connected {
            return;
        }
        let result = match &request {
            Deferred::History {
                wavelet_id,
                from,
                to,
            } => self
                .transport
                .fetch_history(&self.wave_id, wavelet_id, *from, *to),
            Deferred::Snapshot(wavelet_id) => {
                self.transport.request_snapshot(&self.wave_id, wavelet_id)
            }
        };
        match result {
            Err(TransportError::QueueFull) => {
                debug!("Outgoing queue full, deferring {request:?}");
                self.backlogged = true;
                self.deferred.push_back(request);
            }
            result => self.check_transport(result),
        }
    }

    fn retry_deferred(&mut self) {
        for request in std::mem::take(&mut self.deferred) {
            self.send_deferred(request);
        }
    }

    /// Someone added the local participant back to a wavelet it had left.
    fn rejoin(&mut self, wavelet_id: WaveletId) {
        info!("{} was added back to {wavelet_id}", self.participant);
        self.closed.remove(&wavelet_id);
        self.rejoining.insert(wavelet_id.clone());
        self.request_snapshot(wavelet_id);
    }

    fn discard_all(&mut self) -> usize {
        let mut count = 0;
        for (id, mut slot) in std::mem::take(&mut self.channels) {
            count += slot.channel.close();
            self.closed.insert(id);
        }
        count
    }

    fn maybe_finish_close(&mut self) {
        if self.state == MuxState::Closing && self.is_idle() {
            self.finish_close();
        }
    }

    fn finish_close(&mut self) {
        if self.connected {
            let result = self.transport.close(&self.wave_id);
            if let Err(error) = result {
                warn!("Failed to close wave {} cleanly: {error}", self.wave_id);
            }
        }
        for (id, mut slot) in std::mem::take(&mut self.channels) {
            slot.channel.close();
            self.closed.insert(id);
        }
        self.connected = false;
        self.state = MuxState::Closed;
        info!("Wave {} closed", self.wave_id);
        self.events.push_back(MuxEvent::Closed);
    }
}
