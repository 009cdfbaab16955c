//! Wave view: the editor-facing façade over a multiplexer.
//!
//! Holds the local state of every wavelet in one wave, applies local edits
//! immediately, keeps an undo manager per document, and turns multiplexer
//! events into listener callbacks.
//!
//! ```text
//!  editor ── submit_local_operation ──▶ WaveView ── submit ──▶ Multiplexer ──▶ Transport
//!    ▲                                    │  ▲                      │
//!    └── remote listeners ◀── deliver ────┘  └──── poll_event ──────┘
//! ```
//!
//! Listener callbacks run synchronously on the thread that feeds the view.
//! `on_wavelet_added` and `on_wavelet_removed` fire once each time the
//! participant joins or leaves a wavelet; reconnects and resyncs never
//! repeat them.

use std::collections::{BTreeMap, BTreeSet};

use log::{debug, warn};
use thiserror::Error;
use tidal_core::{
    invert_operation, DocOp, Document, DocumentId, DocumentModel, ParticipantId, UndoError,
    UndoManager, WaveId, WaveletApplyError, WaveletData, WaveletId, WaveletOperation,
    WaveletSnapshot,
};
use uuid::Uuid;

use crate::channel::{ChannelError, RemoteOperation};
use crate::multiplexer::{
    CloseMode, MultiplexerConfig, MuxError, MuxEvent, OperationMultiplexer, Transport,
};
use crate::protocol::{IdFilter, ServerMessage};

/// Lifecycle callbacks for the wavelets of a view. All default to no-ops.
pub trait WaveViewListener {
    fn on_wavelet_added(&mut self, _wavelet_id: &WaveletId) {}

    fn on_wavelet_removed(&mut self, _wavelet_id: &WaveletId) {}

    /// A wavelet stopped syncing. Its state is replaced once the resync
    /// snapshot arrives.
    fn on_wavelet_failed(&mut self, _error: &ChannelError) {}

    /// Local operations were dropped; `None` means the whole wave.
    fn on_operations_discarded(&mut self, _wavelet_id: Option<&WaveletId>, _count: usize) {}

    fn on_open_finished(&mut self) {}
}

/// Called for every server operation after it has been applied locally.
pub type RemoteOperationListener = Box<dyn FnMut(&WaveletId, &RemoteOperation) + Send>;

#[derive(Debug, Error)]
pub enum ViewError {
    #[error("unknown wavelet {0}")]
    UnknownWavelet(WaveletId),

    #[error("wavelet {wavelet_id}: {source}")]
    Apply {
        wavelet_id: WaveletId,
        #[source]
        source: WaveletApplyError,
    },

    #[error("wavelet {wavelet_id}, document {document}: {source}")]
    Undo {
        wavelet_id: WaveletId,
        document: DocumentId,
        #[source]
        source: UndoError,
    },

    #[error(transparent)]
    Mux(#[from] MuxError),
}

struct ViewWavelet<D> {
    data: WaveletData<D>,
    undo: BTreeMap<DocumentId, UndoManager>,
}

impl<D> ViewWavelet<D> {
    fn new(data: WaveletData<D>) -> Self {
        Self {
            data,
            undo: BTreeMap::new(),
        }
    }
}

enum History {
    Undo,
    Redo,
}

/// Local replica of one wave for one participant.
pub struct WaveView<T, D = Document> {
    wave_id: WaveId,
    participant: ParticipantId,
    mux: OperationMultiplexer<T>,
    listener: Option<Box<dyn WaveViewListener + Send>>,
    wavelets: BTreeMap<WaveletId, ViewWavelet<D>>,
    remote_listeners: BTreeMap<WaveletId, Vec<RemoteOperationListener>>,
    /// Wavelets the listener currently knows about.
    announced: BTreeSet<WaveletId>,
}

impl<T: Transport, D: DocumentModel + Default + Clone> WaveView<T, D> {
    pub fn new(
        wave_id: WaveId,
        participant: ParticipantId,
        transport: T,
        config: MultiplexerConfig,
    ) -> Self {
        let mux =
            OperationMultiplexer::new(wave_id.clone(), participant.clone(), transport, config);
        Self {
            wave_id,
            participant,
            mux,
            listener: None,
            wavelets: BTreeMap::new(),
            remote_listeners: BTreeMap::new(),
            announced: BTreeSet::new(),
        }
    }

    pub fn wave_id(&self) -> &WaveId {
        &self.wave_id
    }

    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }

    pub fn multiplexer(&self) -> &OperationMultiplexer<T> {
        &self.mux
    }

    pub fn transport_mut(&mut self) -> &mut T {
        self.mux.transport_mut()
    }

    pub fn wavelet(&self, wavelet_id: &WaveletId) -> Option<&WaveletData<D>> {
        self.wavelets.get(wavelet_id).map(|w| &w.data)
    }

    pub fn wavelet_ids(&self) -> impl Iterator<Item = &WaveletId> {
        self.wavelets.keys()
    }

    pub fn document(&self, wavelet_id: &WaveletId, document: &DocumentId) -> Option<&D> {
        self.wavelet(wavelet_id)?.document(document)
    }

    pub fn can_undo(&self, wavelet_id: &WaveletId, document: &DocumentId) -> bool {
        self.undo_manager(wavelet_id, document)
            .is_some_and(UndoManager::can_undo)
    }

    pub fn can_redo(&self, wavelet_id: &WaveletId, document: &DocumentId) -> bool {
        self.undo_manager(wavelet_id, document)
            .is_some_and(UndoManager::can_redo)
    }

    fn undo_manager(&self, wavelet_id: &WaveletId, document: &DocumentId) -> Option<&UndoManager> {
        self.wavelets.get(wavelet_id)?.undo.get(document)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    pub fn open(&mut self, listener: impl WaveViewListener + Send + 'static) -> Result<(), ViewError> {
        self.open_with_filter(listener, IdFilter::All)
    }

    pub fn open_with_filter(
        &mut self,
        listener: impl WaveViewListener + Send + 'static,
        filter: IdFilter,
    ) -> Result<(), ViewError> {
        self.listener = Some(Box::new(listener));
        self.mux.open(filter)?;
        self.dispatch();
        Ok(())
    }

    pub fn close(&mut self, mode: CloseMode) -> Result<(), ViewError> {
        self.mux.close(mode)?;
        self.dispatch();
        Ok(())
    }

    pub fn on_server_message(&mut self, message: ServerMessage) {
        self.mux.on_server_message(message);
        self.dispatch();
    }

    pub fn on_disconnected(&mut self) {
        self.mux.on_disconnected();
        self.dispatch();
    }

    /// Retry anything the transport refused because its queue was full.
    pub fn flush(&mut self) {
        self.mux.flush();
        self.dispatch();
    }

    pub fn reconnect(&mut self) -> Result<(), ViewError> {
        self.mux.reconnect()?;
        self.dispatch();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Local edits
    // ------------------------------------------------------------------

    /// Create a wavelet with the local participant in it. Editing can start
    /// right away; the server learns about it with the first submission.
    pub fn create_wavelet(&mut self) -> Result<WaveletId, ViewError> {
        let wavelet_id = WaveletId::new(format!("w+{}", Uuid::new_v4().simple()));
        self.mux.create_channel(wavelet_id.clone())?;
        let data = WaveletData::new(self.wave_id.clone(), wavelet_id.clone());
        self.wavelets
            .insert(wavelet_id.clone(), ViewWavelet::new(data));
        self.announce_added(&wavelet_id);
        self.submit(
            &wavelet_id,
            WaveletOperation::AddParticipant(self.participant.clone()),
        )?;
        debug!("Created wavelet {wavelet_id}");
        Ok(wavelet_id)
    }

    /// Apply an edit to the local document and send it. The edit becomes
    /// undoable for that document.
    pub fn submit_local_operation(
        &mut self,
        wavelet_id: &WaveletId,
        document: DocumentId,
        op: DocOp,
    ) -> Result<(), ViewError> {
        self.submit(
            wavelet_id,
            WaveletOperation::document(document.clone(), op.clone()),
        )?;
        if let Some(wavelet) = self.wavelets.get_mut(wavelet_id) {
            wavelet.undo.entry(document).or_default().undoable_op(op);
        }
        Ok(())
    }

    pub fn add_participant(
        &mut self,
        wavelet_id: &WaveletId,
        participant: ParticipantId,
    ) -> Result<(), ViewError> {
        self.submit(wavelet_id, WaveletOperation::AddParticipant(participant))
    }

    /// Remove a participant. Removing the local participant also removes
    /// the wavelet from this view once the removal is acknowledged.
    pub fn remove_participant(
        &mut self,
        wavelet_id: &WaveletId,
        participant: ParticipantId,
    ) -> Result<(), ViewError> {
        let leaving = participant == self.participant;
        self.submit(wavelet_id, WaveletOperation::RemoveParticipant(participant))?;
        if leaving {
            self.drop_wavelet(wavelet_id, CloseMode::Flush);
        }
        Ok(())
    }

    /// Close the current undo batch of a document.
    pub fn checkpoint(&mut self, wavelet_id: &WaveletId, document: &DocumentId) {
        if let Some(wavelet) = self.wavelets.get_mut(wavelet_id) {
            wavelet
                .undo
                .entry(document.clone())
                .or_default()
                .checkpoint();
        }
    }

    /// Undo the last batch of local edits to a document, keeping every
    /// remote edit made since. Returns the operation that was applied.
    pub fn undo(
        &mut self,
        wavelet_id: &WaveletId,
        document: &DocumentId,
    ) -> Result<Option<DocOp>, ViewError> {
        self.step_history(wavelet_id, document, History::Undo)
    }

    pub fn redo(
        &mut self,
        wavelet_id: &WaveletId,
        document: &DocumentId,
    ) -> Result<Option<DocOp>, ViewError> {
        self.step_history(wavelet_id, document, History::Redo)
    }

    pub fn register_remote_operation_listener(
        &mut self,
        wavelet_id: WaveletId,
        listener: impl FnMut(&WaveletId, &RemoteOperation) + Send + 'static,
    ) {
        self.remote_listeners
            .entry(wavelet_id)
            .or_default()
            .push(Box::new(listener));
    }

    fn step_history(
        &mut self,
        wavelet_id: &WaveletId,
        document: &DocumentId,
        step: History,
    ) -> Result<Option<DocOp>, ViewError> {
        let wavelet = self
            .wavelets
            .get_mut(wavelet_id)
            .ok_or_else(|| ViewError::UnknownWavelet(wavelet_id.clone()))?;
        let Some(manager) = wavelet.undo.get_mut(document) else {
            return Ok(None);
        };
        let op = match step {
            History::Undo => manager.undo(),
            History::Redo => manager.redo(),
        }
        .map_err(|source| ViewError::Undo {
            wavelet_id: wavelet_id.clone(),
            document: document.clone(),
            source,
        })?;
        let Some(op) = op else {
            return Ok(None);
        };
        self.submit(
            wavelet_id,
            WaveletOperation::document(document.clone(), op.clone()),
        )?;
        Ok(Some(op))
    }

    /// Apply locally, then hand to the multiplexer. A refused submission is
    /// rolled back so local state never runs ahead of what was sent.
    fn submit(&mut self, wavelet_id: &WaveletId, op: WaveletOperation) -> Result<(), ViewError> {
        let wavelet = self
            .wavelets
            .get_mut(wavelet_id)
            .ok_or_else(|| ViewError::UnknownWavelet(wavelet_id.clone()))?;
        wavelet
            .data
            .apply_operation(&op)
            .map_err(|source| ViewError::Apply {
                wavelet_id: wavelet_id.clone(),
                source,
            })?;

        if let Err(error) = self.mux.submit(wavelet_id, vec![op.clone()]) {
            if let Some(wavelet) = self.wavelets.get_mut(wavelet_id) {
                if let Err(rollback) = wavelet.data.apply_operation(&invert_operation(&op)) {
                    warn!("Failed to roll back refused operation on {wavelet_id}: {rollback}");
                }
            }
            self.dispatch();
            return Err(error.into());
        }
        self.dispatch();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Multiplexer events
    // ------------------------------------------------------------------

    fn notify(&mut self, callback: impl FnOnce(&mut dyn WaveViewListener)) {
        if let Some(listener) = self.listener.as_mut() {
            callback(listener.as_mut());
        }
    }

    fn dispatch(&mut self) {
        while let Some(event) = self.mux.poll_event() {
            match event {
                MuxEvent::WaveletAdded(snapshot) => self.on_wavelet_added(&snapshot),
                MuxEvent::WaveletReset {
                    snapshot,
                    discarded,
                } => {
                    self.on_wavelet_reset(&snapshot);
                    if discarded > 0 {
                        let id = snapshot.wavelet_id;
                        self.notify(|l| l.on_operations_discarded(Some(&id), discarded));
                    }
                }
                MuxEvent::OperationsReceived(wavelet_id) => self.deliver(&wavelet_id),
                MuxEvent::WaveletFailed { error, discarded } => {
                    self.notify(|l| l.on_wavelet_failed(&error));
                    if discarded > 0 {
                        let id = error.wavelet_id().clone();
                        self.notify(|l| l.on_operations_discarded(Some(&id), discarded));
                    }
                }
                MuxEvent::Discarded { count } => {
                    self.notify(|l| l.on_operations_discarded(None, count))
                }
                MuxEvent::OpenFinished => self.notify(|l| l.on_open_finished()),
                MuxEvent::Disconnected | MuxEvent::Closed | MuxEvent::ServerError(_) => {}
            }
        }
    }

    fn on_wavelet_added(&mut self, snapshot: &WaveletSnapshot) {
        let wavelet_id = snapshot.wavelet_id.clone();
        match WaveletData::from_snapshot(self.wave_id.clone(), snapshot) {
            Ok(data) => {
                self.wavelets.insert(wavelet_id.clone(), ViewWavelet::new(data));
                self.announce_added(&wavelet_id);
            }
            Err(source) => self
                .mux
                .fail_wavelet(ChannelError::DocumentApply { wavelet_id, source }),
        }
    }

    fn on_wavelet_reset(&mut self, snapshot: &WaveletSnapshot) {
        let wavelet_id = snapshot.wavelet_id.clone();
        match WaveletData::from_snapshot(self.wave_id.clone(), snapshot) {
            Ok(data) => {
                debug!("Rebuilt {wavelet_id} from snapshot at {}", snapshot.version);
                // Undo history referred to the discarded state.
                self.wavelets.insert(wavelet_id.clone(), ViewWavelet::new(data));
                self.announce_added(&wavelet_id);
            }
            Err(source) => self
                .mux
                .fail_wavelet(ChannelError::DocumentApply { wavelet_id, source }),
        }
    }

    fn deliver(&mut self, wavelet_id: &WaveletId) {
        while let Some(remote) = self.mux.receive(wavelet_id) {
            let Some(wavelet) = self.wavelets.get_mut(wavelet_id) else {
                continue;
            };
            if let Err(source) = wavelet.data.apply_operation(&remote.op) {
                self.mux.fail_wavelet(ChannelError::DocumentApply {
                    wavelet_id: wavelet_id.clone(),
                    source,
                });
                return;
            }
            if let WaveletOperation::Document { document, op } = &remote.op {
                if let Some(manager) = wavelet.undo.get_mut(document) {
                    manager.non_undoable_op(op.clone());
                }
            }
            if let Some(listeners) = self.remote_listeners.get_mut(wavelet_id) {
                for listener in listeners.iter_mut() {
                    listener(wavelet_id, &remote);
                }
            }
            if remote.op == WaveletOperation::RemoveParticipant(self.participant.clone()) {
                debug!("{} was removed from {wavelet_id}", self.participant);
                self.drop_wavelet(wavelet_id, CloseMode::Discard);
                return;
            }
        }
    }

    fn announce_added(&mut self, wavelet_id: &WaveletId) {
        if self.announced.insert(wavelet_id.clone()) {
            self.notify(|l| l.on_wavelet_added(wavelet_id));
        }
    }

    fn drop_wavelet(&mut self, wavelet_id: &WaveletId, mode: CloseMode) {
        let discarded = self.mux.close_wavelet(wavelet_id, mode).unwrap_or(0);
        self.wavelets.remove(wavelet_id);
        if discarded > 0 {
            self.notify(|l| l.on_operations_discarded(Some(wavelet_id), discarded));
        }
        if self.announced.remove(wavelet_id) {
            self.notify(|l| l.on_wavelet_removed(wavelet_id));
        }
    }
}
