//! Per-wavelet operation channel.
//!
//! Keeps the local and server operation streams of one wavelet convergent
//! while allowing at most one submitted delta to be unacknowledged.
//!
//! ```text
//!             send()                       flush()
//!  editor ──────────▶ pending ──────────────────────▶ in flight ──▶ server
//!     ▲                  ▲                                 ▲          │
//!     │ receive()        │ transform                       │ ack      │
//!     │                  │                                 │          │
//!  received ◀─────── server delta ──── transform ──────────┘ ◀────────┘
//! ```
//!
//! State is relative to `server_version`: the in-flight delta applies on top
//! of it, pending on top of the in-flight delta, and the received queue on top
//! of what the editor currently shows.
//!
//! The channel is a synchronous state machine. It never talks to the
//! transport itself; `flush` hands out the delta to submit and `on_nack`
//! says what to fetch.

use std::collections::{BTreeMap, VecDeque};

use log::{debug, trace, warn};
use thiserror::Error;
use tidal_core::{
    compose_into, transform_operation_lists, ComposeError, HashedVersion, ParticipantId,
    TransformError, TransformedDelta, WaveId, WaveletApplyError, WaveletDelta, WaveletId,
    WaveletOperation, WaveletSnapshot,
};

use crate::protocol::SubmitRejection;

/// A server operation ready for the local document model, already
/// transformed past every local edit the editor has made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteOperation {
    pub author: ParticipantId,
    pub op: WaveletOperation,
}

/// What the owner must do after a rejected submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackAction {
    /// Fetch the deltas in `[from, to)`; the channel resubmits once it has them.
    FetchHistory {
        from: HashedVersion,
        to: HashedVersion,
    },
    /// The channel is already caught up; `flush` returns the retry.
    Resubmit,
}

/// Why local and server state can no longer be reconciled.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Divergence {
    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Compose(#[from] ComposeError),

    #[error("expected a delta at {expected}, got one at {found}")]
    VersionMismatch {
        expected: HashedVersion,
        found: HashedVersion,
    },

    #[error("delta ending at {0} does not hash to its version")]
    HashMismatch(HashedVersion),

    #[error("ack for {acked} does not match the in-flight delta (expected {expected})")]
    AckMismatch {
        acked: HashedVersion,
        expected: HashedVersion,
    },

    #[error("ack for {0} with nothing in flight")]
    UnexpectedAck(HashedVersion),

    #[error("rejection with nothing in flight")]
    UnexpectedNack,
}

/// Channel-fatal errors. Each names the wavelet it happened on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("wavelet {wavelet_id} diverged from the server: {reason}")]
    Divergence {
        wavelet_id: WaveletId,
        reason: Divergence,
    },

    #[error("wavelet {wavelet_id}: submission rejected: {rejection}")]
    SubmitRejected {
        wavelet_id: WaveletId,
        rejection: SubmitRejection,
    },

    #[error("wavelet {wavelet_id} is closed")]
    Closed { wavelet_id: WaveletId },

    #[error("wavelet {wavelet_id}: {source}")]
    DocumentApply {
        wavelet_id: WaveletId,
        #[source]
        source: WaveletApplyError,
    },
}

impl ChannelError {
    pub fn wavelet_id(&self) -> &WaveletId {
        match self {
            ChannelError::Divergence { wavelet_id, .. }
            | ChannelError::SubmitRejected { wavelet_id, .. }
            | ChannelError::Closed { wavelet_id }
            | ChannelError::DocumentApply { wavelet_id, .. } => wavelet_id,
        }
    }
}

fn diverged(wavelet_id: &WaveletId, reason: impl Into<Divergence>) -> ChannelError {
    ChannelError::Divergence {
        wavelet_id: wavelet_id.clone(),
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, Copy)]
struct HeldAck {
    ops_applied: usize,
    version: HashedVersion,
}

impl HeldAck {
    fn applied_at(&self) -> u64 {
        self.version.version.saturating_sub(self.ops_applied as u64)
    }
}

#[derive(Debug, Clone)]
struct InFlight {
    ops: Vec<WaveletOperation>,
    /// Submitted on the current connection and not rejected since.
    sent: bool,
}

/// Operation channel for one wavelet.
#[derive(Debug, Clone)]
pub struct OperationChannel {
    wavelet_id: WaveletId,
    author: ParticipantId,
    server_version: HashedVersion,
    committed: u64,

    in_flight: Option<InFlight>,
    pending: Vec<WaveletOperation>,
    received: VecDeque<RemoteOperation>,

    held_ack: Option<HeldAck>,
    /// Deltas that arrived ahead of a gap, keyed by the version they apply at.
    held_deltas: BTreeMap<u64, TransformedDelta>,
    /// Version to reach through fetched history before resubmitting.
    awaiting_history: Option<HashedVersion>,

    connected: bool,
    /// After a reconnect: the in-flight delta may already be applied, so a
    /// catch-up delta equal to it counts as its ack.
    echo_window: bool,
    /// Created locally; the server may still announce the wavelet.
    expecting_snapshot: bool,
    verify_ack: bool,
    closed: bool,
}

impl OperationChannel {
    /// A channel for a wavelet the server already knows, at `version`.
    pub fn new(wavelet_id: WaveletId, author: ParticipantId, version: HashedVersion) -> Self {
        Self {
            wavelet_id,
            author,
            server_version: version,
            committed: 0,
            in_flight: None,
            pending: Vec::new(),
            received: VecDeque::new(),
            held_ack: None,
            held_deltas: BTreeMap::new(),
            awaiting_history: None,
            connected: false,
            echo_window: false,
            expecting_snapshot: false,
            verify_ack: true,
            closed: false,
        }
    }

    /// A channel for a wavelet created locally, before the server has seen it.
    pub fn new_local(wave_id: &WaveId, wavelet_id: WaveletId, author: ParticipantId) -> Self {
        let zero = HashedVersion::zero(wave_id, &wavelet_id);
        Self {
            expecting_snapshot: true,
            ..Self::new(wavelet_id, author, zero)
        }
    }

    pub fn wavelet_id(&self) -> &WaveletId {
        &self.wavelet_id
    }

    /// Last server version this channel has fully processed.
    pub fn server_version(&self) -> HashedVersion {
        self.server_version
    }

    pub fn committed_version(&self) -> u64 {
        self.committed
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_expecting_snapshot(&self) -> bool {
        self.expecting_snapshot
    }

    pub fn in_flight(&self) -> Option<&[WaveletOperation]> {
        self.in_flight.as_ref().map(|f| f.ops.as_slice())
    }

    pub fn pending(&self) -> &[WaveletOperation] {
        &self.pending
    }

    /// Nothing left to submit or to wait for.
    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none() && self.pending.is_empty()
    }

    pub fn has_received(&self) -> bool {
        !self.received.is_empty()
    }

    fn ensure_open(&self) -> Result<(), ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed {
                wavelet_id: self.wavelet_id.clone(),
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Local side
    // ------------------------------------------------------------------

    /// Queue local operations, made against the document as the editor
    /// currently shows it. Never blocks and never submits by itself.
    pub fn send(&mut self, ops: Vec<WaveletOperation>) -> Result<(), ChannelError> {
        self.ensure_open()?;
        let mut ops: Vec<WaveletOperation> = ops.into_iter().filter(|op| !op.is_noop()).collect();
        if ops.is_empty() {
            return Ok(());
        }

        if !self.received.is_empty() {
            // The editor has not seen these server ops yet, so the local ops
            // are concurrent with them.
            let server: Vec<WaveletOperation> =
                self.received.iter().map(|remote| remote.op.clone()).collect();
            let (local, server) = transform_operation_lists(&ops, &server)
                .map_err(|e| diverged(&self.wavelet_id, e))?;
            for (remote, op) in self.received.iter_mut().zip(server) {
                remote.op = op;
            }
            ops = local;
        }

        trace!("{}: queued {} local ops", self.wavelet_id, ops.len());
        for op in ops {
            compose_into(&mut self.pending, op).map_err(|e| diverged(&self.wavelet_id, e))?;
        }
        Ok(())
    }

    /// The delta to submit now, if any. Returns `None` while a delta is
    /// unacknowledged, so at most one is ever outstanding.
    pub fn flush(&mut self) -> Option<WaveletDelta> {
        if self.closed || !self.connected || self.echo_window || self.awaiting_history.is_some() {
            return None;
        }

        if let Some(in_flight) = &mut self.in_flight {
            if in_flight.sent {
                return None;
            }
            debug!(
                "{}: resubmitting {} ops at {}",
                self.wavelet_id,
                in_flight.ops.len(),
                self.server_version
            );
            in_flight.sent = true;
            return Some(WaveletDelta {
                author: self.author.clone(),
                target_version: self.server_version,
                ops: in_flight.ops.clone(),
            });
        }

        let ops: Vec<WaveletOperation> = std::mem::take(&mut self.pending)
            .into_iter()
            .filter(|op| !op.is_noop())
            .collect();
        if ops.is_empty() {
            return None;
        }
        trace!(
            "{}: submitting {} ops at {}",
            self.wavelet_id,
            ops.len(),
            self.server_version
        );
        self.in_flight = Some(InFlight {
            ops: ops.clone(),
            sent: true,
        });
        Some(WaveletDelta {
            author: self.author.clone(),
            target_version: self.server_version,
            ops,
        })
    }

    /// The delta from the last [`flush`](Self::flush) never left the
    /// client. The next `flush` returns it again, against whatever version
    /// the channel has reached by then.
    pub fn unsend(&mut self) {
        if let Some(in_flight) = &mut self.in_flight {
            in_flight.sent = false;
        }
    }

    // ------------------------------------------------------------------
    // Server side
    // ------------------------------------------------------------------

    /// The next server operation for the document model, in order.
    pub fn receive(&mut self) -> Option<RemoteOperation> {
        self.received.pop_front()
    }

    pub fn peek(&self) -> Option<&RemoteOperation> {
        self.received.front()
    }

    /// The in-flight delta was applied, producing `version`.
    ///
    /// Held until every delta the server applied before it has arrived.
    pub fn on_ack(&mut self, ops_applied: usize, version: HashedVersion) -> Result<(), ChannelError> {
        self.ensure_open()?;
        if self.in_flight.is_none() || self.held_ack.is_some() {
            return Err(diverged(&self.wavelet_id, Divergence::UnexpectedAck(version)));
        }
        self.held_ack = Some(HeldAck {
            ops_applied,
            version,
        });
        self.drain_held()
    }

    /// Deltas other clients submitted, in server order. Duplicates are
    /// skipped and deltas beyond a gap wait for it to fill.
    pub fn on_server_deltas<I>(&mut self, deltas: I) -> Result<(), ChannelError>
    where
        I: IntoIterator<Item = TransformedDelta>,
    {
        self.ensure_open()?;
        for delta in deltas {
            let at = self.server_version.version;
            if delta.resulting_version.version <= at {
                trace!(
                    "{}: skipping already seen delta ending at {}",
                    self.wavelet_id,
                    delta.resulting_version
                );
                continue;
            }
            if delta.applied_at.version < at {
                return Err(diverged(
                    &self.wavelet_id,
                    Divergence::VersionMismatch {
                        expected: self.server_version,
                        found: delta.applied_at,
                    },
                ));
            }
            self.held_deltas.insert(delta.applied_at.version, delta);
        }
        self.drain_held()
    }

    /// Deltas fetched after a stale rejection.
    pub fn on_history<I>(&mut self, deltas: I) -> Result<(), ChannelError>
    where
        I: IntoIterator<Item = TransformedDelta>,
    {
        self.on_server_deltas(deltas)
    }

    /// The server refused the in-flight delta.
    pub fn on_nack(&mut self, rejection: SubmitRejection) -> Result<NackAction, ChannelError> {
        self.ensure_open()?;
        let Some(in_flight) = self.in_flight.as_mut() else {
            return Err(diverged(&self.wavelet_id, Divergence::UnexpectedNack));
        };
        let current = match rejection {
            SubmitRejection::StaleVersion { current } => current,
            rejection => {
                warn!("{}: submission rejected: {rejection}", self.wavelet_id);
                return Err(ChannelError::SubmitRejected {
                    wavelet_id: self.wavelet_id.clone(),
                    rejection,
                });
            }
        };

        in_flight.sent = false;
        if current.version > self.server_version.version {
            debug!(
                "{}: stale at {}, fetching history up to {current}",
                self.wavelet_id, self.server_version
            );
            self.awaiting_history = Some(current);
            Ok(NackAction::FetchHistory {
                from: self.server_version,
                to: current,
            })
        } else {
            Ok(NackAction::Resubmit)
        }
    }

    /// Server state for a wavelet created locally. An empty snapshot means
    /// the server has nothing yet; otherwise someone else created the same
    /// id first, and local operations are replayed on top of theirs.
    pub fn on_snapshot(&mut self, snapshot: &WaveletSnapshot) -> Result<(), ChannelError> {
        self.ensure_open()?;
        if snapshot.version.version == 0 || snapshot.version.version <= self.server_version.version
        {
            debug!("{}: dropping snapshot at {}", self.wavelet_id, snapshot.version);
            return Ok(());
        }
        self.expecting_snapshot = false;
        self.committed = self.committed.max(snapshot.committed_version);
        debug!(
            "{}: wavelet already exists at {}, rebasing local ops",
            self.wavelet_id, snapshot.version
        );
        let author = snapshot
            .creator
            .clone()
            .unwrap_or_else(|| self.author.clone());
        self.rebase(&author, snapshot.to_operations())?;
        self.server_version = snapshot.version;
        // The server transforms against real history, not the snapshot,
        // so the ack hash cannot be predicted here.
        self.verify_ack = false;
        self.drain_held()
    }

    pub fn on_commit(&mut self, version: u64) {
        self.committed = self.committed.max(version);
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    /// The connection dropped. Anything held belongs to the old stream.
    pub fn reset(&mut self) {
        self.connected = false;
        self.held_ack = None;
        self.held_deltas.clear();
        self.awaiting_history = None;
        if let Some(in_flight) = &mut self.in_flight {
            in_flight.sent = false;
            self.echo_window = true;
        }
    }

    /// The (re)open burst finished. If the catch-up did not contain the
    /// in-flight delta, `flush` resends it.
    pub fn on_connected(&mut self) {
        if self.echo_window && self.in_flight.is_some() {
            debug!("{}: in-flight delta not applied, will resend", self.wavelet_id);
        }
        self.echo_window = false;
        self.connected = true;
    }

    /// Close the channel, discarding unsent work. Returns how many local
    /// operations were dropped.
    pub fn close(&mut self) -> usize {
        let discarded = self.in_flight.take().map_or(0, |f| f.ops.len()) + self.pending.len();
        self.pending.clear();
        self.received.clear();
        self.held_ack = None;
        self.held_deltas.clear();
        self.closed = true;
        if discarded > 0 {
            debug!("{}: closed, discarded {discarded} ops", self.wavelet_id);
        }
        discarded
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn drain_held(&mut self) -> Result<(), ChannelError> {
        loop {
            let at = self.server_version.version;
            if let Some(ack) = self.held_ack.filter(|ack| ack.applied_at() == at) {
                self.held_ack = None;
                self.apply_ack(ack)?;
                continue;
            }
            if let Some(delta) = self.held_deltas.remove(&at) {
                self.apply_delta(delta)?;
                continue;
            }
            break;
        }

        let at = self.server_version.version;
        // Anything left below the current version was a duplicate.
        self.held_deltas = self.held_deltas.split_off(&at);
        if let Some(ack) = self.held_ack {
            if ack.applied_at() < at {
                return Err(diverged(
                    &self.wavelet_id,
                    Divergence::AckMismatch {
                        acked: ack.version,
                        expected: self.server_version,
                    },
                ));
            }
        }
        if let Some(target) = self.awaiting_history {
            if at >= target.version {
                self.awaiting_history = None;
            }
        }
        Ok(())
    }

    fn apply_ack(&mut self, ack: HeldAck) -> Result<(), ChannelError> {
        let Some(in_flight) = self.in_flight.take() else {
            return Err(diverged(&self.wavelet_id, Divergence::UnexpectedAck(ack.version)));
        };
        let expected = self.server_version.next(&self.author, &in_flight.ops);
        if expected.version != ack.version.version || (self.verify_ack && expected != ack.version) {
            return Err(diverged(
                &self.wavelet_id,
                Divergence::AckMismatch {
                    acked: ack.version,
                    expected,
                },
            ));
        }
        trace!("{}: acked at {}", self.wavelet_id, ack.version);
        self.server_version = ack.version;
        self.expecting_snapshot = false;
        self.verify_ack = true;
        Ok(())
    }

    fn apply_delta(&mut self, delta: TransformedDelta) -> Result<(), ChannelError> {
        if delta.applied_at != self.server_version {
            return Err(diverged(
                &self.wavelet_id,
                Divergence::VersionMismatch {
                    expected: self.server_version,
                    found: delta.applied_at,
                },
            ));
        }
        if !delta.is_consistent() {
            return Err(diverged(
                &self.wavelet_id,
                Divergence::HashMismatch(delta.resulting_version),
            ));
        }

        if self.echo_window && delta.author == self.author {
            if let Some(in_flight) = &self.in_flight {
                if in_flight.ops == delta.ops {
                    debug!(
                        "{}: in-flight delta was applied at {}",
                        self.wavelet_id, delta.applied_at
                    );
                    self.in_flight = None;
                    self.echo_window = false;
                    self.expecting_snapshot = false;
                    self.server_version = delta.resulting_version;
                    return Ok(());
                }
            }
        }

        trace!(
            "{}: server delta {} -> {} by {}",
            self.wavelet_id,
            delta.applied_at,
            delta.resulting_version,
            delta.author
        );
        self.rebase(&delta.author, delta.ops)?;
        self.server_version = delta.resulting_version;
        self.expecting_snapshot = false;
        Ok(())
    }

    /// Transform in-flight and pending ops past `server_ops` and queue what
    /// is left of the server ops for the editor.
    fn rebase(
        &mut self,
        author: &ParticipantId,
        server_ops: Vec<WaveletOperation>,
    ) -> Result<(), ChannelError> {
        let mut server_ops = server_ops;
        if let Some(in_flight) = &mut self.in_flight {
            let (local, server) = transform_operation_lists(&in_flight.ops, &server_ops)
                .map_err(|e| diverged(&self.wavelet_id, e))?;
            in_flight.ops = local;
            server_ops = server;
        }
        if !self.pending.is_empty() {
            let (local, server) = transform_operation_lists(&self.pending, &server_ops)
                .map_err(|e| diverged(&self.wavelet_id, e))?;
            self.pending = local;
            server_ops = server;
        }
        self.received.extend(
            server_ops
                .into_iter()
                .filter(|op| !op.is_noop())
                .map(|op| RemoteOperation {
                    author: author.clone(),
                    op,
                }),
        );
        Ok(())
    }
}
