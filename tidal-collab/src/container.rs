//! Authoritative server-side state of one wavelet.
//!
//! A submitted delta names the version its author last saw. The container
//! brings it up to the head before applying it:
//!
//! ```text
//!  target ──▶ d₁ ──▶ d₂ ──▶ head            (history since target)
//!     │
//!     └─ client ops ── transform against d₁, d₂ ──▶ apply at head
//! ```
//!
//! While walking the history the container also looks for the delta
//! itself: a client that lost its connection before the ack arrived
//! resubmits the same ops, and gets the original ack back instead of a
//! second application.

use serde::{Deserialize, Serialize};
use tidal_core::{
    transform_operation_lists, HashedVersion, MalformedOperation, ParticipantId, TransformError,
    TransformedDelta, WaveId, WaveletApplyError, WaveletData, WaveletDelta, WaveletId,
    WaveletOperation, WaveletSnapshot,
};

use crate::protocol::{SubmitRejection, SubmitResult};
use crate::storage::{CompressedDelta, DeltaHistory, HistoryError, HistoryStats};

/// What the server does with a delta that targets an older version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SubmitPolicy {
    /// Transform it against the history since its target.
    #[default]
    Transform,
    /// Refuse it with `StaleVersion`; the client catches up and resubmits.
    RejectStale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitAck {
    pub ops_applied: usize,
    pub version: HashedVersion,
    pub timestamp: u64,
}

impl From<SubmitAck> for SubmitResult {
    fn from(ack: SubmitAck) -> Self {
        SubmitResult::Ack {
            ops_applied: ack.ops_applied,
            version: ack.version,
            timestamp: ack.timestamp,
        }
    }
}

impl From<&TransformedDelta> for SubmitAck {
    fn from(delta: &TransformedDelta) -> Self {
        Self {
            ops_applied: delta.ops.len(),
            version: delta.resulting_version,
            timestamp: delta.timestamp,
        }
    }
}

/// Outcome of an accepted submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submitted {
    pub ack: SubmitAck,
    /// The delta as applied, or `None` when this was a resubmission of a
    /// delta already in the history.
    pub applied: Option<TransformedDelta>,
}

pub struct WaveletContainer {
    data: WaveletData,
    history: DeltaHistory,
    policy: SubmitPolicy,
}

impl WaveletContainer {
    pub fn new(
        wave_id: WaveId,
        wavelet_id: WaveletId,
        policy: SubmitPolicy,
        history_limit: Option<usize>,
    ) -> Self {
        let data = WaveletData::new(wave_id, wavelet_id);
        let history = DeltaHistory::new(data.version(), history_limit);
        Self {
            data,
            history,
            policy,
        }
    }

    pub fn wavelet_id(&self) -> &WaveletId {
        self.data.wavelet_id()
    }

    pub fn version(&self) -> HashedVersion {
        self.data.version()
    }

    /// Nothing applied yet.
    pub fn is_empty(&self) -> bool {
        self.data.version().version == 0
    }

    pub fn data(&self) -> &WaveletData {
        &self.data
    }

    /// Everything applied in memory counts as committed.
    pub fn committed_version(&self) -> u64 {
        self.data.version().version
    }

    pub fn snapshot(&self) -> Result<WaveletSnapshot, MalformedOperation> {
        self.data.snapshot(self.committed_version())
    }

    /// True when a client at `version` can be caught up from the history.
    pub fn knows_version(&self, version: &HashedVersion) -> bool {
        version.version >= self.history.oldest().version && self.history.contains_version(version)
    }

    pub fn deltas_since(&self, from: &HashedVersion) -> Result<Vec<TransformedDelta>, HistoryError> {
        self.history.deltas_since(from)
    }

    pub fn history(
        &self,
        from: &HashedVersion,
        to: &HashedVersion,
    ) -> Result<Vec<TransformedDelta>, HistoryError> {
        self.history.deltas_between(from, to)
    }

    pub fn history_stats(&self) -> HistoryStats {
        self.history.stats()
    }

    /// Validate, transform and apply a client delta. `timestamp` is the
    /// server clock in milliseconds.
    pub fn submit(
        &mut self,
        delta: WaveletDelta,
        timestamp: u64,
    ) -> Result<Submitted, SubmitRejection> {
        let head = self.data.version();
        let WaveletDelta {
            author,
            target_version,
            mut ops,
        } = delta;

        if ops.is_empty() {
            return Err(SubmitRejection::Malformed("delta has no operations".into()));
        }
        if target_version.version > head.version || !self.knows_version(&target_version) {
            log::warn!(
                "{}: {author} targeted unknown version {target_version}, head is {head}",
                self.wavelet_id()
            );
            return Err(SubmitRejection::InvalidVersion { current: head });
        }

        if target_version != head {
            if self.policy == SubmitPolicy::RejectStale {
                if let Some(ack) = self.find_resubmission(&author, &target_version, &ops)? {
                    return Ok(Submitted { ack, applied: None });
                }
                return Err(SubmitRejection::StaleVersion { current: head });
            }
            let concurrent = self
                .history
                .deltas_since(&target_version)
                .map_err(|e| history_failure(head, &e))?;
            for server in &concurrent {
                if server.author == author && server.ops == ops {
                    log::debug!(
                        "{}: resubmission by {author} already applied at {}",
                        self.wavelet_id(),
                        server.applied_at
                    );
                    return Ok(Submitted {
                        ack: SubmitAck::from(server),
                        applied: None,
                    });
                }
                let (transformed, _) = transform_operation_lists(&ops, &server.ops)
                    .map_err(rejection_for_transform)?;
                ops = transformed;
            }
        }

        if head.version > 0 && !self.data.is_participant(&author) {
            return Err(SubmitRejection::PermissionDenied(author.to_string()));
        }

        let applied = TransformedDelta {
            resulting_version: head.next(&author, &ops),
            author,
            applied_at: head,
            timestamp,
            ops,
        };
        // Nothing changes until every fallible step has passed.
        let record = CompressedDelta::compress(&applied)
            .map_err(|e| SubmitRejection::Malformed(e.to_string()))?;
        if self.history.head() != head {
            let gap = HistoryError::NotContiguous {
                expected: self.history.head(),
                found: head,
            };
            log::error!("{}: {gap}", self.wavelet_id());
            return Err(history_failure(head, &gap));
        }
        // Applies all of the ops or none of them.
        let resulting_version = self
            .data
            .apply_delta(&applied.author, &applied.ops)
            .map_err(rejection_for_apply)?;
        debug_assert_eq!(resulting_version, applied.resulting_version);
        self.history
            .push(record)
            .map_err(|e| history_failure(head, &e))?;
        log::trace!(
            "{}: applied {} ops {head} → {resulting_version}",
            self.wavelet_id(),
            applied.ops.len()
        );
        Ok(Submitted {
            ack: SubmitAck::from(&applied),
            applied: Some(applied),
        })
    }

    /// Under `RejectStale` a resubmission is only recognised at its exact
    /// target, since nothing was transformed.
    fn find_resubmission(
        &self,
        author: &ParticipantId,
        target: &HashedVersion,
        ops: &[WaveletOperation],
    ) -> Result<Option<SubmitAck>, SubmitRejection> {
        let current = self.data.version();
        let applied = self
            .history
            .find_applied_at(target)
            .map_err(|e| history_failure(current, &e))?;
        Ok(applied
            .filter(|d| &d.author == author && d.ops == ops)
            .map(|d| SubmitAck::from(&d)))
    }
}

fn history_failure(current: HashedVersion, cause: &HistoryError) -> SubmitRejection {
    log::warn!("history lookup failed: {cause}");
    SubmitRejection::InvalidVersion { current }
}

fn rejection_for_transform(error: TransformError) -> SubmitRejection {
    match error {
        TransformError::Conflict { .. } => SubmitRejection::SchemaViolation(error.to_string()),
        _ => SubmitRejection::Malformed(error.to_string()),
    }
}

fn rejection_for_apply(error: WaveletApplyError) -> SubmitRejection {
    match error {
        WaveletApplyError::Document { .. } | WaveletApplyError::VersionMismatch { .. } => {
            SubmitRejection::Malformed(error.to_string())
        }
        WaveletApplyError::ParticipantAlreadyPresent(_)
        | WaveletApplyError::ParticipantNotPresent(_) => {
            SubmitRejection::SchemaViolation(error.to_string())
        }
    }
}
