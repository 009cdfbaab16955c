//! Binary wire protocol between wave clients and the wave server.
//!
//! Every WebSocket binary frame carries exactly one bincode-encoded
//! message (serde mode, standard config):
//!
//! ```text
//!  client                                   server
//!    │── Open { wave, filter, known } ────────▶│
//!    │◀──────── Snapshot / Update (catch-up) ──│
//!    │◀──────────────────────── OpenFinished ──│
//!    │── Submit { wavelet, delta } ───────────▶│
//!    │◀── SubmitResponse { Ack | Rejected } ───│   (submitter only)
//!    │◀──────────────── Update { deltas } ─────│   (everyone else)
//! ```
//!
//! The server never echoes a client's own delta back to it as an
//! `Update`; the ack carries everything the submitter needs.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tidal_core::{
    HashedVersion, ParticipantId, TransformedDelta, WaveId, WaveletDelta, WaveletId,
    WaveletSnapshot,
};

/// Which wavelets of a wave a client wants to hear about.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IdFilter {
    #[default]
    All,
    /// Wavelets whose id starts with any of the prefixes.
    Prefixes(Vec<String>),
}

impl IdFilter {
    pub fn prefixes<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        IdFilter::Prefixes(prefixes.into_iter().map(Into::into).collect())
    }

    pub fn matches(&self, wavelet_id: &WaveletId) -> bool {
        match self {
            IdFilter::All => true,
            IdFilter::Prefixes(prefixes) => prefixes
                .iter()
                .any(|prefix| wavelet_id.as_str().starts_with(prefix.as_str())),
        }
    }
}

/// A wavelet the client already holds, so the server only sends what is new.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownWavelet {
    pub wavelet_id: WaveletId,
    pub version: HashedVersion,
}

/// Client → server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    Open {
        wave_id: WaveId,
        participant: ParticipantId,
        filter: IdFilter,
        known: Vec<KnownWavelet>,
    },
    Submit {
        wave_id: WaveId,
        wavelet_id: WaveletId,
        delta: WaveletDelta,
    },
    /// Deltas applied in `[from, to)`.
    FetchHistory {
        wave_id: WaveId,
        wavelet_id: WaveletId,
        from: HashedVersion,
        to: HashedVersion,
    },
    RequestSnapshot {
        wave_id: WaveId,
        wavelet_id: WaveletId,
    },
    Ping {
        nonce: u64,
    },
    Close {
        wave_id: WaveId,
    },
}

/// Why the server refused a delta.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum SubmitRejection {
    /// The target version is older than the server is willing to transform
    /// from. Retrying after catching up can succeed.
    #[error("target version is stale, server is at {current}")]
    StaleVersion { current: HashedVersion },

    /// The target is in the future or its hash is not in the history.
    #[error("target version is not in the history, server is at {current}")]
    InvalidVersion { current: HashedVersion },

    #[error("{0} may not write to this wavelet")]
    PermissionDenied(String),

    #[error("schema violation: {0}")]
    SchemaViolation(String),

    #[error("malformed delta: {0}")]
    Malformed(String),
}

impl SubmitRejection {
    /// Permanent rejections are never retried.
    pub fn is_permanent(&self) -> bool {
        !matches!(self, SubmitRejection::StaleVersion { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubmitResult {
    Ack {
        ops_applied: usize,
        version: HashedVersion,
        timestamp: u64,
    },
    Rejected(SubmitRejection),
}

/// Server → client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    Snapshot {
        wave_id: WaveId,
        snapshot: WaveletSnapshot,
    },
    Update {
        wave_id: WaveId,
        wavelet_id: WaveletId,
        deltas: Vec<TransformedDelta>,
        committed: Option<u64>,
    },
    /// End of the initial burst for an `Open`.
    OpenFinished {
        wave_id: WaveId,
    },
    SubmitResponse {
        wave_id: WaveId,
        wavelet_id: WaveletId,
        result: SubmitResult,
    },
    History {
        wave_id: WaveId,
        wavelet_id: WaveletId,
        deltas: Vec<TransformedDelta>,
    },
    Error {
        message: String,
    },
    Pong {
        nonce: u64,
    },
}

impl ServerMessage {
    /// The wave a message belongs to, if any.
    pub fn wave_id(&self) -> Option<&WaveId> {
        match self {
            ServerMessage::Snapshot { wave_id, .. }
            | ServerMessage::Update { wave_id, .. }
            | ServerMessage::OpenFinished { wave_id }
            | ServerMessage::SubmitResponse { wave_id, .. }
            | ServerMessage::History { wave_id, .. } => Some(wave_id),
            ServerMessage::Error { .. } | ServerMessage::Pong { .. } => None,
        }
    }
}

fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(message, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (message, read) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    if read != bytes.len() {
        return Err(ProtocolError::TrailingBytes(bytes.len() - read));
    }
    Ok(message)
}

impl ClientMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("{0} unread bytes after message")]
    TrailingBytes(usize),

    #[error("connection closed")]
    ConnectionClosed,
}
