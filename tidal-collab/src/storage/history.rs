//! Compressed, hash-indexed delta history for one wavelet.
//!
//! Every applied delta is kept as a bincode record compressed with LZ4.
//! The hashed versions at both ends of each record stay uncompressed, so
//! lookups by version never touch the payload:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                   DeltaHistory                      │
//! │                                                     │
//! │  oldest ──▶ [v0→v2] ──▶ [v2→v3] ──▶ [v3→v7] ──▶ head│
//! │             (LZ4)       (LZ4)       (LZ4)           │
//! │                                                     │
//! │  Pruning: drop records from the front past a limit  │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! Performance targets:
//! - Append a typing delta: <10μs
//! - `deltas_since` over 100 records: <200μs

use tidal_core::{HashedVersion, TransformedDelta};
use thiserror::Error;

/// One applied delta, compressed.
#[derive(Debug, Clone)]
pub struct CompressedDelta {
    pub applied_at: HashedVersion,
    pub resulting_version: HashedVersion,
    /// Size of the bincode record before compression
    pub original_size: u32,
    compressed: Vec<u8>,
}

impl CompressedDelta {
    pub fn compress(delta: &TransformedDelta) -> Result<Self, HistoryError> {
        let encoded = bincode::serde::encode_to_vec(delta, bincode::config::standard())
            .map_err(|e| HistoryError::Encode(e.to_string()))?;
        Ok(Self {
            applied_at: delta.applied_at,
            resulting_version: delta.resulting_version,
            original_size: record_size(encoded.len())?,
            compressed: lz4_flex::compress_prepend_size(&encoded),
        })
    }

    pub fn decompress(&self) -> Result<TransformedDelta, HistoryError> {
        let bytes = lz4_flex::decompress_size_prepended(&self.compressed)
            .map_err(|e| HistoryError::Decompress(e.to_string()))?;
        let (delta, _) = bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
            .map_err(|e| HistoryError::Decode(e.to_string()))?;
        Ok(delta)
    }

    /// Compression ratio (original / compressed).
    pub fn compression_ratio(&self) -> f64 {
        if self.compressed.is_empty() {
            return 0.0;
        }
        self.original_size as f64 / self.compressed.len() as f64
    }

    pub fn compressed_size(&self) -> usize {
        self.compressed.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HistoryError {
    #[error("failed to encode delta: {0}")]
    Encode(String),

    #[error("failed to decode delta: {0}")]
    Decode(String),

    #[error("LZ4 decompression failed: {0}")]
    Decompress(String),

    #[error("delta applied at {found} does not continue the history at {expected}")]
    NotContiguous {
        expected: HashedVersion,
        found: HashedVersion,
    },

    #[error("delta record of {0} bytes is too large")]
    TooLarge(usize),

    #[error("version {requested} was pruned, oldest retained is {oldest}")]
    Pruned { requested: u64, oldest: u64 },

    #[error("{0} is not a delta boundary in this history")]
    UnknownVersion(HashedVersion),
}

#[derive(Debug, Clone, Default)]
pub struct HistoryStats {
    pub delta_count: u64,
    pub total_original_bytes: u64,
    pub total_compressed_bytes: u64,
    pub oldest_version: u64,
    pub head_version: u64,
}

impl HistoryStats {
    /// Overall compression ratio across all records.
    pub fn compression_ratio(&self) -> f64 {
        if self.total_compressed_bytes == 0 {
            return 0.0;
        }
        self.total_original_bytes as f64 / self.total_compressed_bytes as f64
    }
}

fn record_size(len: usize) -> Result<u32, HistoryError> {
    u32::try_from(len).map_err(|_| HistoryError::TooLarge(len))
}

/// Append-only log of the deltas applied to a wavelet.
#[derive(Debug, Clone)]
pub struct DeltaHistory {
    records: Vec<CompressedDelta>,
    oldest: HashedVersion,
    head: HashedVersion,
    /// Keep at most this many records; `None` keeps everything.
    max_deltas: Option<usize>,
}

impl DeltaHistory {
    pub fn new(start: HashedVersion, max_deltas: Option<usize>) -> Self {
        Self {
            records: Vec::new(),
            oldest: start,
            head: start,
            max_deltas,
        }
    }

    pub fn head(&self) -> HashedVersion {
        self.head
    }

    pub fn oldest(&self) -> HashedVersion {
        self.oldest
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Append a delta applied at the current head.
    pub fn append(&mut self, delta: &TransformedDelta) -> Result<(), HistoryError> {
        self.push(CompressedDelta::compress(delta)?)
    }

    /// Append an already compressed record starting at the current head.
    pub fn push(&mut self, record: CompressedDelta) -> Result<(), HistoryError> {
        if record.applied_at != self.head {
            return Err(HistoryError::NotContiguous {
                expected: self.head,
                found: record.applied_at,
            });
        }
        self.head = record.resulting_version;
        self.records.push(record);

        if let Some(max) = self.max_deltas {
            if self.records.len() > max {
                let excess = self.records.len() - max;
                self.records.drain(..excess);
                self.oldest = self.records.first().map_or(self.head, |r| r.applied_at);
                log::debug!("pruned {excess} deltas, oldest retained is {}", self.oldest);
            }
        }
        Ok(())
    }

    /// True when `version` (hash included) sits on a retained delta boundary.
    pub fn contains_version(&self, version: &HashedVersion) -> bool {
        if *version == self.head || *version == self.oldest {
            return true;
        }
        self.index_of(version.version)
            .is_some_and(|i| self.records[i].applied_at == *version)
    }

    /// The delta that was applied at exactly `version`.
    pub fn find_applied_at(
        &self,
        version: &HashedVersion,
    ) -> Result<Option<TransformedDelta>, HistoryError> {
        match self.index_of(version.version) {
            Some(i) if self.records[i].applied_at == *version => {
                self.records[i].decompress().map(Some)
            }
            _ => Ok(None),
        }
    }

    /// Every delta from `from` up to the head.
    pub fn deltas_since(&self, from: &HashedVersion) -> Result<Vec<TransformedDelta>, HistoryError> {
        self.deltas_between(from, &self.head)
    }

    /// Deltas applied in `[from, to)`. Both ends must be delta boundaries.
    pub fn deltas_between(
        &self,
        from: &HashedVersion,
        to: &HashedVersion,
    ) -> Result<Vec<TransformedDelta>, HistoryError> {
        if from.version < self.oldest.version {
            return Err(HistoryError::Pruned {
                requested: from.version,
                oldest: self.oldest.version,
            });
        }
        for end in [from, to] {
            if !self.contains_version(end) {
                return Err(HistoryError::UnknownVersion(*end));
            }
        }
        if from.version >= to.version {
            return Ok(Vec::new());
        }
        let start = self.records.partition_point(|r| r.applied_at.version < from.version);
        self.records[start..]
            .iter()
            .take_while(|r| r.resulting_version.version <= to.version)
            .map(CompressedDelta::decompress)
            .collect()
    }

    pub fn stats(&self) -> HistoryStats {
        HistoryStats {
            delta_count: self.records.len() as u64,
            total_original_bytes: self.records.iter().map(|r| r.original_size as u64).sum(),
            total_compressed_bytes: self.records.iter().map(|r| r.compressed_size() as u64).sum(),
            oldest_version: self.oldest.version,
            head_version: self.head.version,
        }
    }

    fn index_of(&self, version: u64) -> Option<usize> {
        self.records
            .binary_search_by_key(&version, |r| r.applied_at.version)
            .ok()
    }
}
