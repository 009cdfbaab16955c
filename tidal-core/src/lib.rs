//! # tidal-core — Operation algebra for collaborative structured documents
//!
//! Documents are linear sequences of characters and element start/end
//! markers, each item carrying key/value annotations. Every change is a
//! [`DocOp`]: an immutable, validated sequence of components that walks the
//! whole document once.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   compose / invert / transform   ┌─────────────┐
//! │   DocOp     │ ───────────────────────────────▶ │   DocOp     │
//! └──────┬──────┘                                  └─────────────┘
//!        │ apply_op
//!        ▼
//! ┌─────────────┐      ┌──────────────┐      ┌──────────────────┐
//! │ Document    │ ◀─── │ WaveletData  │ ◀─── │ WaveletOperation │
//! │ (reference) │      │ (per wavelet)│      │ + HashedVersion  │
//! └─────────────┘      └──────────────┘      └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`op`] — Components, [`DocOp`] and its builder
//! - [`algorithm`] — Composition, inversion and transformation
//! - [`document`] — Reference document model and the [`DocumentModel`] trait
//! - [`undo`] — Per-document undo/redo that survives concurrent edits
//! - [`wavelet`] — Ids, hashed versions, deltas, snapshots
//!
//! ## Performance Targets
//!
//! | Metric | Target |
//! |--------|--------|
//! | Transform of two 1K-component ops | <1ms |
//! | Compose of 100 typing ops | <500µs |
//! | Version hash per delta | <5µs |

pub mod algorithm;
pub mod annotations;
pub mod attributes;
pub mod document;
pub mod error;
pub mod op;
pub mod undo;
pub mod wavelet;

pub use algorithm::{compose, compose_all, invert, transform, transform_with, ConflictPolicy};
pub use annotations::{AnnotationBoundary, AnnotationChange};
pub use attributes::{AttributeChange, Attributes, AttributesUpdate};
pub use document::{DocItem, Document, DocumentModel, ItemKind};
pub use error::{
    ComposeError, DocumentApplyError, InvalidParticipant, MalformedOperation, TransformError,
    UndoError, WaveletApplyError,
};
pub use op::{Component, DocOp, DocOpBuilder, DocOpCursor};
pub use undo::UndoManager;
pub use wavelet::{
    compose_into, invert_operation, transform_operation_lists, transform_operations, DocumentId,
    HashedVersion, ParticipantId, TransformedDelta, WaveId, WaveletData, WaveletDelta,
    WaveletId, WaveletOperation, WaveletSnapshot,
};
