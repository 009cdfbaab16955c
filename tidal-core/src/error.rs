//! Error types for the operation algebra and the reference document.
//!
//! Every error here describes a problem with operations themselves. Layers
//! above (channels, multiplexer) wrap them together with the wavelet they
//! occurred on.

use thiserror::Error;

/// An operation violated a structural invariant at construction time.
///
/// Always an upstream bug: a well-behaved producer never builds one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedOperation {
    #[error("component {index} is empty")]
    EmptyComponent { index: usize },

    #[error("component {index}: {reason}")]
    Structure { index: usize, reason: &'static str },

    #[error("keys must be sorted and unique, found {key:?} out of order")]
    UnsortedKeys { key: String },

    #[error("annotation key {key:?} is both ended and changed in one boundary")]
    EndedAndChanged { key: String },

    #[error("component {index}: annotation key {key:?} ended but not open")]
    AnnotationNotOpen { index: usize, key: String },

    #[error("annotation key {key:?} still open at end of operation")]
    UnclosedAnnotation { key: String },

    #[error("element started at component {index} is never closed")]
    UnclosedElement { index: usize },
}

/// Two operations could not be composed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ComposeError {
    #[error("size mismatch: first op produces {first_output} items, second consumes {second_input}")]
    SizeMismatch {
        first_output: usize,
        second_input: usize,
    },

    #[error("structural mismatch at item {position}: {reason}")]
    Mismatch { position: usize, reason: &'static str },

    #[error("composition produced a malformed operation: {0}")]
    Malformed(#[from] MalformedOperation),
}

/// Two concurrent operations could not be transformed against each other.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransformError {
    #[error("size mismatch: client op consumes {client_input} items, server op consumes {server_input}")]
    SizeMismatch {
        client_input: usize,
        server_input: usize,
    },

    #[error("structural mismatch at item {position}: {reason}")]
    Mismatch { position: usize, reason: &'static str },

    /// Both sides changed the same key to different values and the caller
    /// asked for conflicts to be rejected rather than resolved.
    #[error("conflicting concurrent changes to {key:?}")]
    Conflict { key: String },

    #[error("transform produced a malformed operation: {0}")]
    Malformed(#[from] MalformedOperation),

    #[error(transparent)]
    Compose(#[from] ComposeError),
}

/// A document model refused an operation. The document is left untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocumentApplyError {
    #[error("operation consumes {op_input} items but document has {document_size}")]
    SizeMismatch { op_input: usize, document_size: usize },

    #[error("item {position}: expected {expected}, found {found}")]
    ItemMismatch {
        position: usize,
        expected: String,
        found: String,
    },

    #[error("item {position}: attributes do not match the operation")]
    AttributeMismatch { position: usize },

    #[error("item {position}: annotation {key:?} is {found:?}, operation expected {expected:?}")]
    AnnotationMismatch {
        position: usize,
        key: String,
        expected: Option<String>,
        found: Option<String>,
    },

    #[error("document {document:?} does not exist")]
    UnknownDocument { document: String },
}

/// Undo or redo could not be computed; both stacks are left as they were.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UndoError {
    #[error("undo failed to compose history: {0}")]
    Compose(#[from] ComposeError),

    #[error("undo failed to transform past later edits: {0}")]
    Transform(#[from] TransformError),
}

/// A participant address that is not of the form `name@domain`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid participant address {0:?}")]
pub struct InvalidParticipant(pub String);

/// A wavelet operation could not be applied to a wavelet's state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WaveletApplyError {
    #[error("document {document}: {source}")]
    Document {
        document: String,
        #[source]
        source: DocumentApplyError,
    },

    #[error("{0} is already a participant")]
    ParticipantAlreadyPresent(String),

    #[error("{0} is not a participant")]
    ParticipantNotPresent(String),

    #[error("delta targets version {target} but the wavelet is at {current}")]
    VersionMismatch { target: u64, current: u64 },
}
