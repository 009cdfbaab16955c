//! Per-document undo and redo in the presence of concurrent edits.
//!
//! ```text
//!   undo stack (top last)
//!   ┌──────────────┬────────────────────────────┐
//!   │ local op     │ non-undoable ops after it  │
//!   ├──────────────┼────────────────────────────┤
//!   │ insert "A"   │                            │  ◀─ batch 1
//!   │ insert "B"   │ remote insert "Z"          │  ◀─ batch 2
//!   └──────────────┴────────────────────────────┘
//! ```
//!
//! Undoing an entry inverts its op and transforms the inverse past the
//! non-undoable ops recorded above it, so remote edits (and undone local
//! ones) survive. Checkpoints group consecutive local ops into batches that
//! undo and redo together.

use log::{debug, trace};

use crate::algorithm::{compose_all, invert, transform};
use crate::error::UndoError;
use crate::op::DocOp;

#[derive(Debug, Clone)]
struct StackEntry {
    op: DocOp,
    non_undoables: Vec<DocOp>,
}

#[derive(Debug, Clone, Default)]
struct UndoStack {
    entries: Vec<StackEntry>,
}

impl UndoStack {
    fn push(&mut self, op: DocOp) {
        self.entries.push(StackEntry {
            op,
            non_undoables: Vec::new(),
        });
    }

    /// Record an op applied after the top entry. Dropped when the stack is empty.
    fn non_undoable(&mut self, op: DocOp) {
        if let Some(top) = self.entries.last_mut() {
            top.non_undoables.push(op);
        }
    }

    /// Pop the top entry and return its inverse, transformed to apply to the
    /// current state, together with the non-undoable ops transformed as if
    /// the entry had never been applied.
    fn pop(&mut self) -> Result<Option<(DocOp, DocOp)>, UndoError> {
        let Some(entry) = self.entries.pop() else {
            return Ok(None);
        };
        let inverse = invert(&entry.op);
        let Some(non_undoable) = compose_all(&entry.non_undoables)? else {
            let identity = DocOp::identity(inverse.output_len());
            return Ok(Some((inverse, identity)));
        };
        let (inverse, non_undoable) = transform(&inverse, &non_undoable)?;
        self.non_undoable(non_undoable.clone());
        Ok(Some((inverse, non_undoable)))
    }

    fn clear(&mut self) {
        self.entries.clear();
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Batches of stack entries between checkpoints.
#[derive(Debug, Clone, Default)]
struct Checkpointer {
    partitions: Vec<usize>,
    last_partition: usize,
}

impl Checkpointer {
    fn checkpoint(&mut self) {
        if self.last_partition > 0 {
            self.partitions.push(self.last_partition);
            self.last_partition = 0;
        }
    }

    fn increment(&mut self) {
        self.last_partition += 1;
    }

    /// Size of the most recent batch, removing it. Zero when there is none.
    fn release_checkpoint(&mut self) -> usize {
        if self.last_partition > 0 {
            return std::mem::take(&mut self.last_partition);
        }
        self.partitions.pop().unwrap_or(0)
    }
}

/// Undo and redo history for one document.
#[derive(Debug, Clone, Default)]
pub struct UndoManager {
    undo: UndoStack,
    redo: UndoStack,
    checkpointer: Checkpointer,
}

impl UndoManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a local op the user may undo. Clears the redo history.
    pub fn undoable_op(&mut self, op: DocOp) {
        trace!("undoable op {op}");
        self.undo.push(op);
        self.checkpointer.increment();
        self.redo.clear();
    }

    /// Record an op that must survive undo, such as a remote edit.
    pub fn non_undoable_op(&mut self, op: DocOp) {
        trace!("non-undoable op {op}");
        self.undo.non_undoable(op.clone());
        self.redo.non_undoable(op);
    }

    /// Close the current batch of undoable ops.
    pub fn checkpoint(&mut self) {
        self.checkpointer.checkpoint();
    }

    /// The op that undoes the most recent batch, if any.
    pub fn undo(&mut self) -> Result<Option<DocOp>, UndoError> {
        Ok(self.undo_plus()?.map(|(op, _)| op))
    }

    /// Like [`undo`](Self::undo), also returning the non-undoable ops
    /// transformed as if the undone batch had never happened.
    pub fn undo_plus(&mut self) -> Result<Option<(DocOp, DocOp)>, UndoError> {
        let mut next = self.clone();
        let count = next.checkpointer.release_checkpoint();
        if count == 0 {
            return Ok(None);
        }

        let mut ops = Vec::with_capacity(count);
        let mut transformed = None;
        for _ in 0..count {
            let Some((op, non_undoable)) = next.undo.pop()? else {
                break;
            };
            ops.push(op);
            transformed = Some(non_undoable);
        }
        let (Some(op), Some(transformed)) = (compose_all(&ops)?, transformed) else {
            return Ok(None);
        };
        next.redo.push(op.clone());
        debug!(
            "undid {} ops, {} undo entries left",
            ops.len(),
            next.undo.len()
        );
        *self = next;
        Ok(Some((op, transformed)))
    }

    /// The op that redoes the most recently undone batch, if any.
    pub fn redo(&mut self) -> Result<Option<DocOp>, UndoError> {
        Ok(self.redo_plus()?.map(|(op, _)| op))
    }

    /// Like [`redo`](Self::redo), also returning the transformed non-undoable ops.
    pub fn redo_plus(&mut self) -> Result<Option<(DocOp, DocOp)>, UndoError> {
        let mut next = self.clone();
        let Some((op, transformed)) = next.redo.pop()? else {
            return Ok(None);
        };
        next.checkpointer.checkpoint();
        next.undo.push(op.clone());
        next.checkpointer.increment();
        debug!("redid op, {} redo entries left", next.redo.len());
        *self = next;
        Ok(Some((op, transformed)))
    }

    pub fn can_undo(&self) -> bool {
        self.undo.len() > 0
    }

    pub fn can_redo(&self) -> bool {
        self.redo.len() > 0
    }
}
