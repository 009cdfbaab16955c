//! Document operations.
//!
//! A [`DocOp`] is an immutable list of [`Component`]s walked left to right
//! over a document. The document is a flat sequence of items: characters,
//! element starts and element ends.
//!
//! ```text
//! document:  <p> h  i </p>
//! op:        __1 ++"X" __3 --"" ...
//!            retain 1 / insert "X" / retain 3
//! result:    <p> X  h  i </p>
//! ```
//!
//! Operations are checked for structural validity when constructed and
//! never change afterwards; clones share one allocation.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::annotations::{AnnotationBoundary, OpenAnnotations};
use crate::attributes::{Attributes, AttributesUpdate};
use crate::error::MalformedOperation;

mod builder;
pub(crate) mod normalizer;
pub(crate) mod pieces;

pub use builder::DocOpBuilder;

/// A single step of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Component {
    /// Skip `n` items unchanged.
    Retain(usize),
    Characters(String),
    ElementStart { tag: String, attributes: Attributes },
    ElementEnd,
    DeleteCharacters(String),
    DeleteElementStart { tag: String, attributes: Attributes },
    DeleteElementEnd,
    /// Swap the whole attribute set of the element start at this position.
    ReplaceAttributes { old: Attributes, new: Attributes },
    UpdateAttributes(AttributesUpdate),
    AnnotationBoundary(AnnotationBoundary),
}

impl Component {
    /// Items of the input document this component consumes.
    pub fn input_len(&self) -> usize {
        match self {
            Component::Retain(n) => *n,
            Component::DeleteCharacters(s) => s.chars().count(),
            Component::DeleteElementStart { .. }
            | Component::DeleteElementEnd
            | Component::ReplaceAttributes { .. }
            | Component::UpdateAttributes(_) => 1,
            Component::Characters(_)
            | Component::ElementStart { .. }
            | Component::ElementEnd
            | Component::AnnotationBoundary(_) => 0,
        }
    }

    /// Items of the output document this component produces.
    pub fn output_len(&self) -> usize {
        match self {
            Component::Retain(n) => *n,
            Component::Characters(s) => s.chars().count(),
            Component::ElementStart { .. }
            | Component::ElementEnd
            | Component::ReplaceAttributes { .. }
            | Component::UpdateAttributes(_) => 1,
            Component::DeleteCharacters(_)
            | Component::DeleteElementStart { .. }
            | Component::DeleteElementEnd
            | Component::AnnotationBoundary(_) => 0,
        }
    }
}

/// Consumer side of an operation: one callback per component kind.
///
/// [`DocOp::apply`] drives a cursor through every component in order.
pub trait DocOpCursor {
    fn retain(&mut self, count: usize);
    fn characters(&mut self, chars: &str);
    fn element_start(&mut self, tag: &str, attributes: &Attributes);
    fn element_end(&mut self);
    fn delete_characters(&mut self, chars: &str);
    fn delete_element_start(&mut self, tag: &str, attributes: &Attributes);
    fn delete_element_end(&mut self);
    fn replace_attributes(&mut self, old: &Attributes, new: &Attributes);
    fn update_attributes(&mut self, update: &AttributesUpdate);
    fn annotation_boundary(&mut self, boundary: &AnnotationBoundary);
}

/// An immutable, validated document operation.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<Component>", into = "Vec<Component>")]
pub struct DocOp {
    components: Arc<[Component]>,
}

impl DocOp {
    /// Validate and wrap a component list.
    pub fn from_components(components: Vec<Component>) -> Result<Self, MalformedOperation> {
        validate(&components)?;
        Ok(Self {
            components: components.into(),
        })
    }

    /// Wrap components produced by an algorithm that preserves validity.
    pub(crate) fn from_trusted(components: Vec<Component>) -> Self {
        debug_assert!(validate(&components).is_ok(), "{components:?}");
        Self {
            components: components.into(),
        }
    }

    pub fn builder() -> DocOpBuilder {
        DocOpBuilder::new()
    }

    /// The operation that leaves a document of `size` items unchanged.
    pub fn identity(size: usize) -> Self {
        let components = if size == 0 {
            Vec::new()
        } else {
            vec![Component::Retain(size)]
        };
        Self {
            components: components.into(),
        }
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Size of the document this operation applies to.
    pub fn input_len(&self) -> usize {
        self.components.iter().map(Component::input_len).sum()
    }

    /// Size of the document this operation produces.
    pub fn output_len(&self) -> usize {
        self.components.iter().map(Component::output_len).sum()
    }

    /// True when the operation only retains.
    pub fn is_identity(&self) -> bool {
        self.components
            .iter()
            .all(|c| matches!(c, Component::Retain(_)))
    }

    /// Walk every component through `cursor`.
    pub fn apply<C: DocOpCursor + ?Sized>(&self, cursor: &mut C) {
        for component in self.components.iter() {
            match component {
                Component::Retain(n) => cursor.retain(*n),
                Component::Characters(s) => cursor.characters(s),
                Component::ElementStart { tag, attributes } => {
                    cursor.element_start(tag, attributes)
                }
                Component::ElementEnd => cursor.element_end(),
                Component::DeleteCharacters(s) => cursor.delete_characters(s),
                Component::DeleteElementStart { tag, attributes } => {
                    cursor.delete_element_start(tag, attributes)
                }
                Component::DeleteElementEnd => cursor.delete_element_end(),
                Component::ReplaceAttributes { old, new } => cursor.replace_attributes(old, new),
                Component::UpdateAttributes(update) => cursor.update_attributes(update),
                Component::AnnotationBoundary(boundary) => cursor.annotation_boundary(boundary),
            }
        }
    }
}

impl TryFrom<Vec<Component>> for DocOp {
    type Error = MalformedOperation;

    fn try_from(components: Vec<Component>) -> Result<Self, Self::Error> {
        Self::from_components(components)
    }
}

impl From<DocOp> for Vec<Component> {
    fn from(op: DocOp) -> Self {
        op.components.to_vec()
    }
}

impl fmt::Debug for DocOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocOp[{self}]")
    }
}

/// Compact notation, e.g. `__3; ++"ab"; <p>; >; --"c"`.
impl fmt::Display for DocOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, component) in self.components.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            match component {
                Component::Retain(n) => write!(f, "__{n}")?,
                Component::Characters(s) => write!(f, "++{s:?}")?,
                Component::ElementStart { tag, .. } => write!(f, "++<{tag}>")?,
                Component::ElementEnd => f.write_str("++>")?,
                Component::DeleteCharacters(s) => write!(f, "--{s:?}")?,
                Component::DeleteElementStart { tag, .. } => write!(f, "--<{tag}>")?,
                Component::DeleteElementEnd => f.write_str("-->")?,
                Component::ReplaceAttributes { .. } => f.write_str("r@")?,
                Component::UpdateAttributes(update) => write!(f, "u@{}", update.len())?,
                Component::AnnotationBoundary(boundary) => write!(
                    f,
                    "{{{} ended, {} changed}}",
                    boundary.ends().len(),
                    boundary.changes().len()
                )?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Nesting {
    Inserted,
    Deleted,
}

/// Structural checks shared by every way of building an operation.
fn validate(components: &[Component]) -> Result<(), MalformedOperation> {
    let mut stack: Vec<(Nesting, usize)> = Vec::new();
    let mut open = OpenAnnotations::new();
    let mut after_boundary = false;

    for (index, component) in components.iter().enumerate() {
        let top = stack.last().map(|(nesting, _)| *nesting);
        let structure = |reason| Err(MalformedOperation::Structure { index, reason });
        match component {
            Component::Retain(n) => {
                if *n == 0 {
                    return Err(MalformedOperation::EmptyComponent { index });
                }
                if top.is_some() {
                    return structure("retain inside an inserted or deleted element");
                }
            }
            Component::Characters(s) | Component::DeleteCharacters(s) if s.is_empty() => {
                return Err(MalformedOperation::EmptyComponent { index });
            }
            Component::Characters(_) => {
                if top == Some(Nesting::Deleted) {
                    return structure("insertion inside a deleted element");
                }
            }
            Component::ElementStart { .. } => {
                if top == Some(Nesting::Deleted) {
                    return structure("insertion inside a deleted element");
                }
                stack.push((Nesting::Inserted, index));
            }
            Component::ElementEnd => {
                if top != Some(Nesting::Inserted) {
                    return structure("element end without a matching inserted start");
                }
                stack.pop();
            }
            Component::DeleteCharacters(_) => {
                if top == Some(Nesting::Inserted) {
                    return structure("deletion inside an inserted element");
                }
            }
            Component::DeleteElementStart { .. } => {
                if top == Some(Nesting::Inserted) {
                    return structure("deletion inside an inserted element");
                }
                stack.push((Nesting::Deleted, index));
            }
            Component::DeleteElementEnd => {
                if top != Some(Nesting::Deleted) {
                    return structure("deleted element end without a matching deleted start");
                }
                stack.pop();
            }
            Component::ReplaceAttributes { .. } | Component::UpdateAttributes(_) => {
                if top.is_some() {
                    return structure("attribute change inside an inserted or deleted element");
                }
            }
            Component::AnnotationBoundary(boundary) => {
                if boundary.is_empty() {
                    return Err(MalformedOperation::EmptyComponent { index });
                }
                if after_boundary {
                    return structure("adjacent annotation boundaries");
                }
                open.apply(boundary, index)?;
            }
        }
        after_boundary = matches!(component, Component::AnnotationBoundary(_));
    }

    if let Some((_, index)) = stack.first() {
        return Err(MalformedOperation::UnclosedElement { index: *index });
    }
    if let Some(key) = open.keys().next() {
        return Err(MalformedOperation::UnclosedAnnotation { key: key.clone() });
    }
    Ok(())
}
