//! Reference document model.
//!
//! The core never owns document storage; it talks to whatever model the
//! embedder supplies through [`DocumentModel`]. [`Document`] is the plain
//! linear implementation used by the wave server, tests and tools: a vector
//! of items, each carrying its own annotation values.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::annotations::OpenAnnotations;
use crate::attributes::Attributes;
use crate::error::{DocumentApplyError, MalformedOperation};
use crate::op::normalizer::Normalizer;
use crate::op::pieces::{Item, Piece, PieceCursor};
use crate::op::DocOp;

/// A mutable document an operation can be applied to.
///
/// `apply_op` must either apply the whole operation or leave the document
/// untouched and report why.
pub trait DocumentModel {
    fn apply_op(&mut self, op: &DocOp) -> Result<(), DocumentApplyError>;

    /// Number of items; the required `input_len` of the next operation.
    fn size(&self) -> usize;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ItemKind {
    Char(char),
    ElementStart { tag: String, attributes: Attributes },
    ElementEnd,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocItem {
    pub kind: ItemKind,
    pub annotations: BTreeMap<String, String>,
}

/// Linear document: characters and element boundaries in order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Document {
    items: Vec<DocItem>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a document from an insert-only operation.
    pub fn from_initialization(op: &DocOp) -> Result<Self, DocumentApplyError> {
        let mut document = Self::new();
        document.apply_op(op)?;
        Ok(document)
    }

    pub fn items(&self) -> &[DocItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Concatenated characters, ignoring element structure.
    pub fn text(&self) -> String {
        self.items
            .iter()
            .filter_map(|item| match item.kind {
                ItemKind::Char(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    /// Value of annotation `key` on the item at `position`.
    pub fn annotation(&self, position: usize, key: &str) -> Option<&str> {
        self.items
            .get(position)?
            .annotations
            .get(key)
            .map(String::as_str)
    }

    /// Markup rendering, e.g. `<p class="x">hi</p>`. Annotations are omitted.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        let mut open_tags: Vec<&str> = Vec::new();
        for item in &self.items {
            match &item.kind {
                ItemKind::Char(c) => out.push(*c),
                ItemKind::ElementStart { tag, attributes } => {
                    out.push('<');
                    out.push_str(tag);
                    for (key, value) in attributes.iter() {
                        let _ = write!(out, " {key}=\"{value}\"");
                    }
                    out.push('>');
                    open_tags.push(tag);
                }
                ItemKind::ElementEnd => {
                    let tag = open_tags.pop().unwrap_or("?");
                    let _ = write!(out, "</{tag}>");
                }
            }
        }
        out
    }

    /// The insert-only operation that rebuilds this document from nothing.
    pub fn to_initialization(&self) -> Result<DocOp, MalformedOperation> {
        let mut out = Normalizer::new();
        let mut text = String::new();
        let mut text_annotations = OpenAnnotations::new();
        for item in &self.items {
            let annotations: OpenAnnotations = item
                .annotations
                .iter()
                .map(|(k, v)| (k.clone(), (None, Some(v.clone()))))
                .collect();
            if let ItemKind::Char(c) = item.kind {
                if annotations != text_annotations && !text.is_empty() {
                    out.insert(Item::Chars(&text), &text_annotations);
                    text.clear();
                }
                text_annotations = annotations;
                text.push(c);
                continue;
            }
            if !text.is_empty() {
                out.insert(Item::Chars(&text), &text_annotations);
                text.clear();
            }
            match &item.kind {
                ItemKind::ElementStart { tag, attributes } => {
                    out.insert(Item::Start(tag, attributes), &annotations)
                }
                _ => out.insert(Item::End, &annotations),
            }
        }
        if !text.is_empty() {
            out.insert(Item::Chars(&text), &text_annotations);
        }
        out.finish()
    }

    fn check_annotations(
        item: &DocItem,
        position: usize,
        annotations: &OpenAnnotations,
    ) -> Result<(), DocumentApplyError> {
        for (key, (old, _)) in annotations.iter() {
            let found = item.annotations.get(key);
            if found != old.as_ref() {
                return Err(DocumentApplyError::AnnotationMismatch {
                    position,
                    key: key.clone(),
                    expected: old.clone(),
                    found: found.cloned(),
                });
            }
        }
        Ok(())
    }

    fn update_annotations(item: &mut DocItem, annotations: &OpenAnnotations) {
        for (key, (_, new)) in annotations.iter() {
            match new {
                Some(value) => {
                    item.annotations.insert(key.clone(), value.clone());
                }
                None => {
                    item.annotations.remove(key);
                }
            }
        }
    }

    fn inserted_annotations(annotations: &OpenAnnotations) -> BTreeMap<String, String> {
        annotations
            .iter()
            .filter_map(|(k, (_, new))| new.as_ref().map(|v| (k.clone(), v.clone())))
            .collect()
    }

    fn expect_deleted(
        found: &DocItem,
        position: usize,
        expected: ItemKind,
    ) -> Result<(), DocumentApplyError> {
        if found.kind == expected {
            return Ok(());
        }
        Err(DocumentApplyError::ItemMismatch {
            position,
            expected: describe(&expected),
            found: describe(&found.kind),
        })
    }
}

fn describe(kind: &ItemKind) -> String {
    match kind {
        ItemKind::Char(c) => format!("{c:?}"),
        ItemKind::ElementStart { tag, .. } => format!("<{tag}>"),
        ItemKind::ElementEnd => "element end".to_string(),
    }
}

impl DocumentModel for Document {
    fn apply_op(&mut self, op: &DocOp) -> Result<(), DocumentApplyError> {
        let op_input = op.input_len();
        if op_input != self.items.len() {
            return Err(DocumentApplyError::SizeMismatch {
                op_input,
                document_size: self.items.len(),
            });
        }

        let mut result = Vec::with_capacity(op.output_len());
        let mut position = 0;
        let mut cursor = PieceCursor::new(op);
        while let Some(piece) = cursor.peek() {
            let annotations = cursor.annotations();
            match piece {
                Piece::Retain(n) => {
                    for item in &self.items[position..position + n] {
                        Self::check_annotations(item, position, annotations)?;
                        let mut item = item.clone();
                        Self::update_annotations(&mut item, annotations);
                        result.push(item);
                        position += 1;
                    }
                }
                Piece::Insert(inserted) => {
                    let values = Self::inserted_annotations(annotations);
                    let kinds: Vec<ItemKind> = match inserted {
                        Item::Chars(s) => s.chars().map(ItemKind::Char).collect(),
                        Item::Start(tag, attributes) => vec![ItemKind::ElementStart {
                            tag: tag.to_owned(),
                            attributes: attributes.clone(),
                        }],
                        Item::End => vec![ItemKind::ElementEnd],
                    };
                    result.extend(kinds.into_iter().map(|kind| DocItem {
                        kind,
                        annotations: values.clone(),
                    }));
                }
                Piece::Delete(Item::Chars(s)) => {
                    for c in s.chars() {
                        Self::expect_deleted(&self.items[position], position, ItemKind::Char(c))?;
                        position += 1;
                    }
                }
                Piece::Delete(Item::Start(tag, attributes)) => {
                    let expected = ItemKind::ElementStart {
                        tag: tag.to_owned(),
                        attributes: attributes.clone(),
                    };
                    Self::expect_deleted(&self.items[position], position, expected)?;
                    position += 1;
                }
                Piece::Delete(Item::End) => {
                    Self::expect_deleted(&self.items[position], position, ItemKind::ElementEnd)?;
                    position += 1;
                }
                Piece::Replace(old, new) => {
                    let item = &self.items[position];
                    let ItemKind::ElementStart { tag, attributes } = &item.kind else {
                        return Err(DocumentApplyError::AttributeMismatch { position });
                    };
                    if attributes != old {
                        return Err(DocumentApplyError::AttributeMismatch { position });
                    }
                    Self::check_annotations(item, position, annotations)?;
                    let mut replaced = DocItem {
                        kind: ItemKind::ElementStart {
                            tag: tag.clone(),
                            attributes: new.clone(),
                        },
                        annotations: item.annotations.clone(),
                    };
                    Self::update_annotations(&mut replaced, annotations);
                    result.push(replaced);
                    position += 1;
                }
                Piece::Update(update) => {
                    let item = &self.items[position];
                    let ItemKind::ElementStart { tag, attributes } = &item.kind else {
                        return Err(DocumentApplyError::AttributeMismatch { position });
                    };
                    if !attributes.matches(update) {
                        return Err(DocumentApplyError::AttributeMismatch { position });
                    }
                    Self::check_annotations(item, position, annotations)?;
                    let mut updated = DocItem {
                        kind: ItemKind::ElementStart {
                            tag: tag.clone(),
                            attributes: attributes.update_with(update),
                        },
                        annotations: item.annotations.clone(),
                    };
                    Self::update_annotations(&mut updated, annotations);
                    result.push(updated);
                    position += 1;
                }
            }
            let len = piece.len();
            cursor.advance(len);
        }

        self.items = result;
        Ok(())
    }

    fn size(&self) -> usize {
        self.items.len()
    }
}
