//! Shared generators for property tests.
//!
//! Operations are generated as a list of [`Action`]s and then laid over a
//! concrete document, so every generated op applies cleanly to the document
//! it was built for.

#![allow(dead_code)]

use std::collections::BTreeMap;

use proptest::prelude::*;
use tidal_core::{
    AnnotationBoundary, AnnotationChange, Attributes, AttributesUpdate, DocOp, DocOpBuilder,
    Document, DocumentModel, ItemKind,
};

pub const KEY: &str = "style";
pub const KEYS: [&str; 2] = ["lang", KEY];

#[derive(Debug, Clone)]
pub enum Segment {
    Text(String),
    /// `<e id=..>text</e>`, the text may be empty.
    Element(u8, String),
    /// An element holding text around a child element with its own text.
    Nested(u8, String, String),
}

#[derive(Debug, Clone)]
pub enum Action {
    Retain(usize),
    Insert(String),
    InsertAnnotated(String, &'static str, &'static str),
    InsertElement(u8, String),
    Delete(usize),
    Annotate(usize, &'static str, Option<&'static str>),
    SetAttribute(&'static str, Option<&'static str>),
    ReplaceAttributes(u8),
}

pub fn text_document(text: &str) -> Document {
    let mut builder = DocOp::builder();
    if !text.is_empty() {
        builder.characters(text);
    }
    Document::from_initialization(&builder.build().unwrap()).unwrap()
}

pub fn element_attributes(id: u8) -> Attributes {
    Attributes::from_pairs([("id", id.to_string())]).unwrap()
}

fn element(builder: &mut DocOpBuilder, id: u8, text: &str) {
    builder.element_start("e", element_attributes(id));
    if !text.is_empty() {
        builder.characters(text);
    }
    builder.element_end();
}

pub fn build_document(segments: Vec<Segment>) -> Document {
    let mut builder = DocOp::builder();
    for segment in segments {
        match segment {
            Segment::Text(text) => {
                builder.characters(text);
            }
            Segment::Element(id, text) => element(&mut builder, id, &text),
            Segment::Nested(id, outer, inner) => {
                builder.element_start("e", element_attributes(id)).characters(outer);
                element(&mut builder, id.wrapping_add(1), &inner);
                builder.element_end();
            }
        }
    }
    Document::from_initialization(&builder.build().unwrap()).unwrap()
}

pub fn applied(document: &Document, op: &DocOp) -> Document {
    let mut document = document.clone();
    document.apply_op(op).unwrap();
    document
}

/// `(old, new)` per open annotation key.
type Open = BTreeMap<&'static str, (Option<String>, Option<String>)>;

/// Lays actions over a document, producing a valid op for it.
struct OpGen<'d> {
    document: &'d Document,
    position: usize,
    builder: DocOpBuilder,
    open: Open,
}

impl<'d> OpGen<'d> {
    fn remaining(&self) -> usize {
        self.document.len() - self.position
    }

    fn kind(&self) -> &'d ItemKind {
        &self.document.items()[self.position].kind
    }

    fn current(&self, key: &str) -> Option<String> {
        self.document.annotation(self.position, key).map(str::to_owned)
    }

    /// Emit one boundary moving the open keys to `wanted`.
    fn sync(&mut self, wanted: Open) {
        if wanted == self.open {
            return;
        }
        let ends = self
            .open
            .keys()
            .filter(|key| !wanted.contains_key(*key))
            .map(|key| key.to_string())
            .collect();
        let changes = wanted
            .iter()
            .filter(|(key, values)| self.open.get(*key) != Some(values))
            .map(|(key, (old, new))| AnnotationChange::new(*key, old.as_deref(), new.as_deref()))
            .collect();
        self.builder
            .annotation_boundary(AnnotationBoundary::new(ends, changes).unwrap());
        self.open = wanted;
    }

    fn retain_one(&mut self) {
        self.sync(Open::new());
        self.builder.retain(1);
        self.position += 1;
    }

    fn annotate_one(&mut self, key: &'static str, value: Option<&str>) {
        let wanted = Open::from([(key, (self.current(key), value.map(str::to_owned)))]);
        self.sync(wanted);
        self.builder.retain(1);
        self.position += 1;
    }

    fn delete_item(&mut self) {
        let wanted = KEYS
            .iter()
            .filter_map(|key| self.current(key).map(|value| (*key, (Some(value), None))))
            .collect();
        self.sync(wanted);
        match self.kind() {
            ItemKind::Char(c) => {
                self.builder.delete_characters(c.to_string());
            }
            ItemKind::ElementStart { tag, attributes } => {
                self.builder.delete_element_start(tag.clone(), attributes.clone());
            }
            ItemKind::ElementEnd => {
                self.builder.delete_element_end();
            }
        }
        self.position += 1;
    }

    /// Delete the next item; an element start takes its whole element with it.
    fn delete_one(&mut self) {
        match self.kind() {
            ItemKind::ElementEnd => self.retain_one(),
            ItemKind::Char(_) => self.delete_item(),
            ItemKind::ElementStart { .. } => {
                let mut depth = 0usize;
                loop {
                    match self.kind() {
                        ItemKind::ElementStart { .. } => depth += 1,
                        ItemKind::ElementEnd => depth -= 1,
                        ItemKind::Char(_) => {}
                    }
                    self.delete_item();
                    if depth == 0 {
                        break;
                    }
                }
            }
        }
    }

    fn set_attribute(&mut self, key: &str, value: Option<&str>) {
        match self.kind() {
            ItemKind::ElementStart { attributes, .. } => {
                let update = AttributesUpdate::single(key, attributes.get(key), value);
                self.sync(Open::new());
                self.builder.update_attributes(update);
                self.position += 1;
            }
            _ => self.retain_one(),
        }
    }

    fn replace_attributes(&mut self, id: u8) {
        match self.kind() {
            ItemKind::ElementStart { attributes, .. } => {
                let new = match attributes.get("class") {
                    Some(_) => element_attributes(id),
                    None => Attributes::from_pairs([("class", "x".to_string()), ("id", id.to_string())])
                        .unwrap(),
                };
                self.sync(Open::new());
                self.builder.replace_attributes(attributes.clone(), new);
                self.position += 1;
            }
            _ => self.retain_one(),
        }
    }

    fn apply(&mut self, action: &Action) {
        match action {
            Action::Retain(n) => {
                for _ in 0..(*n).min(self.remaining()) {
                    self.retain_one();
                }
            }
            Action::Insert(text) => {
                self.sync(Open::new());
                self.builder.characters(text.clone());
            }
            Action::InsertAnnotated(text, key, value) => {
                self.sync(Open::from([(*key, (None, Some(value.to_string())))]));
                self.builder.characters(text.clone());
            }
            Action::InsertElement(id, text) => {
                self.sync(Open::new());
                element(&mut self.builder, *id, text);
            }
            Action::Delete(n) => {
                for _ in 0..*n {
                    if self.remaining() == 0 {
                        break;
                    }
                    self.delete_one();
                }
            }
            Action::Annotate(n, key, value) => {
                for _ in 0..(*n).min(self.remaining()) {
                    self.annotate_one(*key, *value);
                }
            }
            Action::SetAttribute(key, value) => {
                if self.remaining() > 0 {
                    self.set_attribute(key, *value);
                }
            }
            Action::ReplaceAttributes(id) => {
                if self.remaining() > 0 {
                    self.replace_attributes(*id);
                }
            }
        }
    }
}

/// Build an op for `document` out of `actions`; the rest is retained.
pub fn build_op(document: &Document, actions: &[Action]) -> DocOp {
    let mut generator = OpGen {
        document,
        position: 0,
        builder: DocOp::builder(),
        open: Open::new(),
    };
    for action in actions {
        generator.apply(action);
    }
    while generator.remaining() > 0 {
        generator.retain_one();
    }
    generator.sync(Open::new());
    generator.builder.build().unwrap()
}

pub fn document_strategy() -> impl Strategy<Value = Document> {
    prop::collection::vec(
        prop_oneof![
            3 => "[a-c]{1,4}".prop_map(Segment::Text),
            1 => (0u8..3, "[a-c]{0,2}").prop_map(|(id, text)| Segment::Element(id, text)),
            1 => (0u8..3, "[a-c]{1,2}", "[a-c]{0,2}")
                .prop_map(|(id, outer, inner)| Segment::Nested(id, outer, inner)),
        ],
        0..6,
    )
    .prop_map(build_document)
}

fn key() -> impl Strategy<Value = &'static str> {
    prop::sample::select(KEYS.to_vec())
}

fn value() -> impl Strategy<Value = &'static str> {
    prop_oneof![Just("red"), Just("blue")]
}

pub fn actions_strategy() -> impl Strategy<Value = Vec<Action>> {
    prop::collection::vec(
        prop_oneof![
            (1usize..4).prop_map(Action::Retain),
            "[x-z]{1,3}".prop_map(Action::Insert),
            ("[x-z]{1,2}", key(), value())
                .prop_map(|(text, key, value)| Action::InsertAnnotated(text, key, value)),
            (0u8..3, "[x-z]{0,2}").prop_map(|(id, text)| Action::InsertElement(id, text)),
            (1usize..4).prop_map(Action::Delete),
            (1usize..4, key(), prop::option::of(value()))
                .prop_map(|(n, key, value)| Action::Annotate(n, key, value)),
            (
                prop_oneof![Just("id"), Just("class")],
                prop::option::of(prop_oneof![Just("1"), Just("2")])
            )
                .prop_map(|(key, value)| Action::SetAttribute(key, value)),
            (0u8..3).prop_map(Action::ReplaceAttributes),
        ],
        0..8,
    )
}
