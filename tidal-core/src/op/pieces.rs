//! Piecewise iteration over an operation.
//!
//! Compose and transform walk two operations in lockstep, consuming whatever
//! length both sides can agree on. [`PieceCursor`] hides annotation
//! boundaries (folding them into the open-annotation state) and lets callers
//! take a prefix of the current component.

use crate::annotations::OpenAnnotations;
use crate::attributes::{Attributes, AttributesUpdate};

use super::{Component, DocOp};

/// A run of inserted or deleted document items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Item<'a> {
    Chars(&'a str),
    Start(&'a str, &'a Attributes),
    End,
}

impl<'a> Item<'a> {
    pub(crate) fn len(&self) -> usize {
        match self {
            Item::Chars(s) => s.chars().count(),
            Item::Start(..) | Item::End => 1,
        }
    }

    fn prefix(self, n: usize) -> Self {
        match self {
            Item::Chars(s) => Item::Chars(char_prefix(s, n)),
            other => other,
        }
    }

    /// Whether two items describe the same document content.
    pub(crate) fn same_content(&self, other: &Item<'_>) -> bool {
        match (self, other) {
            (Item::Chars(a), Item::Chars(b)) => a == b,
            (Item::Start(tag_a, attrs_a), Item::Start(tag_b, attrs_b)) => {
                tag_a == tag_b && attrs_a == attrs_b
            }
            (Item::End, Item::End) => true,
            _ => false,
        }
    }

    pub(crate) fn same_kind(&self, other: &Item<'_>) -> bool {
        matches!(
            (self, other),
            (Item::Chars(_), Item::Chars(_))
                | (Item::Start(..), Item::Start(..))
                | (Item::End, Item::End)
        )
    }
}

/// What an operation does to the next run of items.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Piece<'a> {
    Retain(usize),
    Insert(Item<'a>),
    Delete(Item<'a>),
    Replace(&'a Attributes, &'a Attributes),
    Update(&'a AttributesUpdate),
}

impl<'a> Piece<'a> {
    pub(crate) fn len(&self) -> usize {
        match self {
            Piece::Retain(n) => *n,
            Piece::Insert(item) | Piece::Delete(item) => item.len(),
            Piece::Replace(..) | Piece::Update(_) => 1,
        }
    }

    /// The first `n` items of this piece.
    pub(crate) fn prefix(self, n: usize) -> Self {
        match self {
            Piece::Retain(_) => Piece::Retain(n),
            Piece::Insert(item) => Piece::Insert(item.prefix(n)),
            Piece::Delete(item) => Piece::Delete(item.prefix(n)),
            other => other,
        }
    }
}

pub(crate) fn char_prefix(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

/// Walks an operation piece by piece, tracking open annotations.
pub(crate) struct PieceCursor<'a> {
    components: &'a [Component],
    index: usize,
    /// Retained items already consumed, or bytes already consumed of a string.
    offset: usize,
    annotations: OpenAnnotations,
}

impl<'a> PieceCursor<'a> {
    pub(crate) fn new(op: &'a DocOp) -> Self {
        Self {
            components: op.components(),
            index: 0,
            offset: 0,
            annotations: OpenAnnotations::new(),
        }
    }

    /// The remainder of the current component, after folding in any
    /// boundaries in front of it.
    pub(crate) fn peek(&mut self) -> Option<Piece<'a>> {
        loop {
            let components = self.components;
            let piece = match components.get(self.index)? {
                Component::AnnotationBoundary(boundary) => {
                    self.annotations.apply_trusted(boundary);
                    self.index += 1;
                    continue;
                }
                Component::Retain(n) => Piece::Retain(n - self.offset),
                Component::Characters(s) => Piece::Insert(Item::Chars(&s[self.offset..])),
                Component::ElementStart { tag, attributes } => {
                    Piece::Insert(Item::Start(tag, attributes))
                }
                Component::ElementEnd => Piece::Insert(Item::End),
                Component::DeleteCharacters(s) => Piece::Delete(Item::Chars(&s[self.offset..])),
                Component::DeleteElementStart { tag, attributes } => {
                    Piece::Delete(Item::Start(tag, attributes))
                }
                Component::DeleteElementEnd => Piece::Delete(Item::End),
                Component::ReplaceAttributes { old, new } => Piece::Replace(old, new),
                Component::UpdateAttributes(update) => Piece::Update(update),
            };
            return Some(piece);
        }
    }

    /// Annotations covering the piece last returned by [`peek`](Self::peek).
    pub(crate) fn annotations(&self) -> &OpenAnnotations {
        &self.annotations
    }

    /// Consume `n` items of the current piece (`n` at most its length).
    pub(crate) fn advance(&mut self, n: usize) {
        let Some(component) = self.components.get(self.index) else {
            return;
        };
        let finished = match component {
            Component::Retain(total) => {
                self.offset += n;
                self.offset >= *total
            }
            Component::Characters(s) | Component::DeleteCharacters(s) => {
                self.offset += char_prefix(&s[self.offset..], n).len();
                self.offset >= s.len()
            }
            _ => true,
        };
        if finished {
            self.index += 1;
            self.offset = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::AnnotationBoundary;

    #[test]
    fn test_char_prefix_respects_boundaries() {
        assert_eq!(char_prefix("héllo", 2), "hé");
        assert_eq!(char_prefix("ab", 5), "ab");
        assert_eq!(char_prefix("ab", 0), "");
    }

    #[test]
    fn test_partial_advance() {
        let op = DocOp::builder()
            .retain(3)
            .characters("xyz")
            .build()
            .unwrap();
        let mut cursor = PieceCursor::new(&op);
        assert!(matches!(cursor.peek(), Some(Piece::Retain(3))));
        cursor.advance(2);
        assert!(matches!(cursor.peek(), Some(Piece::Retain(1))));
        cursor.advance(1);
        assert!(matches!(cursor.peek(), Some(Piece::Insert(Item::Chars("xyz")))));
        cursor.advance(1);
        assert!(matches!(cursor.peek(), Some(Piece::Insert(Item::Chars("yz")))));
        cursor.advance(2);
        assert!(cursor.peek().is_none());
    }

    #[test]
    fn test_boundaries_fold_into_annotations() {
        let op = DocOp::builder()
            .annotation_boundary(AnnotationBoundary::start("k", Some("a"), Some("b")))
            .retain(2)
            .annotation_boundary(AnnotationBoundary::end("k"))
            .retain(1)
            .build()
            .unwrap();
        let mut cursor = PieceCursor::new(&op);
        cursor.peek();
        assert_eq!(
            cursor.annotations().get("k"),
            Some(&(Some("a".to_string()), Some("b".to_string())))
        );
        cursor.advance(2);
        cursor.peek();
        assert!(cursor.annotations().is_empty());
    }
}
