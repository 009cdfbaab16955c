//! Operational transformation of two concurrent document operations.
//!
//! ```text
//!              client
//!        S0 ──────────▶ S1
//!        │               │
//!  server│               │server'
//!        ▼               ▼
//!        S2 ──────────▶ S3
//!              client'
//! ```
//!
//! `transform(client, server)` returns `(client', server')` such that
//! `server ; client'` and `client ; server'` reach the same state. Ties
//! break in favour of the server: at the same position its insertion lands
//! first, and on a conflicting attribute or annotation value its value is
//! kept.

use crate::annotations::OpenAnnotations;
use crate::attributes::{AttributeChange, Attributes, AttributesUpdate};
use crate::error::TransformError;
use crate::op::normalizer::Normalizer;
use crate::op::pieces::{Item, Piece, PieceCursor};
use crate::op::DocOp;

/// What to do when both sides set the same key of the same item to
/// different values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// The server's value is kept.
    #[default]
    ServerWins,
    /// Fail with [`TransformError::Conflict`].
    Reject,
}

/// Transform with [`ConflictPolicy::ServerWins`].
pub fn transform(client: &DocOp, server: &DocOp) -> Result<(DocOp, DocOp), TransformError> {
    transform_with(client, server, ConflictPolicy::ServerWins)
}

pub fn transform_with(
    client: &DocOp,
    server: &DocOp,
    policy: ConflictPolicy,
) -> Result<(DocOp, DocOp), TransformError> {
    let client_input = client.input_len();
    let server_input = server.input_len();
    if client_input != server_input {
        return Err(TransformError::SizeMismatch {
            client_input,
            server_input,
        });
    }

    let mut transformer = Transformer {
        client: Side::new(client),
        server: Side::new(server),
        policy,
        position: 0,
    };
    transformer.run(client_input)?;
    Ok((
        transformer.client.out.finish()?,
        transformer.server.out.finish()?,
    ))
}

/// One operation being transformed: its cursor, its transformed output and
/// how deep it currently is inside elements it inserts or deletes.
struct Side<'a> {
    cursor: PieceCursor<'a>,
    out: Normalizer,
    inserting: usize,
    deleting: usize,
}

impl<'a> Side<'a> {
    fn new(op: &'a DocOp) -> Self {
        Self {
            cursor: PieceCursor::new(op),
            out: Normalizer::new(),
            inserting: 0,
            deleting: 0,
        }
    }
}

fn track(depth: &mut usize, item: Item<'_>) {
    match item {
        Item::Start(..) => *depth += 1,
        Item::End => *depth = depth.saturating_sub(1),
        Item::Chars(_) => {}
    }
}

/// An attribute change detached from the operation it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
enum AttributeEdit {
    Replace(Attributes, Attributes),
    Update(AttributesUpdate),
}

impl AttributeEdit {
    fn from_piece(piece: Piece<'_>) -> Option<Self> {
        match piece {
            Piece::Replace(old, new) => Some(AttributeEdit::Replace(old.clone(), new.clone())),
            Piece::Update(update) => Some(AttributeEdit::Update(update.clone())),
            _ => None,
        }
    }

    /// Attributes of an element with `before` once this edit has applied.
    fn applied_to(&self, before: &Attributes) -> Attributes {
        match self {
            AttributeEdit::Replace(_, new) => new.clone(),
            AttributeEdit::Update(update) => before.update_with(update),
        }
    }
}

fn emit_attributes(out: &mut Normalizer, edit: Option<AttributeEdit>, annotations: &OpenAnnotations) {
    match edit {
        None => out.retain(1, annotations),
        Some(AttributeEdit::Replace(old, new)) => out.replace_attributes(&old, &new, annotations),
        Some(AttributeEdit::Update(update)) => out.update_attributes(&update, annotations),
    }
}

struct Transformer<'a> {
    client: Side<'a>,
    server: Side<'a>,
    policy: ConflictPolicy,
    position: usize,
}

impl<'a> Transformer<'a> {
    fn run(&mut self, input_len: usize) -> Result<(), TransformError> {
        loop {
            let client_piece = self.client.cursor.peek();
            let server_piece = self.server.cursor.peek();

            if let Some(Piece::Insert(item)) = server_piece {
                // A client half way through its own inserted element finishes it first.
                let client_mid_element = matches!(client_piece, Some(Piece::Insert(_)))
                    && self.client.inserting > 0
                    && self.server.inserting == 0;
                if !client_mid_element {
                    insert_against(&mut self.server, &mut self.client, item);
                    continue;
                }
            }
            if let Some(Piece::Insert(item)) = client_piece {
                insert_against(&mut self.client, &mut self.server, item);
                continue;
            }

            let (client_piece, server_piece) = match (client_piece, server_piece) {
                (None, None) => return Ok(()),
                (Some(c), Some(s)) => (c, s),
                _ => {
                    return Err(TransformError::SizeMismatch {
                        client_input: input_len,
                        server_input: input_len,
                    })
                }
            };
            let n = client_piece.len().min(server_piece.len());
            self.transform_pair(client_piece.prefix(n), server_piece.prefix(n))?;
            self.client.cursor.advance(n);
            self.server.cursor.advance(n);
            self.position += n;
        }
    }

    /// Both sides act on the same `n` items of the original document.
    fn transform_pair(&mut self, c: Piece<'_>, s: Piece<'_>) -> Result<(), TransformError> {
        let client_annotations = self.client.cursor.annotations().clone();
        let server_annotations = self.server.cursor.annotations().clone();
        let position = self.position;
        let mismatch = |reason| Err(TransformError::Mismatch { position, reason });

        match (c, s) {
            (Piece::Retain(n), Piece::Retain(_)) => {
                let (c_ann, s_ann) =
                    self.resolve_annotations(&client_annotations, &server_annotations)?;
                self.client.out.retain(n, &c_ann);
                self.server.out.retain(n, &s_ann);
            }
            (Piece::Retain(_), Piece::Delete(item)) => {
                let record = rebase_record(&server_annotations, &client_annotations);
                self.server.out.delete(item, &record);
                track(&mut self.server.deleting, item);
            }
            (Piece::Delete(item), Piece::Retain(_)) => {
                let record = rebase_record(&client_annotations, &server_annotations);
                self.client.out.delete(item, &record);
                track(&mut self.client.deleting, item);
            }
            (Piece::Delete(client_item), Piece::Delete(server_item)) => {
                if !client_item.same_kind(&server_item) {
                    return mismatch("both sides delete different kinds of item");
                }
                track(&mut self.client.deleting, client_item);
                track(&mut self.server.deleting, server_item);
            }

            (Piece::Retain(_), Piece::Replace(..) | Piece::Update(_)) => {
                let (c_ann, s_ann) =
                    self.resolve_annotations(&client_annotations, &server_annotations)?;
                self.client.out.retain(1, &c_ann);
                emit_attributes(&mut self.server.out, AttributeEdit::from_piece(s), &s_ann);
            }
            (Piece::Replace(..) | Piece::Update(_), Piece::Retain(_)) => {
                let (c_ann, s_ann) =
                    self.resolve_annotations(&client_annotations, &server_annotations)?;
                emit_attributes(&mut self.client.out, AttributeEdit::from_piece(c), &c_ann);
                self.server.out.retain(1, &s_ann);
            }
            (Piece::Replace(..) | Piece::Update(_), Piece::Replace(..) | Piece::Update(_)) => {
                let (c_ann, s_ann) =
                    self.resolve_annotations(&client_annotations, &server_annotations)?;
                let (client_edit, server_edit) = match (
                    AttributeEdit::from_piece(c),
                    AttributeEdit::from_piece(s),
                ) {
                    (Some(client_edit), Some(server_edit)) => {
                        self.resolve_attributes(client_edit, server_edit)?
                    }
                    _ => return mismatch("expected attribute changes on both sides"),
                };
                emit_attributes(&mut self.client.out, client_edit, &c_ann);
                emit_attributes(&mut self.server.out, server_edit, &s_ann);
            }

            // Deleting an element whose attributes the other side changed:
            // the deletion has to name the attributes as they are after that change.
            (Piece::Replace(..) | Piece::Update(_), Piece::Delete(Item::Start(tag, before))) => {
                let after = match AttributeEdit::from_piece(c) {
                    Some(edit) => edit.applied_to(before),
                    None => before.clone(),
                };
                let record = rebase_record(&server_annotations, &client_annotations);
                self.server.out.delete(Item::Start(tag, &after), &record);
                self.server.deleting += 1;
            }
            (Piece::Delete(Item::Start(tag, before)), Piece::Replace(..) | Piece::Update(_)) => {
                let after = match AttributeEdit::from_piece(s) {
                    Some(edit) => edit.applied_to(before),
                    None => before.clone(),
                };
                let record = rebase_record(&client_annotations, &server_annotations);
                self.client.out.delete(Item::Start(tag, &after), &record);
                self.client.deleting += 1;
            }
            (Piece::Replace(..) | Piece::Update(_), Piece::Delete(_))
            | (Piece::Delete(_), Piece::Replace(..) | Piece::Update(_)) => {
                return mismatch("attribute change on a non-element item");
            }

            (Piece::Insert(_), _) | (_, Piece::Insert(_)) => {
                return mismatch("insertion reached the pairing step");
            }
        }
        Ok(())
    }

    /// Annotation changes both sides make to the same retained items.
    ///
    /// Returns the changes for `client'` and `server'`.
    fn resolve_annotations(
        &self,
        client: &OpenAnnotations,
        server: &OpenAnnotations,
    ) -> Result<(OpenAnnotations, OpenAnnotations), TransformError> {
        let mut client_out = OpenAnnotations::new();
        let mut server_out = OpenAnnotations::new();
        for (key, (client_old, client_new)) in client.iter() {
            match server.get(key) {
                Some((_, server_new)) => {
                    if client_new != server_new && self.policy == ConflictPolicy::Reject {
                        return Err(TransformError::Conflict { key: key.clone() });
                    }
                    server_out.insert(key.clone(), (client_new.clone(), server_new.clone()));
                }
                None => client_out.insert(key.clone(), (client_old.clone(), client_new.clone())),
            }
        }
        for (key, values) in server.iter() {
            if !client.contains(key) {
                server_out.insert(key.clone(), values.clone());
            }
        }
        Ok((client_out, server_out))
    }

    /// Attribute changes both sides make to the same element start.
    ///
    /// `None` in the result means the transformed side leaves the element alone.
    fn resolve_attributes(
        &self,
        client: AttributeEdit,
        server: AttributeEdit,
    ) -> Result<(Option<AttributeEdit>, Option<AttributeEdit>), TransformError> {
        let reject = self.policy == ConflictPolicy::Reject;
        match (client, server) {
            (AttributeEdit::Update(client), AttributeEdit::Update(server)) => {
                if reject {
                    for change in server.iter() {
                        if let Some(theirs) = client.get(&change.key) {
                            if theirs.new != change.new {
                                return Err(TransformError::Conflict {
                                    key: change.key.clone(),
                                });
                            }
                        }
                    }
                }
                let server_prime = AttributesUpdate::from_sorted(
                    server
                        .iter()
                        .map(|change| match client.get(&change.key) {
                            Some(theirs) => AttributeChange {
                                key: change.key.clone(),
                                old: theirs.new.clone(),
                                new: change.new.clone(),
                            },
                            None => change.clone(),
                        })
                        .collect(),
                );
                let client_prime = client.filtered(|change| server.get(&change.key).is_none());
                Ok((
                    Some(AttributeEdit::Update(client_prime)),
                    Some(AttributeEdit::Update(server_prime)),
                ))
            }
            (AttributeEdit::Replace(_, client_new), AttributeEdit::Replace(_, server_new)) => {
                if reject {
                    if let Some(key) = differing_key(&client_new, &server_new) {
                        return Err(TransformError::Conflict { key });
                    }
                }
                Ok((None, Some(AttributeEdit::Replace(client_new, server_new))))
            }
            (AttributeEdit::Update(client), AttributeEdit::Replace(server_old, server_new)) => {
                let after_client = server_new.update_with(&client);
                if reject {
                    if let Some(key) = differing_key(&after_client, &server_new) {
                        return Err(TransformError::Conflict { key });
                    }
                }
                Ok((
                    None,
                    Some(AttributeEdit::Replace(
                        server_old.update_with(&client),
                        server_new,
                    )),
                ))
            }
            (AttributeEdit::Replace(client_old, client_new), AttributeEdit::Update(server)) => {
                let merged = client_new.update_with(&server);
                if reject {
                    if let Some(key) = differing_key(&merged, &client_new) {
                        return Err(TransformError::Conflict { key });
                    }
                }
                let server_prime = AttributesUpdate::from_sorted(
                    server
                        .iter()
                        .map(|change| AttributeChange {
                            key: change.key.clone(),
                            old: client_new.get(&change.key).map(str::to_owned),
                            new: change.new.clone(),
                        })
                        .collect(),
                );
                Ok((
                    Some(AttributeEdit::Replace(
                        client_old.update_with(&server),
                        merged,
                    )),
                    Some(AttributeEdit::Update(server_prime)),
                ))
            }
        }
    }
}

/// An insertion by `side` at a point where `other` has nothing to insert.
///
/// Inside an element `other` deletes, the inserted item goes away with it.
fn insert_against(side: &mut Side<'_>, other: &mut Side<'_>, item: Item<'_>) {
    if other.deleting > 0 {
        let record = side.cursor.annotations().inverted();
        other.out.delete(item, &record);
    } else {
        side.out.insert(item, side.cursor.annotations());
        other.out.retain(item.len(), &OpenAnnotations::new());
    }
    track(&mut side.inserting, item);
    side.cursor.advance(item.len());
}

/// The deletion record one side carries, rewritten to apply after the
/// other side's annotation changes to the same items.
fn rebase_record(record: &OpenAnnotations, changes: &OpenAnnotations) -> OpenAnnotations {
    let mut out = record.clone();
    for (key, (_, new)) in changes.iter() {
        let carried = record.get(key).and_then(|(_, n)| n.clone());
        out.insert(key.clone(), (new.clone(), carried));
    }
    out
}

fn differing_key(a: &Attributes, b: &Attributes) -> Option<String> {
    a.iter()
        .map(|(k, _)| k)
        .chain(b.iter().map(|(k, _)| k))
        .find(|k| a.get(k) != b.get(k))
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::AnnotationBoundary;
    use crate::document::{Document, DocumentModel};
    use crate::op::Component;

    fn doc(text: &str) -> Document {
        let init = DocOp::builder().characters(text).build().unwrap();
        Document::from_initialization(&init).unwrap()
    }

    /// Apply both orders and check they agree; returns the converged document.
    fn converge(start: &Document, client: &DocOp, server: &DocOp) -> Document {
        let (client_prime, server_prime) = transform(client, server).unwrap();
        let mut via_client = start.clone();
        via_client.apply_op(client).unwrap();
        via_client.apply_op(&server_prime).unwrap();
        let mut via_server = start.clone();
        via_server.apply_op(server).unwrap();
        via_server.apply_op(&client_prime).unwrap();
        assert_eq!(via_client, via_server);
        via_client
    }

    #[test]
    fn test_concurrent_inserts_server_first() {
        // "hello": client inserts "hi " at 0, server inserts "hey " at 0.
        let start = doc("hello");
        let client = DocOp::builder().characters("hi ").retain(5).build().unwrap();
        let server = DocOp::builder().characters("hey ").retain(5).build().unwrap();
        let result = converge(&start, &client, &server);
        assert_eq!(result.text(), "hey hi hello");
    }

    #[test]
    fn test_insert_against_delete() {
        // Client types "hi " in front; server deletes the first character.
        let start = doc("hello");
        let client = DocOp::builder().characters("hi ").retain(5).build().unwrap();
        let server = DocOp::builder().delete_characters("h").retain(4).build().unwrap();
        let result = converge(&start, &client, &server);
        assert_eq!(result.text(), "hi ello");
    }

    #[test]
    fn test_overlapping_deletes() {
        // Local deletes "abc" and "efg"; remote replaces "c" with "X".
        let start = doc("abcdefg");
        let local = DocOp::builder()
            .delete_characters("abc")
            .retain(1)
            .delete_characters("efg")
            .build()
            .unwrap();
        let remote = DocOp::builder()
            .retain(2)
            .delete_characters("c")
            .characters("X")
            .retain(4)
            .build()
            .unwrap();
        let (local_prime, remote_prime) = transform(&local, &remote).unwrap();
        assert_eq!(
            local_prime.components(),
            &[
                Component::DeleteCharacters("ab".into()),
                Component::Retain(2),
                Component::DeleteCharacters("efg".into()),
            ]
        );
        assert_eq!(
            remote_prime.components(),
            &[Component::Characters("X".into()), Component::Retain(1)]
        );
        let result = converge(&start, &local, &remote);
        assert_eq!(result.text(), "Xd");
    }

    #[test]
    fn test_insert_inside_deleted_element_is_deleted() {
        let init = DocOp::builder()
            .element_start("p", Attributes::new())
            .characters("ab")
            .element_end()
            .build()
            .unwrap();
        let start = Document::from_initialization(&init).unwrap();
        let client = DocOp::builder()
            .retain(2)
            .characters("X")
            .retain(2)
            .build()
            .unwrap();
        let server = DocOp::builder()
            .delete_element_start("p", Attributes::new())
            .delete_characters("ab")
            .delete_element_end()
            .build()
            .unwrap();
        let result = converge(&start, &client, &server);
        assert!(result.is_empty());
    }

    #[test]
    fn test_attribute_conflict_server_wins() {
        let attrs = Attributes::from_pairs([("color", "red")]).unwrap();
        let init = DocOp::builder()
            .element_start("p", attrs)
            .element_end()
            .build()
            .unwrap();
        let start = Document::from_initialization(&init).unwrap();
        let client = DocOp::builder()
            .update_attributes(AttributesUpdate::single("color", Some("red"), Some("blue")))
            .retain(1)
            .build()
            .unwrap();
        let server = DocOp::builder()
            .update_attributes(AttributesUpdate::single("color", Some("red"), Some("green")))
            .retain(1)
            .build()
            .unwrap();
        let result = converge(&start, &client, &server);
        assert_eq!(result.to_xml(), "<p color=\"green\"></p>");

        assert_eq!(
            transform_with(&client, &server, ConflictPolicy::Reject),
            Err(TransformError::Conflict {
                key: "color".into()
            })
        );
    }

    #[test]
    fn test_replace_against_update() {
        let init = DocOp::builder()
            .element_start("p", Attributes::from_pairs([("a", "1")]).unwrap())
            .element_end()
            .build()
            .unwrap();
        let start = Document::from_initialization(&init).unwrap();
        let client = DocOp::builder()
            .replace_attributes(
                Attributes::from_pairs([("a", "1")]).unwrap(),
                Attributes::from_pairs([("b", "2")]).unwrap(),
            )
            .retain(1)
            .build()
            .unwrap();
        let server = DocOp::builder()
            .update_attributes(AttributesUpdate::single("c", None, Some("3")))
            .retain(1)
            .build()
            .unwrap();
        let result = converge(&start, &client, &server);
        assert_eq!(result.to_xml(), "<p b=\"2\" c=\"3\"></p>");
        // The reverse pairing converges too.
        let result = converge(&start, &server, &client);
        assert_eq!(result.to_xml(), "<p b=\"2\"></p>");
    }

    #[test]
    fn test_delete_of_element_with_changed_attributes() {
        let init = DocOp::builder()
            .element_start("p", Attributes::from_pairs([("a", "1")]).unwrap())
            .element_end()
            .build()
            .unwrap();
        let start = Document::from_initialization(&init).unwrap();
        let client = DocOp::builder()
            .update_attributes(AttributesUpdate::single("a", Some("1"), Some("2")))
            .retain(1)
            .build()
            .unwrap();
        let server = DocOp::builder()
            .delete_element_start("p", Attributes::from_pairs([("a", "1")]).unwrap())
            .delete_element_end()
            .build()
            .unwrap();
        let result = converge(&start, &client, &server);
        assert!(result.is_empty());
    }

    #[test]
    fn test_annotation_conflict() {
        let start = doc("abcd");
        let client = DocOp::builder()
            .annotation_boundary(AnnotationBoundary::start("s", None, Some("bold")))
            .retain(3)
            .annotation_boundary(AnnotationBoundary::end("s"))
            .retain(1)
            .build()
            .unwrap();
        let server = DocOp::builder()
            .retain(1)
            .annotation_boundary(AnnotationBoundary::start("s", None, Some("italic")))
            .retain(3)
            .annotation_boundary(AnnotationBoundary::end("s"))
            .build()
            .unwrap();
        let result = converge(&start, &client, &server);
        assert_eq!(result.annotation(0, "s"), Some("bold"));
        assert_eq!(result.annotation(1, "s"), Some("italic"));
        assert_eq!(result.annotation(3, "s"), Some("italic"));
    }

    #[test]
    fn test_annotation_survives_delete_record() {
        // Client annotates the character the server deletes.
        let start = doc("ab");
        let client = DocOp::builder()
            .annotation_boundary(AnnotationBoundary::start("k", None, Some("v")))
            .retain(1)
            .annotation_boundary(AnnotationBoundary::end("k"))
            .retain(1)
            .build()
            .unwrap();
        let server = DocOp::builder().delete_characters("a").retain(1).build().unwrap();
        let result = converge(&start, &client, &server);
        assert_eq!(result.text(), "b");
    }

    #[test]
    fn test_size_mismatch() {
        let a = DocOp::identity(2);
        let b = DocOp::identity(3);
        assert_eq!(
            transform(&a, &b),
            Err(TransformError::SizeMismatch {
                client_input: 2,
                server_input: 3
            })
        );
    }
}
