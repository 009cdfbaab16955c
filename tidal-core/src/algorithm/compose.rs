//! Sequential composition.
//!
//! `compose(a, b)` walks `a`'s output and `b`'s input together. Deletions
//! made by `a` and insertions made by `b` pass straight through; everything
//! else pairs one item of `a`'s output with one item of `b`'s input.

use crate::annotations::OpenAnnotations;
use crate::attributes::Attributes;
use crate::error::ComposeError;
use crate::op::normalizer::Normalizer;
use crate::op::pieces::{Item, Piece, PieceCursor};
use crate::op::DocOp;

/// An operation equivalent to applying `first` and then `second`.
pub fn compose(first: &DocOp, second: &DocOp) -> Result<DocOp, ComposeError> {
    let first_output = first.output_len();
    let second_input = second.input_len();
    if first_output != second_input {
        return Err(ComposeError::SizeMismatch {
            first_output,
            second_input,
        });
    }

    let mut a = PieceCursor::new(first);
    let mut b = PieceCursor::new(second);
    let mut out = Normalizer::new();
    // Nesting of elements `first` is deleting at the current point.
    let mut deletion_depth = 0usize;
    let mut position = 0usize;

    loop {
        match (a.peek(), b.peek()) {
            (None, None) => break,
            (Some(Piece::Delete(item)), next)
                if deletion_depth > 0 || !matches!(next, Some(Piece::Insert(_))) =>
            {
                out.delete(item, a.annotations());
                match item {
                    Item::Start(..) => deletion_depth += 1,
                    Item::End => deletion_depth = deletion_depth.saturating_sub(1),
                    Item::Chars(_) => {}
                }
                a.advance(item.len());
            }
            (_, Some(Piece::Insert(item))) => {
                out.insert(item, b.annotations());
                b.advance(item.len());
            }
            (Some(pa), Some(pb)) => {
                let n = pa.len().min(pb.len());
                let annotations = a.annotations().compose(b.annotations());
                compose_pair(&mut out, pa.prefix(n), pb.prefix(n), &annotations, position)?;
                a.advance(n);
                b.advance(n);
                position += n;
            }
            _ => {
                return Err(ComposeError::SizeMismatch {
                    first_output,
                    second_input,
                })
            }
        }
    }

    Ok(out.finish()?)
}

/// Compose a sequence of operations left to right. `None` for an empty input.
pub fn compose_all<'a, I>(ops: I) -> Result<Option<DocOp>, ComposeError>
where
    I: IntoIterator<Item = &'a DocOp>,
{
    let mut composed: Option<DocOp> = None;
    for op in ops {
        composed = Some(match composed {
            None => op.clone(),
            Some(previous) => compose(&previous, op)?,
        });
    }
    Ok(composed)
}

/// One item of `first`'s output (`a`) meets one item of `second`'s input (`b`).
fn compose_pair(
    out: &mut Normalizer,
    a: Piece<'_>,
    b: Piece<'_>,
    annotations: &OpenAnnotations,
    position: usize,
) -> Result<(), ComposeError> {
    let mismatch = |reason| Err(ComposeError::Mismatch { position, reason });
    match (a, b) {
        (Piece::Insert(item), Piece::Retain(_)) => out.insert(item, annotations),
        (Piece::Insert(inserted), Piece::Delete(deleted)) => {
            if !inserted.same_content(&deleted) {
                return mismatch("second op deletes content the first did not insert");
            }
        }
        (Piece::Insert(Item::Start(tag, attributes)), Piece::Replace(old, new)) => {
            if attributes != old {
                return mismatch("attribute replacement does not match inserted element");
            }
            out.insert(Item::Start(tag, new), annotations);
        }
        (Piece::Insert(Item::Start(tag, attributes)), Piece::Update(update)) => {
            let updated = attributes.update_with(update);
            out.insert(Item::Start(tag, &updated), annotations);
        }
        (Piece::Insert(_), _) => return mismatch("attribute change on a non-element item"),

        (Piece::Retain(n), Piece::Retain(_)) => out.retain(n, annotations),
        (Piece::Retain(_), Piece::Delete(item)) => out.delete(item, annotations),
        (Piece::Retain(_), Piece::Replace(old, new)) => {
            out.replace_attributes(old, new, annotations)
        }
        (Piece::Retain(_), Piece::Update(update)) => out.update_attributes(update, annotations),

        (Piece::Replace(old, new), Piece::Retain(_)) => {
            out.replace_attributes(old, new, annotations)
        }
        (Piece::Update(update), Piece::Retain(_)) => out.update_attributes(update, annotations),

        // The deletion records the attributes as they were before `first`.
        (Piece::Replace(old, _), Piece::Delete(Item::Start(tag, _))) => {
            out.delete(Item::Start(tag, old), annotations)
        }
        (Piece::Update(update), Piece::Delete(Item::Start(tag, attributes))) => {
            let before = attributes.update_with(&update.inverted());
            out.delete(Item::Start(tag, &before), annotations);
        }
        (Piece::Replace(..) | Piece::Update(_), Piece::Delete(_)) => {
            return mismatch("deleting a non-element item whose attributes changed")
        }

        (Piece::Replace(old, _), Piece::Replace(_, new)) => {
            out.replace_attributes(old, new, annotations)
        }
        (Piece::Replace(old, new), Piece::Update(update)) => {
            let updated = new.update_with(update);
            out.replace_attributes(old, &updated, annotations);
        }
        (Piece::Update(update), Piece::Replace(old, new)) => {
            let before: Attributes = old.update_with(&update.inverted());
            out.replace_attributes(&before, new, annotations);
        }
        (Piece::Update(first), Piece::Update(second)) => {
            out.update_attributes(&first.compose(second), annotations)
        }

        (Piece::Delete(_), _) | (_, Piece::Insert(_)) => {
            return mismatch("unpaired insertion or deletion")
        }
    }
    Ok(())
}
