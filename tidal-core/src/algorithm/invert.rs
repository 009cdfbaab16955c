use crate::op::{Component, DocOp};

/// The operation that undoes `op`.
///
/// Insertions become deletions (and back), attribute and annotation changes
/// swap their old and new values. `invert(invert(op)) == op`.
pub fn invert(op: &DocOp) -> DocOp {
    let components = op
        .components()
        .iter()
        .map(|component| match component {
            Component::Retain(n) => Component::Retain(*n),
            Component::Characters(s) => Component::DeleteCharacters(s.clone()),
            Component::ElementStart { tag, attributes } => Component::DeleteElementStart {
                tag: tag.clone(),
                attributes: attributes.clone(),
            },
            Component::ElementEnd => Component::DeleteElementEnd,
            Component::DeleteCharacters(s) => Component::Characters(s.clone()),
            Component::DeleteElementStart { tag, attributes } => Component::ElementStart {
                tag: tag.clone(),
                attributes: attributes.clone(),
            },
            Component::DeleteElementEnd => Component::ElementEnd,
            Component::ReplaceAttributes { old, new } => Component::ReplaceAttributes {
                old: new.clone(),
                new: old.clone(),
            },
            Component::UpdateAttributes(update) => Component::UpdateAttributes(update.inverted()),
            Component::AnnotationBoundary(boundary) => {
                Component::AnnotationBoundary(boundary.inverted())
            }
        })
        .collect();
    DocOp::from_trusted(components)
}
