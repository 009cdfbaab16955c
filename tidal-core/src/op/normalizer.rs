//! Output side of the algorithms.
//!
//! Compose, transform and invert describe their result item by item, each
//! with the annotation changes that should cover it. The normalizer turns
//! that into a canonical operation: adjacent runs merged, boundaries emitted
//! only where the covering annotations actually change, and annotation
//! entries that have no effect on an item of that kind dropped.

use crate::annotations::{AnnotationBoundary, AnnotationChange, OpenAnnotations};
use crate::attributes::{Attributes, AttributesUpdate};
use crate::error::MalformedOperation;

use super::pieces::Item;
use super::{Component, DocOp};

#[derive(Debug, Clone, Copy)]
enum Coverage {
    Retained,
    Inserted,
    Deleted,
}

#[derive(Debug, Default)]
pub(crate) struct Normalizer {
    components: Vec<Component>,
    open: OpenAnnotations,
}

impl Normalizer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn retain(&mut self, count: usize, annotations: &OpenAnnotations) {
        if count == 0 {
            return;
        }
        self.sync(annotations, Coverage::Retained);
        self.push(Component::Retain(count));
    }

    pub(crate) fn insert(&mut self, item: Item<'_>, annotations: &OpenAnnotations) {
        match item {
            Item::Chars("") => {}
            Item::Chars(s) => {
                self.sync(annotations, Coverage::Inserted);
                self.push(Component::Characters(s.to_owned()));
            }
            Item::Start(tag, attributes) => {
                self.sync(annotations, Coverage::Inserted);
                self.push(Component::ElementStart {
                    tag: tag.to_owned(),
                    attributes: attributes.clone(),
                });
            }
            Item::End => {
                self.sync(annotations, Coverage::Inserted);
                self.push(Component::ElementEnd);
            }
        }
    }

    pub(crate) fn delete(&mut self, item: Item<'_>, annotations: &OpenAnnotations) {
        match item {
            Item::Chars("") => {}
            Item::Chars(s) => {
                self.sync(annotations, Coverage::Deleted);
                self.push(Component::DeleteCharacters(s.to_owned()));
            }
            Item::Start(tag, attributes) => {
                self.sync(annotations, Coverage::Deleted);
                self.push(Component::DeleteElementStart {
                    tag: tag.to_owned(),
                    attributes: attributes.clone(),
                });
            }
            Item::End => {
                self.sync(annotations, Coverage::Deleted);
                self.push(Component::DeleteElementEnd);
            }
        }
    }

    pub(crate) fn replace_attributes(
        &mut self,
        old: &Attributes,
        new: &Attributes,
        annotations: &OpenAnnotations,
    ) {
        if old == new {
            return self.retain(1, annotations);
        }
        self.sync(annotations, Coverage::Retained);
        self.push(Component::ReplaceAttributes {
            old: old.clone(),
            new: new.clone(),
        });
    }

    pub(crate) fn update_attributes(
        &mut self,
        update: &AttributesUpdate,
        annotations: &OpenAnnotations,
    ) {
        let update = update.without_noops();
        if update.is_empty() {
            return self.retain(1, annotations);
        }
        self.sync(annotations, Coverage::Retained);
        self.push(Component::UpdateAttributes(update));
    }

    /// Close whatever is still open and validate the result.
    pub(crate) fn finish(mut self) -> Result<DocOp, MalformedOperation> {
        if !self.open.is_empty() {
            let ends = self.open.keys().cloned().collect();
            self.components
                .push(Component::AnnotationBoundary(AnnotationBoundary::from_sorted(
                    ends,
                    Vec::new(),
                )));
        }
        DocOp::from_components(self.components)
    }

    /// Emit a boundary if the annotations wanted for the next item differ
    /// from those currently open.
    fn sync(&mut self, annotations: &OpenAnnotations, coverage: Coverage) {
        let wanted = match coverage {
            Coverage::Retained => annotations.filtered(|(old, new)| old != new),
            Coverage::Inserted => annotations.filtered(|(_, new)| new.is_some()),
            Coverage::Deleted => annotations.filtered(|(old, _)| old.is_some()),
        };
        let ends: Vec<String> = self
            .open
            .keys()
            .filter(|key| !wanted.contains(key))
            .cloned()
            .collect();
        let changes: Vec<AnnotationChange> = wanted
            .iter()
            .filter(|(key, values)| self.open.get(key) != Some(*values))
            .map(|(key, (old, new))| AnnotationChange {
                key: key.clone(),
                old: old.clone(),
                new: new.clone(),
            })
            .collect();
        if ends.is_empty() && changes.is_empty() {
            return;
        }
        self.components
            .push(Component::AnnotationBoundary(AnnotationBoundary::from_sorted(
                ends, changes,
            )));
        self.open = wanted;
    }

    fn push(&mut self, component: Component) {
        if let Some(last) = self.components.last_mut() {
            match (last, &component) {
                (Component::Retain(n), Component::Retain(m)) => {
                    *n += m;
                    return;
                }
                (Component::Characters(a), Component::Characters(b))
                | (Component::DeleteCharacters(a), Component::DeleteCharacters(b)) => {
                    a.push_str(b);
                    return;
                }
                _ => {}
            }
        }
        self.components.push(component);
    }
}
