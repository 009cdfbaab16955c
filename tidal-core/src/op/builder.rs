use crate::annotations::AnnotationBoundary;
use crate::attributes::{Attributes, AttributesUpdate};
use crate::error::MalformedOperation;

use super::{Component, DocOp, DocOpCursor};

/// Records components and validates them once in [`DocOpBuilder::build`].
///
/// Consecutive retains, insertions of characters and deletions of characters
/// are merged as they are added.
///
/// ```
/// use tidal_core::DocOp;
///
/// let op = DocOp::builder().retain(2).characters("hi").retain(1).build().unwrap();
/// assert_eq!(op.input_len(), 3);
/// ```
#[derive(Debug, Clone, Default)]
pub struct DocOpBuilder {
    components: Vec<Component>,
}

impl DocOpBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retain(&mut self, count: usize) -> &mut Self {
        if let Some(Component::Retain(n)) = self.components.last_mut() {
            *n += count;
        } else {
            self.components.push(Component::Retain(count));
        }
        self
    }

    pub fn characters(&mut self, chars: impl Into<String>) -> &mut Self {
        let chars = chars.into();
        if let Some(Component::Characters(s)) = self.components.last_mut() {
            s.push_str(&chars);
        } else {
            self.components.push(Component::Characters(chars));
        }
        self
    }

    pub fn element_start(&mut self, tag: impl Into<String>, attributes: Attributes) -> &mut Self {
        self.components.push(Component::ElementStart {
            tag: tag.into(),
            attributes,
        });
        self
    }

    pub fn element_end(&mut self) -> &mut Self {
        self.components.push(Component::ElementEnd);
        self
    }

    pub fn delete_characters(&mut self, chars: impl Into<String>) -> &mut Self {
        let chars = chars.into();
        if let Some(Component::DeleteCharacters(s)) = self.components.last_mut() {
            s.push_str(&chars);
        } else {
            self.components.push(Component::DeleteCharacters(chars));
        }
        self
    }

    pub fn delete_element_start(
        &mut self,
        tag: impl Into<String>,
        attributes: Attributes,
    ) -> &mut Self {
        self.components.push(Component::DeleteElementStart {
            tag: tag.into(),
            attributes,
        });
        self
    }

    pub fn delete_element_end(&mut self) -> &mut Self {
        self.components.push(Component::DeleteElementEnd);
        self
    }

    pub fn replace_attributes(&mut self, old: Attributes, new: Attributes) -> &mut Self {
        self.components.push(Component::ReplaceAttributes { old, new });
        self
    }

    pub fn update_attributes(&mut self, update: AttributesUpdate) -> &mut Self {
        self.components.push(Component::UpdateAttributes(update));
        self
    }

    pub fn annotation_boundary(&mut self, boundary: AnnotationBoundary) -> &mut Self {
        self.components.push(Component::AnnotationBoundary(boundary));
        self
    }

    /// Validate what was recorded and hand it out, leaving the builder empty.
    pub fn build(&mut self) -> Result<DocOp, MalformedOperation> {
        DocOp::from_components(std::mem::take(&mut self.components))
    }
}

impl DocOpCursor for DocOpBuilder {
    fn retain(&mut self, count: usize) {
        DocOpBuilder::retain(self, count);
    }

    fn characters(&mut self, chars: &str) {
        DocOpBuilder::characters(self, chars);
    }

    fn element_start(&mut self, tag: &str, attributes: &Attributes) {
        DocOpBuilder::element_start(self, tag, attributes.clone());
    }

    fn element_end(&mut self) {
        DocOpBuilder::element_end(self);
    }

    fn delete_characters(&mut self, chars: &str) {
        DocOpBuilder::delete_characters(self, chars);
    }

    fn delete_element_start(&mut self, tag: &str, attributes: &Attributes) {
        DocOpBuilder::delete_element_start(self, tag, attributes.clone());
    }

    fn delete_element_end(&mut self) {
        DocOpBuilder::delete_element_end(self);
    }

    fn replace_attributes(&mut self, old: &Attributes, new: &Attributes) {
        DocOpBuilder::replace_attributes(self, old.clone(), new.clone());
    }

    fn update_attributes(&mut self, update: &AttributesUpdate) {
        DocOpBuilder::update_attributes(self, update.clone());
    }

    fn annotation_boundary(&mut self, boundary: &AnnotationBoundary) {
        DocOpBuilder::annotation_boundary(self, boundary.clone());
    }
}
