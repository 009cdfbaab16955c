//! Annotation boundaries and the open-annotation state they describe.
//!
//! An operation annotates ranges by interleaving boundaries with its other
//! components. A boundary opens (or changes) keys with an `old -> new` pair
//! and ends keys that were open. Everything between the boundary that opens
//! a key and the boundary that ends it carries that change.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::attributes::check_sorted;
use crate::error::MalformedOperation;

/// One key's change inside an annotation boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AnnotationChange {
    pub key: String,
    pub old: Option<String>,
    pub new: Option<String>,
}

impl AnnotationChange {
    pub fn new(key: impl Into<String>, old: Option<&str>, new: Option<&str>) -> Self {
        Self {
            key: key.into(),
            old: old.map(str::to_owned),
            new: new.map(str::to_owned),
        }
    }
}

type RawBoundary = (Vec<String>, Vec<AnnotationChange>);

/// A set of annotation keys ending here plus a set of keys (re)opened here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawBoundary", into = "RawBoundary")]
pub struct AnnotationBoundary {
    ends: Vec<String>,
    changes: Vec<AnnotationChange>,
}

impl AnnotationBoundary {
    /// Keys must be sorted and unique within each list, and a key may not be
    /// both ended and changed.
    pub fn new(
        ends: Vec<String>,
        changes: Vec<AnnotationChange>,
    ) -> Result<Self, MalformedOperation> {
        check_sorted(ends.iter().map(String::as_str))?;
        check_sorted(changes.iter().map(|c| c.key.as_str()))?;
        if let Some(key) = ends
            .iter()
            .find(|k| changes.binary_search_by(|c| c.key.cmp(*k)).is_ok())
        {
            return Err(MalformedOperation::EndedAndChanged { key: key.clone() });
        }
        Ok(Self { ends, changes })
    }

    /// Open a single key.
    pub fn start(key: impl Into<String>, old: Option<&str>, new: Option<&str>) -> Self {
        Self {
            ends: Vec::new(),
            changes: vec![AnnotationChange::new(key, old, new)],
        }
    }

    /// End a single key.
    pub fn end(key: impl Into<String>) -> Self {
        Self {
            ends: vec![key.into()],
            changes: Vec::new(),
        }
    }

    /// Caller guarantees sorted, unique and disjoint keys.
    pub(crate) fn from_sorted(ends: Vec<String>, changes: Vec<AnnotationChange>) -> Self {
        debug_assert!(Self::new(ends.clone(), changes.clone()).is_ok());
        Self { ends, changes }
    }

    pub fn ends(&self) -> &[String] {
        &self.ends
    }

    pub fn changes(&self) -> &[AnnotationChange] {
        &self.changes
    }

    pub fn is_empty(&self) -> bool {
        self.ends.is_empty() && self.changes.is_empty()
    }

    /// The boundary of the inverse operation: every change swaps old and new.
    pub fn inverted(&self) -> Self {
        Self {
            ends: self.ends.clone(),
            changes: self
                .changes
                .iter()
                .map(|c| AnnotationChange {
                    key: c.key.clone(),
                    old: c.new.clone(),
                    new: c.old.clone(),
                })
                .collect(),
        }
    }
}

impl TryFrom<RawBoundary> for AnnotationBoundary {
    type Error = MalformedOperation;

    fn try_from((ends, changes): RawBoundary) -> Result<Self, Self::Error> {
        Self::new(ends, changes)
    }
}

impl From<AnnotationBoundary> for RawBoundary {
    fn from(boundary: AnnotationBoundary) -> Self {
        (boundary.ends, boundary.changes)
    }
}

/// `(old, new)` values of one open annotation key.
pub(crate) type ValuePair = (Option<String>, Option<String>);

/// The annotation keys open at some point of an operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct OpenAnnotations {
    open: BTreeMap<String, ValuePair>,
}

impl OpenAnnotations {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get(&self, key: &str) -> Option<&ValuePair> {
        self.open.get(key)
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.open.contains_key(key)
    }

    pub(crate) fn insert(&mut self, key: String, values: ValuePair) {
        self.open.insert(key, values);
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&String, &ValuePair)> {
        self.open.iter()
    }

    pub(crate) fn keys(&self) -> impl Iterator<Item = &String> {
        self.open.keys()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.open.is_empty()
    }

    /// Apply a boundary, failing if it ends a key that is not open.
    pub(crate) fn apply(
        &mut self,
        boundary: &AnnotationBoundary,
        index: usize,
    ) -> Result<(), MalformedOperation> {
        for key in boundary.ends() {
            if self.open.remove(key).is_none() {
                return Err(MalformedOperation::AnnotationNotOpen {
                    index,
                    key: key.clone(),
                });
            }
        }
        for change in boundary.changes() {
            self.open
                .insert(change.key.clone(), (change.old.clone(), change.new.clone()));
        }
        Ok(())
    }

    /// Apply a boundary from an already validated operation.
    pub(crate) fn apply_trusted(&mut self, boundary: &AnnotationBoundary) {
        for key in boundary.ends() {
            self.open.remove(key);
        }
        for change in boundary.changes() {
            self.open
                .insert(change.key.clone(), (change.old.clone(), change.new.clone()));
        }
    }

    /// Same map with every pair swapped.
    pub(crate) fn inverted(&self) -> Self {
        Self {
            open: self
                .open
                .iter()
                .map(|(k, (old, new))| (k.clone(), (new.clone(), old.clone())))
                .collect(),
        }
    }

    /// The changes of applying `self` and then `later` to the same items.
    ///
    /// A key in both maps goes from `self`'s old value to `later`'s new one.
    pub(crate) fn compose(&self, later: &OpenAnnotations) -> OpenAnnotations {
        let mut open = self.open.clone();
        for (key, (old, new)) in &later.open {
            match open.get_mut(key) {
                Some(entry) => entry.1 = new.clone(),
                None => {
                    open.insert(key.clone(), (old.clone(), new.clone()));
                }
            }
        }
        OpenAnnotations { open }
    }

    /// Keep only the entries satisfying `keep`.
    pub(crate) fn filtered(&self, mut keep: impl FnMut(&ValuePair) -> bool) -> Self {
        Self {
            open: self
                .open
                .iter()
                .filter(|(_, v)| keep(v))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

impl FromIterator<(String, ValuePair)> for OpenAnnotations {
    fn from_iter<T: IntoIterator<Item = (String, ValuePair)>>(iter: T) -> Self {
        Self {
            open: iter.into_iter().collect(),
        }
    }
}
