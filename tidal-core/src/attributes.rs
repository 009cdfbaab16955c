//! Element attributes and attribute updates.
//!
//! Both are immutable association lists sorted by key. Sortedness and key
//! uniqueness are checked once at construction (and on deserialization), so
//! lookups can binary-search and merges can walk both lists in step.

use serde::{Deserialize, Serialize};

use crate::error::MalformedOperation;

/// The attributes of an element start, e.g. `<p class="x">`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<(String, String)>", into = "Vec<(String, String)>")]
pub struct Attributes {
    entries: Vec<(String, String)>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from arbitrary pairs. Pairs are sorted; a repeated key is an error.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, MalformedOperation>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut entries: Vec<(String, String)> = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        check_sorted(entries.iter().map(|(k, _)| k.as_str()))?;
        Ok(Self { entries })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .binary_search_by(|(k, _)| k.as_str().cmp(key))
            .ok()
            .map(|i| self.entries[i].1.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether every change's `old` value matches the current value.
    pub fn matches(&self, update: &AttributesUpdate) -> bool {
        update
            .iter()
            .all(|change| self.get(&change.key) == change.old.as_deref())
    }

    /// Apply an update, ignoring its `old` values.
    pub fn update_with(&self, update: &AttributesUpdate) -> Attributes {
        let mut entries = Vec::with_capacity(self.entries.len() + update.len());
        let mut mine = self.entries.iter().peekable();
        let mut theirs = update.iter().peekable();
        loop {
            match (mine.peek(), theirs.peek()) {
                (Some((k, v)), Some(change)) => {
                    if k.as_str() < change.key.as_str() {
                        entries.push((k.clone(), v.clone()));
                        mine.next();
                    } else {
                        if k.as_str() == change.key.as_str() {
                            mine.next();
                        }
                        if let Some(new) = &change.new {
                            entries.push((change.key.clone(), new.clone()));
                        }
                        theirs.next();
                    }
                }
                (Some((k, v)), None) => {
                    entries.push((k.clone(), v.clone()));
                    mine.next();
                }
                (None, Some(change)) => {
                    if let Some(new) = &change.new {
                        entries.push((change.key.clone(), new.clone()));
                    }
                    theirs.next();
                }
                (None, None) => break,
            }
        }
        Attributes { entries }
    }
}

impl TryFrom<Vec<(String, String)>> for Attributes {
    type Error = MalformedOperation;

    fn try_from(entries: Vec<(String, String)>) -> Result<Self, Self::Error> {
        check_sorted(entries.iter().map(|(k, _)| k.as_str()))?;
        Ok(Self { entries })
    }
}

impl From<Attributes> for Vec<(String, String)> {
    fn from(attributes: Attributes) -> Self {
        attributes.entries
    }
}

/// One key's change inside an [`AttributesUpdate`] or an annotation boundary.
///
/// `old == None` means the key was absent; `new == None` removes it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttributeChange {
    pub key: String,
    pub old: Option<String>,
    pub new: Option<String>,
}

impl AttributeChange {
    pub fn new(key: impl Into<String>, old: Option<&str>, new: Option<&str>) -> Self {
        Self {
            key: key.into(),
            old: old.map(str::to_owned),
            new: new.map(str::to_owned),
        }
    }

    pub fn inverted(&self) -> Self {
        Self {
            key: self.key.clone(),
            old: self.new.clone(),
            new: self.old.clone(),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.old == self.new
    }
}

/// A compare-and-swap update of selected attribute keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<AttributeChange>", into = "Vec<AttributeChange>")]
pub struct AttributesUpdate {
    changes: Vec<AttributeChange>,
}

impl AttributesUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_changes(
        changes: impl IntoIterator<Item = AttributeChange>,
    ) -> Result<Self, MalformedOperation> {
        let mut changes: Vec<_> = changes.into_iter().collect();
        changes.sort_by(|a, b| a.key.cmp(&b.key));
        check_sorted(changes.iter().map(|c| c.key.as_str()))?;
        Ok(Self { changes })
    }

    /// Shorthand for a single-key update.
    pub fn single(key: impl Into<String>, old: Option<&str>, new: Option<&str>) -> Self {
        Self {
            changes: vec![AttributeChange::new(key, old, new)],
        }
    }

    pub fn get(&self, key: &str) -> Option<&AttributeChange> {
        self.changes
            .binary_search_by(|c| c.key.as_str().cmp(key))
            .ok()
            .map(|i| &self.changes[i])
    }

    pub fn iter(&self) -> std::slice::Iter<'_, AttributeChange> {
        self.changes.iter()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn inverted(&self) -> Self {
        Self {
            changes: self.changes.iter().map(AttributeChange::inverted).collect(),
        }
    }

    /// Drop changes whose old and new values agree.
    pub fn without_noops(&self) -> Self {
        Self {
            changes: self.changes.iter().filter(|c| !c.is_noop()).cloned().collect(),
        }
    }

    /// The update equivalent to applying `self` and then `later`.
    pub fn compose(&self, later: &AttributesUpdate) -> AttributesUpdate {
        let mut changes = Vec::with_capacity(self.len() + later.len());
        let mut first = self.changes.iter().peekable();
        let mut second = later.changes.iter().peekable();
        loop {
            match (first.peek(), second.peek()) {
                (Some(a), Some(b)) if a.key == b.key => {
                    changes.push(AttributeChange {
                        key: a.key.clone(),
                        old: a.old.clone(),
                        new: b.new.clone(),
                    });
                    first.next();
                    second.next();
                }
                (Some(a), Some(b)) if a.key < b.key => {
                    changes.push((*a).clone());
                    first.next();
                }
                (Some(_), Some(b)) | (None, Some(b)) => {
                    changes.push((*b).clone());
                    second.next();
                }
                (Some(a), None) => {
                    changes.push((*a).clone());
                    first.next();
                }
                (None, None) => break,
            }
        }
        AttributesUpdate { changes }
    }

    /// Keep only the changes whose key satisfies `keep`.
    pub(crate) fn filtered(&self, mut keep: impl FnMut(&AttributeChange) -> bool) -> Self {
        Self {
            changes: self.changes.iter().filter(|c| keep(c)).cloned().collect(),
        }
    }

    pub(crate) fn from_sorted(changes: Vec<AttributeChange>) -> Self {
        debug_assert!(changes.windows(2).all(|w| w[0].key < w[1].key));
        Self { changes }
    }
}

impl TryFrom<Vec<AttributeChange>> for AttributesUpdate {
    type Error = MalformedOperation;

    fn try_from(changes: Vec<AttributeChange>) -> Result<Self, Self::Error> {
        check_sorted(changes.iter().map(|c| c.key.as_str()))?;
        Ok(Self { changes })
    }
}

impl From<AttributesUpdate> for Vec<AttributeChange> {
    fn from(update: AttributesUpdate) -> Self {
        update.changes
    }
}

pub(crate) fn check_sorted<'a>(
    mut keys: impl Iterator<Item = &'a str>,
) -> Result<(), MalformedOperation> {
    let Some(mut previous) = keys.next() else {
        return Ok(());
    };
    for key in keys {
        if key <= previous {
            return Err(MalformedOperation::UnsortedKeys { key: key.to_owned() });
        }
        previous = key;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_pairs_sorts() {
        let attrs = Attributes::from_pairs([("b", "2"), ("a", "1")]).unwrap();
        let keys: Vec<_> = attrs.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["a", "b"]);
        assert_eq!(attrs.get("b"), Some("2"));
        assert_eq!(attrs.get("c"), None);
    }

    #[test]
    fn test_duplicate_keys_rejected() {
        let result = Attributes::from_pairs([("a", "1"), ("a", "2")]);
        assert!(matches!(result, Err(MalformedOperation::UnsortedKeys { .. })));
    }

    #[test]
    fn test_unsorted_deserialization_rejected() {
        let raw = vec![("b".to_string(), "1".to_string()), ("a".to_string(), "2".to_string())];
        assert!(Attributes::try_from(raw).is_err());
    }

    #[test]
    fn test_update_with_adds_changes_and_removes() {
        let attrs = Attributes::from_pairs([("a", "1"), ("b", "2")]).unwrap();
        let update = AttributesUpdate::from_changes([
            AttributeChange::new("a", Some("1"), None),
            AttributeChange::new("b", Some("2"), Some("3")),
            AttributeChange::new("c", None, Some("4")),
        ])
        .unwrap();
        assert!(attrs.matches(&update));
        let updated = attrs.update_with(&update);
        assert_eq!(updated, Attributes::from_pairs([("b", "3"), ("c", "4")]).unwrap());
    }

    #[test]
    fn test_matches_detects_stale_old_value() {
        let attrs = Attributes::from_pairs([("a", "1")]).unwrap();
        let update = AttributesUpdate::single("a", Some("0"), Some("2"));
        assert!(!attrs.matches(&update));
    }

    #[test]
    fn test_compose_merges_keys() {
        let first = AttributesUpdate::single("a", None, Some("1"));
        let second = AttributesUpdate::from_changes([
            AttributeChange::new("a", Some("1"), Some("2")),
            AttributeChange::new("b", None, Some("x")),
        ])
        .unwrap();
        let composed = first.compose(&second);
        assert_eq!(composed.get("a"), Some(&AttributeChange::new("a", None, Some("2"))));
        assert_eq!(composed.get("b"), Some(&AttributeChange::new("b", None, Some("x"))));
    }

    #[test]
    fn test_inverted_swaps_values() {
        let update = AttributesUpdate::single("k", Some("old"), Some("new"));
        let inverse = update.inverted();
        assert_eq!(inverse.get("k"), Some(&AttributeChange::new("k", Some("new"), Some("old"))));
        assert!(update.compose(&inverse).without_noops().is_empty());
    }
}
