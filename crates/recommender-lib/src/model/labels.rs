//! Interned pod label sets
//!
//! Pods with identical labels share one [`LabelSetKey`]. The key wraps the
//! canonical `k1=v1,k2=v2` rendering (keys sorted), so two keys are equal
//! exactly when their label sets are.

use std::borrow::Borrow;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

pub type LabelSet = BTreeMap<String, String>;

#[derive(Debug, Clone)]
pub struct LabelSetKey(Arc<str>);

impl LabelSetKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PartialEq for LabelSetKey {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || self.0 == other.0
    }
}

impl Eq for LabelSetKey {}

impl Hash for LabelSetKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_str().hash(state)
    }
}

impl PartialOrd for LabelSetKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LabelSetKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_str().cmp(other.as_str())
    }
}

impl Borrow<str> for LabelSetKey {
    fn borrow(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for LabelSetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical string form of a label set
pub fn canonical_labels(labels: &LabelSet) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Registry handing out one shared key per distinct label set
#[derive(Debug, Default)]
pub struct LabelSetInterner {
    sets: HashMap<LabelSetKey, LabelSet>,
}

impl LabelSetInterner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, labels: &LabelSet) -> LabelSetKey {
        let canonical = canonical_labels(labels);
        if let Some((key, _)) = self.sets.get_key_value(canonical.as_str()) {
            return key.clone();
        }
        let key = LabelSetKey(Arc::from(canonical));
        self.sets.insert(key.clone(), labels.clone());
        key
    }

    pub fn labels(&self, key: &LabelSetKey) -> Option<&LabelSet> {
        self.sets.get(key)
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Drop every label set for which `keep` returns false
    pub fn retain(&mut self, mut keep: impl FnMut(&LabelSetKey) -> bool) {
        self.sets.retain(|key, _| keep(key));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> LabelSet {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_equal_sets_share_key() {
        let mut interner = LabelSetInterner::new();
        let a = interner.intern(&labels(&[("app", "web"), ("tier", "front")]));
        let b = interner.intern(&labels(&[("tier", "front"), ("app", "web")]));
        assert_eq!(a, b);
        assert!(Arc::ptr_eq(&a.0, &b.0));
        assert_eq!(a.as_str(), "app=web,tier=front");
        assert_eq!(interner.len(), 1);
    }

    #[test]
    fn test_different_sets_differ() {
        let mut interner = LabelSetInterner::new();
        let a = interner.intern(&labels(&[("app", "web")]));
        let b = interner.intern(&labels(&[("app", "db")]));
        assert_ne!(a, b);
        assert_eq!(interner.labels(&b), Some(&labels(&[("app", "db")])));
    }

    #[test]
    fn test_retain() {
        let mut interner = LabelSetInterner::new();
        let keep = interner.intern(&labels(&[("a", "1")]));
        interner.intern(&labels(&[("a", "2")]));
        interner.retain(|key| *key == keep);
        assert_eq!(interner.len(), 1);
        assert!(interner.labels(&keep).is_some());
    }

    #[test]
    fn test_empty_label_set() {
        let mut interner = LabelSetInterner::new();
        let key = interner.intern(&LabelSet::new());
        assert_eq!(key.as_str(), "");
    }
}
