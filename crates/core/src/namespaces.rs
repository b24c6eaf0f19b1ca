//! Namespace sets and the allow/deny admission policy.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Entry that makes an allow-set admit every namespace.
pub const WILDCARD: &str = "*";

/// Unordered set of namespace names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceSet(BTreeSet<String>);

impl NamespaceSet {
    pub fn new() -> Self { Self::default() }

    pub fn insert(&mut self, namespace: impl Into<String>) -> bool { self.0.insert(namespace.into()) }

    pub fn contains(&self, namespace: &str) -> bool { self.0.contains(namespace) }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    pub fn len(&self) -> usize { self.0.len() }

    pub fn union(&self, other: &NamespaceSet) -> NamespaceSet {
        NamespaceSet(self.0.union(&other.0).cloned().collect())
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> { self.0.iter().map(String::as_str) }
}

impl<S: Into<String>> FromIterator<S> for NamespaceSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        NamespaceSet(iter.into_iter().map(Into::into).collect())
    }
}

/// Allowed if (allow is empty, or holds the namespace or `*`) and deny does not hold it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionFilter {
    pub allow: NamespaceSet,
    pub deny: NamespaceSet,
}

impl AdmissionFilter {
    pub fn new(allow: NamespaceSet, deny: NamespaceSet) -> Self { Self { allow, deny } }

    pub fn admits(&self, namespace: &str) -> bool {
        let allowed = self.allow.is_empty() || self.allow.contains(WILDCARD) || self.allow.contains(namespace);
        allowed && !self.deny.contains(namespace)
    }
}
