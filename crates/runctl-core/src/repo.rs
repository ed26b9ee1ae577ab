//! Identity types for the two entities the concurrency core reasons about:
//! repos (the thing that owns a concurrency limit) and runs (a single
//! execution attempt against a repo).
use serde::{Deserialize, Serialize};
use std::fmt;

/// `(namespace, name)` identity, canonicalized to `"namespace/name"` for use
/// as a map/storage key. Shared representation for both [`RepoRef`] and
/// [`RunRef`] since the spec gives them identical identity shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Parse a canonical `"namespace/name"` key back into its parts.
    /// Only the first `/` is treated as the separator, so names containing
    /// `/` (unusual, but not forbidden upstream) round-trip correctly.
    pub fn parse(key: &str) -> Option<Self> {
        let (namespace, name) = key.split_once('/')?;
        if namespace.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self::new(namespace, name))
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Identity of a repo, plus the concurrency limit it currently declares.
/// `None` and `Some(0)` both mean "unlimited" per the spec surface: the
/// core reads exactly this one field from the owning custom resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoRef {
    pub ident: NamespacedName,
    pub concurrency_limit: Option<u32>,
}

impl RepoRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, limit: Option<u32>) -> Self {
        Self {
            ident: NamespacedName::new(namespace, name),
            concurrency_limit: limit,
        }
    }

    pub fn key(&self) -> String {
        self.ident.key()
    }

    /// `absent` or `0` both mean unlimited.
    pub fn is_unlimited(&self) -> bool {
        matches!(self.concurrency_limit, None | Some(0))
    }

    /// Effective limit as used by admission arithmetic; `None` when
    /// unlimited (the driver never materializes a slot in that case).
    pub fn effective_limit(&self) -> Option<u32> {
        match self.concurrency_limit {
            None | Some(0) => None,
            Some(n) => Some(n),
        }
    }
}

/// Immutable identity of a single run (pipeline execution attempt).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunRef(pub NamespacedName);

impl RunRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self(NamespacedName::new(namespace, name))
    }

    pub fn key(&self) -> String {
        self.0.key()
    }
}

impl fmt::Display for RunRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn canonical_key() {
        let r = RepoRef::new("ns", "p", Some(2));
        assert_eq!(r.key(), "ns/p");
        assert_eq!(NamespacedName::parse("ns/p"), Some(r.ident.clone()));
    }

    #[test]
    fn unlimited_means_nil_or_zero() {
        assert!(RepoRef::new("ns", "p", None).is_unlimited());
        assert!(RepoRef::new("ns", "p", Some(0)).is_unlimited());
        assert!(!RepoRef::new("ns", "p", Some(1)).is_unlimited());
        assert_eq!(RepoRef::new("ns", "p", Some(0)).effective_limit(), None);
        assert_eq!(RepoRef::new("ns", "p", Some(3)).effective_limit(), Some(3));
    }
}
