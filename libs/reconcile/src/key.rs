//! Object keys.
//!
//! Keys are the only thing carried through the work queue. They are formatted
//! as `namespace/name` for namespaced objects and `name` for cluster-scoped
//! ones.

use std::fmt;

use thiserror::Error;

/// Errors produced when splitting a key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    /// Key has more than two `/`-separated segments.
    #[error("unexpected key format: {0:?}")]
    TooManySegments(String),

    /// Name segment is empty.
    #[error("key has an empty name: {0:?}")]
    EmptyName(String),
}

/// Structural identity of an object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    /// Namespace; `None` for cluster-scoped objects.
    pub namespace: Option<String>,

    /// Object name.
    pub name: String,
}

impl ObjectKey {
    /// Key for a namespaced object.
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Key for a cluster-scoped object.
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) if !ns.is_empty() => write!(f, "{}/{}", ns, self.name),
            _ => f.write_str(&self.name),
        }
    }
}

impl std::str::FromStr for ObjectKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        split_key(s)
    }
}

/// Split a key into its namespace and name.
pub fn split_key(key: &str) -> Result<ObjectKey, KeyError> {
    let mut parts = key.split('/');
    let first = parts.next().unwrap_or_default();

    let (namespace, name) = match (parts.next(), parts.next()) {
        (None, _) => (None, first),
        (Some(name), None) => (Some(first), name),
        (Some(_), Some(_)) => return Err(KeyError::TooManySegments(key.to_string())),
    };

    if name.is_empty() {
        return Err(KeyError::EmptyName(key.to_string()));
    }

    Ok(ObjectKey {
        namespace: namespace.filter(|ns| !ns.is_empty()).map(str::to_string),
        name: name.to_string(),
    })
}
