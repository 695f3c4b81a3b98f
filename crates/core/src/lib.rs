//! Kiln core types: object keys, resource versions and deltas.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use kube::Resource;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Stable identifier of an object within its kind (`namespace/name` or `name`).
pub type Key = String;

/// Derives a [`Key`] from an object.
pub type KeyFunc<K> = fn(&K) -> Result<Key, KeyError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("object has no metadata.name")]
    MissingName,
    #[error("invalid key: {0} (expect name or namespace/name)")]
    Malformed(String),
}

/// Anything the cache and controllers can carry: a kube resource that is cheap
/// enough to clone and safe to share across worker tasks.
pub trait Object: Resource + Clone + fmt::Debug + Send + Sync + 'static {}

impl<K> Object for K where K: Resource + Clone + fmt::Debug + Send + Sync + 'static {}

/// `namespace/name` for namespaced objects, bare `name` otherwise.
pub fn meta_namespace_key<K: Resource>(obj: &K) -> Result<Key, KeyError> {
    let meta = obj.meta();
    let name = meta
        .name
        .as_deref()
        .filter(|n| !n.is_empty())
        .ok_or(KeyError::MissingName)?;
    Ok(match meta.namespace.as_deref() {
        Some(ns) if !ns.is_empty() => format!("{}/{}", ns, name),
        _ => name.to_string(),
    })
}

/// Inverse of [`meta_namespace_key`].
pub fn split_meta_namespace_key(key: &str) -> Result<(Option<&str>, &str), KeyError> {
    let parts: Vec<&str> = key.split('/').collect();
    match parts.as_slice() {
        [name] if !name.is_empty() => Ok((None, *name)),
        [ns, name] if !ns.is_empty() && !name.is_empty() => Ok((Some(*ns), *name)),
        _ => Err(KeyError::Malformed(key.to_string())),
    }
}

// ---- resource versions ----

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VersionError {
    #[error("object has no resourceVersion")]
    Missing,
    #[error("resourceVersion {0:?} is not a decimal counter")]
    Invalid(String),
}

/// Backend-assigned monotonic version. Opaque on the wire, ordered here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceVersion(pub u64);

impl FromStr for ResourceVersion {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(VersionError::Missing);
        }
        s.parse::<u64>()
            .map(ResourceVersion)
            .map_err(|_| VersionError::Invalid(s.to_string()))
    }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parsed `metadata.resourceVersion` of an object.
pub fn resource_version_of<K: Resource>(obj: &K) -> Result<ResourceVersion, VersionError> {
    obj.meta()
        .resource_version
        .as_deref()
        .ok_or(VersionError::Missing)?
        .parse()
}

// ---- deltas ----

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DeltaType {
    Added,
    Updated,
    Deleted,
    /// Observed by a list rather than a watch event.
    Sync,
}

impl fmt::Display for DeltaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeltaType::Added => "added",
            DeltaType::Updated => "updated",
            DeltaType::Deleted => "deleted",
            DeltaType::Sync => "sync",
        };
        f.write_str(s)
    }
}

/// Payload of a delta: either an observed object or a synthesized deletion
/// whose final state was never seen.
#[derive(Debug, Clone, PartialEq)]
pub enum DeltaObject<K> {
    Object(K),
    Tombstone { key: Key, last_known: Option<K> },
}

impl<K> DeltaObject<K> {
    /// The live object, or the last state observed before a tombstone.
    pub fn object(&self) -> Option<&K> {
        match self {
            DeltaObject::Object(o) => Some(o),
            DeltaObject::Tombstone { last_known, .. } => last_known.as_ref(),
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, DeltaObject::Tombstone { .. })
    }

    pub fn key(&self, key_fn: KeyFunc<K>) -> Result<Key, KeyError> {
        match self {
            DeltaObject::Object(o) => key_fn(o),
            DeltaObject::Tombstone { key, .. } => Ok(key.clone()),
        }
    }
}

/// One observed change. Never mutated after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct Delta<K> {
    pub kind: DeltaType,
    pub object: DeltaObject<K>,
}

impl<K> Delta<K> {
    pub fn new(kind: DeltaType, obj: K) -> Self {
        Self { kind, object: DeltaObject::Object(obj) }
    }

    pub fn tombstone(key: Key, last_known: Option<K>) -> Self {
        Self { kind: DeltaType::Deleted, object: DeltaObject::Tombstone { key, last_known } }
    }
}

/// Ordered history of deltas for one key, oldest first.
#[derive(Debug, Clone, PartialEq)]
pub struct Deltas<K>(SmallVec<[Delta<K>; 2]>);

impl<K> Default for Deltas<K> {
    fn default() -> Self {
        Self(SmallVec::new())
    }
}

impl<K> Deltas<K> {
    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
    pub fn oldest(&self) -> Option<&Delta<K>> { self.0.first() }
    pub fn newest(&self) -> Option<&Delta<K>> { self.0.last() }
    pub fn iter(&self) -> std::slice::Iter<'_, Delta<K>> { self.0.iter() }

    /// First deletion in the history, if any.
    pub fn deletion(&self) -> Option<&Delta<K>> {
        self.0.iter().find(|d| d.kind == DeltaType::Deleted)
    }

    /// Append a delta. Two deletions in a row collapse into one; a tombstone
    /// never replaces a deletion that carries a live object.
    pub fn push(&mut self, d: Delta<K>) {
        if d.kind == DeltaType::Deleted {
            if let Some(last) = self.0.last_mut() {
                if last.kind == DeltaType::Deleted {
                    if !d.object.is_tombstone() {
                        *last = d;
                    }
                    return;
                }
            }
        }
        self.0.push(d);
    }
}

impl<K> IntoIterator for Deltas<K> {
    type Item = Delta<K>;
    type IntoIter = smallvec::IntoIter<[Delta<K>; 2]>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a, K> IntoIterator for &'a Deltas<K> {
    type Item = &'a Delta<K>;
    type IntoIter = std::slice::Iter<'a, Delta<K>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl<K> FromIterator<Delta<K>> for Deltas<K> {
    fn from_iter<I: IntoIterator<Item = Delta<K>>>(iter: I) -> Self {
        let mut out = Deltas::default();
        for d in iter {
            out.push(d);
        }
        out
    }
}

/// A `KILN_*` variable that is set but does not parse.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{var}={value:?} is not valid")]
pub struct EnvError {
    pub var: &'static str,
    pub value: String,
}

/// Parse `var` if it is set, else fall back to `default`.
pub fn env_or<T: FromStr>(var: &'static str, default: T) -> Result<T, EnvError> {
    match std::env::var(var) {
        Ok(raw) => raw.trim().parse().map_err(|_| EnvError { var, value: raw }),
        Err(_) => Ok(default),
    }
}

pub mod prelude {
    pub use super::{
        env_or, meta_namespace_key, resource_version_of, Delta, DeltaObject, DeltaType, Deltas, Key, KeyError,
        KeyFunc, Object, ResourceVersion, VersionError,
    };
}
