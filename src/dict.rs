//! Key/value maps carried alongside FOP calls and replies.
//!
//! The xattr payloads of setxattr/getxattr and the `xdata` side channel
//! every FOP carries are both a `Dict`: an ordered-enough map from string
//! keys to tagged values. The map itself is refcount-shared so a stub
//! capture clones the handle, never the values.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::iatt::Iatt;

/// One tagged value in a [`Dict`].
#[derive(Clone, Debug, PartialEq)]
pub enum DictValue {
    /// Signed integer.
    Int(i64),
    /// Unsigned integer.
    Uint(u64),
    /// Owned string.
    Str(String),
    /// Static string.
    StaticStr(&'static str),
    /// Opaque bytes, shared.
    Bin(Arc<[u8]>),
    /// A file attribute record.
    Iatt(Iatt),
}

impl DictValue {
    /// The value as bytes, when it has a byte rendering.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            DictValue::Str(s) => Some(s.as_bytes()),
            DictValue::StaticStr(s) => Some(s.as_bytes()),
            DictValue::Bin(b) => Some(b),
            _ => None,
        }
    }

    /// The value as UTF-8 text, when it is text.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            DictValue::Str(s) => Some(s),
            DictValue::StaticStr(s) => Some(s),
            DictValue::Bin(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// The value as a signed integer, when numeric.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            DictValue::Int(v) => Some(*v),
            DictValue::Uint(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }
}

/// A refcount-shared string -> value map.
///
/// Cloning is a refcount bump; two clones see each other's writes. Use
/// [`Dict::deep_copy`] for an isolated snapshot.
#[derive(Clone, Debug, Default)]
pub struct Dict {
    inner: Arc<RwLock<BTreeMap<String, DictValue>>>,
}

impl Dict {
    /// New empty dict.
    pub fn new() -> Dict {
        Dict::default()
    }

    /// Build from an iterator of pairs.
    pub fn from_iter<I, K>(pairs: I) -> Dict
    where
        I: IntoIterator<Item = (K, DictValue)>,
        K: Into<String>,
    {
        let dict = Dict::new();
        for (k, v) in pairs {
            dict.set(k, v);
        }
        dict
    }

    /// Insert or replace.
    pub fn set<K: Into<String>>(&self, key: K, value: DictValue) {
        self.inner.write().insert(key.into(), value);
    }

    /// Fetch a clone of the value.
    pub fn get(&self, key: &str) -> Option<DictValue> {
        self.inner.read().get(key).cloned()
    }

    /// True if the key is present.
    pub fn contains(&self, key: &str) -> bool {
        self.inner.read().contains_key(key)
    }

    /// Remove a key, returning its value.
    pub fn remove(&self, key: &str) -> Option<DictValue> {
        self.inner.write().remove(key)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// True if empty.
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Snapshot of the keys.
    pub fn keys(&self) -> Vec<String> {
        self.inner.read().keys().cloned().collect()
    }

    /// Snapshot of all pairs.
    pub fn pairs(&self) -> Vec<(String, DictValue)> {
        self.inner
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Keep only entries the predicate accepts.
    pub fn retain<F: FnMut(&str, &DictValue) -> bool>(&self, mut keep: F) {
        self.inner.write().retain(|k, v| keep(k, v));
    }

    /// An isolated copy sharing no state with `self`. Values stay
    /// refcount-shared where they are `Arc`-backed.
    pub fn deep_copy(&self) -> Dict {
        Dict {
            inner: Arc::new(RwLock::new(self.inner.read().clone())),
        }
    }

    /// True when both handles refer to the same map.
    pub fn same_map(&self, other: &Dict) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for Dict {
    fn eq(&self, other: &Dict) -> bool {
        self.same_map(other) || *self.inner.read() == *other.inner.read()
    }
}
