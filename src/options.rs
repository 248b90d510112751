//! Rendering option sets.
//!
//! An [`Options`] set is the parameter map attached to every base asset:
//! quality, orientation and stripping flags for images, template values for
//! the external encoders. The build core treats it as opaque except for two
//! things it needs to know:
//!
//! - which keys are **superficial** (presentation-only, never change the
//!   bytes of a derived file) and are therefore stripped before hashing, and
//! - how to turn the remaining keys into a **deterministic digest**.
//!
//! Values are kept as [`serde_json::Value`] in a `BTreeMap`, so iteration
//! and serialization order is the key order regardless of how the set was
//! built. That makes the canonical JSON form, and the digest computed from
//! it, independent of insertion order.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Keys that only affect presentation and never the rendered output.
///
/// `resize` is a resize hint that is already reflected in the derived path of
/// each variant, so it is superficial as well.
pub const SUPERFICIAL_KEYS: &[&str] = &["name", "exif", "text", "type", "size", "float", "resize"];

/// Length of the short checksum embedded in video and audio file names.
const CHECKSUM_LEN: usize = 8;

/// Ordered parameter map for one asset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Options(BTreeMap<String, Value>);

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Insert or overwrite a key, returning the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// String value of a key. Non-string values yield `None`.
    pub fn str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// A flag is set only when the key holds boolean `true`.
    pub fn flag(&self, key: &str) -> bool {
        matches!(self.0.get(key), Some(Value::Bool(true)))
    }

    pub fn u64(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(Value::as_u64)
    }

    /// Render a value for command-line substitution.
    ///
    /// Strings are used verbatim (no JSON quoting), everything else uses its
    /// JSON text form. `null` counts as missing.
    pub fn template_value(&self, key: &str) -> Option<String> {
        match self.0.get(key)? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// A copy of `self` with every key of `overrides` applied on top.
    pub fn merged(&self, overrides: &Options) -> Options {
        let mut out = self.clone();
        for (k, v) in &overrides.0 {
            out.0.insert(k.clone(), v.clone());
        }
        out
    }

    /// A copy with the superficial keys removed.
    pub fn without_superficial(&self) -> Options {
        Options(
            self.0
                .iter()
                .filter(|(k, _)| !SUPERFICIAL_KEYS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// Sorted-key JSON text of the full set.
    pub fn canonical_json(&self) -> String {
        // serde_json's Map is BTreeMap backed without `preserve_order`, so
        // nested objects are emitted in key order as well.
        let map: serde_json::Map<String, Value> =
            self.0.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        Value::Object(map).to_string()
    }

    /// SHA-256 hex digest of the effective (non-superficial) options.
    pub fn digest(&self) -> String {
        let canonical = self.without_superficial().canonical_json();
        format!("{:x}", Sha256::digest(canonical.as_bytes()))
    }

    /// Short digest prefix used in derived file names.
    pub fn checksum(&self) -> String {
        self.digest()[..CHECKSUM_LEN].to_string()
    }
}

impl FromIterator<(String, Value)> for Options {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Options(iter.into_iter().collect())
    }
}
