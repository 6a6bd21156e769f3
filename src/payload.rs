//! Opaque report content with canonical equality
//!
//! A payload is a map of top-level *sections* (e.g. `installation`,
//! `schedule_of_tests`) to arbitrary JSON. The sync core never looks inside a
//! section; it only compares, replaces and merges whole sections.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, Result};

/// Certificate field data keyed by section name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(BTreeMap<String, Value>);

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a payload from a JSON object
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map.into_iter().collect())),
            other => Err(Error::InvalidInput(format!(
                "payload must be a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Parse a payload from JSON text
    pub fn from_json(text: &str) -> Result<Self> {
        Self::from_value(serde_json::from_str(text)?)
    }

    pub fn get(&self, section: &str) -> Option<&Value> {
        self.0.get(section)
    }

    pub fn insert(&mut self, section: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(section.into(), value)
    }

    pub fn remove(&mut self, section: &str) -> Option<Value> {
        self.0.remove(section)
    }

    pub fn sections(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Shallow-merge a delta: each section in `delta` replaces ours, `null` removes it
    pub fn apply_delta(&mut self, delta: &Payload) {
        for (section, value) in &delta.0 {
            if value.is_null() {
                self.0.remove(section);
            } else {
                self.0.insert(section.clone(), value.clone());
            }
        }
    }

    /// Deterministic encoding with object keys sorted at every depth
    ///
    /// serde_json's `Map` is a `BTreeMap` unless `preserve_order` is enabled,
    /// so plain serialization already sorts nested keys.
    pub fn canonical_string(&self) -> String {
        // String keys and JSON values always serialize
        serde_json::to_string(&self.0).unwrap_or_default()
    }

    /// Byte equality of the canonical encodings
    pub fn canonical_eq(&self, other: &Payload) -> bool {
        self.canonical_string() == other.canonical_string()
    }

    /// Sections whose value differs from `base` (added, removed or changed)
    pub fn changed_sections(&self, base: &Payload) -> BTreeSet<String> {
        let mut changed = BTreeSet::new();
        for (section, value) in &self.0 {
            match base.0.get(section) {
                Some(old) if old == value => {}
                _ => {
                    changed.insert(section.clone());
                }
            }
        }
        for section in base.0.keys() {
            if !self.0.contains_key(section) {
                changed.insert(section.clone());
            }
        }
        changed
    }
}

impl From<BTreeMap<String, Value>> for Payload {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Self(map)
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for Payload {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
