//! Nested JSON document helpers: dot-separated field paths and merge patches.
//!
//! User documents are schemaless JSON objects. Form answers are routed into
//! them through [`FieldPath`]s and applied as deep merges, never as full
//! overwrites.

use std::fmt;
use std::str::FromStr;

use serde_json::{Map, Value};

use crate::error::FormError;

/// A parsed dot-separated path such as `profile.age_bracket`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    /// Parse a dot-separated path. Empty paths and empty segments are rejected.
    pub fn parse(raw: &str) -> Result<Self, FormError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(FormError::InvalidPath {
                path: raw.to_string(),
                reason: "path is empty".to_string(),
            });
        }
        let segments: Vec<String> = raw.split('.').map(str::to_string).collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(FormError::InvalidPath {
                path: raw.to_string(),
                reason: "path contains an empty segment".to_string(),
            });
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// The path with its first segment removed, if the first segment is `head`
    /// and something remains after it.
    pub fn strip_head(&self, head: &str) -> Option<FieldPath> {
        match self.segments.split_first() {
            Some((first, rest)) if first == head && !rest.is_empty() => Some(FieldPath {
                segments: rest.to_vec(),
            }),
            _ => None,
        }
    }

    /// Walk the path from `root`. Returns `None` as soon as a segment is missing
    /// or the current value cannot be indexed. Array elements are addressed by
    /// decimal index.
    pub fn resolve<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        self.segments.iter().try_fold(root, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
    }

    /// Set `value` at this path inside `root`, creating intermediate objects.
    ///
    /// Any non-object value met on the way (including `root` itself) is
    /// replaced by an empty object.
    pub fn assign(&self, root: &mut Value, value: Value) {
        let Some((last, parents)) = self.segments.split_last() else {
            return;
        };
        let mut current = root;
        for segment in parents {
            current = ensure_object(current)
                .entry(segment.clone())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        ensure_object(current).insert(last.clone(), value);
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("."))
    }
}

impl FromStr for FieldPath {
    type Err = FormError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn ensure_object(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!("value was just replaced by an object"),
    }
}

/// A partial update destined for a JSON document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Patch {
    root: Value,
}

impl Patch {
    pub fn new() -> Self {
        Self {
            root: Value::Object(Map::new()),
        }
    }

    /// Set `value` at `path`. A later `set` on an overlapping path wins.
    pub fn set(&mut self, path: &FieldPath, value: Value) {
        path.assign(&mut self.root, value);
    }

    pub fn is_empty(&self) -> bool {
        match &self.root {
            Value::Object(map) => map.is_empty(),
            Value::Null => true,
            _ => false,
        }
    }

    pub fn as_value(&self) -> &Value {
        &self.root
    }

    pub fn into_value(self) -> Value {
        self.root
    }

    /// Apply this patch to `target` as a deep merge.
    pub fn apply_to(&self, target: &mut Value) {
        deep_merge(target, &self.root);
    }
}

/// Merge `patch` into `target`.
///
/// Objects merge key by key, recursively. Every other value (arrays, scalars,
/// `null`) replaces what was there.
pub fn deep_merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target_map), Value::Object(patch_map)) => {
            for (key, patch_value) in patch_map {
                match target_map.get_mut(key) {
                    Some(existing) if existing.is_object() && patch_value.is_object() => {
                        deep_merge(existing, patch_value);
                    }
                    _ => {
                        target_map.insert(key.clone(), patch_value.clone());
                    }
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}
