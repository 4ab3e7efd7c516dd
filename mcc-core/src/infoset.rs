//! Path-addressed nested JSON document
//!
//! Paths are dot separated (`.props.tags.precharge_fail`); empty segments are
//! skipped so `.`, `` and `..a` are all valid. Cell records, charger settings
//! and workflow events are stored in this shape.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Infoset(Value);

impl Default for Infoset {
    fn default() -> Self {
        Self::new()
    }
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('.').filter(|s| !s.is_empty())
}

impl Infoset {
    /// Empty document (`{}`)
    pub fn new() -> Self {
        Infoset(Value::Object(Map::new()))
    }

    pub fn from_value(value: Value) -> Self {
        Infoset(value)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    /// Value at `path`, `None` if any segment is missing
    pub fn fetch(&self, path: &str) -> Option<&Value> {
        segments(path).try_fold(&self.0, |node, key| match node {
            Value::Object(map) => map.get(key),
            Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
    }

    pub fn fetch_mut(&mut self, path: &str) -> Option<&mut Value> {
        segments(path).try_fold(&mut self.0, |node, key| match node {
            Value::Object(map) => map.get_mut(key),
            Value::Array(items) => key.parse::<usize>().ok().and_then(move |i| items.get_mut(i)),
            _ => None,
        })
    }

    /// Cloned value at `path`, or `default`
    pub fn fetch_or(&self, path: &str, default: Value) -> Value {
        self.fetch(path).cloned().unwrap_or(default)
    }

    pub fn fetch_str(&self, path: &str) -> Option<&str> {
        self.fetch(path).and_then(Value::as_str)
    }

    /// Store `value` at `path`, creating intermediate objects.
    ///
    /// Numeric segments step into existing array elements. Any other
    /// non-object found on the way is replaced by an object. An empty path
    /// replaces the whole document.
    pub fn put(&mut self, path: &str, value: impl Into<Value>) {
        let mut node = &mut self.0;
        for key in segments(path) {
            node = child_mut(node, key);
        }
        *node = value.into();
    }

    pub fn to_json(&self) -> String {
        self.0.to_string()
    }

    pub fn to_json_pretty(&self) -> String {
        serde_json::to_string_pretty(&self.0).unwrap_or_else(|_| self.to_json())
    }
}

fn child_mut<'a>(node: &'a mut Value, key: &str) -> &'a mut Value {
    let index = match node {
        Value::Array(items) => key.parse::<usize>().ok().filter(|i| *i < items.len()),
        _ => None,
    };
    if index.is_none() && !node.is_object() {
        *node = Value::Object(Map::new());
    }
    match (node, index) {
        (Value::Array(items), Some(i)) => &mut items[i],
        (node, _) => &mut node[key],
    }
}

impl From<Value> for Infoset {
    fn from(value: Value) -> Self {
        Infoset(value)
    }
}
