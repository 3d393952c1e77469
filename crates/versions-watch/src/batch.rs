//! Change batches as delivered by a watch transport.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Top-level key holding the list of changed file entries.
pub const FILES_KEY: &str = "files";

/// One loosely-structured change notification: a JSON object whose optional
/// `files` entry lists per-file metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventBatch(Map<String, Value>);

impl EventBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` unless `value` is a JSON object.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn files(&self) -> Option<&Value> {
        self.0.get(FILES_KEY)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn clock(&self) -> Option<&str> {
        self.0.get("clock").and_then(Value::as_str)
    }
}

impl From<Map<String, Value>> for EventBatch {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Short name of a JSON value's type, for warnings.
pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() => "integer",
        Value::Number(_) => "float",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_value_requires_object() {
        assert!(EventBatch::from_value(json!({"files": []})).is_some());
        assert!(EventBatch::from_value(json!([1, 2])).is_none());
        assert!(EventBatch::from_value(json!("files")).is_none());
    }

    #[test]
    fn test_accessors() {
        let mut batch = EventBatch::new();
        assert!(batch.files().is_none());
        batch.insert("clock", "c:1:2").insert(FILES_KEY, json!([]));
        assert_eq!(batch.clock(), Some("c:1:2"));
        assert_eq!(batch.files(), Some(&json!([])));
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn test_deserializes_from_json_text() {
        let batch: EventBatch =
            serde_json::from_str(r#"{"version": "1.0", "files": [{"name": "a"}]}"#).unwrap();
        assert_eq!(batch.get("version"), Some(&json!("1.0")));
    }

    #[test]
    fn test_json_type_name() {
        assert_eq!(json_type_name(&json!(null)), "null");
        assert_eq!(json_type_name(&json!(3)), "integer");
        assert_eq!(json_type_name(&json!(3.5)), "float");
        assert_eq!(json_type_name(&json!({})), "object");
    }
}
