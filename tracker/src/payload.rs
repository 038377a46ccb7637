//! Event payload type
//!
//! A [`Payload`] is one flattened event record: an insertion-ordered map from
//! string keys to a closed set of value kinds. Payloads are produced by the
//! tracking façade and handed to an [`crate::EventSink`] one at a time.
//!
//! # Example
//!
//! ```
//! use snowplow_tracker::Payload;
//!
//! let payload = Payload::new()
//!     .with("e", "pv")
//!     .with("url", "https://example.com")
//!     .with("cd", 24);
//! assert_eq!(payload.len(), 3);
//! assert_eq!(payload.to_query_string(), "e=pv&url=https%3A%2F%2Fexample.com&cd=24");
//! ```

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// A single payload value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    String(String),
    Integer(i64),
    Boolean(bool),
    Map(Payload),
}

impl Value {
    /// Render the value the way it appears in a GET query string
    ///
    /// Booleans follow form encoding (`1`/`0`); nested maps become JSON.
    pub fn to_query_value(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            Value::Integer(i) => i.to_string(),
            Value::Boolean(true) => "1".to_string(),
            Value::Boolean(false) => "0".to_string(),
            Value::Map(map) => serde_json::to_string(map).unwrap_or_default(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Integer(i64::from(i))
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Integer(i64::from(i))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<Payload> for Value {
    fn from(map: Payload) -> Self {
        Value::Map(map)
    }
}

/// Insertion-ordered string-keyed map of event fields
///
/// Inserting an existing key replaces its value in place and keeps the
/// original position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    entries: Vec<(String, Value)>,
}

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a field
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Builder form of [`Payload::insert`]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Insert a field only if the key is not present yet
    ///
    /// Returns `true` when the field was added.
    pub fn insert_missing(&mut self, key: &str, value: impl Into<Value>) -> bool {
        if self.contains_key(key) {
            return false;
        }
        self.entries.push((key.to_string(), value.into()));
        true
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Encode as `application/x-www-form-urlencoded`, preserving field order
    pub fn to_query_string(&self) -> String {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (key, value) in &self.entries {
            serializer.append_pair(key, &value.to_query_value());
        }
        serializer.finish()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Payload {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut payload = Payload::new();
        for (k, v) in iter {
            payload.insert(k, v);
        }
        payload
    }
}

impl Serialize for Payload {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, value) in &self.entries {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct PayloadVisitor;

        impl<'de> Visitor<'de> for PayloadVisitor {
            type Value = Payload;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of payload fields")
            }

            fn visit_map<A>(self, mut access: A) -> Result<Payload, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut payload = Payload::new();
                while let Some((key, value)) = access.next_entry::<String, Value>()? {
                    payload.insert(key, value);
                }
                Ok(payload)
            }
        }

        deserializer.deserialize_map(PayloadVisitor)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_keeps_order_and_replaces_in_place() {
        let mut payload = Payload::new().with("e", "pv").with("p", "srv");
        payload.insert("e", "se");
        payload.insert("aid", "app");

        let keys: Vec<&str> = payload.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["e", "p", "aid"]);
        assert_eq!(payload.get("e"), Some(&Value::from("se")));
    }

    #[test]
    fn test_insert_missing_does_not_override() {
        let mut payload = Payload::new().with("p", "mob");
        assert!(!payload.insert_missing("p", "srv"));
        assert!(payload.insert_missing("uid", "user-1"));
        assert_eq!(payload.get("p").and_then(Value::as_str), Some("mob"));
        assert_eq!(payload.len(), 2);
    }

    #[test]
    fn test_json_keeps_field_order() {
        let payload = Payload::new()
            .with("z", "last-alphabetically")
            .with("a", 1)
            .with("flag", true)
            .with("nested", Payload::new().with("k", "v"));

        let json = serde_json::to_string(&payload).unwrap();
        assert_eq!(
            json,
            r#"{"z":"last-alphabetically","a":1,"flag":true,"nested":{"k":"v"}}"#
        );

        let back: Payload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn test_query_string_encoding() {
        let payload = Payload::new()
            .with("page", "Home & About")
            .with("ok", true)
            .with("ctx", Payload::new().with("a", "b"));

        assert_eq!(
            payload.to_query_string(),
            "page=Home+%26+About&ok=1&ctx=%7B%22a%22%3A%22b%22%7D"
        );
    }

    #[test]
    fn test_floats_are_rejected() {
        let result = serde_json::from_str::<Payload>(r#"{"price": 1.5}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_remove() {
        let mut payload: Payload = vec![("a", "1"), ("b", "2")].into_iter().collect();
        assert_eq!(payload.remove("a"), Some(Value::from("1")));
        assert!(payload.remove("a").is_none());
        assert_eq!(payload.len(), 1);
    }
}
