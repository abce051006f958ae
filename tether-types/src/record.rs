//! Flat field records.
//!
//! A [`Record`] is the unit exchanged with the remote store and carried by
//! realtime events: a mapping from column name to JSON value.

use crate::{EntityId, Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Column holding the entity identifier.
pub const ID_FIELD: &str = "id";

/// A field-name to value mapping for one row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    /// Creates an empty record.
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Builder-style field setter.
    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(field, value);
        self
    }

    /// Returns the value of a field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Returns a string field.
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(Value::as_str)
    }

    /// Sets a field, returning the previous value.
    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(field.into(), value.into())
    }

    /// Removes a field.
    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    /// Whether the field is present (a JSON `null` counts as present).
    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the record has no fields.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over fields in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Parses the `id` field, if present and a valid UUID string.
    pub fn id(&self) -> Option<EntityId> {
        self.get_str(ID_FIELD).and_then(|s| EntityId::parse(s).ok())
    }

    /// Like [`Record::id`] but fails with a validation error.
    pub fn require_id(&self) -> Result<EntityId> {
        match self.get(ID_FIELD) {
            None => Err(Error::InvalidRecord("missing `id` field".into())),
            Some(Value::String(s)) => EntityId::parse(s),
            Some(other) => Err(Error::InvalidRecord(format!("`id` is not a string: {other}"))),
        }
    }

    /// Sets the `id` field.
    pub fn set_id(&mut self, id: EntityId) {
        self.insert(ID_FIELD, id.to_string());
    }

    /// Merges `other` into `self`: fields present in `other` overwrite,
    /// fields absent from `other` are kept.
    pub fn merge(&mut self, other: &Record) {
        for (field, value) in &other.0 {
            self.0.insert(field.clone(), value.clone());
        }
    }

    /// Extracts a single row from a response body.
    ///
    /// Accepts an object, or an array whose first element is an object.
    pub fn from_response(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            Value::Array(items) => match items.into_iter().next() {
                Some(Value::Object(map)) => Ok(Self(map)),
                _ => Err(Error::InvalidRecord("invalid response".into())),
            },
            _ => Err(Error::InvalidRecord("invalid response".into())),
        }
    }

    /// Extracts every object row from an array response body.
    /// Non-object elements are skipped.
    pub fn rows_from_response(value: Value) -> Result<Vec<Self>> {
        match value {
            Value::Array(items) => Ok(items
                .into_iter()
                .filter_map(|item| match item {
                    Value::Object(map) => Some(Self(map)),
                    _ => None,
                })
                .collect()),
            Value::Object(map) => Ok(vec![Self(map)]),
            _ => Err(Error::InvalidRecord("invalid response".into())),
        }
    }

    /// Returns the record as a JSON object value.
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// Borrows the underlying map.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

impl From<Map<String, Value>> for Record {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl From<Record> for Value {
    fn from(record: Record) -> Self {
        record.into_value()
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for Record {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}
