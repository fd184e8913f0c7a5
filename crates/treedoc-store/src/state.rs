//! Record model: `State`, `StateDiff` and `ListDiff`
//!
//! A `State` is the unit the document layer persists: a map of field keys
//! (possibly prefixed, e.g. `dc:title`) to typed values. Updates travel as
//! sparse `StateDiff` overlays so the adapter can patch records in place.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::codec;

/// Key of the record identifier field.
pub const KEY_ID: &str = "ecm:id";
pub const KEY_PARENT_ID: &str = "ecm:parentId";
pub const KEY_NAME: &str = "ecm:name";
pub const KEY_PRIMARY_TYPE: &str = "ecm:primaryType";
pub const KEY_MIXIN_TYPES: &str = "ecm:mixinTypes";
pub const KEY_ANCESTOR_IDS: &str = "ecm:ancestorIds";
pub const KEY_READ_ACL: &str = "ecm:racl";
pub const KEY_ACP: &str = "ecm:acp";
pub const KEY_IS_PROXY: &str = "ecm:isProxy";
pub const KEY_IS_VERSION: &str = "ecm:isVersion";
pub const KEY_IS_TRASHED: &str = "ecm:isTrashed";
pub const KEY_LIFECYCLE_STATE: &str = "ecm:lifeCycleState";
pub const KEY_LOCK_OWNER: &str = "ecm:lockOwner";
pub const KEY_LOCK_CREATED: &str = "ecm:lockCreated";
pub const KEY_FULLTEXT_SCORE: &str = "ecm:fulltextScore";

/// A field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Long(i64),
    Double(f64),
    String(String),
    Calendar(DateTime<Utc>),
    State(State),
    /// Homogeneous array of scalars
    Array(Vec<Value>),
    /// List of nested states
    List(Vec<State>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_scalar(&self) -> bool {
        !matches!(self, Value::State(_) | Value::Array(_) | Value::List(_))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match self {
            Value::Long(l) => Some(*l),
            _ => None,
        }
    }

    pub fn as_state(&self) -> Option<&State> {
        match self {
            Value::State(s) => Some(s),
            _ => None,
        }
    }

    /// Textual wire form of a scalar, `None` for containers and null.
    pub fn to_wire_text(&self) -> Option<String> {
        match self {
            Value::Boolean(b) => Some(b.to_string()),
            Value::Long(l) => Some(l.to_string()),
            Value::Double(d) => Some(d.to_string()),
            Value::String(s) => Some(s.clone()),
            Value::Calendar(c) => Some(codec::format_calendar(c)),
            Value::Null | Value::State(_) | Value::Array(_) | Value::List(_) => None,
        }
    }

    /// JSON view used for display and the CLI.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Boolean(b) => serde_json::Value::Bool(*b),
            Value::Long(l) => serde_json::Value::from(*l),
            Value::Double(d) => serde_json::Value::from(*d),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Calendar(c) => serde_json::Value::String(codec::format_calendar(c)),
            Value::State(s) => s.to_json(),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::List(states) => {
                serde_json::Value::Array(states.iter().map(State::to_json).collect())
            }
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

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<i64> for Value {
    fn from(l: i64) -> Self {
        Value::Long(l)
    }
}

impl From<f64> for Value {
    fn from(d: f64) -> Self {
        Value::Double(d)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(c: DateTime<Utc>) -> Self {
        Value::Calendar(c)
    }
}

impl From<State> for Value {
    fn from(s: State) -> Self {
        Value::State(s)
    }
}

/// Ordered map of field key to value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct State {
    fields: BTreeMap<String, Value>,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.fields.get_mut(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.fields.keys()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Record identifier, if present.
    pub fn id(&self) -> Option<&str> {
        self.get(KEY_ID).and_then(Value::as_str)
    }

    pub fn to_json(&self) -> serde_json::Value {
        let map = self
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect::<serde_json::Map<_, _>>();
        serde_json::Value::Object(map)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for State {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut state = State::new();
        for (k, v) in iter {
            state.insert(k, v);
        }
        state
    }
}

/// Numeric increment applied server-side.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Delta {
    Long(i64),
    Double(f64),
}

impl Delta {
    pub fn to_value(self) -> Value {
        match self {
            Delta::Long(l) => Value::Long(l),
            Delta::Double(d) => Value::Double(d),
        }
    }
}

/// One changed field in a [`StateDiff`].
#[derive(Debug, Clone, PartialEq)]
pub enum DiffValue {
    /// Whole-value replacement (`Value::Null` is equivalent to `Remove`)
    Set(Value),
    /// Changes inside a nested state
    Diff(StateDiff),
    /// Changes inside a list
    List(ListDiff),
    /// Increment without reading the current value
    Delta(Delta),
    /// Remove the field
    Remove,
}

/// Sparse overlay of a [`State`]; absent keys are unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateDiff {
    fields: BTreeMap<String, DiffValue>,
}

impl StateDiff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), DiffValue::Set(value.into()));
        self
    }

    pub fn remove(mut self, key: impl Into<String>) -> Self {
        self.fields.insert(key.into(), DiffValue::Remove);
        self
    }

    pub fn delta(mut self, key: impl Into<String>, delta: Delta) -> Self {
        self.fields.insert(key.into(), DiffValue::Delta(delta));
        self
    }

    pub fn nested(mut self, key: impl Into<String>, diff: StateDiff) -> Self {
        self.fields.insert(key.into(), DiffValue::Diff(diff));
        self
    }

    pub fn list(mut self, key: impl Into<String>, diff: ListDiff) -> Self {
        self.fields.insert(key.into(), DiffValue::List(diff));
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: DiffValue) {
        self.fields.insert(key.into(), value);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &DiffValue)> {
        self.fields.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Positional entry of a [`ListDiff`] overlay.
#[derive(Debug, Clone, PartialEq)]
pub enum ListEntry {
    /// Leave the element untouched
    Nop,
    Set(Value),
    Diff(StateDiff),
    Remove,
}

/// Positional update of a list: sparse overlay plus appended tail.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListDiff {
    pub diff: Option<Vec<ListEntry>>,
    pub rpush: Option<Vec<Value>>,
}

impl ListDiff {
    pub fn push(values: Vec<Value>) -> Self {
        Self {
            diff: None,
            rpush: Some(values),
        }
    }

    pub fn overlay(entries: Vec<ListEntry>) -> Self {
        Self {
            diff: Some(entries),
            rpush: None,
        }
    }

    pub fn with_push(mut self, values: Vec<Value>) -> Self {
        self.rpush = Some(values);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_builder_and_id() {
        let state = State::new()
            .with(KEY_ID, "doc1")
            .with("dc:title", "Hello")
            .with("size", 3i64);
        assert_eq!(state.id(), Some("doc1"));
        assert_eq!(state.len(), 3);
        assert_eq!(state.get("size"), Some(&Value::Long(3)));
    }

    #[test]
    fn test_state_to_json() {
        let state = State::new()
            .with("dc:title", "Hello")
            .with("tags", Value::Array(vec!["a".into(), "b".into()]));
        let json = state.to_json();
        assert_eq!(json["dc:title"], "Hello");
        assert_eq!(json["tags"][1], "b");
    }
}
