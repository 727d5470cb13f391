//! Run context threaded through a routine's task chain.
//!
//! A [`Context`] is an ordered key/value map. Handlers read it through typed
//! accessors or decode it into a stage struct, and tasks can declare a
//! [`ContextSchema`] that the executor checks before the handler runs.

use std::fmt;

use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use vitals_signal::Payload;

pub type Value = serde_json::Value;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("missing field '{0}'")]
    Missing(String),

    #[error("field '{key}' should be {expected}, found {found}")]
    WrongType {
        key: String,
        expected: FieldKind,
        found: String,
    },

    #[error("failed to decode context: {0}")]
    Decode(String),

    #[error("failed to encode field '{key}': {message}")]
    Encode { key: String, message: String },
}

/// Ordered key/value payload for one run.
///
/// Cloning is a deep copy, which is what fan-out relies on: every branch
/// owns its own context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Context {
    fields: IndexMap<String, Value>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initial context for a run triggered by a signal.
    pub fn from_payload(payload: &Payload) -> Self {
        Self {
            fields: payload.clone(),
        }
    }

    pub fn into_payload(self) -> Payload {
        self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Present and not null.
    pub fn is_set(&self, key: &str) -> bool {
        self.fields.get(key).is_some_and(|v| !v.is_null())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(key.into(), value.into())
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Store any serializable value under `key`.
    pub fn put<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), ContextError> {
        let v = serde_json::to_value(value).map_err(|e| ContextError::Encode {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        self.fields.insert(key.to_string(), v);
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.shift_remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    fn require(&self, key: &str) -> Result<&Value, ContextError> {
        match self.fields.get(key) {
            Some(v) if !v.is_null() => Ok(v),
            _ => Err(ContextError::Missing(key.to_string())),
        }
    }

    fn wrong_type(key: &str, expected: FieldKind, found: &Value) -> ContextError {
        ContextError::WrongType {
            key: key.to_string(),
            expected,
            found: kind_name(found).to_string(),
        }
    }

    pub fn str(&self, key: &str) -> Result<&str, ContextError> {
        let v = self.require(key)?;
        v.as_str()
            .ok_or_else(|| Self::wrong_type(key, FieldKind::String, v))
    }

    pub fn f64(&self, key: &str) -> Result<f64, ContextError> {
        let v = self.require(key)?;
        v.as_f64()
            .ok_or_else(|| Self::wrong_type(key, FieldKind::Number, v))
    }

    pub fn bool(&self, key: &str) -> Result<bool, ContextError> {
        let v = self.require(key)?;
        v.as_bool()
            .ok_or_else(|| Self::wrong_type(key, FieldKind::Bool, v))
    }

    /// Decode one field into `T`.
    pub fn field<T: DeserializeOwned>(&self, key: &str) -> Result<T, ContextError> {
        let v = self.require(key)?;
        serde_json::from_value(v.clone())
            .map_err(|e| ContextError::Decode(format!("field '{key}': {e}")))
    }

    /// Decode the whole context into a stage struct. Unknown keys are ignored
    /// unless `T` denies them.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ContextError> {
        let v = serde_json::to_value(&self.fields)
            .map_err(|e| ContextError::Decode(e.to_string()))?;
        serde_json::from_value(v).map_err(|e| ContextError::Decode(e.to_string()))
    }

    /// Copy every field of a serializable struct into the context.
    pub fn extend_from<T: Serialize>(&mut self, value: &T) -> Result<(), ContextError> {
        match serde_json::to_value(value) {
            Ok(Value::Object(map)) => {
                self.fields.extend(map);
                Ok(())
            }
            Ok(other) => Err(ContextError::Encode {
                key: "<root>".to_string(),
                message: format!("expected an object, got {}", kind_name(&other)),
            }),
            Err(e) => Err(ContextError::Encode {
                key: "<root>".to_string(),
                message: e.to_string(),
            }),
        }
    }
}

impl From<Payload> for Context {
    fn from(fields: Payload) -> Self {
        Self { fields }
    }
}

impl FromIterator<(String, Value)> for Context {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

fn kind_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ── Stage schema ─────────────────────────────────────────────────────

/// Expected shape of a single context field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    String,
    Number,
    Bool,
    Array,
    Object,
    /// RFC 3339 timestamp string.
    Timestamp,
    Any,
}

impl FieldKind {
    pub fn matches(self, v: &Value) -> bool {
        match self {
            Self::String => v.is_string(),
            Self::Number => v.is_number(),
            Self::Bool => v.is_boolean(),
            Self::Array => v.is_array(),
            Self::Object => v.is_object(),
            Self::Timestamp => v
                .as_str()
                .is_some_and(|s| chrono::DateTime::parse_from_rfc3339(s).is_ok()),
            Self::Any => true,
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::String => "a string",
            Self::Number => "a number",
            Self::Bool => "a bool",
            Self::Array => "an array",
            Self::Object => "an object",
            Self::Timestamp => "an RFC 3339 timestamp",
            Self::Any => "any value",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
}

/// Fields a task expects on entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextSchema {
    fields: Vec<FieldSpec>,
}

impl ContextSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            kind,
            required: true,
        });
        self
    }

    pub fn optional(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            kind,
            required: false,
        });
        self
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Collect every violation; `Ok` only if there are none.
    pub fn check(&self, ctx: &Context) -> Result<(), Vec<ContextError>> {
        let mut problems = Vec::new();
        for spec in &self.fields {
            match ctx.get(&spec.name) {
                None | Some(Value::Null) => {
                    if spec.required {
                        problems.push(ContextError::Missing(spec.name.clone()));
                    }
                }
                Some(v) if !spec.kind.matches(v) => {
                    problems.push(Context::wrong_type(&spec.name, spec.kind, v));
                }
                Some(_) => {}
            }
        }
        if problems.is_empty() { Ok(()) } else { Err(problems) }
    }
}
