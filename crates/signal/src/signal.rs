use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Ordered key/value payload carried by a [`Signal`].
pub type Payload = IndexMap<String, serde_json::Value>;

/// A named asynchronous event.
///
/// Fields are private: a signal can be shaped with the builder methods before
/// it is published, and is read-only afterwards. On the bus it travels as a
/// MessagePack envelope, so every recipient decodes its own copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    id: Uuid,
    name: String,
    payload: Payload,
    /// Empty = local to the emitting service.
    target_services: BTreeSet<String>,
    /// Set by the bus at publish time.
    emitted_by: Option<String>,
    timestamp: DateTime<Utc>,
    /// Schema version for forward-compatible evolution.
    version: u16,
}

impl Signal {
    /// Create a local signal (visible only to the emitting service).
    pub fn new(name: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            payload,
            target_services: BTreeSet::new(),
            emitted_by: None,
            timestamp: Utc::now(),
            version: 1,
        }
    }

    /// Route the signal to the named services' inboxes instead of the emitter's own.
    pub fn with_targets<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target_services
            .extend(targets.into_iter().map(Into::into));
        self
    }

    pub(crate) fn stamp_origin(mut self, origin: &str) -> Self {
        self.emitted_by = Some(origin.to_string());
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Look up a single payload field.
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.payload.get(key)
    }

    pub fn target_services(&self) -> &BTreeSet<String> {
        &self.target_services
    }

    pub fn is_local(&self) -> bool {
        self.target_services.is_empty()
    }

    pub fn emitted_by(&self) -> Option<&str> {
        self.emitted_by.as_deref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn version(&self) -> u16 {
        self.version
    }

    /// Serialize this signal to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec(self)
    }

    /// Deserialize a signal from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

/// Build a [`Payload`] from `key => value` pairs.
///
/// ```ignore
/// let payload = payload! { "device_id" => "device-001", "temperature" => 21.5 };
/// ```
#[macro_export]
macro_rules! payload {
    () => { $crate::Payload::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut map = $crate::Payload::new();
        $( map.insert(($key).to_string(), ::serde_json::json!($value)); )+
        map
    }};
}
