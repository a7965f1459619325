//! The immutable event record and its draft builder.

use std::collections::BTreeMap;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::EventError;

/// Per-origin signature blocks: `origin -> key_id -> signature`.
pub type Signatures = BTreeMap<String, BTreeMap<String, String>>;

/// An immutable event.
///
/// Fields are private; an `Event` is obtained by decoding JSON
/// ([`Event::from_json`]) or by finishing an [`EventDraft`]. Operations that
/// would change an event (signing, assigning an id) return a new value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    room_id: Option<String>,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    origin: Option<String>,
    #[serde(default)]
    origin_server_ts: i64,
    #[serde(default)]
    depth: i64,
    #[serde(default)]
    prev_events: Vec<String>,
    #[serde(default)]
    auth_events: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    state_key: Option<String>,
    #[serde(default = "empty_object")]
    content: Value,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    signatures: Signatures,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    unsigned: Map<String, Value>,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl Event {
    /// Decodes an event from JSON text.
    pub fn from_json(json: &str) -> Result<Self, EventError> {
        let value: Value = serde_json::from_str(json)?;
        Self::from_value(value)
    }

    /// Decodes an event from an already-parsed JSON value.
    pub fn from_value(value: Value) -> Result<Self, EventError> {
        if !value.is_object() {
            return Err(EventError::NotAnObject);
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Returns the event id; `None` for an ephemeral event.
    pub fn event_id(&self) -> Option<&str> {
        self.event_id.as_deref()
    }

    pub fn room_id(&self) -> Option<&str> {
        self.room_id.as_deref()
    }

    /// Returns the event `type`.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    pub fn origin_server_ts(&self) -> i64 {
        self.origin_server_ts
    }

    /// Causal height of this event in its room's DAG.
    pub fn depth(&self) -> i64 {
        self.depth
    }

    pub fn prev_events(&self) -> &[String] {
        &self.prev_events
    }

    pub fn auth_events(&self) -> &[String] {
        &self.auth_events
    }

    pub fn state_key(&self) -> Option<&str> {
        self.state_key.as_deref()
    }

    pub fn content(&self) -> &Value {
        &self.content
    }

    pub fn signatures(&self) -> &Signatures {
        &self.signatures
    }

    /// Returns `true` if this event carries an id (a persistent event).
    pub fn is_pdu(&self) -> bool {
        self.event_id.is_some()
    }

    /// Returns `true` if the event has a `state_key`.
    pub fn is_state(&self) -> bool {
        self.state_key.is_some()
    }

    /// The server an event is attributed to: `origin`, else the sender's
    /// server name.
    pub fn origin_server(&self) -> Option<&str> {
        self.origin
            .as_deref()
            .or_else(|| self.sender().and_then(braid_types::id::server_name))
    }

    /// Canonical bytes covered by the content hash and the signatures.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, EventError> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut value {
            map.remove("event_id");
            map.remove("signatures");
            map.remove("unsigned");
        }
        Ok(serde_json::to_vec(&value)?)
    }

    /// Computes the content-addressed id of this event.
    ///
    /// The id is stable for a given canonical serialization regardless of
    /// whether the event currently carries an id or signatures.
    pub fn compute_id(&self) -> Result<String, EventError> {
        let digest = Sha256::digest(self.canonical_bytes()?);
        Ok(format!("${}", URL_SAFE_NO_PAD.encode(digest)))
    }

    /// Returns a copy of this event carrying its computed id.
    pub fn with_computed_id(&self) -> Result<Self, EventError> {
        let mut event = self.clone();
        event.event_id = Some(self.compute_id()?);
        Ok(event)
    }

    /// Size of the full JSON serialization in bytes.
    pub fn serialized_size(&self) -> Result<usize, EventError> {
        Ok(serde_json::to_vec(self)?.len())
    }

    /// Serializes the full event, including id and signatures.
    pub fn to_json(&self) -> Result<String, EventError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Returns a copy with one signature added.
    pub(crate) fn with_signature(&self, origin: &str, key_id: &str, signature: String) -> Self {
        let mut event = self.clone();
        event
            .signatures
            .entry(origin.to_string())
            .or_default()
            .insert(key_id.to_string(), signature);
        event
    }

    /// One-line summary for logs.
    pub fn summary(&self) -> String {
        format!(
            "{} {} {} {} depth:{} prev:{}{}",
            self.event_id.as_deref().unwrap_or("<edu>"),
            self.room_id.as_deref().unwrap_or("-"),
            self.kind,
            self.sender.as_deref().unwrap_or("-"),
            self.depth,
            self.prev_events.len(),
            self.state_key
                .as_deref()
                .map(|key| format!(" state_key:{key:?}"))
                .unwrap_or_default(),
        )
    }
}

/// Mutable builder for an [`Event`].
///
/// Used for locally authored events, where the engine fills in the causal
/// fields (`depth`, `prev_events`) and the id before admission, and by tests.
#[derive(Debug, Clone, Default)]
pub struct EventDraft {
    pub room_id: Option<String>,
    pub kind: String,
    pub sender: Option<String>,
    pub origin: Option<String>,
    pub origin_server_ts: i64,
    pub depth: i64,
    pub prev_events: Vec<String>,
    pub auth_events: Vec<String>,
    pub state_key: Option<String>,
    pub content: Map<String, Value>,
}

impl EventDraft {
    /// Starts a draft for an event of the given type in a room.
    pub fn new(room_id: &str, kind: &str, sender: &str) -> Self {
        Self {
            room_id: Some(room_id.to_string()),
            kind: kind.to_string(),
            sender: Some(sender.to_string()),
            ..Self::default()
        }
    }

    /// Starts a draft for an ephemeral event (no room required).
    pub fn ephemeral(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            ..Self::default()
        }
    }

    pub fn state_key(mut self, state_key: &str) -> Self {
        self.state_key = Some(state_key.to_string());
        self
    }

    pub fn depth(mut self, depth: i64) -> Self {
        self.depth = depth;
        self
    }

    pub fn prev_events<I, S>(mut self, prev: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prev_events = prev.into_iter().map(Into::into).collect();
        self
    }

    pub fn content(mut self, content: Value) -> Self {
        if let Value::Object(map) = content {
            self.content = map;
        }
        self
    }

    /// Finishes the draft without an id (an ephemeral event).
    pub fn into_event(self) -> Event {
        Event {
            event_id: None,
            room_id: self.room_id,
            kind: self.kind,
            sender: self.sender,
            origin: self.origin,
            origin_server_ts: self.origin_server_ts,
            depth: self.depth,
            prev_events: self.prev_events,
            auth_events: self.auth_events,
            state_key: self.state_key,
            content: Value::Object(self.content),
            signatures: Signatures::new(),
            unsigned: Map::new(),
        }
    }

    /// Finishes the draft as a persistent event with its computed id.
    pub fn into_pdu(self) -> Result<Event, EventError> {
        self.into_event().with_computed_id()
    }
}
