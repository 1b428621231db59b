//! Generic event envelope.
//!
//! An [`Event`] pairs a type discriminant with an arbitrary body. It knows
//! nothing about processes; domain modules decide which bodies go with which
//! discriminants.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Point-in-time marker composed into event bodies.
///
/// Bodies embed it with `#[serde(flatten)]`, so on the wire it is a plain
/// `time` field next to the body's own fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timed {
    /// When the observation was made (RFC 3339, UTC).
    pub time: DateTime<Utc>,
}

impl Timed {
    pub fn new(time: DateTime<Utc>) -> Self {
        Self { time }
    }
}

/// Transport-ready envelope.
///
/// Serialized as `{"type": "...", "body": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event<B = Value> {
    /// Event discriminant (e.g. `process_started`).
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event payload, shaped according to `event_type`.
    pub body: B,
}

impl<B> Event<B> {
    pub fn new(event_type: impl Into<String>, body: B) -> Self {
        Self {
            event_type: event_type.into(),
            body,
        }
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }
}

/// An event together with the agent instance that emitted it.
///
/// This is the top-level document written to an outgoing channel:
/// `{"type": "...", "body": {...}, "agent_id": "..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage<B = Value> {
    #[serde(flatten)]
    pub event: Event<B>,
    /// Identifies the sender, not the subject of the event.
    pub agent_id: String,
}

impl<B: Serialize> EventMessage<B> {
    pub fn new(event: Event<B>, agent_id: impl Into<String>) -> Self {
        Self {
            event,
            agent_id: agent_id.into(),
        }
    }

    /// Render as a single newline-terminated JSON document.
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}
