//! Shared definitions for the exec agent and its clients.
//!
//! - [`event`]: the generic event envelope.
//! - [`process_events`]: process event types, payloads and the factory that builds them.
//! - [`clock`]: the time source used when stamping status events.

pub mod clock;
pub mod event;
pub mod process_events;

use serde::{Deserialize, Serialize};

pub use clock::{Clock, FixedClock, SystemClock};
pub use event::{Event, EventMessage, Timed};
pub use process_events::{
    OutputStream, ProcessEvent, ProcessEventBody, ProcessEventFactory, ProcessEventType,
    ProcessOutputEventBody, ProcessSnapshot, ProcessStatusEventBody, StatusEventType,
};

// ============================================================================
// Process Control
// ============================================================================

/// Parameters for starting a process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartProcessParams {
    pub name: String,
    pub command_line: String,
    /// Working directory; the agent default is used when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
}

/// A managed process as reported by the agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    #[serde(flatten)]
    pub process: ProcessSnapshot,
    pub alive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}
