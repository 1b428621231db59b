//! Process event model.
//!
//! Turns observations about a managed process (it started, it died, it wrote
//! a chunk of output) into [`Event`]s ready for the transport.
//!
//! Two timestamp rules apply and are intentionally different:
//! - output events take the time supplied by the caller, i.e. when the chunk
//!   was actually read from the pipe;
//! - status events take the factory clock's "now", because the supervisor
//!   calls them synchronously at the moment of the transition.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::{Clock, SystemClock};
use crate::event::{Event, Timed};

// ============================================================================
// Event Type Constants
// ============================================================================

pub const STARTED_EVENT_TYPE: &str = "process_started";
pub const DIED_EVENT_TYPE: &str = "process_died";
pub const STDOUT_EVENT_TYPE: &str = "process_stdout";
pub const STDERR_EVENT_TYPE: &str = "process_stderr";

/// The four process event discriminants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessEventType {
    #[serde(rename = "process_started")]
    Started,
    #[serde(rename = "process_died")]
    Died,
    #[serde(rename = "process_stdout")]
    Stdout,
    #[serde(rename = "process_stderr")]
    Stderr,
}

impl ProcessEventType {
    pub const ALL: [ProcessEventType; 4] = [
        ProcessEventType::Started,
        ProcessEventType::Died,
        ProcessEventType::Stdout,
        ProcessEventType::Stderr,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessEventType::Started => STARTED_EVENT_TYPE,
            ProcessEventType::Died => DIED_EVENT_TYPE,
            ProcessEventType::Stdout => STDOUT_EVENT_TYPE,
            ProcessEventType::Stderr => STDERR_EVENT_TYPE,
        }
    }

    /// Returns `None` for anything that is not a process event type.
    pub fn from_type(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }

    pub fn is_status(&self) -> bool {
        matches!(self, ProcessEventType::Started | ProcessEventType::Died)
    }

    pub fn is_output(&self) -> bool {
        !self.is_status()
    }
}

impl fmt::Display for ProcessEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle transitions that carry a full process snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusEventType {
    Started,
    Died,
}

impl StatusEventType {
    pub fn event_type(&self) -> ProcessEventType {
        match self {
            StatusEventType::Started => ProcessEventType::Started,
            StatusEventType::Died => ProcessEventType::Died,
        }
    }
}

/// Which pipe an output chunk was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }

    pub fn event_type(&self) -> ProcessEventType {
        match self {
            OutputStream::Stdout => ProcessEventType::Stdout,
            OutputStream::Stderr => ProcessEventType::Stderr,
        }
    }
}

// ============================================================================
// Data Structures
// ============================================================================

/// Identity of a managed process at the moment of an observation.
///
/// Owned by the process supervisor; the event model only reads it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSnapshot {
    /// Agent-assigned id, unique for the agent's lifetime and never reused.
    pub pid: u64,
    /// OS process id. 0 when the OS id is not known.
    pub native_pid: i64,
    /// Human-assigned label, not unique.
    pub name: String,
    /// Exact command line the process was launched with.
    pub command_line: String,
}

/// Body of `process_started` and `process_died`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessStatusEventBody {
    #[serde(flatten)]
    pub timed: Timed,
    #[serde(flatten)]
    pub process: ProcessSnapshot,
}

/// Body of `process_stdout` and `process_stderr`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessOutputEventBody {
    #[serde(flatten)]
    pub timed: Timed,
    pub pid: u64,
    /// Decoded chunk of output; not necessarily a whole line.
    pub text: String,
}

/// Either process event body.
///
/// Untagged: the envelope's `type` already says which one it is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProcessEventBody {
    Status(ProcessStatusEventBody),
    Output(ProcessOutputEventBody),
}

impl ProcessEventBody {
    pub fn pid(&self) -> u64 {
        match self {
            ProcessEventBody::Status(body) => body.process.pid,
            ProcessEventBody::Output(body) => body.pid,
        }
    }

    pub fn time(&self) -> DateTime<Utc> {
        match self {
            ProcessEventBody::Status(body) => body.timed.time,
            ProcessEventBody::Output(body) => body.timed.time,
        }
    }
}

/// Envelope carrying a process event body.
pub type ProcessEvent = Event<ProcessEventBody>;

impl Event<ProcessEventBody> {
    /// Parsed discriminant.
    ///
    /// `None` if the type is not a process event type, or if it does not go
    /// with the body. The factory never builds such an event, but the fields
    /// are public and a decoded envelope can carry any pairing.
    pub fn process_event_type(&self) -> Option<ProcessEventType> {
        let event_type = ProcessEventType::from_type(&self.event_type)?;
        let matches_body = match &self.body {
            ProcessEventBody::Status(_) => event_type.is_status(),
            ProcessEventBody::Output(_) => event_type.is_output(),
        };
        matches_body.then_some(event_type)
    }

    pub fn pid(&self) -> u64 {
        self.body.pid()
    }

    pub fn is_died(&self) -> bool {
        self.process_event_type() == Some(ProcessEventType::Died)
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Builds process events.
///
/// Holds nothing but the clock used by the status builders, so it is cheap
/// to clone and safe to share across tasks.
#[derive(Debug, Clone, Default)]
pub struct ProcessEventFactory<C = SystemClock> {
    clock: C,
}

impl ProcessEventFactory<SystemClock> {
    pub fn new() -> Self {
        Self { clock: SystemClock }
    }
}

impl<C: Clock> ProcessEventFactory<C> {
    pub fn with_clock(clock: C) -> Self {
        Self { clock }
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// `process_stdout` event for a chunk read at `observed_at`.
    ///
    /// The caller must not pass empty `text`; it is forwarded as is.
    pub fn stdout_event(
        &self,
        pid: u64,
        text: impl Into<String>,
        observed_at: DateTime<Utc>,
    ) -> ProcessEvent {
        output_event(OutputStream::Stdout, pid, text.into(), observed_at)
    }

    /// `process_stderr` event for a chunk read at `observed_at`.
    pub fn stderr_event(
        &self,
        pid: u64,
        text: impl Into<String>,
        observed_at: DateTime<Utc>,
    ) -> ProcessEvent {
        output_event(OutputStream::Stderr, pid, text.into(), observed_at)
    }

    /// Output event for the given stream.
    pub fn output_event(
        &self,
        stream: OutputStream,
        pid: u64,
        text: impl Into<String>,
        observed_at: DateTime<Utc>,
    ) -> ProcessEvent {
        output_event(stream, pid, text.into(), observed_at)
    }

    /// Status event stamped with the clock's current time.
    pub fn status_event(&self, process: &ProcessSnapshot, status: StatusEventType) -> ProcessEvent {
        Event::new(
            status.event_type().as_str(),
            ProcessEventBody::Status(ProcessStatusEventBody {
                timed: Timed::new(self.clock.now()),
                process: process.clone(),
            }),
        )
    }

    pub fn started_event(&self, process: &ProcessSnapshot) -> ProcessEvent {
        self.status_event(process, StatusEventType::Started)
    }

    pub fn died_event(&self, process: &ProcessSnapshot) -> ProcessEvent {
        self.status_event(process, StatusEventType::Died)
    }
}

fn output_event(
    stream: OutputStream,
    pid: u64,
    text: String,
    observed_at: DateTime<Utc>,
) -> ProcessEvent {
    Event::new(
        stream.event_type().as_str(),
        ProcessEventBody::Output(ProcessOutputEventBody {
            timed: Timed::new(observed_at),
            pid,
            text,
        }),
    )
}

// ============================================================================
// Tests
// ============================================================================
