//! Process execution agent.
//!
//! Starts command lines as child processes through [`supervisor::ProcessSupervisor`]
//! and reports their lifecycle and output as process events on an
//! [`event_bus::EventBus`].

pub mod config;
pub mod error;
pub mod event_bus;
pub mod supervisor;

pub use config::AgentConfig;
pub use error::AgentError;
pub use event_bus::EventBus;
pub use supervisor::ProcessSupervisor;
