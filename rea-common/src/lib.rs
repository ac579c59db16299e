//! Shared types and utilities for the Remote Execution Agent.
//!
//! This crate holds everything the agent binary shares with tooling:
//! the wire protocol spoken over the backend WebSocket, the error
//! taxonomy, agent configuration, and logging initialization.

pub mod config;
pub mod errors;
pub mod logging;
pub mod protocol;

pub use config::{AgentConfig, CompanionConfig, ConfigError};
pub use errors::AgentError;
pub use logging::{LogConfig, init_logging};
pub use protocol::{
    BackendCommand, CompanionAction, LogPayload, LogStream, ResponseStatus, RunnerMessage,
    RunnerMetadata,
};
