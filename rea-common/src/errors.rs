//! Error taxonomy for the Remote Execution Agent.
//!
//! Per-command failures are converted into a terminal error response for
//! that command and never bring the agent down. Only a global timeout or
//! an unrecoverable startup error is fatal to the whole process.

use serde_json::{Value, json};
use thiserror::Error;

/// Everything that can go wrong while serving a run.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The child process could not be started at all (missing executable,
    /// permission denied). Terminal for the one command, sentinel exit
    /// code -1 on the wire.
    #[error("failed to execute command: {0}")]
    SpawnFailure(String),

    /// Captured output exceeded the configured ceiling. The child is
    /// killed and the command fails; the agent keeps running.
    #[error("captured output exceeded the {limit_bytes} byte limit")]
    CaptureOverflow { limit_bytes: usize },

    /// A companion call was attempted before the service reached Ready.
    #[error("companion service is not ready")]
    CompanionNotReady,

    /// The companion never became healthy within the attempt ceiling.
    #[error("companion service failed to become healthy after {attempts} checks")]
    CompanionUnhealthyTimeout { attempts: u32 },

    /// The companion process exited before reaching Ready.
    #[error("companion service exited before becoming ready: {0}")]
    CompanionStartupExit(String),

    /// The companion crashed after Ready; in-flight forwards fail with
    /// this instead of hanging, and a later start() may retry.
    #[error("companion service unavailable: {0}")]
    CompanionUnavailable(String),

    /// The HTTP request to the companion could not be sent at all.
    #[error("companion request failed: {0}")]
    Transport(String),

    /// The companion answered with a non-2xx status.
    #[error("companion returned status {status}")]
    UpstreamStatus { status: u16, body: String },

    /// The companion answered 2xx but the body was not valid JSON.
    #[error("companion returned a response that is not valid JSON")]
    MalformedResponse { body: String },

    /// Inbound frame carried an unrecognized `command` value.
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// Inbound companion frame carried an unrecognized `action` value.
    #[error("unknown companion action: {0}")]
    UnknownAction(String),

    /// Inbound frame was not valid JSON. Logged; the dispatcher survives.
    #[error("failed to decode inbound frame: {0}")]
    Decode(String),

    /// Cancellation targeted an id that is not registered (never started,
    /// already completed, or already cancelled).
    #[error("command {0} not found for cancellation")]
    CancelTargetNotFound(String),

    /// The backend closed the socket with a non-normal code. Surfaced as
    /// a failure of the run, not of any individual command.
    #[error("connection closed abnormally with code {0}")]
    ConnectionClosedAbnormally(u16),

    /// The global run deadline expired. Forces shutdown, exit 1.
    #[error("global run timeout exceeded")]
    GlobalTimeout,
}

impl AgentError {
    /// Build the error payload for a terminal response frame.
    ///
    /// Variants that carry extra context the backend can act on (upstream
    /// status codes, raw bodies, spawn exit sentinel) include it alongside
    /// the message.
    pub fn to_payload(&self) -> Value {
        match self {
            Self::SpawnFailure(reason) => json!({
                "message": self.to_string(),
                "exitCode": -1,
                "stderr": reason,
            }),
            Self::UpstreamStatus { status, body } => json!({
                "message": self.to_string(),
                "status": status,
                "body": body,
            }),
            Self::MalformedResponse { body } => json!({
                "message": self.to_string(),
                "response": body,
            }),
            _ => json!({ "message": self.to_string() }),
        }
    }
}
