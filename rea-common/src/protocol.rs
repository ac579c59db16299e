//! Wire protocol for the backend WebSocket connection.
//!
//! One JSON object per frame in both directions. Inbound frames are
//! commands from the backend, tagged by the `command` field; outbound
//! frames are either a terminal `response` correlated to the originating
//! command or an intermediate `log` chunk.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Registry id reserved for the companion service process.
///
/// Registering the companion under this sentinel lets it participate in
/// bulk termination alongside ordinary command processes. Backend command
/// ids are caller-supplied and never collide with it.
pub const COMPANION_PROCESS_ID: &str = "companion_process";

/// Marker value the companion health endpoint must report before the
/// supervisor considers it ready.
pub const HEALTH_OK: &str = "ok";

// ── Inbound frames ───────────────────────────────────────────────────────

/// A command received from the backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum BackendCommand {
    /// Run a shell line as an independently cancellable child process.
    #[serde(rename_all = "camelCase")]
    ExecuteCommand {
        command_id: String,
        params: ExecuteParams,
    },
    /// Request graceful termination of a previously issued execute command.
    #[serde(rename_all = "camelCase")]
    CancelCommand {
        command_id: String,
        params: CancelParams,
    },
    /// Proxy a call into the companion code-intelligence service.
    #[serde(rename_all = "camelCase")]
    LsproxyCommand {
        command_id: String,
        params: CompanionParams,
    },
    /// Shut the agent down: kill everything, close cleanly, exit.
    #[serde(rename_all = "camelCase")]
    Terminate {
        #[serde(default)]
        command_id: Option<String>,
    },
}

impl BackendCommand {
    /// The caller-supplied correlation id, if the frame carries one.
    pub fn command_id(&self) -> Option<&str> {
        match self {
            Self::ExecuteCommand { command_id, .. }
            | Self::CancelCommand { command_id, .. }
            | Self::LsproxyCommand { command_id, .. } => Some(command_id),
            Self::Terminate { command_id } => command_id.as_deref(),
        }
    }
}

/// Parameters for `execute_command`.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteParams {
    /// The shell line to run.
    pub command: String,
}

/// Parameters for `cancel_command`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelParams {
    /// Id of the execute command whose process should be terminated.
    pub command_id_to_cancel: String,
}

/// Parameters for `lsproxy_command`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompanionParams {
    pub action: CompanionAction,
    /// Action-specific arguments, forwarded to the companion verbatim.
    #[serde(default)]
    pub action_params: Option<Value>,
}

/// Actions the backend may request against the companion service.
///
/// Every non-`start` action maps 1:1 to a companion HTTP endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompanionAction {
    Start,
    ListFiles,
    GetDefinition,
    GetReferences,
    GetDefinitionsInFile,
    ReadSourceCode,
}

impl std::fmt::Display for CompanionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Start => "start",
            Self::ListFiles => "list-files",
            Self::GetDefinition => "get-definition",
            Self::GetReferences => "get-references",
            Self::GetDefinitionsInFile => "get-definitions-in-file",
            Self::ReadSourceCode => "read-source-code",
        };
        write!(f, "{s}")
    }
}

// ── Outbound frames ──────────────────────────────────────────────────────

/// Terminal outcome of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    Error,
}

impl std::fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Which stream an intermediate log chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogStream {
    Stdout,
    Stderr,
    CompanionOut,
    CompanionErr,
}

/// Payload of a `log` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogPayload {
    pub stream: LogStream,
    pub message: String,
}

/// A frame sent from the agent to the backend.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum RunnerMessage {
    /// The one definitive outcome frame for a command.
    #[serde(rename_all = "camelCase")]
    Response {
        original_command_id: String,
        status: ResponseStatus,
        payload: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        runner_metadata: Option<RunnerMetadata>,
    },
    /// Zero or more of these may precede the terminal response.
    #[serde(rename_all = "camelCase")]
    Log {
        command_id: String,
        payload: LogPayload,
    },
}

/// CI run context attached to every response so the backend can attribute
/// results without a second lookup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub github_repo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub github_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub github_run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub github_sha: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub github_triggering_actor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub github_run_attempt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub github_workflow_ref: Option<String>,
}

impl RunnerMetadata {
    /// Capture run context from the standard CI environment variables.
    pub fn from_env() -> Self {
        let get = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            github_repo: get("GITHUB_REPOSITORY"),
            github_ref: get("GITHUB_REF"),
            github_run_id: get("GITHUB_RUN_ID"),
            github_sha: get("GITHUB_SHA"),
            github_triggering_actor: get("GITHUB_TRIGGERING_ACTOR"),
            github_run_attempt: get("GITHUB_RUN_ATTEMPT"),
            github_workflow_ref: get("GITHUB_WORKFLOW_REF"),
        }
    }
}

/// Hello frame sent immediately after the socket opens.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthFrame<'a> {
    pub r#type: &'static str,
    pub run_id: &'a str,
}

impl<'a> AuthFrame<'a> {
    pub fn new(run_id: &'a str) -> Self {
        Self {
            r#type: "auth",
            run_id,
        }
    }
}

/// Body of the companion health endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct CompanionHealth {
    pub status: String,
}

impl CompanionHealth {
    pub fn is_ok(&self) -> bool {
        self.status == HEALTH_OK
    }
}
