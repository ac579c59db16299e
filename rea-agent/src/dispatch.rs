//! Inbound frame dispatch.
//!
//! One entry point per received text frame. Malformed or unknown frames
//! never take the agent down: whatever can be answered gets a terminal
//! error response, the rest is logged and dropped. Long-running work is
//! spawned so the read loop keeps consuming frames.

use crate::companion::CompanionSupervisor;
use crate::executor::{self, ExecOptions};
use crate::outbound::OutboundSender;
use crate::registry::{self, ProcessRegistry};
use crate::shutdown::ShutdownCoordinator;
use nix::sys::signal::Signal;
use rea_common::errors::AgentError;
use rea_common::protocol::{BackendCommand, CompanionAction, CompanionParams, ResponseStatus};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{info, warn};

/// Routes backend commands to their handlers.
#[derive(Clone)]
pub struct CommandDispatcher {
    registry: Arc<ProcessRegistry>,
    companion: CompanionSupervisor,
    outbound: OutboundSender,
    shutdown: ShutdownCoordinator,
    exec: ExecOptions,
}

impl CommandDispatcher {
    pub fn new(
        registry: Arc<ProcessRegistry>,
        companion: CompanionSupervisor,
        outbound: OutboundSender,
        shutdown: ShutdownCoordinator,
        exec: ExecOptions,
    ) -> Self {
        Self {
            registry,
            companion,
            outbound,
            shutdown,
            exec,
        }
    }

    /// Handle one raw text frame from the backend.
    pub async fn dispatch(&self, raw: &str) {
        if self.shutdown.is_shutting_down() {
            warn!("ignoring frame received during shutdown");
            return;
        }

        let value: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(e) => {
                warn!("{}", AgentError::Decode(e.to_string()));
                return;
            }
        };

        match serde_json::from_value::<BackendCommand>(value.clone()) {
            Ok(command) => self.handle(command).await,
            Err(e) => self.reject(&value, e).await,
        }
    }

    async fn handle(&self, command: BackendCommand) {
        match command {
            BackendCommand::ExecuteCommand { command_id, params } => {
                tokio::spawn(executor::run_command(
                    Arc::clone(&self.registry),
                    self.outbound.clone(),
                    command_id,
                    params.command,
                    self.exec.clone(),
                ));
            }
            BackendCommand::CancelCommand { command_id, params } => {
                self.cancel(&command_id, &params.command_id_to_cancel);
            }
            BackendCommand::LsproxyCommand { command_id, params } => {
                let this = self.clone();
                tokio::spawn(async move {
                    this.companion_command(&command_id, params).await;
                });
            }
            BackendCommand::Terminate { command_id } => {
                self.shutdown.terminate(command_id).await;
            }
        }
    }

    /// Cancel a running execute command.
    ///
    /// Removing the registry entry here is what suppresses the target's
    /// own terminal response; the cancel acknowledgement is the last
    /// frame the backend sees for that process.
    fn cancel(&self, command_id: &str, target: &str) {
        match self.registry.lookup(target) {
            Some(proc) => {
                info!("cancelling command {target} (pid {})", proc.pid);
                registry::send_signal(proc.pid, Signal::SIGTERM);
                self.registry.remove(target);
                self.outbound.send_response(
                    command_id,
                    ResponseStatus::Success,
                    json!({"message": format!("Command {target} cancelled.")}),
                );
            }
            None => {
                let err = AgentError::CancelTargetNotFound(target.to_string());
                self.outbound
                    .send_response(command_id, ResponseStatus::Error, err.to_payload());
            }
        }
    }

    async fn companion_command(&self, command_id: &str, params: CompanionParams) {
        let outcome = match params.action {
            CompanionAction::Start => self
                .companion
                .start()
                .await
                .map(|()| json!({"message": "Companion service is ready."})),
            action => {
                let body = params.action_params;
                let (method, path, query, body) = match action {
                    CompanionAction::ListFiles => {
                        (reqwest::Method::GET, "/workspace/list-files", Vec::new(), None)
                    }
                    CompanionAction::GetDefinition => {
                        (reqwest::Method::POST, "/symbol/find-definition", Vec::new(), body)
                    }
                    CompanionAction::GetReferences => {
                        (reqwest::Method::POST, "/symbol/find-references", Vec::new(), body)
                    }
                    CompanionAction::GetDefinitionsInFile => (
                        reqwest::Method::GET,
                        "/symbol/definitions-in-file",
                        definitions_in_file_query(body.as_ref()),
                        None,
                    ),
                    CompanionAction::ReadSourceCode => {
                        (reqwest::Method::POST, "/workspace/read-source-code", Vec::new(), body)
                    }
                    CompanionAction::Start => unreachable!("handled above"),
                };
                self.companion.call(method, path, &query, body).await
            }
        };

        match outcome {
            Ok(payload) => {
                self.outbound
                    .send_response(command_id, ResponseStatus::Success, payload)
            }
            Err(e) => {
                warn!("companion action {} failed: {e}", params.action);
                self.outbound
                    .send_response(command_id, ResponseStatus::Error, e.to_payload())
            }
        }
    }

    /// A frame that parsed as JSON but not as a known command. Answer it
    /// when it carries a correlation id, otherwise just log.
    async fn reject(&self, value: &Value, decode_err: serde_json::Error) {
        let tag = value.get("command").and_then(Value::as_str).unwrap_or("");
        let err = match tag {
            "execute_command" | "cancel_command" | "terminate" => {
                AgentError::Decode(decode_err.to_string())
            }
            "lsproxy_command" => {
                let action = value
                    .pointer("/params/action")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                if !action.is_empty()
                    && serde_json::from_value::<CompanionAction>(json!(action)).is_err()
                {
                    AgentError::UnknownAction(action.to_string())
                } else {
                    AgentError::Decode(decode_err.to_string())
                }
            }
            _ => AgentError::UnknownCommand(tag.to_string()),
        };

        match value.get("commandId").and_then(Value::as_str) {
            Some(command_id) => {
                warn!("rejecting frame {command_id}: {err}");
                self.outbound
                    .send_response(command_id, ResponseStatus::Error, err.to_payload());
            }
            None => warn!("dropping unanswerable frame: {err}"),
        }
    }
}

/// The backend names the file `path`; the companion's query parameter is
/// `file_path`. Other keys pass through untouched.
fn definitions_in_file_query(params: Option<&Value>) -> Vec<(String, String)> {
    query_pairs(params)
        .into_iter()
        .map(|(key, value)| {
            if key == "path" {
                ("file_path".to_string(), value)
            } else {
                (key, value)
            }
        })
        .collect()
}

/// Flatten a JSON object into query pairs for GET-style forwards.
fn query_pairs(params: Option<&Value>) -> Vec<(String, String)> {
    let Some(Value::Object(map)) = params else {
        return Vec::new();
    };
    map.iter()
        .map(|(key, value)| {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (key.clone(), rendered)
        })
        .collect()
}
