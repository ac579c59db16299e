//! Companion code-intelligence service supervisor.
//!
//! Owns the lifecycle of the local `lsproxy` process: single-flight
//! startup with health polling, forwarding of API calls once it is
//! ready, and crash detection both before and after readiness. The
//! process itself is registered under a sentinel id so shutdown sweeps
//! reap it along with ordinary commands.

use crate::outbound::OutboundSender;
use crate::registry::ProcessRegistry;
use rea_common::config::CompanionConfig;
use rea_common::errors::AgentError;
use rea_common::protocol::{COMPANION_PROCESS_ID, CompanionHealth, LogStream};
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Lifecycle phase of the companion service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompanionState {
    NotStarted,
    Starting,
    Ready,
    Failed,
}

/// Why a startup attempt did not reach Ready.
#[derive(Debug, Clone)]
enum StartFailure {
    Timeout(u32),
    Exited(String),
}

impl From<StartFailure> for AgentError {
    fn from(failure: StartFailure) -> Self {
        match failure {
            StartFailure::Timeout(attempts) => AgentError::CompanionUnhealthyTimeout { attempts },
            StartFailure::Exited(detail) => AgentError::CompanionStartupExit(detail),
        }
    }
}

struct Inner {
    state: CompanionState,
    waiters: Vec<oneshot::Sender<Result<(), StartFailure>>>,
}

/// Supervises the companion process and forwards API calls to it.
#[derive(Clone)]
pub struct CompanionSupervisor {
    config: CompanionConfig,
    workspace_dir: PathBuf,
    registry: Arc<ProcessRegistry>,
    outbound: OutboundSender,
    http: reqwest::Client,
    inner: Arc<Mutex<Inner>>,
}

impl CompanionSupervisor {
    pub fn new(
        config: CompanionConfig,
        workspace_dir: PathBuf,
        registry: Arc<ProcessRegistry>,
        outbound: OutboundSender,
    ) -> Self {
        Self {
            config,
            workspace_dir,
            registry,
            outbound,
            http: reqwest::Client::new(),
            inner: Arc::new(Mutex::new(Inner {
                state: CompanionState::NotStarted,
                waiters: Vec::new(),
            })),
        }
    }

    /// Current lifecycle phase.
    pub fn state(&self) -> CompanionState {
        self.lock().state
    }

    /// Ensure the companion is running and healthy.
    ///
    /// Single-flight: concurrent callers during startup all wait on the
    /// same attempt and share its outcome. A Failed state is not sticky,
    /// the next call starts a fresh attempt.
    pub async fn start(&self) -> Result<(), AgentError> {
        let rx = {
            let mut inner = self.lock();
            match inner.state {
                CompanionState::Ready => return Ok(()),
                CompanionState::Starting => {
                    let (tx, rx) = oneshot::channel();
                    inner.waiters.push(tx);
                    rx
                }
                CompanionState::NotStarted | CompanionState::Failed => {
                    inner.state = CompanionState::Starting;
                    let (tx, rx) = oneshot::channel();
                    inner.waiters.push(tx);
                    tokio::spawn(self.clone().run_startup());
                    rx
                }
            }
        };

        match rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(failure)) => Err(failure.into()),
            Err(_) => Err(AgentError::CompanionUnavailable(
                "startup attempt was abandoned".to_string(),
            )),
        }
    }

    /// Forward one API call to a ready companion.
    ///
    /// Rejected locally when the service is not Ready; nothing is sent
    /// over the wire in that case.
    pub async fn call(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &[(String, String)],
        body: Option<Value>,
    ) -> Result<Value, AgentError> {
        if self.state() != CompanionState::Ready {
            return Err(AgentError::CompanionNotReady);
        }

        let url = format!("{}{path}", self.config.base_url());
        debug!("forwarding companion request: {method} {url}");

        let mut request = self
            .http
            .request(method, &url)
            .timeout(self.config.request_timeout);
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                // A crash between the readiness check and the request
                // surfaces here as a connection error.
                if self.state() != CompanionState::Ready {
                    return Err(AgentError::CompanionUnavailable(e.to_string()));
                }
                return Err(AgentError::Transport(e.to_string()));
            }
        };

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| AgentError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(AgentError::UpstreamStatus {
                status: status.as_u16(),
                body: text,
            });
        }

        serde_json::from_str(&text).map_err(|_| AgentError::MalformedResponse { body: text })
    }

    /// One startup attempt: spawn, poll health, settle waiters.
    async fn run_startup(self) {
        info!(
            "starting companion service '{}' (port {})",
            self.config.program, self.config.port
        );

        let spawned = Command::new(&self.config.program)
            .arg("--mount-dir")
            .arg(&self.workspace_dir)
            .env("USE_AUTH", "false")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                warn!("failed to spawn companion: {e}");
                self.settle(CompanionState::Failed, Err(StartFailure::Exited(e.to_string())));
                return;
            }
        };

        self.registry
            .register(COMPANION_PROCESS_ID, child.id().unwrap_or_default());

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, LogStream::CompanionOut, self.outbound.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, LogStream::CompanionErr, self.outbound.clone()));
        }

        let mut attempts = 0u32;
        let mut ready = false;
        loop {
            tokio::select! {
                status = child.wait() => {
                    self.registry.remove(COMPANION_PROCESS_ID);
                    let detail = match status {
                        Ok(status) => status.to_string(),
                        Err(e) => e.to_string(),
                    };
                    if ready {
                        // Post-ready crash: forwards start failing, and a
                        // later start() may bring it back.
                        warn!("companion exited after becoming ready: {detail}");
                        self.settle(CompanionState::NotStarted, Ok(()));
                    } else {
                        warn!("companion exited during startup: {detail}");
                        self.settle(
                            CompanionState::Failed,
                            Err(StartFailure::Exited(detail)),
                        );
                    }
                    return;
                }
                _ = sleep(self.config.poll_interval), if !ready => {
                    attempts += 1;
                    if self.health_ok().await {
                        info!("companion healthy after {attempts} checks");
                        ready = true;
                        self.settle(CompanionState::Ready, Ok(()));
                    } else if attempts >= self.config.max_health_attempts {
                        warn!(
                            "companion not healthy after {attempts} checks; giving up"
                        );
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                        self.registry.remove(COMPANION_PROCESS_ID);
                        self.settle(
                            CompanionState::Failed,
                            Err(StartFailure::Timeout(attempts)),
                        );
                        return;
                    } else {
                        debug!("companion health check {attempts} not ready yet");
                    }
                }
            }
        }
    }

    async fn health_ok(&self) -> bool {
        let request = self
            .http
            .get(self.config.health_url())
            .timeout(self.config.poll_interval);
        match request.send().await {
            Ok(response) if response.status().is_success() => response
                .json::<CompanionHealth>()
                .await
                .map(|health| health.is_ok())
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Transition state and resolve everyone waiting on the attempt.
    fn settle(&self, state: CompanionState, outcome: Result<(), StartFailure>) {
        let mut inner = self.lock();
        inner.state = state;
        for waiter in inner.waiters.drain(..) {
            let _ = waiter.send(outcome.clone());
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Mirror one companion output stream to tracing and the backend log
/// channel, line by line.
async fn forward_output(
    stream: impl tokio::io::AsyncRead + Unpin,
    log_stream: LogStream,
    outbound: OutboundSender,
) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("companion {log_stream:?}: {line}");
        outbound.send_log(COMPANION_PROCESS_ID, log_stream, line);
    }
}
