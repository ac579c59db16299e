//! Shell command execution.
//!
//! Each `execute_command` becomes one child process: spawned through the
//! configured shell, registered for cancellation, its stdout and stderr
//! drained concurrently into capped buffers, and answered with exactly
//! one terminal response frame.

use crate::outbound::OutboundSender;
use crate::registry::ProcessRegistry;
use rea_common::errors::AgentError;
use rea_common::protocol::{LogStream, ResponseStatus};
use serde_json::json;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Read chunk size for output capture.
const CAPTURE_CHUNK_BYTES: usize = 8 * 1024;

/// How a command's execution environment is set up.
#[derive(Debug, Clone)]
pub struct ExecOptions {
    /// Shell invoked as `shell -c <line>`.
    pub shell: String,
    /// Working directory for the child.
    pub workdir: PathBuf,
    /// Ceiling on captured bytes per stream pair.
    pub max_capture_bytes: usize,
    /// Forward output chunks as intermediate log frames.
    pub stream_output: bool,
}

/// Outcome of draining one output stream.
enum Captured {
    Complete(Vec<u8>),
    /// The ceiling was hit; captured data is truncated at the ceiling.
    Overflow(Vec<u8>),
}

/// Run one `execute_command` to completion and emit its terminal response.
///
/// Registry removal is the single gate for the terminal frame: if the
/// entry is already gone when the child exits, the command was cancelled
/// and the cancel handler has already answered for it, so this path stays
/// silent.
pub async fn run_command(
    registry: Arc<ProcessRegistry>,
    outbound: OutboundSender,
    command_id: String,
    command_line: String,
    opts: ExecOptions,
) {
    info!("[{command_id}] executing: {command_line}");

    let spawned = Command::new(&opts.shell)
        .arg("-c")
        .arg(&command_line)
        .current_dir(&opts.workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn();

    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            warn!("[{command_id}] failed to spawn: {e}");
            let err = AgentError::SpawnFailure(e.to_string());
            outbound.send_response(&command_id, ResponseStatus::Error, err.to_payload());
            return;
        }
    };

    let pid = child.id().unwrap_or_default();
    registry.register(&command_id, pid);

    // Overflow notifications let us kill a child that keeps writing past
    // the ceiling; once a capture task stops reading, the pipe would
    // otherwise fill up and the child would never exit.
    let (overflow_tx, mut overflow_rx) = mpsc::channel::<()>(2);

    let stdout_task = child.stdout.take().map(|stream| {
        tokio::spawn(capture_stream(
            stream,
            opts.max_capture_bytes,
            overflow_tx.clone(),
            opts.stream_output
                .then(|| (outbound.clone(), command_id.clone(), LogStream::Stdout)),
        ))
    });
    let stderr_task = child.stderr.take().map(|stream| {
        tokio::spawn(capture_stream(
            stream,
            opts.max_capture_bytes,
            overflow_tx.clone(),
            opts.stream_output
                .then(|| (outbound.clone(), command_id.clone(), LogStream::Stderr)),
        ))
    });
    drop(overflow_tx);

    let status = tokio::select! {
        status = child.wait() => status,
        notice = overflow_rx.recv() => {
            if notice.is_some() {
                let _ = child.start_kill();
            }
            child.wait().await
        }
    };

    let stdout = join_capture(stdout_task).await;
    let stderr = join_capture(stderr_task).await;
    let overflowed =
        matches!(stdout, Captured::Overflow(_)) || matches!(stderr, Captured::Overflow(_));

    // First remover wins: an absent entry means the cancel handler got
    // here first and already answered for this command.
    if registry.remove(&command_id).is_none() {
        debug!("[{command_id}] exited after cancellation; suppressing terminal response");
        return;
    }

    if overflowed {
        warn!("[{command_id}] output capture exceeded {} bytes", opts.max_capture_bytes);
        let err = AgentError::CaptureOverflow {
            limit_bytes: opts.max_capture_bytes,
        };
        outbound.send_response(&command_id, ResponseStatus::Error, err.to_payload());
        return;
    }

    let (exit_code, response_status) = match status {
        Ok(status) => {
            let code = status.code().unwrap_or(-1);
            let response = if code == 0 {
                ResponseStatus::Success
            } else {
                ResponseStatus::Error
            };
            (code, response)
        }
        Err(e) => {
            warn!("[{command_id}] wait failed: {e}");
            (-1, ResponseStatus::Error)
        }
    };

    info!("[{command_id}] finished with exit code {exit_code}");
    outbound.send_response(
        &command_id,
        response_status,
        json!({
            "exitCode": exit_code,
            "stdout": String::from_utf8_lossy(captured_bytes(&stdout)).into_owned(),
            "stderr": String::from_utf8_lossy(captured_bytes(&stderr)).into_owned(),
        }),
    );
}

fn captured_bytes(captured: &Captured) -> &[u8] {
    match captured {
        Captured::Complete(bytes) | Captured::Overflow(bytes) => bytes,
    }
}

async fn join_capture(task: Option<tokio::task::JoinHandle<Captured>>) -> Captured {
    match task {
        Some(handle) => handle.await.unwrap_or(Captured::Complete(Vec::new())),
        None => Captured::Complete(Vec::new()),
    }
}

/// Drain one output stream into a capped buffer.
///
/// Chunks arriving on the same stream keep their order; interleaving with
/// the other stream is unspecified. When `log_sink` is set, each chunk is
/// also forwarded as an intermediate log frame.
async fn capture_stream<R: AsyncReadExt + Unpin>(
    mut stream: R,
    limit: usize,
    overflow_tx: mpsc::Sender<()>,
    log_sink: Option<(OutboundSender, String, LogStream)>,
) -> Captured {
    let mut captured = Vec::new();
    let mut chunk = vec![0u8; CAPTURE_CHUNK_BYTES];

    loop {
        match stream.read(&mut chunk).await {
            Ok(0) => return Captured::Complete(captured),
            Ok(n) => {
                let data = &chunk[..n];
                if let Some((outbound, command_id, log_stream)) = &log_sink {
                    outbound.send_log(
                        command_id,
                        *log_stream,
                        String::from_utf8_lossy(data).into_owned(),
                    );
                }
                let room = limit.saturating_sub(captured.len());
                if n > room {
                    captured.extend_from_slice(&data[..room]);
                    let _ = overflow_tx.try_send(());
                    return Captured::Overflow(captured);
                }
                captured.extend_from_slice(data);
            }
            Err(e) => {
                debug!("output stream read ended with error: {e}");
                return Captured::Complete(captured);
            }
        }
    }
}
