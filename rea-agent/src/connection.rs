//! Backend WebSocket connection.
//!
//! One connection per run. The read loop feeds frames to the dispatcher;
//! a writer task drains the outbound channel so handlers never block on
//! the socket. When the connection ends, whatever is still running gets
//! SIGTERM, and only a normal closure counts as a successful run.

use crate::dispatch::CommandDispatcher;
use crate::outbound::Outbound;
use crate::registry::ProcessRegistry;
use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use nix::sys::signal::Signal;
use rea_common::config::AgentConfig;
use rea_common::errors::AgentError;
use rea_common::protocol::AuthFrame;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, info, warn};

/// Close code reported when the stream ends without a close frame.
const NO_CLOSE_FRAME: u16 = 1006;

/// Connect, authenticate, and serve the run until the backend hangs up.
pub async fn run(
    config: &AgentConfig,
    dispatcher: CommandDispatcher,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    registry: Arc<ProcessRegistry>,
) -> anyhow::Result<()> {
    let url = config.websocket_url()?;
    info!("connecting to {url}");

    let (ws, _) = connect_async(&url)
        .await
        .with_context(|| format!("failed to connect to {url}"))?;
    let (mut write, mut read) = ws.split();

    let hello = serde_json::to_string(&AuthFrame::new(&config.run_id))?;
    write
        .send(Message::text(hello))
        .await
        .context("failed to send auth frame")?;
    info!("authenticated as run {}", config.run_id);

    let writer = tokio::spawn(async move {
        while let Some(item) = outbound_rx.recv().await {
            match item {
                Outbound::Frame(frame) => {
                    let text = match serde_json::to_string(&frame) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("failed to serialize outbound frame: {e}");
                            continue;
                        }
                    };
                    if let Err(e) = write.send(Message::text(text)).await {
                        warn!("writer stopping: {e}");
                        return;
                    }
                }
                Outbound::Close => {
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: "Work complete".into(),
                    };
                    if let Err(e) = write.send(Message::Close(Some(frame))).await {
                        warn!("failed to send close frame: {e}");
                    }
                    return;
                }
            }
        }
    });

    let close_code = loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => dispatcher.dispatch(text.as_str()).await,
            Some(Ok(Message::Close(frame))) => {
                let code = frame
                    .map(|frame| u16::from(frame.code))
                    .unwrap_or(NO_CLOSE_FRAME);
                info!("backend closed the connection with code {code}");
                break code;
            }
            Some(Ok(other)) => debug!("ignoring non-text frame: {other:?}"),
            Some(Err(e)) => {
                warn!("connection error: {e}");
                break NO_CLOSE_FRAME;
            }
            None => {
                warn!("connection ended without a close frame");
                break NO_CLOSE_FRAME;
            }
        }
    };

    // The backend is gone; nothing left to report results to.
    let killed = registry.terminate_all(Signal::SIGTERM);
    if killed > 0 {
        warn!("terminated {killed} processes left running at disconnect");
    }
    writer.abort();

    if close_code == u16::from(CloseCode::Normal) {
        Ok(())
    } else {
        Err(AgentError::ConnectionClosedAbnormally(close_code).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::companion::CompanionSupervisor;
    use crate::executor::ExecOptions;
    use crate::outbound::OutboundSender;
    use crate::shutdown::ShutdownCoordinator;
    use rea_common::config::CompanionConfig;
    use rea_common::protocol::RunnerMetadata;
    use serde_json::Value;
    use std::time::Duration;
    use tokio_tungstenite::accept_async;

    fn harness(backend_url: &str) -> (AgentConfig, CommandDispatcher, mpsc::UnboundedReceiver<Outbound>, Arc<ProcessRegistry>) {
        let config = AgentConfig::new(backend_url, "run-test", std::env::temp_dir());
        let registry = Arc::new(ProcessRegistry::new());
        let (outbound, rx) = OutboundSender::channel(RunnerMetadata::default());
        let companion = CompanionSupervisor::new(
            CompanionConfig {
                program: "false".to_string(),
                poll_interval: Duration::from_millis(50),
                max_health_attempts: 1,
                ..CompanionConfig::default()
            },
            std::env::temp_dir(),
            Arc::clone(&registry),
            outbound.clone(),
        );
        let shutdown = ShutdownCoordinator::new(
            Arc::clone(&registry),
            outbound.clone(),
            Duration::from_millis(10),
        );
        let exec = ExecOptions {
            shell: "/bin/bash".to_string(),
            workdir: std::env::temp_dir(),
            max_capture_bytes: 1024 * 1024,
            stream_output: false,
        };
        let dispatcher = CommandDispatcher::new(
            Arc::clone(&registry),
            companion,
            outbound,
            shutdown,
            exec,
        );
        (config, dispatcher, rx, registry)
    }

    #[tokio::test]
    async fn authenticates_executes_and_closes_normally() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();

            let hello = ws.next().await.unwrap().unwrap();
            let hello: Value = serde_json::from_str(hello.to_text().unwrap()).unwrap();
            assert_eq!(hello["type"], "auth");
            assert_eq!(hello["runId"], "run-test");

            ws.send(Message::text(
                r#"{"command":"execute_command","commandId":"cmd-1",
                    "params":{"command":"echo over-the-wire"}}"#,
            ))
            .await
            .unwrap();

            let response = loop {
                let msg = ws.next().await.unwrap().unwrap();
                let v: Value = serde_json::from_str(msg.to_text().unwrap()).unwrap();
                if v["command"] == "response" {
                    break v;
                }
            };
            assert_eq!(response["originalCommandId"], "cmd-1");
            assert_eq!(response["status"], "success");
            assert_eq!(response["payload"]["stdout"], "over-the-wire\n");

            ws.send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "done".into(),
            })))
            .await
            .unwrap();
        });

        let (config, dispatcher, rx, registry) = harness(&format!("ws://{addr}"));
        run(&config, dispatcher, rx, registry).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn abrupt_disconnect_is_an_error_and_sweeps_processes() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let _auth = ws.next().await.unwrap().unwrap();

            ws.send(Message::text(
                r#"{"command":"execute_command","commandId":"cmd-1",
                    "params":{"command":"sleep 30"}}"#,
            ))
            .await
            .unwrap();

            // Give the agent time to spawn, then vanish without a close
            // frame.
            tokio::time::sleep(Duration::from_millis(300)).await;
            drop(ws);
        });

        let (config, dispatcher, rx, registry) = harness(&format!("ws://{addr}"));
        let err = run(&config, dispatcher, rx, Arc::clone(&registry))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("closed abnormally"));
        assert!(registry.is_empty());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn bad_backend_url_fails_before_connecting() {
        let (config, dispatcher, rx, registry) = harness("ftp://backend");
        assert!(run(&config, dispatcher, rx, registry).await.is_err());
    }
}
