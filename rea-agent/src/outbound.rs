//! Outbound frame construction and delivery.
//!
//! Handlers never touch the socket. They hand finished frames to the
//! writer task through an unbounded channel; once the connection is gone
//! the channel closes and frames are dropped with a warning instead of
//! being sent into the void.

use rea_common::protocol::{LogPayload, LogStream, ResponseStatus, RunnerMessage, RunnerMetadata};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// An item queued for the connection writer task.
#[derive(Debug)]
pub enum Outbound {
    /// A serialized protocol frame.
    Frame(RunnerMessage),
    /// Close the connection with a normal-closure code.
    Close,
}

/// Cloneable handle for emitting frames toward the backend.
#[derive(Debug, Clone)]
pub struct OutboundSender {
    tx: mpsc::UnboundedSender<Outbound>,
    metadata: Arc<RunnerMetadata>,
}

impl OutboundSender {
    /// Create a sender plus the receiver end the writer task drains.
    pub fn channel(metadata: RunnerMetadata) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                metadata: Arc::new(metadata),
            },
            rx,
        )
    }

    /// Emit the terminal response for a command.
    ///
    /// Run metadata is attached to every response so the backend can
    /// attribute the result without a second lookup.
    pub fn send_response(&self, original_command_id: &str, status: ResponseStatus, payload: Value) {
        info!("sending response for {original_command_id} with status {status}");
        self.send(Outbound::Frame(RunnerMessage::Response {
            original_command_id: original_command_id.to_string(),
            status,
            payload,
            runner_metadata: Some((*self.metadata).clone()),
        }));
    }

    /// Emit an intermediate log chunk for a command.
    pub fn send_log(&self, command_id: &str, stream: LogStream, message: impl Into<String>) {
        self.send(Outbound::Frame(RunnerMessage::Log {
            command_id: command_id.to_string(),
            payload: LogPayload {
                stream,
                message: message.into(),
            },
        }));
    }

    /// Ask the writer to close the connection cleanly.
    pub fn close(&self) {
        self.send(Outbound::Close);
    }

    fn send(&self, item: Outbound) {
        if self.tx.send(item).is_err() {
            warn!("connection writer is gone; dropping outbound frame");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rea_common::protocol::ResponseStatus;
    use serde_json::json;

    fn metadata() -> RunnerMetadata {
        RunnerMetadata {
            github_repo: Some("acme/widget".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn response_carries_metadata_and_correlation_id() {
        let (sender, mut rx) = OutboundSender::channel(metadata());
        sender.send_response("cmd-1", ResponseStatus::Success, json!({"exitCode": 0}));

        let Outbound::Frame(frame) = rx.recv().await.unwrap() else {
            panic!("expected a frame");
        };
        let v = serde_json::to_value(&frame).unwrap();
        assert_eq!(v["command"], "response");
        assert_eq!(v["originalCommandId"], "cmd-1");
        assert_eq!(v["status"], "success");
        assert_eq!(v["runnerMetadata"]["githubRepo"], "acme/widget");
    }

    #[tokio::test]
    async fn log_frames_preserve_per_stream_order() {
        let (sender, mut rx) = OutboundSender::channel(RunnerMetadata::default());
        sender.send_log("cmd-1", LogStream::Stdout, "first");
        sender.send_log("cmd-1", LogStream::Stdout, "second");

        for expected in ["first", "second"] {
            let Outbound::Frame(frame) = rx.recv().await.unwrap() else {
                panic!("expected a frame");
            };
            let v = serde_json::to_value(&frame).unwrap();
            assert_eq!(v["command"], "log");
            assert_eq!(v["payload"]["stream"], "stdout");
            assert_eq!(v["payload"]["message"], expected);
        }
    }

    #[tokio::test]
    async fn sending_after_writer_is_gone_does_not_panic() {
        let (sender, rx) = OutboundSender::channel(RunnerMetadata::default());
        drop(rx);

        // Must be a silent drop, not a crash.
        sender.send_response("cmd-1", ResponseStatus::Error, json!({"message": "late"}));
        sender.send_log("cmd-1", LogStream::Stderr, "late");
        sender.close();
    }

    #[tokio::test]
    async fn close_is_queued_after_pending_frames() {
        let (sender, mut rx) = OutboundSender::channel(RunnerMetadata::default());
        sender.send_response("cmd-1", ResponseStatus::Success, json!({}));
        sender.close();

        assert!(matches!(rx.recv().await.unwrap(), Outbound::Frame(_)));
        assert!(matches!(rx.recv().await.unwrap(), Outbound::Close));
    }
}
