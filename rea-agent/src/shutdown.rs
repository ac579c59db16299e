//! Run teardown: graceful terminate and the global deadline.
//!
//! Both paths converge on the same sweep: every registered process gets
//! SIGKILL, including the companion under its sentinel id. Graceful
//! terminate additionally acknowledges the command, asks the writer to
//! close the connection, and waits a short grace period so the close
//! frame can flush. Either way the process exits; there is nothing to
//! hand back to.

use crate::outbound::OutboundSender;
use crate::registry::ProcessRegistry;
use nix::sys::signal::Signal;
use rea_common::errors::AgentError;
use rea_common::protocol::ResponseStatus;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Coordinates the one-way transition into shutdown.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    registry: Arc<ProcessRegistry>,
    outbound: OutboundSender,
    grace: Duration,
    shutting_down: Arc<AtomicBool>,
    timer: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ShutdownCoordinator {
    pub fn new(registry: Arc<ProcessRegistry>, outbound: OutboundSender, grace: Duration) -> Self {
        Self {
            registry,
            outbound,
            grace,
            shutting_down: Arc::new(AtomicBool::new(false)),
            timer: Arc::new(Mutex::new(None)),
        }
    }

    /// Arm the global run deadline. When it fires, every process is
    /// killed and the agent exits with a failure code.
    pub fn arm(&self, deadline: Duration) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            this.force_shutdown(deadline);
        });
        *self.lock_timer() = Some(handle);
    }

    /// Whether a shutdown path has already been entered.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Graceful terminate requested by the backend.
    ///
    /// Acknowledges the terminate command (when it carried an id), kills
    /// everything, closes the connection cleanly, and exits 0 after the
    /// grace period.
    pub async fn terminate(&self, command_id: Option<String>) -> ! {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            warn!("terminate received while already shutting down");
        }
        if let Some(handle) = self.lock_timer().take() {
            handle.abort();
        }

        info!("terminate received; shutting down");
        if let Some(id) = command_id {
            self.outbound.send_response(
                &id,
                ResponseStatus::Success,
                json!({"message": "Runner terminating."}),
            );
        }

        let killed = self.registry.terminate_all(Signal::SIGKILL);
        info!("killed {killed} remaining processes");

        self.outbound.close();
        tokio::time::sleep(self.grace).await;
        std::process::exit(0);
    }

    /// The global deadline fired: kill everything and exit non-zero.
    fn force_shutdown(&self, deadline: Duration) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        error!(
            "{} after {}s; forcing shutdown",
            AgentError::GlobalTimeout,
            deadline.as_secs()
        );
        let killed = self.registry.terminate_all(Signal::SIGKILL);
        error!("killed {killed} processes during forced shutdown");
        std::process::exit(1);
    }

    fn lock_timer(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.timer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rea_common::protocol::RunnerMetadata;

    // The exit paths themselves are covered by the end-to-end tests,
    // which observe the spawned binary's exit code. Here we only cover
    // the state that can be observed from inside the process.

    #[tokio::test]
    async fn armed_timer_can_be_disarmed() {
        let registry = Arc::new(ProcessRegistry::new());
        let (outbound, _rx) = OutboundSender::channel(RunnerMetadata::default());
        let coordinator =
            ShutdownCoordinator::new(registry, outbound, Duration::from_millis(10));

        coordinator.arm(Duration::from_secs(3600));
        assert!(!coordinator.is_shutting_down());

        let handle = coordinator.lock_timer().take().unwrap();
        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn shutdown_flag_starts_clear() {
        let registry = Arc::new(ProcessRegistry::new());
        let (outbound, _rx) = OutboundSender::channel(RunnerMetadata::default());
        let coordinator =
            ShutdownCoordinator::new(registry, outbound, Duration::from_millis(10));
        assert!(!coordinator.is_shutting_down());
    }
}
