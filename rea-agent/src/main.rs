//! Remote execution agent entry point.
//!
//! Connects to the control backend over a WebSocket, executes backend
//! commands as local processes, supervises the companion
//! code-intelligence service, and streams correlated results back until
//! the run ends.

#![forbid(unsafe_code)]

mod companion;
mod connection;
mod dispatch;
mod executor;
mod outbound;
mod registry;
mod shutdown;

use anyhow::bail;
use clap::Parser;
use companion::CompanionSupervisor;
use dispatch::CommandDispatcher;
use executor::ExecOptions;
use outbound::OutboundSender;
use rea_common::config::AgentConfig;
use rea_common::logging::{LogConfig, init_logging};
use rea_common::protocol::RunnerMetadata;
use registry::ProcessRegistry;
use shutdown::ShutdownCoordinator;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "rea-agent",
    version,
    about = "Remote execution agent for sandboxed CI runs"
)]
struct Cli {
    /// Backend base URL (http(s) or ws(s)); the agent derives the
    /// WebSocket endpoint from it.
    #[arg(long, env = "REA_BACKEND_URL")]
    backend_url: String,

    /// Run identifier presented in the auth hello.
    #[arg(long, env = "REA_RUN_ID")]
    run_id: String,

    /// Workspace directory commands run in and the companion mounts.
    #[arg(long, env = "GITHUB_WORKSPACE", default_value = "/github/workspace")]
    workspace: PathBuf,

    /// Forward stdout/stderr chunks as intermediate log frames.
    #[arg(long)]
    stream_output: bool,

    /// Start the companion service in the background at startup instead
    /// of waiting for the first start action.
    #[arg(long)]
    autostart_companion: bool,

    /// Enable debug logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env("info").with_stderr();
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    if let Err(e) = init_logging(&log_config) {
        eprintln!("failed to initialize logging: {e}");
    }

    let mut config = AgentConfig::new(cli.backend_url, cli.run_id, cli.workspace);
    if let Err(errors) = config.apply_env() {
        let rendered: Vec<String> = errors.iter().map(ToString::to_string).collect();
        bail!("invalid configuration:\n  {}", rendered.join("\n  "));
    }
    config.stream_output |= cli.stream_output;

    info!(
        "agent starting for run {} (workspace {})",
        config.run_id,
        config.workspace_dir.display()
    );

    let registry = Arc::new(ProcessRegistry::new());
    let (outbound, outbound_rx) = OutboundSender::channel(RunnerMetadata::from_env());

    let companion = CompanionSupervisor::new(
        config.companion.clone(),
        config.workspace_dir.clone(),
        Arc::clone(&registry),
        outbound.clone(),
    );
    if cli.autostart_companion {
        let companion = companion.clone();
        tokio::spawn(async move {
            if let Err(e) = companion.start().await {
                warn!("background companion start failed: {e}");
            }
        });
    }

    let shutdown = ShutdownCoordinator::new(
        Arc::clone(&registry),
        outbound.clone(),
        config.close_grace,
    );
    shutdown.arm(config.global_timeout);

    let dispatcher = CommandDispatcher::new(
        Arc::clone(&registry),
        companion,
        outbound,
        shutdown,
        ExecOptions {
            shell: config.shell.clone(),
            workdir: config.workspace_dir.clone(),
            max_capture_bytes: config.max_capture_bytes,
            stream_output: config.stream_output,
        },
    );

    connection::run(&config, dispatcher, outbound_rx, registry).await?;
    info!("run complete");
    Ok(())
}
