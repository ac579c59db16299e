//! Logging initialization shared by the agent binary and test harnesses.
//!
//! Log output goes to stderr so it never interleaves with anything a
//! wrapping CI step captures from stdout.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Filter directive (a level like `info` or a full EnvFilter spec).
    pub level: String,
    /// Write to stderr instead of stdout.
    pub use_stderr: bool,
}

impl LogConfig {
    /// Build from the `REA_LOG` environment variable, falling back to the
    /// given default level.
    pub fn from_env(default_level: &str) -> Self {
        let level = std::env::var("REA_LOG")
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| default_level.to_string());
        Self {
            level,
            use_stderr: false,
        }
    }

    pub fn with_level(mut self, level: &str) -> Self {
        self.level = level.to_string();
        self
    }

    pub fn with_stderr(mut self) -> Self {
        self.use_stderr = true;
        self
    }
}

/// Install the global tracing subscriber.
///
/// Safe to call once per process; later calls return an error rather
/// than panicking, which keeps test binaries that race on initialization
/// harmless.
pub fn init_logging(config: &LogConfig) -> Result<(), String> {
    let filter = EnvFilter::try_new(&config.level)
        .map_err(|e| format!("invalid log filter '{}': {e}", config.level))?;

    let result = if config.use_stderr {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .try_init()
    };

    result.map_err(|e| format!("failed to install tracing subscriber: {e}"))
}
