//! Agent configuration.
//!
//! CLI flags provide the required inputs (backend URL, run id); everything
//! else has a documented default and an optional `REA_`-prefixed
//! environment override. Overrides are validated up front so a bad value
//! fails the run at startup instead of mid-command.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Default shell used to run command lines.
pub const DEFAULT_SHELL: &str = "/bin/bash";

/// Ceiling on captured stdout/stderr per command (10 MiB).
pub const DEFAULT_MAX_CAPTURE_BYTES: usize = 10 * 1024 * 1024;

/// Global run deadline: one hour, then forced shutdown.
pub const DEFAULT_GLOBAL_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Delay after the close frame before exiting, so it can flush.
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Fixed local port the companion service listens on.
pub const DEFAULT_COMPANION_PORT: u16 = 4444;

/// Interval between companion health polls.
pub const DEFAULT_HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Health poll attempt ceiling (60 polls at 2s = 2 minute ceiling).
pub const DEFAULT_HEALTH_MAX_ATTEMPTS: u32 = 60;

/// Per-request timeout for forwarded companion calls.
pub const DEFAULT_COMPANION_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors raised while assembling configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },

    #[error("Value out of range for {var}: {value} (valid: {min}..={max})")]
    OutOfRange {
        var: String,
        value: String,
        min: String,
        max: String,
    },

    #[error("Unsupported backend URL scheme: {url}")]
    UnsupportedScheme { url: String },

    #[error("Backend URL has no host: {url}")]
    MissingHost { url: String },
}

/// Companion service lifecycle and forwarding settings.
#[derive(Debug, Clone)]
pub struct CompanionConfig {
    /// Executable started as the companion service.
    pub program: String,
    /// Local port its HTTP API listens on.
    pub port: u16,
    /// Health endpoint path polled during startup.
    pub health_path: String,
    /// Interval between health polls.
    pub poll_interval: Duration,
    /// Number of polls before the startup attempt is abandoned.
    pub max_health_attempts: u32,
    /// Timeout for each forwarded API request.
    pub request_timeout: Duration,
}

impl Default for CompanionConfig {
    fn default() -> Self {
        Self {
            program: "lsproxy".to_string(),
            port: DEFAULT_COMPANION_PORT,
            health_path: "/v1/system/health".to_string(),
            poll_interval: DEFAULT_HEALTH_POLL_INTERVAL,
            max_health_attempts: DEFAULT_HEALTH_MAX_ATTEMPTS,
            request_timeout: DEFAULT_COMPANION_REQUEST_TIMEOUT,
        }
    }
}

impl CompanionConfig {
    /// Base URL of the companion API, versioned prefix included.
    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}/v1", self.port)
    }

    /// Full URL of the health endpoint.
    pub fn health_url(&self) -> String {
        format!("http://127.0.0.1:{}{}", self.port, self.health_path)
    }
}

/// Full agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Backend base URL (http(s) or ws(s)).
    pub backend_url: String,
    /// Run identifier sent in the auth hello.
    pub run_id: String,
    /// Workspace the companion mounts and commands run in.
    pub workspace_dir: PathBuf,
    /// Shell used for `execute_command` lines.
    pub shell: String,
    /// Per-command captured output ceiling in bytes.
    pub max_capture_bytes: usize,
    /// Stream intermediate log frames per output chunk.
    pub stream_output: bool,
    /// Global deadline before forced shutdown.
    pub global_timeout: Duration,
    /// Close-frame flush delay on graceful terminate.
    pub close_grace: Duration,
    /// Companion service settings.
    pub companion: CompanionConfig,
}

impl AgentConfig {
    /// Build a config with defaults for everything but the required inputs.
    pub fn new(
        backend_url: impl Into<String>,
        run_id: impl Into<String>,
        workspace_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            backend_url: backend_url.into(),
            run_id: run_id.into(),
            workspace_dir: workspace_dir.into(),
            shell: DEFAULT_SHELL.to_string(),
            max_capture_bytes: DEFAULT_MAX_CAPTURE_BYTES,
            stream_output: false,
            global_timeout: DEFAULT_GLOBAL_TIMEOUT,
            close_grace: DEFAULT_CLOSE_GRACE,
            companion: CompanionConfig::default(),
        }
    }

    /// Apply `REA_` environment overrides, collecting every bad value.
    pub fn apply_env(&mut self) -> Result<(), Vec<ConfigError>> {
        let mut errors = Vec::new();

        if let Some(v) = env_string("REA_SHELL") {
            self.shell = v;
        }
        if let Some(v) = env_u64("REA_MAX_CAPTURE_BYTES", 1024, 1 << 30, &mut errors) {
            self.max_capture_bytes = v as usize;
        }
        if let Some(v) = env_bool("REA_STREAM_OUTPUT", &mut errors) {
            self.stream_output = v;
        }
        if let Some(v) = env_u64("REA_GLOBAL_TIMEOUT_SECS", 1, 24 * 60 * 60, &mut errors) {
            self.global_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_string("REA_COMPANION_PROGRAM") {
            self.companion.program = v;
        }
        if let Some(v) = env_u64("REA_COMPANION_PORT", 1, u16::MAX as u64, &mut errors) {
            self.companion.port = v as u16;
        }
        if let Some(v) = env_u64("REA_HEALTH_POLL_SECS", 1, 600, &mut errors) {
            self.companion.poll_interval = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("REA_HEALTH_MAX_ATTEMPTS", 1, 10_000, &mut errors) {
            self.companion.max_health_attempts = v as u32;
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    /// Derive the WebSocket endpoint from the backend URL.
    ///
    /// `https://host` maps to `wss://host/ws/sandbox`, `http://host` to
    /// `ws://host/ws/sandbox`; explicit ws(s) URLs keep their scheme. Any
    /// path on the input URL is discarded, only the host matters.
    pub fn websocket_url(&self) -> Result<String, ConfigError> {
        let url = self.backend_url.trim();
        let (scheme, rest) = if let Some(rest) = url.strip_prefix("https://") {
            ("wss", rest)
        } else if let Some(rest) = url.strip_prefix("http://") {
            ("ws", rest)
        } else if let Some(rest) = url.strip_prefix("wss://") {
            ("wss", rest)
        } else if let Some(rest) = url.strip_prefix("ws://") {
            ("ws", rest)
        } else {
            return Err(ConfigError::UnsupportedScheme {
                url: url.to_string(),
            });
        };

        let host = rest.split('/').next().unwrap_or("");
        if host.is_empty() {
            return Err(ConfigError::MissingHost {
                url: url.to_string(),
            });
        }

        Ok(format!("{scheme}://{host}/ws/sandbox"))
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_bool(name: &str, errors: &mut Vec<ConfigError>) -> Option<bool> {
    let value = std::env::var(name).ok()?;
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => {
            errors.push(ConfigError::InvalidValue {
                var: name.to_string(),
                expected: "boolean (true/false/1/0/yes/no)".to_string(),
                value,
            });
            None
        }
    }
}

fn env_u64(name: &str, min: u64, max: u64, errors: &mut Vec<ConfigError>) -> Option<u64> {
    let value = std::env::var(name).ok()?;
    match value.parse::<u64>() {
        Ok(n) if (min..=max).contains(&n) => Some(n),
        Ok(n) => {
            errors.push(ConfigError::OutOfRange {
                var: name.to_string(),
                value: n.to_string(),
                min: min.to_string(),
                max: max.to_string(),
            });
            None
        }
        Err(_) => {
            errors.push(ConfigError::InvalidValue {
                var: name.to_string(),
                expected: "unsigned integer".to_string(),
                value,
            });
            None
        }
    }
}

#[cfg(test)]
pub(crate) fn env_test_lock() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap()
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;

    fn set_env(key: &str, value: &str) {
        // SAFETY: Tests run single-threaded, no concurrent access to env vars
        unsafe { std::env::set_var(key, value) };
    }

    fn cleanup_env(vars: &[&str]) {
        for var in vars {
            // SAFETY: Tests run single-threaded, no concurrent access to env vars
            unsafe { std::env::remove_var(var) };
        }
    }

    fn base_config() -> AgentConfig {
        AgentConfig::new("https://backend.example.com", "run-1", "/tmp/ws")
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = base_config();
        assert_eq!(config.shell, "/bin/bash");
        assert_eq!(config.max_capture_bytes, 10 * 1024 * 1024);
        assert!(!config.stream_output);
        assert_eq!(config.global_timeout, Duration::from_secs(3600));
        assert_eq!(config.companion.port, 4444);
        assert_eq!(config.companion.max_health_attempts, 60);
        assert_eq!(config.companion.poll_interval, Duration::from_secs(2));
    }

    #[test]
    fn websocket_url_from_https() {
        let config = base_config();
        assert_eq!(
            config.websocket_url().unwrap(),
            "wss://backend.example.com/ws/sandbox"
        );
    }

    #[test]
    fn websocket_url_from_http_with_path() {
        let config = AgentConfig::new("http://localhost:8080/api/v2", "r", "/tmp");
        assert_eq!(
            config.websocket_url().unwrap(),
            "ws://localhost:8080/ws/sandbox"
        );
    }

    #[test]
    fn websocket_url_keeps_explicit_ws_scheme() {
        let config = AgentConfig::new("ws://10.0.0.1:9000", "r", "/tmp");
        assert_eq!(config.websocket_url().unwrap(), "ws://10.0.0.1:9000/ws/sandbox");
    }

    #[test]
    fn websocket_url_rejects_bad_scheme() {
        let config = AgentConfig::new("ftp://backend", "r", "/tmp");
        assert!(matches!(
            config.websocket_url(),
            Err(ConfigError::UnsupportedScheme { .. })
        ));
    }

    #[test]
    fn websocket_url_rejects_empty_host() {
        let config = AgentConfig::new("https://", "r", "/tmp");
        assert!(matches!(
            config.websocket_url(),
            Err(ConfigError::MissingHost { .. })
        ));
    }

    #[test]
    fn companion_urls() {
        let companion = CompanionConfig::default();
        assert_eq!(companion.base_url(), "http://127.0.0.1:4444/v1");
        assert_eq!(
            companion.health_url(),
            "http://127.0.0.1:4444/v1/system/health"
        );
    }

    #[test]
    fn apply_env_overrides_and_validation() {
        let _lock = env_test_lock();

        set_env("REA_MAX_CAPTURE_BYTES", "2048");
        set_env("REA_STREAM_OUTPUT", "yes");
        set_env("REA_COMPANION_PORT", "5555");

        let mut config = base_config();
        config.apply_env().unwrap();
        assert_eq!(config.max_capture_bytes, 2048);
        assert!(config.stream_output);
        assert_eq!(config.companion.port, 5555);

        set_env("REA_COMPANION_PORT", "not-a-port");
        let mut config = base_config();
        let errors = config.apply_env().unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], ConfigError::InvalidValue { .. }));
        // The bad override is ignored, the default survives.
        assert_eq!(config.companion.port, 4444);

        cleanup_env(&[
            "REA_MAX_CAPTURE_BYTES",
            "REA_STREAM_OUTPUT",
            "REA_COMPANION_PORT",
        ]);
    }

    #[test]
    fn out_of_range_override_is_collected() {
        let _lock = env_test_lock();

        set_env("REA_MAX_CAPTURE_BYTES", "1");
        let mut config = base_config();
        let errors = config.apply_env().unwrap_err();
        assert!(matches!(errors[0], ConfigError::OutOfRange { .. }));

        cleanup_env(&["REA_MAX_CAPTURE_BYTES"]);
    }
}
