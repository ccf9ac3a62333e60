//! Server configuration, loaded from a TOML file with env overrides.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub state: StateConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default = "d_port")]
    pub port: u16,
    /// Origins allowed for CORS. Defaults to localhost-only.
    #[serde(default = "d_cors_origins")]
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: d_host(),
            port: d_port(),
            allowed_origins: d_cors_origins(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Maximum concurrent chat sessions across all sockets.
    #[serde(default = "d_max_sessions")]
    pub max_concurrent: usize,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            max_concurrent: d_max_sessions(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    /// Coarse deadline for upstream provider requests, in seconds.
    #[serde(default = "d_provider_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: d_provider_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Soft wall-clock deadline for one script execution, in seconds.
    #[serde(default = "d_script_timeout")]
    pub script_timeout_secs: u64,
    /// Operation budget handed to the script engine.
    #[serde(default = "d_max_operations")]
    pub max_operations: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            script_timeout_secs: d_script_timeout(),
            max_operations: d_max_operations(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Directory holding the JSON-file state store.
    #[serde(default = "d_state_path")]
    pub path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: d_state_path(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Loading & validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub message: String,
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl Config {
    /// Load from a TOML file; a missing file yields the defaults.
    pub fn load(path: &std::path::Path) -> crate::Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| crate::Error::Config(format!("{}: {e}", path.display())))
    }

    /// Sanity-check the loaded values. Errors abort startup; warnings are
    /// logged and the server continues.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.sessions.max_concurrent == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: "sessions.max_concurrent must be at least 1".into(),
            });
        }
        if self.sandbox.script_timeout_secs == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: "sandbox.script_timeout_secs must be at least 1".into(),
            });
        }
        if self.providers.request_timeout_secs < 10 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                message: format!(
                    "providers.request_timeout_secs = {} is very low; streaming \
                     responses may be cut off",
                    self.providers.request_timeout_secs
                ),
            });
        }
        if self.server.allowed_origins.iter().any(|o| o == "*") {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                message: "server.allowed_origins contains '*'".into(),
            });
        }

        issues
    }
}

fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_port() -> u16 {
    8710
}
fn d_cors_origins() -> Vec<String> {
    vec![
        "http://localhost:5173".into(),
        "http://127.0.0.1:5173".into(),
    ]
}
fn d_max_sessions() -> usize {
    100
}
fn d_provider_timeout() -> u64 {
    300
}
fn d_script_timeout() -> u64 {
    30
}
fn d_max_operations() -> u64 {
    5_000_000
}
fn d_state_path() -> PathBuf {
    PathBuf::from("./data")
}
