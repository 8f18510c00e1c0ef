//! Server configuration: TOML file + environment + CLI overrides.
//!
//! Precedence, highest first: CLI flags, `API_KEY` / `SHELL_PORT`
//! environment variables, config file, built-in defaults.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use termbridge_core::{BridgeError, BridgeResult};
use tracing::{info, warn};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub shell: ShellSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

/// `[auth]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthSection {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_token_ttl")]
    pub token_ttl: u64,
    #[serde(default = "default_max_auth_attempts")]
    pub max_auth_attempts: u32,
    #[serde(default = "default_auth_window")]
    pub auth_window: u64,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            api_key: None,
            token_ttl: default_token_ttl(),
            max_auth_attempts: default_max_auth_attempts(),
            auth_window: default_auth_window(),
        }
    }
}

/// `[shell]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ShellSection {
    #[serde(default = "default_shell_path")]
    pub path: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_read_chunk")]
    pub read_chunk: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
}

impl Default for ShellSection {
    fn default() -> Self {
        Self {
            path: default_shell_path(),
            args: Vec::new(),
            read_chunk: default_read_chunk(),
            poll_interval_ms: default_poll_interval_ms(),
            write_timeout_ms: default_write_timeout_ms(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    5001
}
fn default_token_ttl() -> u64 {
    86400
}
fn default_max_auth_attempts() -> u32 {
    5
}
fn default_auth_window() -> u64 {
    60
}
fn default_shell_path() -> String {
    "/bin/bash".to_string()
}
fn default_read_chunk() -> usize {
    20 * 1024
}
fn default_poll_interval_ms() -> u64 {
    100
}
fn default_write_timeout_ms() -> u64 {
    5000
}

/// How shells are spawned and pumped.
#[derive(Debug, Clone)]
pub struct ShellSettings {
    pub path: PathBuf,
    pub args: Vec<String>,
    pub read_chunk: usize,
    pub poll_interval: Duration,
    pub write_timeout: Duration,
}

impl Default for ShellSettings {
    fn default() -> Self {
        ShellSettings::from(ShellSection::default())
    }
}

impl From<ShellSection> for ShellSettings {
    fn from(s: ShellSection) -> Self {
        Self {
            path: expand_tilde_str(&s.path),
            args: s.args,
            read_chunk: s.read_chunk.max(1),
            poll_interval: Duration::from_millis(s.poll_interval_ms.max(1)),
            write_timeout: Duration::from_millis(s.write_timeout_ms),
        }
    }
}

/// Overrides collected from the command line.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub port: Option<u16>,
    pub bind: Option<String>,
    pub shell: Option<String>,
}

/// Overrides collected from the process environment.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    pub api_key: Option<String>,
    pub port: Option<u16>,
}

impl EnvOverrides {
    /// Read `API_KEY` and `SHELL_PORT`.
    pub fn from_process() -> Self {
        let port = match std::env::var("SHELL_PORT") {
            Ok(raw) => match raw.parse() {
                Ok(p) => Some(p),
                Err(e) => {
                    warn!(value = %raw, error = %e, "ignoring invalid SHELL_PORT");
                    None
                }
            },
            Err(_) => None,
        };
        Self {
            api_key: std::env::var("API_KEY").ok().filter(|k| !k.is_empty()),
            port,
        }
    }
}

/// Resolved server configuration (paths expanded, overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub api_key: String,
    pub token_ttl: u64,
    pub max_auth_attempts: u32,
    pub auth_window: u64,
    pub shell: ShellSettings,
}

impl ServerConfig {
    /// Load config from a TOML file, then apply environment and CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        env: EnvOverrides,
        cli: CliOverrides,
    ) -> BridgeResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse_config(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Self::resolve(file_config, env, cli)
    }

    fn resolve(file: ConfigFile, env: EnvOverrides, cli: CliOverrides) -> BridgeResult<Self> {
        let api_key = env
            .api_key
            .or(file.auth.api_key)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                BridgeError::Config(
                    "no API key configured (set API_KEY or [auth].api_key)".into(),
                )
            })?;

        let port = cli.port.or(env.port).unwrap_or(file.server.port);
        let bind = cli.bind.unwrap_or(file.server.bind);

        let mut shell_section = file.shell;
        if let Some(shell) = cli.shell {
            shell_section.path = shell;
        }

        Ok(Self {
            bind,
            port,
            api_key,
            token_ttl: file.auth.token_ttl,
            max_auth_attempts: file.auth.max_auth_attempts,
            auth_window: file.auth.auth_window,
            shell: ShellSettings::from(shell_section),
        })
    }

    /// `bind:port` string for the listener.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse_config(content: &str) -> BridgeResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| BridgeError::Config(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
