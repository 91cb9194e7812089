//! Server configuration: TOML file + CLI overrides.

use crate::session::ManagerConfig;
use ptyhub_core::{PtyError, PtyResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub sessions: SessionsSection,
}

/// `[sessions]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionsSection {
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_max_sessions_per_user")]
    pub max_sessions_per_user: usize,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_buffer_chunks")]
    pub buffer_chunks: usize,
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,
    #[serde(default = "default_close_grace")]
    pub close_grace_ms: u64,
    #[serde(default = "default_shell")]
    pub default_shell: String,
    #[serde(default)]
    pub default_cwd: Option<String>,
    #[serde(default = "default_true")]
    pub skip_shell_rc: bool,
}

impl Default for SessionsSection {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            max_sessions_per_user: default_max_sessions_per_user(),
            max_sessions: default_max_sessions(),
            buffer_chunks: default_buffer_chunks(),
            read_chunk_size: default_read_chunk_size(),
            close_grace_ms: default_close_grace(),
            default_shell: default_shell(),
            default_cwd: None,
            skip_shell_rc: true,
        }
    }
}

fn default_idle_timeout() -> u64 {
    1800
}
fn default_sweep_interval() -> u64 {
    60
}
fn default_max_sessions_per_user() -> usize {
    20
}
fn default_max_sessions() -> usize {
    200
}
fn default_buffer_chunks() -> usize {
    10_000
}
fn default_read_chunk_size() -> usize {
    4096
}
fn default_close_grace() -> u64 {
    1000
}
fn default_shell() -> String {
    "bash".to_string()
}
fn default_true() -> bool {
    true
}

/// Values given on the command line; `None` keeps the file's value.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub idle_timeout_secs: Option<u64>,
    pub sweep_interval_secs: Option<u64>,
    pub max_sessions_per_user: Option<usize>,
    pub max_sessions: Option<usize>,
    pub shell: Option<String>,
    pub cwd: Option<String>,
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub max_sessions_per_user: usize,
    pub max_sessions: usize,
    pub buffer_chunks: usize,
    pub read_chunk_size: usize,
    pub close_grace: Duration,
    pub default_shell: String,
    pub default_cwd: Option<PathBuf>,
    pub skip_shell_rc: bool,
}

impl ServerConfig {
    /// Load config from a TOML file, then apply CLI overrides.
    ///
    /// A missing file means defaults; an unreadable or malformed one is an error.
    pub fn load(config_path: Option<&Path>, overrides: &ConfigOverrides) -> PtyResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded).map_err(|e| {
                        PtyError::Config(format!("cannot read {}: {e}", expanded.display()))
                    })?;
                    parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Self::resolve(file_config.sessions, overrides)
    }

    fn resolve(file: SessionsSection, overrides: &ConfigOverrides) -> PtyResult<Self> {
        let idle_timeout_secs = overrides.idle_timeout_secs.unwrap_or(file.idle_timeout_secs);
        let sweep_interval_secs = overrides
            .sweep_interval_secs
            .unwrap_or(file.sweep_interval_secs);
        let max_sessions_per_user = overrides
            .max_sessions_per_user
            .unwrap_or(file.max_sessions_per_user);
        let max_sessions = overrides.max_sessions.unwrap_or(file.max_sessions);
        let default_shell = overrides.shell.clone().unwrap_or(file.default_shell);
        let default_cwd = overrides.cwd.clone().or(file.default_cwd);

        if idle_timeout_secs == 0 {
            return Err(PtyError::Config("idle_timeout_secs must be positive".into()));
        }
        if sweep_interval_secs == 0 {
            return Err(PtyError::Config("sweep_interval_secs must be positive".into()));
        }
        if max_sessions_per_user == 0 || max_sessions == 0 {
            return Err(PtyError::Config("session limits must be positive".into()));
        }
        if file.buffer_chunks == 0 || file.read_chunk_size == 0 {
            return Err(PtyError::Config(
                "buffer_chunks and read_chunk_size must be positive".into(),
            ));
        }
        if default_shell.trim().is_empty() {
            return Err(PtyError::Config("default_shell is empty".into()));
        }

        Ok(Self {
            idle_timeout: Duration::from_secs(idle_timeout_secs),
            sweep_interval: Duration::from_secs(sweep_interval_secs),
            max_sessions_per_user,
            max_sessions,
            buffer_chunks: file.buffer_chunks,
            read_chunk_size: file.read_chunk_size,
            close_grace: Duration::from_millis(file.close_grace_ms),
            default_shell,
            default_cwd: default_cwd.as_deref().map(expand_tilde_str),
            skip_shell_rc: file.skip_shell_rc,
        })
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            idle_timeout: self.idle_timeout,
            sweep_interval: self.sweep_interval,
            max_sessions_per_user: self.max_sessions_per_user,
            max_sessions: self.max_sessions,
            buffer_chunks: self.buffer_chunks,
            read_chunk_size: self.read_chunk_size,
            close_grace: self.close_grace,
            default_shell: self.default_shell.clone(),
            default_cwd: self.default_cwd.clone(),
            skip_shell_rc: self.skip_shell_rc,
        }
    }
}

fn parse(content: &str) -> PtyResult<ConfigFile> {
    toml::from_str(content).map_err(|e| PtyError::Config(format!("config parse error: {e}")))
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_without_file() {
        let cfg = ServerConfig::load(None, &ConfigOverrides::default()).unwrap();
        assert_eq!(cfg.idle_timeout, Duration::from_secs(1800));
        assert_eq!(cfg.sweep_interval, Duration::from_secs(60));
        assert_eq!(cfg.max_sessions_per_user, 20);
        assert_eq!(cfg.max_sessions, 200);
        assert_eq!(cfg.buffer_chunks, 10_000);
        assert_eq!(cfg.read_chunk_size, 4096);
        assert_eq!(cfg.close_grace, Duration::from_millis(1000));
        assert_eq!(cfg.default_shell, "bash");
        assert_eq!(cfg.default_cwd, None);
        assert!(cfg.skip_shell_rc);
    }

    #[test]
    fn missing_file_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let cfg = ServerConfig::load(Some(&path), &ConfigOverrides::default()).unwrap();
        assert_eq!(cfg.max_sessions_per_user, 20);
    }

    #[test]
    fn file_values_then_cli_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[sessions]
idle_timeout_secs = 600
max_sessions_per_user = 5
default_shell = "zsh"
default_cwd = "/srv/work"
close_grace_ms = 250
"#
        )
        .unwrap();

        let overrides = ConfigOverrides {
            max_sessions_per_user: Some(3),
            ..ConfigOverrides::default()
        };
        let cfg = ServerConfig::load(Some(file.path()), &overrides).unwrap();
        assert_eq!(cfg.idle_timeout, Duration::from_secs(600));
        assert_eq!(cfg.max_sessions_per_user, 3);
        assert_eq!(cfg.default_shell, "zsh");
        assert_eq!(cfg.default_cwd, Some(PathBuf::from("/srv/work")));
        assert_eq!(cfg.close_grace, Duration::from_millis(250));
        // Untouched keys keep their defaults.
        assert_eq!(cfg.sweep_interval, Duration::from_secs(60));

        let manager = cfg.manager_config();
        assert_eq!(manager.max_sessions_per_user, 3);
        assert_eq!(manager.default_shell, "zsh");
    }

    #[test]
    fn malformed_file_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[sessions]\nidle_timeout_secs = \"soon\"").unwrap();
        let err = ServerConfig::load(Some(file.path()), &ConfigOverrides::default()).unwrap_err();
        assert!(matches!(err, PtyError::Config(_)));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[sessions]\nidle_timeout = 5").unwrap();
        assert!(matches!(
            ServerConfig::load(Some(file.path()), &ConfigOverrides::default()),
            Err(PtyError::Config(_))
        ));
    }

    #[test]
    fn zero_limits_are_rejected() {
        let overrides = ConfigOverrides {
            max_sessions_per_user: Some(0),
            ..ConfigOverrides::default()
        };
        assert!(matches!(
            ServerConfig::load(None, &overrides),
            Err(PtyError::Config(_))
        ));
    }

    #[test]
    fn tilde_expands_to_home() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde_str("~/work"), home.join("work"));
        }
        assert_eq!(expand_tilde_str("/abs"), PathBuf::from("/abs"));
    }
}
