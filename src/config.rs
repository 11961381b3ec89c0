// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Layered configuration: defaults, user config, explicit file, environment.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Fallback for `disconnect_timeout` when unset or non-positive.
pub const DEFAULT_DISCONNECT_TIMEOUT_SECS: i64 = 5;

/// Top-level configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Per-request timeout in seconds (default: 30).
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,

    /// Timeout for the `initialize` handshake in seconds (default: 30).
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout: u64,

    /// Grace period before a process is killed after `exit`, in ms (default: 1000).
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// How server start failures are surfaced.
    #[serde(default)]
    pub error_reporting: ErrorReporting,

    /// Language hierarchy keyed by language id.
    #[serde(default)]
    pub language: HashMap<String, LanguageConfig>,

    /// Server definitions, in registration order.
    #[serde(default)]
    pub server: Vec<ServerConfig>,
}

/// A declared language.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct LanguageConfig {
    /// Parent language, e.g. `python` for `django-python`.
    #[serde(default)]
    pub base: Option<String>,
}

/// Whether a session is shared by all workspace roots or bound to one.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ServerScope {
    /// One session per workspace root.
    Project,
    /// One session for the whole manager.
    #[default]
    Application,
}

/// Policy for surfacing server start failures.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorReporting {
    /// Keep quiet; the session still becomes `Failed`.
    None,
    /// Broadcast a `ServerError` lifecycle event.
    #[default]
    Notification,
    /// Log the failure at error level.
    InLog,
}

/// One `[[server]]` entry.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Stable unique id.
    pub id: String,

    /// Display name; defaults to the id.
    #[serde(default)]
    pub label: Option<String>,

    /// Free-form description.
    #[serde(default)]
    pub description: Option<String>,

    /// Program to execute (e.g., "pyright-langserver").
    #[serde(default)]
    pub command: Option<String>,

    /// Arguments to pass to the command.
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory of the process; defaults to the workspace root.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Extra environment variables for the process.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// `host:port` of a server to reach over TCP instead of spawning one.
    #[serde(default)]
    pub address: Option<String>,

    /// At most one live session per scope key.
    #[serde(default)]
    pub singleton: bool,

    /// Sharing scope of the sessions.
    #[serde(default)]
    pub scope: ServerScope,

    /// Seconds a session survives without documents.
    #[serde(default = "default_disconnect_timeout")]
    pub disconnect_timeout: i64,

    /// Disabled servers never match.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Sent as `initializationOptions`.
    #[serde(default)]
    pub initialization_options: Option<serde_json::Value>,

    /// Pushed through `workspace/didChangeConfiguration`.
    #[serde(default)]
    pub settings: Option<serde_json::Value>,

    /// Language associations of this server.
    #[serde(default)]
    pub languages: Vec<LanguageBinding>,
}

/// A `[[server.languages]]` entry.
#[derive(Debug, Deserialize, Clone)]
pub struct LanguageBinding {
    /// Editor language id.
    pub language: String,

    /// LSP `languageId` sent in `didOpen`; defaults to `language`.
    #[serde(default)]
    pub language_id: Option<String>,

    /// Optional file globs narrowing the association.
    #[serde(default)]
    pub patterns: Vec<String>,
}

const fn default_request_timeout() -> u64 {
    30
}

const fn default_handshake_timeout() -> u64 {
    30
}

const fn default_shutdown_grace_ms() -> u64 {
    1000
}

const fn default_disconnect_timeout() -> i64 {
    DEFAULT_DISCONNECT_TIMEOUT_SECS
}

const fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            request_timeout: default_request_timeout(),
            handshake_timeout: default_handshake_timeout(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            error_reporting: ErrorReporting::default(),
            language: HashMap::new(),
            server: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from standard paths or a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be read or the merged result does
    /// not deserialize.
    pub fn load(explicit_file: Option<PathBuf>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .set_default("request_timeout", default_request_timeout())?
            .set_default("handshake_timeout", default_handshake_timeout())?
            .set_default("shutdown_grace_ms", default_shutdown_grace_ms())?;

        // ~/.config/switchyard/config.toml
        if let Some(config_dir) = dirs::config_dir() {
            let config_path = config_dir.join("switchyard").join("config.toml");
            if config_path.exists() {
                builder = builder.add_source(config::File::from(config_path));
            }
        }

        if let Some(path) = explicit_file {
            builder = builder.add_source(config::File::from(path));
        }

        // SWITCHYARD_REQUEST_TIMEOUT, SWITCHYARD_ERROR_REPORTING, ...
        builder = builder.add_source(config::Environment::with_prefix("SWITCHYARD"));

        let config = builder.build().context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Parses configuration from a TOML string, without the other layers.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid configuration.
    pub fn from_toml(text: &str) -> Result<Self> {
        config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Per-request timeout.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    /// Handshake timeout.
    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout)
    }

    /// Grace period before killing a stopped server process.
    #[must_use]
    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl ServerConfig {
    /// Effective disconnect timeout; non-positive values fall back to the default.
    #[must_use]
    pub fn disconnect_timeout(&self) -> Duration {
        let secs = if self.disconnect_timeout > 0 {
            self.disconnect_timeout
        } else {
            DEFAULT_DISCONNECT_TIMEOUT_SECS
        };
        Duration::from_secs(secs.unsigned_abs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
request_timeout = 10
error_reporting = "in_log"

[language.python]
[language.django-python]
base = "python"

[[server]]
id = "pyright"
label = "Pyright"
command = "pyright-langserver"
args = ["--stdio"]
scope = "project"
disconnect_timeout = 0
settings = { python = { analysis = { mode = "basic" } } }

[[server.languages]]
language = "python"
patterns = ["*.py", "*.pyi"]

[[server]]
id = "ruff"
address = "127.0.0.1:9000"
singleton = true
enabled = false

[[server.languages]]
language = "python"
language_id = "python"
"#;

    #[test]
    fn test_parse_full_document() -> Result<()> {
        let config = Config::from_toml(SAMPLE)?;
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.handshake_timeout(), Duration::from_secs(30));
        assert_eq!(config.shutdown_grace(), Duration::from_millis(1000));
        assert_eq!(config.error_reporting, ErrorReporting::InLog);

        let django = config
            .language
            .get("django-python")
            .context("missing django-python")?;
        assert_eq!(django.base.as_deref(), Some("python"));

        assert_eq!(config.server.len(), 2);
        let pyright = &config.server[0];
        assert_eq!(pyright.scope, ServerScope::Project);
        assert!(pyright.enabled);
        assert!(!pyright.singleton);
        assert_eq!(pyright.languages[0].patterns, vec!["*.py", "*.pyi"]);
        assert_eq!(
            pyright.settings.as_ref().map(|s| s["python"]["analysis"]["mode"].clone()),
            Some(serde_json::json!("basic"))
        );

        let ruff = &config.server[1];
        assert_eq!(ruff.scope, ServerScope::Application);
        assert!(ruff.singleton);
        assert!(!ruff.enabled);
        assert_eq!(ruff.address.as_deref(), Some("127.0.0.1:9000"));
        Ok(())
    }

    #[test]
    fn test_non_positive_disconnect_timeout_falls_back() -> Result<()> {
        let config = Config::from_toml(SAMPLE)?;
        assert_eq!(config.server[0].disconnect_timeout(), Duration::from_secs(5));
        assert_eq!(config.server[1].disconnect_timeout(), Duration::from_secs(5));
        Ok(())
    }

    #[test]
    fn test_empty_document_uses_defaults() -> Result<()> {
        let config = Config::from_toml("")?;
        assert_eq!(config.request_timeout, 30);
        assert_eq!(config.error_reporting, ErrorReporting::Notification);
        assert!(config.server.is_empty());
        Ok(())
    }
}
