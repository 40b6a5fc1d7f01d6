//! Durable and volatile server descriptions.
//!
//! A [`ServerRecord`] is the durable catalog entry for an installed MCP
//! server; a [`ServerStatus`] is its volatile runtime state. Both are value
//! records: updates go through copy-on-write in the registry, never through
//! shared in-place mutation.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Invocation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How to launch a server process: command, arguments, working directory,
/// and an environment overlay on top of the host environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Invocation {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ServerRecord
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How a server record came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum InstallMethod {
    #[default]
    Enhanced,
    LegacyNpm,
    LegacyPip,
    LegacyGit,
    Manual,
}

/// Installer bookkeeping attached to a record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMetadata {
    #[serde(default)]
    pub install_path: Option<PathBuf>,
    #[serde(default)]
    pub install_id: Option<String>,
    /// Security scan summary from the last install, kept as an open record.
    #[serde(default)]
    pub security: Option<serde_json::Value>,
    #[serde(default)]
    pub auto_start: bool,
}

/// The durable description of an installed server.
///
/// Created by the installer, mutated only by the registry, destroyed on
/// uninstall.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    pub invocation: Invocation,
    #[serde(default)]
    pub install_method: InstallMethod,
    #[serde(default)]
    pub install_url: Option<String>,
    #[serde(default)]
    pub metadata: ServerMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ServerRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>, invocation: Invocation) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            version: None,
            invocation,
            install_method: InstallMethod::default(),
            install_url: None,
            metadata: ServerMetadata::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Validate the invariants the registry enforces on insert.
    pub fn validate(&self) -> Result<()> {
        validate_server_id(&self.id)?;
        if self.invocation.command.trim().is_empty() {
            return Err(Error::registry(format!(
                "server '{}' has an empty command",
                self.id
            )));
        }
        Ok(())
    }
}

/// Server ids are restricted to `[A-Za-z0-9_-]+`.
pub fn validate_server_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::registry("server id is empty"));
    }
    if let Some(bad) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
    {
        return Err(Error::registry(format!(
            "server id '{id}' contains invalid character '{bad}'"
        )));
    }
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ServerStatus
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Lifecycle state of a peer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    Reconnecting,
    Error,
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// The volatile runtime state associated with a [`ServerRecord`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    #[serde(default)]
    pub state: ServerState,
    #[serde(default)]
    pub last_started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_stopped: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub restart_count: u32,
    #[serde(default)]
    pub error_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Set while running.
    #[serde(default)]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub version_capabilities: Vec<String>,
    #[serde(default)]
    pub pid: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_character_class() {
        assert!(validate_server_id("my-server_2").is_ok());
        assert!(validate_server_id("").is_err());
        assert!(validate_server_id("bad id").is_err());
        assert!(validate_server_id("no/slash").is_err());
        assert!(validate_server_id("no.dot").is_err());
    }

    #[test]
    fn record_validation_requires_command() {
        let mut record = ServerRecord::new("s1", "Server One", Invocation::new("node"));
        assert!(record.validate().is_ok());
        record.invocation.command = "  ".into();
        assert!(record.validate().is_err());
    }

    #[test]
    fn record_round_trips_through_json() {
        let record = ServerRecord::new(
            "echo",
            "Echo",
            Invocation::new("node")
                .with_args(["dist/index.js"])
                .with_cwd("/tmp/echo")
                .with_env_var("DEBUG", "1"),
        );
        let json = serde_json::to_string(&record).unwrap();
        let parsed: ServerRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, "echo");
        assert_eq!(parsed.invocation, record.invocation);
    }

    #[test]
    fn install_method_serializes_kebab_case() {
        let json = serde_json::to_string(&InstallMethod::LegacyNpm).unwrap();
        assert_eq!(json, "\"legacy-npm\"");
    }

    #[test]
    fn status_defaults_to_stopped() {
        let status = ServerStatus::default();
        assert_eq!(status.state, ServerState::Stopped);
        assert_eq!(status.restart_count, 0);
        assert!(status.pid.is_none());
    }
}
