//! Host runtime configuration.
//!
//! All knobs the runtime exposes, with serde defaults so a partial config
//! file (or none at all) yields a working host. Paths are resolved at
//! construction; nothing here reads module-scope globals.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HostConfig {
    #[serde(default)]
    pub client: ClientInfoConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub installer: InstallerConfig,
    #[serde(default)]
    pub paths: PathsConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client identity
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Sent to every peer in the `initialize` clientInfo block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfoConfig {
    #[serde(default = "d_client_name")]
    pub name: String,
    #[serde(default = "d_client_version")]
    pub version: String,
}

impl Default for ClientInfoConfig {
    fn default() -> Self {
        Self {
            name: d_client_name(),
            version: d_client_version(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session / transport timing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Per-RPC deadline.
    #[serde(default = "d_30000")]
    pub call_timeout_ms: u64,
    /// Linear back-off base: wait `reconnect_delay_ms * attempt`.
    #[serde(default = "d_2000")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "d_3")]
    pub max_reconnect_attempts: u32,
    /// Grace period between SIGTERM and SIGKILL on stop.
    #[serde(default = "d_5000")]
    pub stop_grace_ms: u64,
    /// Pause between stop and start during a restart.
    #[serde(default = "d_1000")]
    pub restart_pause_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 30_000,
            reconnect_delay_ms: 2_000,
            max_reconnect_attempts: 3,
            stop_grace_ms: 5_000,
            restart_pause_ms: 1_000,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Installer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallerConfig {
    /// Cache entries older than this are re-acquired.
    #[serde(default = "d_7")]
    pub cache_ttl_days: u32,
    /// Per external command (clone, pack, install).
    #[serde(default = "d_300000")]
    pub command_timeout_ms: u64,
    /// Per build command.
    #[serde(default = "d_600000")]
    pub build_timeout_ms: u64,
    #[serde(default = "d_3")]
    pub max_retries: u32,
    #[serde(default = "d_true")]
    pub auto_retry: bool,
    /// High-risk security findings block the install unless set.
    #[serde(default)]
    pub allow_high_risk: bool,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            cache_ttl_days: 7,
            command_timeout_ms: 300_000,
            build_timeout_ms: 600_000,
            max_retries: 3,
            auto_retry: true,
            allow_high_risk: false,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Paths
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root under which server sources and the metadata cache live.
    #[serde(default = "d_install_root")]
    pub install_root: PathBuf,
    /// Directory for the default file-backed key/value store.
    #[serde(default = "d_state_path")]
    pub state_path: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            install_root: d_install_root(),
            state_path: d_state_path(),
        }
    }
}

impl PathsConfig {
    pub fn cache_metadata_dir(&self) -> PathBuf {
        self.install_root.join(".cache").join("metadata")
    }

    pub fn cache_builds_dir(&self) -> PathBuf {
        self.install_root.join(".cache").join("builds")
    }
}

// ── default fns ─────────────────────────────────────────────────────

fn d_client_name() -> String {
    "stevedore".into()
}
fn d_client_version() -> String {
    env!("CARGO_PKG_VERSION").into()
}
fn d_install_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".vscode")
        .join("mcp-servers")
}
fn d_state_path() -> PathBuf {
    d_install_root().join(".state")
}
fn d_30000() -> u64 {
    30_000
}
fn d_5000() -> u64 {
    5_000
}
fn d_2000() -> u64 {
    2_000
}
fn d_1000() -> u64 {
    1_000
}
fn d_300000() -> u64 {
    300_000
}
fn d_600000() -> u64 {
    600_000
}
fn d_3() -> u32 {
    3
}
fn d_7() -> u32 {
    7
}
fn d_true() -> bool {
    true
}
