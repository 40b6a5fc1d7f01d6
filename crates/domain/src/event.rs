//! Host event vocabulary.
//!
//! Everything observable about the runtime flows through one tagged enum:
//! installer progress, registry mutations, session lifecycle, version
//! negotiation, per-call activity, and transport noise. The host subscribes
//! once and receives events in emission order.

use serde::Serialize;

use crate::record::ServerState;

/// A single event on the host-facing stream.
///
/// Serialized as `{ "kind": ..., ...payload }` so hosts can dispatch on the
/// tag without knowing every variant. Payload fields follow the same
/// camelCase contract as every other wire-facing type.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all_fields = "camelCase")]
pub enum HostEvent {
    // ── installer ───────────────────────────────────────────────────
    #[serde(rename = "installStarted")]
    InstallStarted { url: String, install_id: String },

    #[serde(rename = "installProgress")]
    InstallProgress {
        install_id: String,
        stage: String,
        detail: String,
    },

    #[serde(rename = "installCompleted")]
    InstallCompleted {
        install_id: String,
        server_id: String,
        from_cache: bool,
    },

    #[serde(rename = "installFailed")]
    InstallFailed {
        install_id: String,
        url: String,
        error: String,
    },

    #[serde(rename = "serverInstalled")]
    ServerInstalled { server_id: String },

    #[serde(rename = "serverUninstalled")]
    ServerUninstalled { server_id: String },

    // ── manager lifecycle ───────────────────────────────────────────
    #[serde(rename = "serverStarting")]
    ServerStarting { server_id: String },

    #[serde(rename = "serverStarted")]
    ServerStarted { server_id: String, pid: Option<u32> },

    #[serde(rename = "serverStopping")]
    ServerStopping { server_id: String },

    #[serde(rename = "serverStopped")]
    ServerStopped { server_id: String },

    #[serde(rename = "serverRestartFailed")]
    ServerRestartFailed { server_id: String, error: String },

    // ── session / client ────────────────────────────────────────────
    #[serde(rename = "clientConnected")]
    ClientConnected {
        server_id: String,
        protocol_version: String,
        pid: Option<u32>,
    },

    #[serde(rename = "clientDisconnected")]
    ClientDisconnected { server_id: String },

    #[serde(rename = "clientError")]
    ClientError { server_id: String, error: String },

    #[serde(rename = "clientReconnecting")]
    ClientReconnecting { server_id: String, attempt: u32 },

    // ── version negotiation ─────────────────────────────────────────
    #[serde(rename = "versionNegotiated")]
    VersionNegotiated {
        server_id: String,
        version: String,
        backward_compatible: bool,
    },

    #[serde(rename = "versionWarning")]
    VersionWarning { server_id: String, warning: String },

    #[serde(rename = "versionNegotiationError")]
    VersionNegotiationError { server_id: String, error: String },

    #[serde(rename = "versionFallbackAttempt")]
    VersionFallbackAttempt { server_id: String, version: String },

    #[serde(rename = "versionFallbackSuccess")]
    VersionFallbackSuccess { server_id: String, version: String },

    // ── per-call activity ───────────────────────────────────────────
    #[serde(rename = "toolCalled")]
    ToolCalled {
        server_id: String,
        tool: String,
        is_error: bool,
    },

    #[serde(rename = "resourceRead")]
    ResourceRead { server_id: String, uri: String },

    #[serde(rename = "promptRetrieved")]
    PromptRetrieved { server_id: String, prompt: String },

    // ── peer notifications ──────────────────────────────────────────
    #[serde(rename = "toolsListChanged")]
    ToolsListChanged { server_id: String },

    #[serde(rename = "resourcesListChanged")]
    ResourcesListChanged { server_id: String },

    #[serde(rename = "promptsListChanged")]
    PromptsListChanged { server_id: String },

    /// Any peer notification outside the typed set, forwarded generically.
    #[serde(rename = "peerNotification")]
    PeerNotification { server_id: String, method: String },

    // ── transport noise ─────────────────────────────────────────────
    #[serde(rename = "nonJsonOutput")]
    NonJsonOutput { server_id: String, line: String },

    #[serde(rename = "stderrOutput")]
    StderrOutput {
        server_id: String,
        line: String,
        /// False for benign package-manager notices and readiness banners.
        is_error: bool,
    },

    // ── registry ────────────────────────────────────────────────────
    #[serde(rename = "serverAdded")]
    ServerAdded { server_id: String },

    #[serde(rename = "serverUpdated")]
    ServerUpdated { server_id: String },

    #[serde(rename = "serverRemoved")]
    ServerRemoved { server_id: String },

    #[serde(rename = "statusChanged")]
    StatusChanged {
        server_id: String,
        state: ServerState,
        detail: Option<String>,
    },
}

impl HostEvent {
    /// The server id this event concerns, when there is one.
    pub fn server_id(&self) -> Option<&str> {
        use HostEvent::*;
        match self {
            InstallStarted { .. } | InstallFailed { .. } => None,
            InstallProgress { .. } => None,
            InstallCompleted { server_id, .. }
            | ServerInstalled { server_id }
            | ServerUninstalled { server_id }
            | ServerStarting { server_id }
            | ServerStarted { server_id, .. }
            | ServerStopping { server_id }
            | ServerStopped { server_id }
            | ServerRestartFailed { server_id, .. }
            | ClientConnected { server_id, .. }
            | ClientDisconnected { server_id }
            | ClientError { server_id, .. }
            | ClientReconnecting { server_id, .. }
            | VersionNegotiated { server_id, .. }
            | VersionWarning { server_id, .. }
            | VersionNegotiationError { server_id, .. }
            | VersionFallbackAttempt { server_id, .. }
            | VersionFallbackSuccess { server_id, .. }
            | ToolsListChanged { server_id }
            | ResourcesListChanged { server_id }
            | PromptsListChanged { server_id }
            | PeerNotification { server_id, .. }
            | ToolCalled { server_id, .. }
            | ResourceRead { server_id, .. }
            | PromptRetrieved { server_id, .. }
            | NonJsonOutput { server_id, .. }
            | StderrOutput { server_id, .. }
            | ServerAdded { server_id }
            | ServerUpdated { server_id }
            | ServerRemoved { server_id }
            | StatusChanged { server_id, .. } => Some(server_id),
        }
    }
}
