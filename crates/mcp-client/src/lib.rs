//! `stevedore-mcp` — MCP peer transport, sessions, and the host manager.
//!
//! This crate provides:
//! - JSON-RPC 2.0 protocol types for talking to MCP servers over
//!   newline-delimited stdio ([`protocol`]).
//! - The immutable protocol [`version`] catalog: negotiation, capability
//!   gating, message validation, and cross-version translation.
//! - A [`transport`] that owns one child process and multiplexes
//!   concurrent RPCs over its pipes.
//! - A [`session`] that layers the handshake, capability caches, and
//!   reconnect supervision on a transport.
//! - The [`registry`] and [`manager`]: the persistent catalog and the
//!   caller-facing orchestrator.
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use stevedore_domain::{HostConfig, JsonFileStore};
//! use stevedore_installer::{InstallOptions, ProcessRunner};
//! use stevedore_mcp::McpHostManager;
//!
//! let config = HostConfig::default();
//! let store = Arc::new(JsonFileStore::new(&config.paths.state_path)?);
//! let manager = McpHostManager::new(config, store, Arc::new(ProcessRunner))?;
//!
//! let mut events = manager.subscribe();
//! let record = manager.install("https://github.com/example/my-mcp", InstallOptions::default()).await?;
//! let session = manager.start(&record.id).await?;
//! let result = session.call_tool("echo", Some(serde_json::json!({"message": "hi"}))).await?;
//! ```

pub mod manager;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod transport;
pub mod version;

pub use manager::McpHostManager;
pub use protocol::{ClientInfo, ToolDef};
pub use registry::{ImportOutcome, RecordPatch, ServerRegistry};
pub use session::{PeerSession, SessionConfig};
pub use transport::{PeerTransport, TransportEvent};
pub use version::{CapabilitySet, Negotiated, VersionCatalog};
