//! `stevedore-domain` — shared data model for the stevedore MCP host runtime.
//!
//! This crate carries everything the transport, session, manager, and
//! installer crates exchange:
//! - [`record`]: durable [`record::ServerRecord`]s and volatile
//!   [`record::ServerStatus`] snapshots.
//! - [`event`]: the [`event::HostEvent`] vocabulary fanned out to the host.
//! - [`error`]: the shared error taxonomy.
//! - [`config`]: host configuration with serde defaults.
//! - [`store`]: the host key/value persistence contract and two built-in
//!   implementations.

pub mod config;
pub mod error;
pub mod event;
pub mod record;
pub mod store;

pub use config::HostConfig;
pub use error::{Error, Result};
pub use event::HostEvent;
pub use record::{
    InstallMethod, Invocation, ServerRecord, ServerState, ServerStatus, validate_server_id,
};
pub use store::{JsonFileStore, KvStore, MemoryStore, KEY_SERVERS, KEY_SERVER_STATUS};
