//! Persistent server catalog.
//!
//! An id-keyed map of [`ServerRecord`]s plus their volatile
//! [`ServerStatus`] snapshots, mirrored into the host key/value store on
//! every mutation. The in-memory state and the store are equal after each
//! operation returns.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::broadcast;

use stevedore_domain::error::{Error, Result};
use stevedore_domain::event::HostEvent;
use stevedore_domain::record::{Invocation, ServerRecord, ServerState, ServerStatus};
use stevedore_domain::store::{KvStore, KEY_SERVERS, KEY_SERVER_STATUS};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Patch & import types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Fields [`ServerRegistry::update`] may merge. The id is immutable.
#[derive(Debug, Clone, Default)]
pub struct RecordPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub version: Option<String>,
    pub invocation: Option<Invocation>,
    pub install_url: Option<String>,
    pub auto_start: Option<bool>,
}

/// Counters from a bulk [`ServerRegistry::import`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportOutcome {
    pub imported: usize,
    pub skipped: usize,
    pub errors: usize,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ServerRegistry {
    store: Arc<dyn KvStore>,
    records: parking_lot::RwLock<HashMap<String, ServerRecord>>,
    status: parking_lot::RwLock<HashMap<String, ServerStatus>>,
    events: broadcast::Sender<HostEvent>,
}

impl ServerRegistry {
    /// Load the catalog from the store (missing or corrupt blobs yield an
    /// empty catalog rather than a failed host).
    pub fn load(store: Arc<dyn KvStore>, events: broadcast::Sender<HostEvent>) -> Self {
        let records: HashMap<String, ServerRecord> = store
            .get(KEY_SERVERS)
            .ok()
            .flatten()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        let status: HashMap<String, ServerStatus> = store
            .get(KEY_SERVER_STATUS)
            .ok()
            .flatten()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        tracing::info!(servers = records.len(), "server registry loaded");

        Self {
            store,
            records: parking_lot::RwLock::new(records),
            status: parking_lot::RwLock::new(status),
            events,
        }
    }

    // ── mutations ───────────────────────────────────────────────────

    pub fn add(&self, record: ServerRecord) -> Result<()> {
        record.validate()?;
        {
            let mut records = self.records.write();
            if records.contains_key(&record.id) {
                return Err(Error::registry(format!(
                    "server id '{}' already exists",
                    record.id
                )));
            }
            let id = record.id.clone();
            records.insert(id.clone(), record);
            self.persist_records(&records)?;
            self.emit(HostEvent::ServerAdded { server_id: id });
        }
        Ok(())
    }

    /// `add`, or remove-then-add when `overwrite` is set and the id exists.
    pub fn add_or_replace(&self, record: ServerRecord, overwrite: bool) -> Result<()> {
        if overwrite && self.records.read().contains_key(&record.id) {
            self.remove(&record.id)?;
        }
        self.add(record)
    }

    pub fn update(&self, id: &str, patch: RecordPatch) -> Result<ServerRecord> {
        let updated = {
            let mut records = self.records.write();
            let record = records
                .get_mut(id)
                .ok_or_else(|| Error::NotFound(format!("server '{id}'")))?;

            if let Some(name) = patch.name {
                record.name = name;
            }
            if let Some(description) = patch.description {
                record.description = Some(description);
            }
            if let Some(version) = patch.version {
                record.version = Some(version);
            }
            if let Some(invocation) = patch.invocation {
                record.invocation = invocation;
            }
            if let Some(install_url) = patch.install_url {
                record.install_url = Some(install_url);
            }
            if let Some(auto_start) = patch.auto_start {
                record.metadata.auto_start = auto_start;
            }
            record.updated_at = Utc::now();
            let updated = record.clone();
            self.persist_records(&records)?;
            updated
        };
        self.emit(HostEvent::ServerUpdated {
            server_id: id.to_owned(),
        });
        Ok(updated)
    }

    pub fn remove(&self, id: &str) -> Result<ServerRecord> {
        let removed = {
            let mut records = self.records.write();
            let removed = records
                .remove(id)
                .ok_or_else(|| Error::NotFound(format!("server '{id}'")))?;
            self.persist_records(&records)?;
            removed
        };
        {
            let mut status = self.status.write();
            status.remove(id);
            self.persist_status(&status)?;
        }
        self.emit(HostEvent::ServerRemoved {
            server_id: id.to_owned(),
        });
        Ok(removed)
    }

    // ── reads ───────────────────────────────────────────────────────

    pub fn get(&self, id: &str) -> Option<ServerRecord> {
        self.records.read().get(id).cloned()
    }

    pub fn list(&self) -> Vec<ServerRecord> {
        let mut records: Vec<ServerRecord> = self.records.read().values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub fn list_by_method(
        &self,
        method: stevedore_domain::record::InstallMethod,
    ) -> Vec<ServerRecord> {
        self.list()
            .into_iter()
            .filter(|r| r.install_method == method)
            .collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.read().contains_key(id)
    }

    // ── status ──────────────────────────────────────────────────────

    pub fn status(&self, id: &str) -> ServerStatus {
        self.status.read().get(id).cloned().unwrap_or_default()
    }

    pub fn status_all(&self) -> HashMap<String, ServerStatus> {
        self.status.read().clone()
    }

    /// Update a server's runtime state, applying the per-state timestamp
    /// and counter rules, then persist and broadcast.
    pub fn set_status(&self, id: &str, state: ServerState, detail: Option<String>) -> Result<()> {
        {
            let mut status = self.status.write();
            let entry = status.entry(id.to_owned()).or_default();
            let now = Utc::now();
            entry.state = state;
            entry.updated_at = Some(now);
            match state {
                ServerState::Running => entry.last_started = Some(now),
                ServerState::Stopped => {
                    entry.last_stopped = Some(now);
                    entry.protocol_version = None;
                    entry.version_capabilities.clear();
                    entry.pid = None;
                }
                ServerState::Error => {
                    entry.error_count += 1;
                    if let Some(detail) = &detail {
                        entry.last_error = Some(detail.clone());
                    }
                }
                _ => {}
            }
            self.persist_status(&status)?;
        }
        self.emit(HostEvent::StatusChanged {
            server_id: id.to_owned(),
            state,
            detail,
        });
        Ok(())
    }

    /// Record the negotiated connection details while running.
    pub fn set_runtime_info(
        &self,
        id: &str,
        pid: Option<u32>,
        protocol_version: Option<String>,
        version_capabilities: Vec<String>,
    ) -> Result<()> {
        let mut status = self.status.write();
        let entry = status.entry(id.to_owned()).or_default();
        entry.pid = pid;
        entry.protocol_version = protocol_version;
        entry.version_capabilities = version_capabilities;
        self.persist_status(&status)
    }

    pub fn increment_restart_count(&self, id: &str) -> Result<()> {
        let mut status = self.status.write();
        let entry = status.entry(id.to_owned()).or_default();
        entry.restart_count += 1;
        self.persist_status(&status)
    }

    // ── bulk transfer ───────────────────────────────────────────────

    /// Export the named servers (or all of them) as a versioned blob.
    pub fn export(&self, ids: Option<&[String]>) -> Result<Value> {
        let records = self.records.read();
        let selected: HashMap<&String, &ServerRecord> = match ids {
            Some(ids) => records
                .iter()
                .filter(|(id, _)| ids.contains(id))
                .collect(),
            None => records.iter().collect(),
        };
        Ok(serde_json::json!({
            "version": 1,
            "servers": selected,
        }))
    }

    pub fn import(&self, blob: &Value, overwrite: bool) -> ImportOutcome {
        let mut outcome = ImportOutcome::default();
        let servers = match blob.get("servers").and_then(Value::as_object) {
            Some(servers) => servers,
            None => {
                outcome.errors += 1;
                return outcome;
            }
        };

        for (id, value) in servers {
            let record: ServerRecord = match serde_json::from_value(value.clone()) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(server_id = %id, error = %e, "skipping malformed import entry");
                    outcome.errors += 1;
                    continue;
                }
            };
            if !overwrite && self.contains(&record.id) {
                outcome.skipped += 1;
                continue;
            }
            match self.add_or_replace(record, overwrite) {
                Ok(()) => outcome.imported += 1,
                Err(e) => {
                    tracing::warn!(server_id = %id, error = %e, "import failed");
                    outcome.errors += 1;
                }
            }
        }
        outcome
    }

    // ── persistence ─────────────────────────────────────────────────

    fn persist_records(&self, records: &HashMap<String, ServerRecord>) -> Result<()> {
        self.store.set(KEY_SERVERS, serde_json::to_value(records)?)
    }

    fn persist_status(&self, status: &HashMap<String, ServerStatus>) -> Result<()> {
        self.store
            .set(KEY_SERVER_STATUS, serde_json::to_value(status)?)
    }

    fn emit(&self, event: HostEvent) {
        let _ = self.events.send(event);
    }
}
