//! Host manager: the registry plus the set of live peer sessions.
//!
//! The manager is the caller-facing surface of the runtime. It owns every
//! session (at most one per server id), drives the installer, keeps the
//! registry's status snapshots in step with session lifecycle events, and
//! republishes everything on one broadcast stream the host subscribes to
//! once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use stevedore_domain::config::HostConfig;
use stevedore_domain::error::{Error, Result};
use stevedore_domain::event::HostEvent;
use stevedore_domain::record::{ServerRecord, ServerState, ServerStatus};
use stevedore_domain::store::KvStore;

use stevedore_installer::{CommandRunner, InstallOptions, Installer};

use crate::protocol::ClientInfo;
use crate::registry::ServerRegistry;
use crate::session::{PeerSession, SessionConfig};
use crate::version::VersionCatalog;

/// Capacity of the broadcast bus; a lagging subscriber loses the oldest
/// events and is told how many it missed.
const EVENT_BUS_CAPACITY: usize = 1024;

pub struct McpHostManager {
    config: HostConfig,
    catalog: Arc<VersionCatalog>,
    registry: Arc<ServerRegistry>,
    installer: Installer,
    sessions: tokio::sync::RwLock<HashMap<String, Arc<PeerSession>>>,
    events: broadcast::Sender<HostEvent>,
}

impl McpHostManager {
    /// Construct the runtime. The store and command runner are injected so
    /// hosts and tests control persistence and subprocess behavior.
    pub fn new(
        config: HostConfig,
        store: Arc<dyn KvStore>,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Arc<Self>> {
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        let catalog = Arc::new(VersionCatalog::new());
        let registry = Arc::new(ServerRegistry::load(store, events.clone()));
        let installer = Installer::new(
            config.paths.install_root.clone(),
            config.installer.clone(),
            runner,
            events.clone(),
        )?;

        let manager = Arc::new(Self {
            config,
            catalog,
            registry,
            installer,
            sessions: tokio::sync::RwLock::new(HashMap::new()),
            events,
        });

        // Mirror session lifecycle events into registry status snapshots.
        // Held weakly so dropping the manager ends the task.
        let watcher = Arc::downgrade(&manager);
        let rx = manager.events.subscribe();
        tokio::spawn(status_watcher(watcher, rx));

        Ok(manager)
    }

    /// Subscribe to the host event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.events.subscribe()
    }

    pub fn registry(&self) -> &ServerRegistry {
        &self.registry
    }

    // ── install / uninstall / update ────────────────────────────────

    /// Install from a textual origin. A second install of an id that is
    /// already present succeeds idempotently only when served from cache;
    /// otherwise the caller must uninstall first.
    pub async fn install(&self, url: &str, options: InstallOptions) -> Result<ServerRecord> {
        let auto_start = options.auto_start;
        let outcome = self.installer.install(url, &options).await?;

        let record = match self.registry.get(&outcome.record.id) {
            Some(existing) if outcome.from_cache => existing,
            Some(_) => {
                return Err(Error::registry(format!(
                    "server '{}' is already installed; uninstall it first",
                    outcome.record.id
                )))
            }
            None => {
                self.registry.add(outcome.record.clone())?;
                self.emit(HostEvent::ServerInstalled {
                    server_id: outcome.record.id.clone(),
                });
                outcome.record
            }
        };

        if auto_start {
            self.start(&record.id).await?;
        }
        Ok(record)
    }

    pub async fn uninstall(&self, id: &str) -> Result<()> {
        let record = self
            .registry
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("server '{id}'")))?;

        if let Some(session) = self.sessions.write().await.remove(id) {
            session.stop().await;
        }
        self.installer.remove_files(&record)?;
        self.registry.remove(id)?;
        self.emit(HostEvent::ServerUninstalled {
            server_id: id.to_owned(),
        });
        Ok(())
    }

    /// Reinstall from the recorded install URL.
    pub async fn update(&self, id: &str, mut options: InstallOptions) -> Result<ServerRecord> {
        let record = self
            .registry
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("server '{id}'")))?;
        let url = record
            .install_url
            .clone()
            .ok_or_else(|| Error::install(format!("server '{id}' has no recorded install URL")))?;

        if let Some(session) = self.sessions.write().await.remove(id) {
            session.stop().await;
            self.registry.set_status(id, ServerState::Stopped, None)?;
        }

        options.id = Some(id.to_owned());
        options.force_reinstall = true;
        let outcome = self.installer.install(&url, &options).await?;
        self.registry.add_or_replace(outcome.record.clone(), true)?;
        Ok(outcome.record)
    }

    // ── lifecycle ───────────────────────────────────────────────────

    /// Start a server. Starting an already-running server returns its
    /// session unchanged.
    pub async fn start(&self, id: &str) -> Result<Arc<PeerSession>> {
        let record = self
            .registry
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("server '{id}'")))?;

        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(id) {
            if session.state() == ServerState::Running {
                return Ok(Arc::clone(session));
            }
            // Stale session from a previous run: tear it down first.
            let stale = Arc::clone(session);
            sessions.remove(id);
            stale.stop().await;
        }

        self.emit(HostEvent::ServerStarting {
            server_id: id.to_owned(),
        });
        self.registry.set_status(id, ServerState::Starting, None)?;

        let session = PeerSession::new(
            SessionConfig {
                server_id: id.to_owned(),
                client_info: ClientInfo {
                    name: self.config.client.name.clone(),
                    version: self.config.client.version.clone(),
                },
                call_timeout: Duration::from_millis(self.config.session.call_timeout_ms),
                reconnect_delay: Duration::from_millis(self.config.session.reconnect_delay_ms),
                max_reconnect_attempts: self.config.session.max_reconnect_attempts,
                stop_grace: Duration::from_millis(self.config.session.stop_grace_ms),
            },
            record.invocation.clone(),
            Arc::clone(&self.catalog),
            self.events.clone(),
        );

        match session.connect().await {
            Ok(()) => {
                let pid = session.pid().await;
                self.registry.set_status(id, ServerState::Running, None)?;
                self.registry.set_runtime_info(
                    id,
                    pid,
                    session.negotiated_version(),
                    session.version_capabilities(),
                )?;
                self.emit(HostEvent::ServerStarted {
                    server_id: id.to_owned(),
                    pid,
                });
                sessions.insert(id.to_owned(), Arc::clone(&session));
                Ok(session)
            }
            Err(e) => {
                self.registry
                    .set_status(id, ServerState::Error, Some(e.to_string()))?;
                Err(e)
            }
        }
    }

    pub async fn stop(&self, id: &str) -> Result<()> {
        if !self.registry.contains(id) {
            return Err(Error::NotFound(format!("server '{id}'")));
        }
        self.emit(HostEvent::ServerStopping {
            server_id: id.to_owned(),
        });

        if let Some(session) = self.sessions.write().await.remove(id) {
            session.stop().await;
        }
        self.registry.set_status(id, ServerState::Stopped, None)?;
        self.emit(HostEvent::ServerStopped {
            server_id: id.to_owned(),
        });
        Ok(())
    }

    /// Stop (when live), pause briefly, start again.
    pub async fn restart(&self, id: &str) -> Result<Arc<PeerSession>> {
        if self.sessions.read().await.contains_key(id) {
            self.stop(id).await?;
        }
        tokio::time::sleep(Duration::from_millis(self.config.session.restart_pause_ms)).await;
        self.registry.increment_restart_count(id)?;

        match self.start(id).await {
            Ok(session) => Ok(session),
            Err(e) => {
                self.emit(HostEvent::ServerRestartFailed {
                    server_id: id.to_owned(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Start every server whose record opts into auto-start; returns
    /// per-id outcomes.
    pub async fn start_auto_start_servers(&self) -> Vec<(String, Result<()>)> {
        let mut outcomes = Vec::new();
        for record in self.registry.list() {
            if !record.metadata.auto_start {
                continue;
            }
            let outcome = self.start(&record.id).await.map(|_| ());
            if let Err(e) = &outcome {
                tracing::warn!(server_id = %record.id, error = %e, "auto-start failed");
            }
            outcomes.push((record.id, outcome));
        }
        outcomes
    }

    /// Stop every live session, shutting them down concurrently.
    pub async fn stop_all(&self) {
        let drained: Vec<(String, Arc<PeerSession>)> =
            self.sessions.write().await.drain().collect();
        for (id, _) in &drained {
            self.emit(HostEvent::ServerStopping {
                server_id: id.clone(),
            });
        }
        futures_util::future::join_all(drained.iter().map(|(_, session)| session.stop())).await;
        for (id, _) in &drained {
            if let Err(e) = self.registry.set_status(id, ServerState::Stopped, None) {
                tracing::warn!(server_id = %id, error = %e, "status update failed during stop_all");
            }
            self.emit(HostEvent::ServerStopped {
                server_id: id.clone(),
            });
        }
    }

    /// Stop everything and let subscribers drain.
    pub async fn dispose(&self) {
        self.stop_all().await;
    }

    // ── queries ─────────────────────────────────────────────────────

    pub fn list(&self) -> Vec<ServerRecord> {
        self.registry.list()
    }

    pub fn status(&self, id: &str) -> ServerStatus {
        self.registry.status(id)
    }

    pub fn status_all(&self) -> HashMap<String, ServerStatus> {
        self.registry.status_all()
    }

    /// The live session for a running server.
    pub async fn get_client(&self, id: &str) -> Option<Arc<PeerSession>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// A `tools/list` probe; success means healthy.
    pub async fn health(&self, id: &str) -> Result<()> {
        let session = self
            .get_client(id)
            .await
            .ok_or(Error::NotConnected)?;
        session.health().await
    }

    pub fn clear_cache(&self) -> Result<usize> {
        self.installer.clear_cache()
    }

    fn emit(&self, event: HostEvent) {
        let _ = self.events.send(event);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Status mirroring
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Keep registry status snapshots in step with what sessions report.
/// Sessions never call back into the manager; this task is the one place
/// their lifecycle events become durable status.
async fn status_watcher(
    manager: std::sync::Weak<McpHostManager>,
    mut rx: broadcast::Receiver<HostEvent>,
) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "status watcher lagged behind the event bus");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        let Some(manager) = manager.upgrade() else {
            return;
        };

        match event {
            HostEvent::ClientReconnecting { server_id, .. } => {
                let _ = manager
                    .registry
                    .set_status(&server_id, ServerState::Reconnecting, None);
            }
            HostEvent::ClientConnected {
                server_id,
                protocol_version,
                pid,
            } => {
                // Reconnections re-enter running without start() in the
                // picture; initial connects are recorded by start() itself.
                if manager.registry.contains(&server_id)
                    && manager.registry.status(&server_id).state == ServerState::Reconnecting
                {
                    let _ = manager
                        .registry
                        .set_status(&server_id, ServerState::Running, None);
                    let session = manager.sessions.read().await.get(&server_id).cloned();
                    let caps = session
                        .map(|s| s.version_capabilities())
                        .unwrap_or_default();
                    let _ = manager.registry.set_runtime_info(
                        &server_id,
                        pid,
                        Some(protocol_version),
                        caps,
                    );
                }
            }
            HostEvent::ClientError { server_id, error } => {
                let session = manager.sessions.read().await.get(&server_id).cloned();
                if let Some(session) = session {
                    if session.state() == ServerState::Error {
                        let _ = manager.registry.set_status(
                            &server_id,
                            ServerState::Error,
                            Some(error),
                        );
                    }
                }
            }
            _ => {}
        }
    }
}
