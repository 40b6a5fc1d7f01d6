//! Peer session: protocol semantics layered on one transport.
//!
//! A session owns a peer across its whole life: the initialize handshake
//! with version negotiation and fallback, the capability caches, the
//! per-version gating of every outgoing call, and the reconnect policy.
//! The negotiated version is constant for the session's lifetime; a
//! reconnect builds a fresh transport and negotiates again.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use stevedore_domain::error::{Error, Result};
use stevedore_domain::event::HostEvent;
use stevedore_domain::record::{Invocation, ServerState};

use crate::protocol::{
    ClientInfo, GetPromptResult, InitializeResult, PromptDef, PromptsListResult, ResourceDef,
    ResourceReadResult, ResourcesListResult, ServerInfo, ToolCallResult, ToolDef,
    ToolsListResult, NOTIFY_PROMPTS_CHANGED, NOTIFY_RESOURCES_CHANGED, NOTIFY_TOOLS_CHANGED,
};
use crate::transport::{PeerTransport, TransportEvent};
use crate::version::{Negotiated, VersionCatalog};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub server_id: String,
    pub client_info: ClientInfo,
    pub call_timeout: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub stop_grace: Duration,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct PeerSession {
    config: SessionConfig,
    invocation: Invocation,
    catalog: Arc<VersionCatalog>,
    events: broadcast::Sender<HostEvent>,

    state: parking_lot::RwLock<ServerState>,
    transport: tokio::sync::RwLock<Option<Arc<PeerTransport>>>,
    negotiated: parking_lot::RwLock<Option<Negotiated>>,
    peer_capabilities: parking_lot::RwLock<Value>,
    server_info: parking_lot::RwLock<Option<ServerInfo>>,

    tools: parking_lot::RwLock<Vec<ToolDef>>,
    resources: parking_lot::RwLock<Vec<ResourceDef>>,
    prompts: parking_lot::RwLock<Vec<PromptDef>>,

    reconnect_attempts: AtomicU32,
    /// Set between `clientConnected` and the matching `clientDisconnected`.
    connected: AtomicBool,
    /// Set by `stop()` so the exit event does not trigger reconnection.
    closing: AtomicBool,
    /// Set while a reconnect loop is live; a connection-class stderr line
    /// and the subsequent exit event must not race two loops into being.
    reconnecting: AtomicBool,
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("server_id", &self.config.server_id)
            .field("state", &self.state())
            .finish()
    }
}

impl PeerSession {
    pub fn new(
        config: SessionConfig,
        invocation: Invocation,
        catalog: Arc<VersionCatalog>,
        events: broadcast::Sender<HostEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            invocation,
            catalog,
            events,
            state: parking_lot::RwLock::new(ServerState::Stopped),
            transport: tokio::sync::RwLock::new(None),
            negotiated: parking_lot::RwLock::new(None),
            peer_capabilities: parking_lot::RwLock::new(Value::Null),
            server_info: parking_lot::RwLock::new(None),
            tools: parking_lot::RwLock::new(Vec::new()),
            resources: parking_lot::RwLock::new(Vec::new()),
            prompts: parking_lot::RwLock::new(Vec::new()),
            reconnect_attempts: AtomicU32::new(0),
            connected: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
        })
    }

    // ── accessors ───────────────────────────────────────────────────

    pub fn server_id(&self) -> &str {
        &self.config.server_id
    }

    pub fn state(&self) -> ServerState {
        *self.state.read()
    }

    pub fn negotiated_version(&self) -> Option<String> {
        self.negotiated.read().as_ref().map(|n| n.version.clone())
    }

    pub fn version_capabilities(&self) -> Vec<String> {
        self.negotiated
            .read()
            .as_ref()
            .map(|n| n.capabilities.names())
            .unwrap_or_default()
    }

    pub fn server_info(&self) -> Option<ServerInfo> {
        self.server_info.read().clone()
    }

    pub async fn pid(&self) -> Option<u32> {
        self.transport.read().await.as_ref().and_then(|t| t.pid())
    }

    pub fn cached_tools(&self) -> Vec<ToolDef> {
        self.tools.read().clone()
    }

    // ── lifecycle ───────────────────────────────────────────────────

    /// Spawn the process and run the handshake. On success the session is
    /// `running`; on failure it is `error`.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        self.set_state(ServerState::Starting);
        self.closing.store(false, Ordering::SeqCst);

        match self.establish().await {
            Ok(()) => {
                self.reconnect_attempts.store(0, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                self.set_state(ServerState::Error);
                self.emit(HostEvent::ClientError {
                    server_id: self.config.server_id.clone(),
                    error: e.to_string(),
                });
                // Tear down whatever half-started.
                if let Some(transport) = self.transport.write().await.take() {
                    transport.close().await;
                }
                Err(e)
            }
        }
    }

    /// Graceful stop: `shutdown` notification, then transport teardown.
    pub async fn stop(self: &Arc<Self>) {
        self.closing.store(true, Ordering::SeqCst);
        self.set_state(ServerState::Stopping);

        if let Some(transport) = self.transport.write().await.take() {
            let _ = transport.notify("shutdown", None).await;
            transport.close().await;
        }

        self.set_state(ServerState::Stopped);
        self.emit_disconnected();
    }

    // ── operation surface ───────────────────────────────────────────

    pub async fn list_tools(&self) -> Result<Vec<ToolDef>> {
        let value = self.checked_call("tools/list", None).await?;
        let parsed: ToolsListResult = serde_json::from_value(value)?;
        *self.tools.write() = parsed.tools.clone();
        Ok(parsed.tools)
    }

    pub async fn call_tool(&self, name: &str, arguments: Option<Value>) -> Result<ToolCallResult> {
        if !self.tools.read().iter().any(|t| t.name == name) {
            // Refresh once; the peer may have grown the tool since listing.
            // Gating failures surface as-is, a mere listing failure does not.
            match self.list_tools().await {
                Err(e @ (Error::Validation(_) | Error::NotConnected)) => return Err(e),
                _ => {}
            }
            if !self.tools.read().iter().any(|t| t.name == name) {
                return Err(Error::NotFound(format!("tool '{name}'")));
            }
        }

        let params = serde_json::json!({ "name": name, "arguments": arguments.unwrap_or(Value::Null) });
        let value = self.checked_call("tools/call", Some(params)).await?;
        let result: ToolCallResult = serde_json::from_value(value)?;
        self.emit(HostEvent::ToolCalled {
            server_id: self.config.server_id.clone(),
            tool: name.to_owned(),
            is_error: result.is_error,
        });
        Ok(result)
    }

    pub async fn list_resources(&self) -> Result<Vec<ResourceDef>> {
        let value = self.checked_call("resources/list", None).await?;
        let parsed: ResourcesListResult = serde_json::from_value(value)?;
        *self.resources.write() = parsed.resources.clone();
        Ok(parsed.resources)
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ResourceReadResult> {
        let params = serde_json::json!({ "uri": uri });
        let value = self.checked_call("resources/read", Some(params)).await?;
        let result: ResourceReadResult = serde_json::from_value(value)?;
        self.emit(HostEvent::ResourceRead {
            server_id: self.config.server_id.clone(),
            uri: uri.to_owned(),
        });
        Ok(result)
    }

    pub async fn list_prompts(&self) -> Result<Vec<PromptDef>> {
        let value = self.checked_call("prompts/list", None).await?;
        let parsed: PromptsListResult = serde_json::from_value(value)?;
        *self.prompts.write() = parsed.prompts.clone();
        Ok(parsed.prompts)
    }

    pub async fn get_prompt(&self, name: &str, arguments: Option<Value>) -> Result<GetPromptResult> {
        if !self.prompts.read().iter().any(|p| p.name == name) {
            match self.list_prompts().await {
                Err(e @ (Error::Validation(_) | Error::NotConnected)) => return Err(e),
                _ => {}
            }
            if !self.prompts.read().iter().any(|p| p.name == name) {
                return Err(Error::NotFound(format!("prompt '{name}'")));
            }
        }

        let params = serde_json::json!({ "name": name, "arguments": arguments.unwrap_or(Value::Null) });
        let value = self.checked_call("prompts/get", Some(params)).await?;
        let result: GetPromptResult = serde_json::from_value(value)?;
        self.emit(HostEvent::PromptRetrieved {
            server_id: self.config.server_id.clone(),
            prompt: name.to_owned(),
        });
        Ok(result)
    }

    /// Lightweight health probe: a successful `tools/list` means healthy.
    pub async fn health(&self) -> Result<()> {
        self.list_tools().await.map(|_| ())
    }

    // ── handshake ───────────────────────────────────────────────────

    /// Spawn a transport, pump its events, and run the handshake plus
    /// capability discovery. Shared by connect and reconnect.
    async fn establish(self: &Arc<Self>) -> Result<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(PeerTransport::spawn(
            &self.config.server_id,
            &self.invocation,
            self.config.stop_grace,
            tx,
        )?);
        *self.transport.write().await = Some(Arc::clone(&transport));

        let pump_session = Arc::clone(self);
        tokio::spawn(async move { pump_session.pump(rx).await });

        let negotiated = self.handshake(&transport).await?;

        self.emit(HostEvent::VersionNegotiated {
            server_id: self.config.server_id.clone(),
            version: negotiated.version.clone(),
            backward_compatible: negotiated.is_backward_compatible,
        });
        if negotiated.is_deprecated {
            self.emit(HostEvent::VersionWarning {
                server_id: self.config.server_id.clone(),
                warning: format!("negotiated deprecated protocol version {}", negotiated.version),
            });
        }

        let version = negotiated.version.clone();
        *self.negotiated.write() = Some(negotiated);
        self.set_state(ServerState::Running);
        self.connected.store(true, Ordering::SeqCst);
        self.emit(HostEvent::ClientConnected {
            server_id: self.config.server_id.clone(),
            protocol_version: version,
            pid: transport.pid(),
        });

        self.discover().await;
        Ok(())
    }

    /// Primary handshake at the host's preferred version, then fallback
    /// through every supported version in order.
    async fn handshake(self: &Arc<Self>, transport: &PeerTransport) -> Result<Negotiated> {
        let preferred = self.catalog.preferred().id;
        match self.handshake_with(transport, preferred).await {
            Ok(negotiated) => Ok(negotiated),
            Err(primary) => {
                self.emit(HostEvent::VersionNegotiationError {
                    server_id: self.config.server_id.clone(),
                    error: primary.to_string(),
                });
                tracing::warn!(
                    server_id = %self.config.server_id,
                    error = %primary,
                    "primary handshake failed, trying fallback versions"
                );
                for version in self.catalog.supported_versions() {
                    self.emit(HostEvent::VersionFallbackAttempt {
                        server_id: self.config.server_id.clone(),
                        version: version.to_owned(),
                    });
                    match self.handshake_with(transport, version).await {
                        Ok(negotiated) => {
                            self.emit(HostEvent::VersionFallbackSuccess {
                                server_id: self.config.server_id.clone(),
                                version: negotiated.version.clone(),
                            });
                            return Ok(negotiated);
                        }
                        Err(e) => {
                            tracing::debug!(
                                server_id = %self.config.server_id,
                                version,
                                error = %e,
                                "fallback handshake attempt failed"
                            );
                        }
                    }
                }
                Err(Error::handshake(format!(
                    "all protocol versions exhausted (primary failure: {primary})"
                )))
            }
        }
    }

    /// One or two `initialize` round-trips at a given starting version.
    async fn handshake_with(&self, transport: &PeerTransport, version: &str) -> Result<Negotiated> {
        let params = self
            .catalog
            .build_initialize_params(version, self.config.client_info.clone())?;
        let value = transport
            .call(
                "initialize",
                Some(serde_json::to_value(&params)?),
                self.config.call_timeout,
            )
            .await?;
        let init: InitializeResult = serde_json::from_value(value).unwrap_or_default();

        // Peers that answer with nothing version-shaped are assumed to
        // speak whatever we opened with.
        let mut claimed = init.claimed_versions();
        if claimed.is_empty() {
            claimed.push(version.to_owned());
        }

        let negotiated = self.catalog.negotiate(&claimed)?;

        // If negotiation moved us off the opening version, re-issue
        // initialize so the peer sees the version we will actually speak.
        if negotiated.version != version {
            let params = self
                .catalog
                .build_initialize_params(&negotiated.version, self.config.client_info.clone())?;
            let value = transport
                .call(
                    "initialize",
                    Some(serde_json::to_value(&params)?),
                    self.config.call_timeout,
                )
                .await?;
            let reinit: InitializeResult = serde_json::from_value(value).unwrap_or_default();
            *self.peer_capabilities.write() = reinit.capabilities.clone();
            *self.server_info.write() = reinit.server_info.or(init.server_info);
        } else {
            *self.peer_capabilities.write() = init.capabilities.clone();
            *self.server_info.write() = init.server_info;
        }

        transport
            .notify(crate::protocol::NOTIFY_INITIALIZED, None)
            .await?;
        Ok(negotiated)
    }

    /// List whatever the negotiated version and the peer both enable.
    /// Discovery failures are warnings, never fatal.
    async fn discover(self: &Arc<Self>) {
        let (want_tools, want_resources, want_prompts) = {
            let negotiated = self.negotiated.read();
            let caps = match negotiated.as_ref() {
                Some(n) => n.capabilities,
                None => return,
            };
            let peer = self.peer_capabilities.read();
            (
                caps.tools && peer.get("tools").is_some(),
                caps.resources && peer.get("resources").is_some(),
                caps.prompts && peer.get("prompts").is_some(),
            )
        };

        if want_tools {
            if let Err(e) = self.list_tools().await {
                tracing::warn!(server_id = %self.config.server_id, error = %e, "tool discovery failed");
            }
        }
        if want_resources {
            if let Err(e) = self.list_resources().await {
                tracing::warn!(server_id = %self.config.server_id, error = %e, "resource discovery failed");
            }
        }
        if want_prompts {
            if let Err(e) = self.list_prompts().await {
                tracing::warn!(server_id = %self.config.server_id, error = %e, "prompt discovery failed");
            }
        }
    }

    // ── gated call path ─────────────────────────────────────────────

    /// Validate through the version catalog, then send.
    async fn checked_call(&self, method: &str, params: Option<Value>) -> Result<Value> {
        if self.state() != ServerState::Running {
            return Err(Error::NotConnected);
        }
        let version = self
            .negotiated_version()
            .ok_or(Error::NotConnected)?;

        let envelope = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 0,
            "method": method,
            "params": params.clone(),
        });
        let report = self.catalog.validate_message(&envelope, &version)?;
        for warning in &report.warnings {
            tracing::warn!(server_id = %self.config.server_id, method, warning = %warning, "validation warning");
            self.emit(HostEvent::VersionWarning {
                server_id: self.config.server_id.clone(),
                warning: warning.clone(),
            });
        }
        if !report.ok {
            return Err(Error::validation(report.errors.join("; ")));
        }

        let transport = {
            let guard = self.transport.read().await;
            guard.as_ref().cloned().ok_or(Error::NotConnected)?
        };
        transport.call(method, params, self.config.call_timeout).await
    }

    // ── event pump & reconnection ───────────────────────────────────

    async fn pump(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                TransportEvent::NonJsonOutput { line } => {
                    self.emit(HostEvent::NonJsonOutput {
                        server_id: self.config.server_id.clone(),
                        line,
                    });
                }
                TransportEvent::ParseError { message } => {
                    // Looked like JSON but was not: a transport error, but
                    // not a connection-class one.
                    self.emit(HostEvent::ClientError {
                        server_id: self.config.server_id.clone(),
                        error: message,
                    });
                }
                TransportEvent::Stderr {
                    line,
                    is_error,
                    connection_class,
                } => {
                    self.emit(HostEvent::StderrOutput {
                        server_id: self.config.server_id.clone(),
                        line: line.clone(),
                        is_error,
                    });
                    if connection_class && self.state() == ServerState::Running {
                        self.emit(HostEvent::ClientError {
                            server_id: self.config.server_id.clone(),
                            error: format!("connection-class stderr: {line}"),
                        });
                        self.spawn_reconnect();
                    }
                }
                TransportEvent::Notification(notification) => {
                    self.handle_notification(notification);
                }
                TransportEvent::Exited {
                    code,
                    signal,
                    reconnect_eligible,
                    fatal_stderr_seen,
                    stderr_tail,
                } => {
                    self.handle_exit(
                        code,
                        signal,
                        reconnect_eligible,
                        fatal_stderr_seen,
                        stderr_tail,
                    );
                }
            }
        }
    }

    fn handle_notification(&self, notification: crate::protocol::JsonRpcNotification) {
        let notifications_enabled = self
            .negotiated
            .read()
            .as_ref()
            .map(|n| n.capabilities.notifications)
            .unwrap_or(false);

        match notification.method.as_str() {
            NOTIFY_TOOLS_CHANGED if notifications_enabled => {
                self.tools.write().clear();
                self.emit(HostEvent::ToolsListChanged {
                    server_id: self.config.server_id.clone(),
                });
            }
            NOTIFY_RESOURCES_CHANGED if notifications_enabled => {
                self.resources.write().clear();
                self.emit(HostEvent::ResourcesListChanged {
                    server_id: self.config.server_id.clone(),
                });
            }
            NOTIFY_PROMPTS_CHANGED if notifications_enabled => {
                self.prompts.write().clear();
                self.emit(HostEvent::PromptsListChanged {
                    server_id: self.config.server_id.clone(),
                });
            }
            method => {
                self.emit(HostEvent::PeerNotification {
                    server_id: self.config.server_id.clone(),
                    method: method.to_owned(),
                });
            }
        }
    }

    fn handle_exit(
        self: &Arc<Self>,
        code: Option<i32>,
        signal: Option<i32>,
        reconnect_eligible: bool,
        fatal_stderr_seen: bool,
        stderr_tail: Vec<String>,
    ) {
        if self.closing.load(Ordering::SeqCst) {
            // stop()/dispose() owns this teardown.
            return;
        }

        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        if was_connected {
            self.emit(HostEvent::ClientDisconnected {
                server_id: self.config.server_id.clone(),
            });
        } else {
            // Died before (or during) the handshake; connect() surfaces
            // that failure and no reconnection applies.
            return;
        }

        if reconnect_eligible {
            self.emit(HostEvent::ClientError {
                server_id: self.config.server_id.clone(),
                error: format!(
                    "peer exited unexpectedly (code {code:?}, signal {signal:?}): {}",
                    stderr_tail.join(" | ")
                ),
            });
            self.spawn_reconnect();
        } else if fatal_stderr_seen {
            // Benign exit code but the peer complained first.
            self.set_state(ServerState::Error);
            self.emit(HostEvent::ClientError {
                server_id: self.config.server_id.clone(),
                error: format!("peer exited after error output: {}", stderr_tail.join(" | ")),
            });
        } else {
            self.set_state(ServerState::Stopped);
        }
    }

    fn spawn_reconnect(self: &Arc<Self>) {
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let session = Arc::clone(self);
        tokio::spawn(async move {
            let session2 = Arc::clone(&session);
            session.reconnect_loop().await;
            session2.reconnecting.store(false, Ordering::SeqCst);
        });
    }

    /// Linear back-off supervision: wait `delay * attempt`, rebuild the
    /// transport, redo the handshake. Latches in `error` once the attempt
    /// budget is spent.
    async fn reconnect_loop(self: Arc<Self>) {
        loop {
            let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt > self.config.max_reconnect_attempts {
                self.set_state(ServerState::Error);
                self.emit(HostEvent::ClientError {
                    server_id: self.config.server_id.clone(),
                    error: format!(
                        "giving up after {} reconnect attempts",
                        self.config.max_reconnect_attempts
                    ),
                });
                return;
            }

            self.set_state(ServerState::Reconnecting);
            self.emit(HostEvent::ClientReconnecting {
                server_id: self.config.server_id.clone(),
                attempt,
            });

            tokio::time::sleep(self.config.reconnect_delay * attempt).await;

            // A manual restart may have raced the automatic policy.
            if self.state() == ServerState::Running || self.closing.load(Ordering::SeqCst) {
                return;
            }

            // Drop the dead transport before building a fresh one.
            if let Some(old) = self.transport.write().await.take() {
                old.close().await;
            }

            match self.establish().await {
                Ok(()) => {
                    self.reconnect_attempts.store(0, Ordering::SeqCst);
                    return;
                }
                Err(e) => {
                    tracing::warn!(
                        server_id = %self.config.server_id,
                        attempt,
                        error = %e,
                        "reconnect attempt failed"
                    );
                }
            }
        }
    }

    // ── helpers ─────────────────────────────────────────────────────

    fn set_state(&self, state: ServerState) {
        *self.state.write() = state;
        tracing::debug!(server_id = %self.config.server_id, %state, "session state");
    }

    /// Emit `clientDisconnected` exactly once per `clientConnected`.
    fn emit_disconnected(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.emit(HostEvent::ClientDisconnected {
                server_id: self.config.server_id.clone(),
            });
        }
    }

    fn emit(&self, event: HostEvent) {
        let _ = self.events.send(event);
    }
}
