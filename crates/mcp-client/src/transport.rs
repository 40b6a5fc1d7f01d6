//! Peer transport: one child process, newline-delimited JSON-RPC over its
//! stdio.
//!
//! The transport owns the process and three stream tasks: a stdout reader
//! that correlates responses to pending calls by id, a stderr reader that
//! classifies noise, and an exit monitor that reaps the process and rejects
//! whatever is still in flight. Multiple RPCs may be outstanding at once;
//! writes to stdin are serialized, responses complete in whatever order the
//! peer produces them.

use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{mpsc, oneshot, Mutex};

use stevedore_domain::error::{Error, Result};
use stevedore_domain::record::Invocation;

use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

/// How many stderr lines are retained for exit reports.
const STDERR_TAIL_LINES: usize = 20;

/// Stderr prefixes that are informational rather than errors: package
/// manager chatter and readiness banners.
const BENIGN_STDERR_PREFIXES: &[&str] = &[
    "npm WARN",
    "npm notice",
    "npm info",
    "added ",
    "audited ",
    "found 0 vulnerabilities",
    "up to date",
];

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Out-of-band happenings on the wire, consumed by the owning session.
#[derive(Debug)]
pub enum TransportEvent {
    /// A stdout line that did not start with `{` or `[`.
    NonJsonOutput { line: String },
    /// A stdout line that looked like JSON but failed to parse.
    ParseError { message: String },
    /// A stderr line, classified.
    Stderr {
        line: String,
        is_error: bool,
        connection_class: bool,
    },
    /// A notification from the peer.
    Notification(JsonRpcNotification),
    /// The process exited (or was torn down).
    Exited {
        code: Option<i32>,
        signal: Option<i32>,
        /// Whether the exit qualifies for automatic reconnection.
        reconnect_eligible: bool,
        /// Whether a non-benign stderr line was seen during the run.
        fatal_stderr_seen: bool,
        stderr_tail: Vec<String>,
    },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pending call map
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct PendingCall {
    method: String,
    tx: oneshot::Sender<Result<Value>>,
}

#[derive(Default)]
struct PendingMap {
    inner: parking_lot::Mutex<HashMap<u64, PendingCall>>,
}

impl PendingMap {
    fn insert(&self, id: u64, call: PendingCall) {
        self.inner.lock().insert(id, call);
    }

    fn remove(&self, id: u64) -> Option<PendingCall> {
        self.inner.lock().remove(&id)
    }

    /// Reject everything in flight. Each entry is removed exactly once.
    fn reject_all(&self) {
        let drained: Vec<PendingCall> = self.inner.lock().drain().map(|(_, c)| c).collect();
        for call in drained {
            let _ = call.tx.send(Err(Error::ConnectionClosed));
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct PeerTransport {
    server_id: String,
    pid: Option<u32>,
    stdin: Mutex<Option<ChildStdin>>,
    pending: Arc<PendingMap>,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
    /// Asks the exit monitor to tear the process down.
    close_tx: parking_lot::Mutex<Option<oneshot::Sender<()>>>,
    /// Resolved by the exit monitor once the process is reaped.
    closed_rx: Mutex<Option<oneshot::Receiver<()>>>,
}

impl PeerTransport {
    /// Launch the process with piped stdio and install the stream tasks.
    ///
    /// Returns once the OS accepts the spawn; peer readiness is the
    /// session's concern. `events` receives everything that is not a
    /// direct response to a call.
    pub fn spawn(
        server_id: &str,
        invocation: &Invocation,
        stop_grace: Duration,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Self> {
        let mut cmd = tokio::process::Command::new(&invocation.command);
        cmd.args(&invocation.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &invocation.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &invocation.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| {
            Error::transport(format!("failed to spawn '{}': {e}", invocation.command))
        })?;

        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::transport("failed to capture child stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::transport("failed to capture child stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::transport("failed to capture child stderr"))?;

        tracing::info!(
            server_id,
            command = %invocation.command,
            pid,
            "spawned MCP peer process"
        );

        let pending = Arc::new(PendingMap::default());
        let alive = Arc::new(AtomicBool::new(true));
        let stderr_tail = Arc::new(parking_lot::Mutex::new(VecDeque::new()));
        let fatal_stderr = Arc::new(AtomicBool::new(false));
        let (close_tx, close_rx) = oneshot::channel::<()>();
        let (closed_tx, closed_rx) = oneshot::channel::<()>();

        // stdout reader: frame lines, route responses, forward the rest.
        tokio::spawn(stdout_reader(
            server_id.to_owned(),
            stdout,
            Arc::clone(&pending),
            events.clone(),
        ));

        // stderr reader: classify and retain a tail.
        tokio::spawn(stderr_reader(
            server_id.to_owned(),
            stderr,
            events.clone(),
            Arc::clone(&stderr_tail),
            Arc::clone(&fatal_stderr),
        ));

        // exit monitor: reap on natural exit or on close request.
        tokio::spawn(exit_monitor(
            server_id.to_owned(),
            child,
            pid,
            stop_grace,
            close_rx,
            closed_tx,
            Arc::clone(&pending),
            Arc::clone(&alive),
            Arc::clone(&stderr_tail),
            Arc::clone(&fatal_stderr),
            events,
        ));

        Ok(Self {
            server_id: server_id.to_owned(),
            pid,
            stdin: Mutex::new(Some(stdin)),
            pending,
            next_id: AtomicU64::new(1),
            alive,
            close_tx: parking_lot::Mutex::new(Some(close_tx)),
            closed_rx: Mutex::new(Some(closed_rx)),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Send a request and suspend until the matching response, the
    /// deadline, or transport teardown.
    ///
    /// The pending entry is registered before any byte is written, so a
    /// response can never arrive unmatched. A timeout removes the entry
    /// and leaves the process running.
    pub async fn call(&self, method: &str, params: Option<Value>, deadline: Duration) -> Result<Value> {
        if !self.is_alive() {
            return Err(Error::ConnectionClosed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            id,
            PendingCall {
                method: method.to_owned(),
                tx,
            },
        );

        let request = JsonRpcRequest::new(id, method, params);
        let json = match serde_json::to_string(&request) {
            Ok(json) => json,
            Err(e) => {
                self.pending.remove(id);
                return Err(e.into());
            }
        };

        tracing::debug!(server_id = %self.server_id, id, method, "sending MCP request");
        if let Err(e) = self.write_line(&json).await {
            self.pending.remove(id);
            return Err(e);
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => {
                self.pending.remove(id);
                Err(Error::Timeout {
                    method: method.to_owned(),
                })
            }
        }
    }

    /// Fire-and-forget notification.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let notification = JsonRpcNotification::new(method, params);
        let json = serde_json::to_string(&notification)?;
        tracing::debug!(server_id = %self.server_id, method, "sending MCP notification");
        self.write_line(&json).await
    }

    /// Tear the process down: SIGTERM, wait up to the grace period,
    /// escalate to SIGKILL. All outstanding calls are rejected with
    /// `ConnectionClosed`.
    pub async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);

        // Drop stdin so well-behaved peers exit on EOF.
        self.stdin.lock().await.take();

        if let Some(tx) = self.close_tx.lock().take() {
            let _ = tx.send(());
        }
        if let Some(rx) = self.closed_rx.lock().await.take() {
            let _ = rx.await;
        }
    }

    async fn write_line(&self, json: &str) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(Error::ConnectionClosed)?;
        stdin
            .write_all(json.as_bytes())
            .await
            .map_err(|e| Error::transport(format!("write to peer stdin: {e}")))?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|e| Error::transport(format!("write to peer stdin: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| Error::transport(format!("flush peer stdin: {e}")))?;
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stream tasks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn stdout_reader(
    server_id: String,
    stdout: tokio::process::ChildStdout,
    pending: Arc<PendingMap>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(server_id, error = %e, "error reading peer stdout");
                break;
            }
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        // Servers and their package managers routinely print banners before
        // becoming silent JSON endpoints; pass those through untouched.
        if !trimmed.starts_with('{') && !trimmed.starts_with('[') {
            tracing::debug!(server_id, line = %trimmed, "non-JSON line on peer stdout");
            let _ = events.send(TransportEvent::NonJsonOutput {
                line: trimmed.to_owned(),
            });
            continue;
        }

        let value: Value = match serde_json::from_str(trimmed) {
            Ok(value) => value,
            Err(e) => {
                let prefix: String = trimmed.chars().take(80).collect();
                let _ = events.send(TransportEvent::ParseError {
                    message: format!("unparseable JSON from peer ({e}): {prefix}"),
                });
                continue;
            }
        };

        let has_id = value.get("id").is_some();
        let has_method = value.get("method").is_some();
        if has_id && !has_method {
            match serde_json::from_value::<JsonRpcResponse>(value) {
                Ok(response) => route_response(&server_id, &pending, response),
                Err(e) => {
                    let _ = events.send(TransportEvent::ParseError {
                        message: format!("malformed response from peer: {e}"),
                    });
                }
            }
        } else if has_method && !has_id {
            match serde_json::from_value::<JsonRpcNotification>(value) {
                Ok(notification) => {
                    let _ = events.send(TransportEvent::Notification(notification));
                }
                Err(e) => {
                    let _ = events.send(TransportEvent::ParseError {
                        message: format!("malformed notification from peer: {e}"),
                    });
                }
            }
        } else {
            // Server-initiated requests are not part of this host's surface.
            tracing::warn!(server_id, "ignoring server-initiated request from peer");
        }
    }
}

fn route_response(server_id: &str, pending: &PendingMap, response: JsonRpcResponse) {
    let id = response.id;
    match pending.remove(id) {
        Some(call) => {
            let result = response.into_result().map_err(|e| {
                Error::peer(call.method.clone(), e.code, e.message, e.data)
            });
            let _ = call.tx.send(result);
        }
        None => {
            // Response raced a timeout or teardown; it has no home.
            tracing::debug!(server_id, id, "response for unknown or expired request id");
        }
    }
}

async fn stderr_reader(
    server_id: String,
    stderr: tokio::process::ChildStderr,
    events: mpsc::UnboundedSender<TransportEvent>,
    tail: Arc<parking_lot::Mutex<VecDeque<String>>>,
    fatal_seen: Arc<AtomicBool>,
) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        {
            let mut tail = tail.lock();
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(trimmed.to_owned());
        }

        let benign = is_benign_stderr(trimmed);
        let connection_class = !benign && is_connection_class_stderr(trimmed);

        if benign {
            tracing::debug!(server_id, line = %trimmed, "peer stderr (info)");
        } else {
            fatal_seen.store(true, Ordering::SeqCst);
            tracing::warn!(server_id, line = %trimmed, "peer stderr");
        }

        let _ = events.send(TransportEvent::Stderr {
            line: trimmed.to_owned(),
            is_error: !benign,
            connection_class,
        });
    }
}

fn is_benign_stderr(line: &str) -> bool {
    BENIGN_STDERR_PREFIXES
        .iter()
        .any(|prefix| line.starts_with(prefix))
        || line.to_lowercase().contains("running on stdio")
}

/// Only these stderr lines trigger reconnection consideration; everything
/// else is recorded without escalating.
fn is_connection_class_stderr(line: &str) -> bool {
    let lower = line.to_lowercase();
    ["connection", "econnrefused", "timeout", "network"]
        .iter()
        .any(|needle| lower.contains(needle))
}

#[allow(clippy::too_many_arguments)]
async fn exit_monitor(
    server_id: String,
    mut child: Child,
    pid: Option<u32>,
    stop_grace: Duration,
    close_rx: oneshot::Receiver<()>,
    closed_tx: oneshot::Sender<()>,
    pending: Arc<PendingMap>,
    alive: Arc<AtomicBool>,
    stderr_tail: Arc<parking_lot::Mutex<VecDeque<String>>>,
    fatal_stderr: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let mut initiated_by_us = false;

    let status = tokio::select! {
        status = child.wait() => status.ok(),
        _ = close_rx => {
            initiated_by_us = true;
            terminate(&mut child, pid, stop_grace, &server_id).await
        }
    };

    alive.store(false, Ordering::SeqCst);
    pending.reject_all();

    let code = status.as_ref().and_then(|s| s.code());
    let signal = exit_signal(status.as_ref());

    // Codes 0 and 1 are normal or benign (1 is typical of peers that print
    // a ready banner to stderr and then block). SIGTERM/SIGINT are ours.
    let benign_code = matches!(code, Some(0) | Some(1));
    let benign_signal = matches!(signal, Some(s) if s == sig_term() || s == sig_int());
    let reconnect_eligible =
        !initiated_by_us && !benign_code && !(code.is_none() && benign_signal);

    tracing::info!(
        server_id,
        code,
        signal,
        initiated_by_us,
        reconnect_eligible,
        "MCP peer process exited"
    );

    let _ = events.send(TransportEvent::Exited {
        code,
        signal,
        reconnect_eligible,
        fatal_stderr_seen: fatal_stderr.load(Ordering::SeqCst),
        stderr_tail: stderr_tail.lock().iter().cloned().collect(),
    });
    let _ = closed_tx.send(());
}

/// Graceful stop: SIGTERM, wait up to the grace period, then SIGKILL.
async fn terminate(
    child: &mut Child,
    pid: Option<u32>,
    grace: Duration,
    server_id: &str,
) -> Option<std::process::ExitStatus> {
    #[cfg(unix)]
    if let Some(pid) = pid {
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    let _ = pid;

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(result) => result.ok(),
        Err(_) => {
            tracing::warn!(server_id, "peer did not exit within grace period, killing");
            let _ = child.kill().await;
            child.wait().await.ok()
        }
    }
}

#[cfg(unix)]
fn exit_signal(status: Option<&std::process::ExitStatus>) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.and_then(|s| s.signal())
}

#[cfg(not(unix))]
fn exit_signal(_status: Option<&std::process::ExitStatus>) -> Option<i32> {
    None
}

#[cfg(unix)]
fn sig_term() -> i32 {
    libc::SIGTERM
}
#[cfg(unix)]
fn sig_int() -> i32 {
    libc::SIGINT
}
#[cfg(not(unix))]
fn sig_term() -> i32 {
    15
}
#[cfg(not(unix))]
fn sig_int() -> i32 {
    2
}
