//! End-to-end tests against scripted mock peers.

mod mock_peer;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use stevedore_domain::config::HostConfig;
use stevedore_domain::error::Error;
use stevedore_domain::event::HostEvent;
use stevedore_domain::record::{Invocation, ServerRecord, ServerState};
use stevedore_domain::store::MemoryStore;
use stevedore_installer::FakeRunner;
use stevedore_mcp::McpHostManager;

fn test_config(tmp: &Path) -> HostConfig {
    let mut config = HostConfig::default();
    config.paths.install_root = tmp.join("root");
    config.paths.state_path = tmp.join("state");
    config.session.call_timeout_ms = 5_000;
    config.session.reconnect_delay_ms = 100;
    config.session.restart_pause_ms = 50;
    config.session.stop_grace_ms = 2_000;
    config
}

fn manager(tmp: &Path) -> Arc<McpHostManager> {
    McpHostManager::new(
        test_config(tmp),
        Arc::new(MemoryStore::new()),
        Arc::new(FakeRunner::new()),
    )
    .unwrap()
}

fn record_for(id: &str, invocation: Invocation) -> ServerRecord {
    ServerRecord::new(id, format!("Mock {id}"), invocation)
}

/// Drain events until `pred` matches or the deadline passes; returns
/// everything received.
async fn collect_until(
    rx: &mut broadcast::Receiver<HostEvent>,
    deadline: Duration,
    mut pred: impl FnMut(&HostEvent) -> bool,
) -> Vec<HostEvent> {
    let mut events = Vec::new();
    let end = tokio::time::Instant::now() + deadline;
    loop {
        let remaining = end.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return events;
        }
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Ok(event)) => {
                let done = pred(&event);
                events.push(event);
                if done {
                    return events;
                }
            }
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            _ => return events,
        }
    }
}

fn kind_index(events: &[HostEvent], pred: impl Fn(&HostEvent) -> bool) -> Option<usize> {
    events.iter().position(pred)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Happy path
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn happy_path_echo_tool() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = manager(tmp.path());
    let mut rx = manager.subscribe();

    manager
        .registry()
        .add(record_for("echo-server", mock_peer::versioned_peer(tmp.path())))
        .unwrap();

    let session = manager.start("echo-server").await.unwrap();
    assert_eq!(session.state(), ServerState::Running);
    assert_eq!(session.negotiated_version().as_deref(), Some("2024-11-05"));

    let result = session
        .call_tool("echo", Some(serde_json::json!({"message": "hi"})))
        .await
        .unwrap();
    assert!(!result.is_error);
    assert_eq!(result.content[0].text, "hi");

    manager.stop("echo-server").await.unwrap();

    let events = collect_until(&mut rx, Duration::from_secs(5), |e| {
        matches!(e, HostEvent::ServerStopped { .. })
    })
    .await;

    let starting = kind_index(&events, |e| matches!(e, HostEvent::ServerStarting { .. })).unwrap();
    let connected = kind_index(&events, |e| {
        matches!(e, HostEvent::ClientConnected { protocol_version, .. } if protocol_version == "2024-11-05")
    })
    .unwrap();
    let started = kind_index(&events, |e| matches!(e, HostEvent::ServerStarted { .. })).unwrap();
    let tool_called = kind_index(&events, |e| {
        matches!(e, HostEvent::ToolCalled { tool, .. } if tool == "echo")
    })
    .unwrap();
    let disconnected =
        kind_index(&events, |e| matches!(e, HostEvent::ClientDisconnected { .. })).unwrap();
    let stopped = kind_index(&events, |e| matches!(e, HostEvent::ServerStopped { .. })).unwrap();

    assert!(starting < connected);
    assert!(connected < started);
    assert!(started < tool_called);
    assert!(tool_called < disconnected);
    assert!(disconnected <= stopped);

    assert_eq!(manager.status("echo-server").state, ServerState::Stopped);
}

#[tokio::test]
async fn resources_and_prompts_flow() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = manager(tmp.path());
    manager
        .registry()
        .add(record_for("full", mock_peer::versioned_peer(tmp.path())))
        .unwrap();

    let session = manager.start("full").await.unwrap();

    let resources = session.list_resources().await.unwrap();
    assert_eq!(resources[0].uri, "mock://greeting");
    let read = session.read_resource("mock://greeting").await.unwrap();
    assert_eq!(read.contents[0].text.as_deref(), Some("hello"));

    let prompts = session.list_prompts().await.unwrap();
    assert_eq!(prompts[0].name, "greet");
    let prompt = session.get_prompt("greet", None).await.unwrap();
    assert_eq!(prompt.description, "greet");

    manager.stop("full").await.unwrap();
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Negotiation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn silent_peer_negotiates_host_preferred_version() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = manager(tmp.path());
    manager
        .registry()
        .add(record_for("silent", mock_peer::simple_tools_peer(tmp.path())))
        .unwrap();

    let session = manager.start("silent").await.unwrap();
    assert_eq!(session.negotiated_version().as_deref(), Some("2025-06-18"));
    assert_eq!(
        manager.status("silent").protocol_version.as_deref(),
        Some("2025-06-18")
    );
    manager.stop("silent").await.unwrap();
}

#[tokio::test]
async fn legacy_version_fallback() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = manager(tmp.path());
    let mut rx = manager.subscribe();
    manager
        .registry()
        .add(record_for("legacy", mock_peer::legacy_peer(tmp.path())))
        .unwrap();

    let session = manager.start("legacy").await.unwrap();
    assert_eq!(session.negotiated_version().as_deref(), Some("2024-09-24"));

    let events = collect_until(&mut rx, Duration::from_secs(5), |e| {
        matches!(e, HostEvent::ServerStarted { .. })
    })
    .await;
    assert!(events
        .iter()
        .any(|e| matches!(e, HostEvent::VersionFallbackAttempt { .. })));
    assert!(events.iter().any(|e| matches!(
        e,
        HostEvent::VersionFallbackSuccess { version, .. } if version == "2024-09-24"
    )));

    // The negotiated version does not enable prompts.
    let err = session.get_prompt("greet", None).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    manager.stop("legacy").await.unwrap();
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Lifecycle laws
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn start_twice_is_idempotent() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = manager(tmp.path());
    manager
        .registry()
        .add(record_for("idem", mock_peer::versioned_peer(tmp.path())))
        .unwrap();

    let first = manager.start("idem").await.unwrap();
    let second = manager.start("idem").await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    manager.stop("idem").await.unwrap();
}

#[tokio::test]
async fn start_stop_returns_to_stopped() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = manager(tmp.path());
    manager
        .registry()
        .add(record_for("cycle", mock_peer::versioned_peer(tmp.path())))
        .unwrap();

    assert_eq!(manager.status("cycle").state, ServerState::Stopped);
    manager.start("cycle").await.unwrap();
    assert_eq!(manager.status("cycle").state, ServerState::Running);
    assert!(manager.status("cycle").pid.is_some());
    manager.stop("cycle").await.unwrap();

    let status = manager.status("cycle");
    assert_eq!(status.state, ServerState::Stopped);
    assert!(status.pid.is_none());
    assert!(status.last_started.is_some());
    assert!(status.last_stopped.is_some());
}

#[tokio::test]
async fn start_unknown_server_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = manager(tmp.path());
    let err = manager.start("ghost").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn operations_outside_running_fail_not_connected() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = manager(tmp.path());
    manager
        .registry()
        .add(record_for("down", mock_peer::versioned_peer(tmp.path())))
        .unwrap();

    let session = manager.start("down").await.unwrap();
    manager.stop("down").await.unwrap();
    let err = session.list_tools().await.unwrap_err();
    assert!(matches!(err, Error::NotConnected));
}

#[tokio::test]
async fn restart_increments_counter() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = manager(tmp.path());
    manager
        .registry()
        .add(record_for("again", mock_peer::versioned_peer(tmp.path())))
        .unwrap();

    manager.start("again").await.unwrap();
    manager.restart("again").await.unwrap();
    let status = manager.status("again");
    assert_eq!(status.state, ServerState::Running);
    assert_eq!(status.restart_count, 1);
    manager.stop("again").await.unwrap();
}

#[tokio::test]
async fn uninstall_removes_record_and_session() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = manager(tmp.path());
    let mut rx = manager.subscribe();
    manager
        .registry()
        .add(record_for("gone", mock_peer::versioned_peer(tmp.path())))
        .unwrap();

    manager.start("gone").await.unwrap();
    manager.uninstall("gone").await.unwrap();

    assert!(manager.registry().get("gone").is_none());
    assert!(manager.get_client("gone").await.is_none());

    let events = collect_until(&mut rx, Duration::from_secs(5), |e| {
        matches!(e, HostEvent::ServerUninstalled { .. })
    })
    .await;
    assert!(events
        .iter()
        .any(|e| matches!(e, HostEvent::ServerUninstalled { .. })));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Crash handling
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn crash_reconnects_and_recovers() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = manager(tmp.path());
    let mut rx = manager.subscribe();
    manager
        .registry()
        .add(record_for(
            "flaky",
            mock_peer::crash_then_recover_peer(tmp.path()),
        ))
        .unwrap();

    let session = manager.start("flaky").await.unwrap();

    // The peer crashes shortly after connecting, reconnects once, and the
    // respawned process stays up: two connects in total.
    let mut connects = 0;
    let events = collect_until(&mut rx, Duration::from_secs(10), |e| {
        if matches!(e, HostEvent::ClientConnected { .. }) {
            connects += 1;
        }
        connects >= 2
    })
    .await;

    assert!(events
        .iter()
        .any(|e| matches!(e, HostEvent::ClientReconnecting { attempt: 1, .. })));
    // One disconnect for the crash, then a fresh connect.
    assert!(events
        .iter()
        .any(|e| matches!(e, HostEvent::ClientDisconnected { .. })));

    // Give the session a beat to finish discovery, then verify liveness.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(session.state(), ServerState::Running);
    manager.stop("flaky").await.unwrap();
}

#[tokio::test]
async fn repeated_crashes_latch_error_state() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = manager(tmp.path());
    let mut rx = manager.subscribe();
    manager
        .registry()
        .add(record_for("doomed", mock_peer::crash_once_peer(tmp.path())))
        .unwrap();

    let session = manager.start("doomed").await.unwrap();

    // Wait for the reconnect budget (3 attempts) to drain.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    while session.state() != ServerState::Error {
        assert!(
            tokio::time::Instant::now() < deadline,
            "session never latched error"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let events = collect_until(&mut rx, Duration::from_secs(2), |_| false).await;
    let attempts = events
        .iter()
        .filter(|e| matches!(e, HostEvent::ClientReconnecting { .. }))
        .count();
    assert_eq!(attempts, 3);

    // Status mirrors the latch.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while manager.status("doomed").state != ServerState::Error {
        assert!(
            tokio::time::Instant::now() < deadline,
            "registry status never reached error"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(manager.status("doomed").error_count >= 1);
}

#[tokio::test]
async fn stderr_noise_does_not_disturb_the_handshake() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = manager(tmp.path());
    let mut rx = manager.subscribe();
    manager
        .registry()
        .add(record_for("noisy", mock_peer::noisy_peer(tmp.path())))
        .unwrap();

    manager.start("noisy").await.unwrap();

    let events = collect_until(&mut rx, Duration::from_secs(5), |e| {
        matches!(e, HostEvent::ServerStarted { .. })
    })
    .await;

    let stderr_events: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            HostEvent::StderrOutput { line, is_error, .. } => Some((line.clone(), *is_error)),
            _ => None,
        })
        .collect();
    assert!(stderr_events.iter().any(|(l, _)| l.contains("npm notice")));
    assert!(stderr_events.iter().all(|(_, is_error)| !is_error));
    assert!(!events
        .iter()
        .any(|e| matches!(e, HostEvent::ClientError { .. })));

    manager.stop("noisy").await.unwrap();
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Health & bulk transfer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn health_probe_succeeds_when_running() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = manager(tmp.path());
    manager
        .registry()
        .add(record_for("healthy", mock_peer::versioned_peer(tmp.path())))
        .unwrap();

    manager.start("healthy").await.unwrap();
    manager.health("healthy").await.unwrap();
    manager.stop("healthy").await.unwrap();

    let err = manager.health("healthy").await.unwrap_err();
    assert!(matches!(err, Error::NotConnected));
}

#[tokio::test]
async fn export_import_preserves_listing() {
    let tmp = tempfile::tempdir().unwrap();
    let source = manager(tmp.path());
    source
        .registry()
        .add(record_for("a", Invocation::new("node")))
        .unwrap();
    source
        .registry()
        .add(record_for("b", Invocation::new("node")))
        .unwrap();

    let blob = source.registry().export(None).unwrap();

    let tmp2 = tempfile::tempdir().unwrap();
    let target = manager(tmp2.path());
    let outcome = target.registry().import(&blob, true);
    assert_eq!(outcome.imported, 2);

    let original: Vec<String> = source.list().into_iter().map(|r| r.id).collect();
    let imported: Vec<String> = target.list().into_iter().map(|r| r.id).collect();
    assert_eq!(original, imported);
}

#[tokio::test]
async fn auto_start_servers_report_outcomes() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = manager(tmp.path());

    let mut auto = record_for("auto", mock_peer::versioned_peer(tmp.path()));
    auto.metadata.auto_start = true;
    manager.registry().add(auto).unwrap();
    manager
        .registry()
        .add(record_for("manual", Invocation::new("node")))
        .unwrap();

    let outcomes = manager.start_auto_start_servers().await;
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].0, "auto");
    assert!(outcomes[0].1.is_ok());

    manager.stop_all().await;
    assert_eq!(manager.status("auto").state, ServerState::Stopped);
}
