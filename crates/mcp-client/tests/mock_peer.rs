//! Scripted mock MCP peers for integration tests.
//!
//! Each peer is a small `/bin/sh` script speaking newline-delimited
//! JSON-RPC on stdio. Request ids are assigned monotonically from 1 by the
//! transport and the handshake/discovery sequence is deterministic, so the
//! scripts either hardcode response ids or count `"id":` lines.

#![allow(dead_code)]

use std::path::Path;

use stevedore_domain::record::Invocation;

/// Write `body` as an executable peer script and return its invocation.
pub fn script_peer(dir: &Path, name: &str, body: &str) -> Invocation {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    Invocation::new("sh").with_args([path.to_string_lossy().to_string()])
}

/// A minimal well-behaved peer: one `echo` tool, no version claims.
///
/// Omitting `protocolVersion` exercises the assume-host-preferred path.
/// Sequence: initialize(1) → initialized → tools/list(2) → tools/call(3).
pub fn simple_tools_peer(dir: &Path) -> Invocation {
    script_peer(
        dir,
        "simple_peer.sh",
        r#"read line
printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"capabilities":{"tools":{}},"serverInfo":{"name":"mock","version":"1.0"}}}'
read line
read line
printf '%s\n' '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"echo","description":"echo back","inputSchema":{"type":"object","properties":{"message":{"type":"string"}}}}]}}'
read line
printf '%s\n' '{"jsonrpc":"2.0","id":3,"result":{"content":[{"type":"text","text":"hi"}]}}'
read line
read line
"#,
    )
}

/// A peer that claims `2024-11-05`, forcing the re-issued initialize, and
/// serves tools/resources/prompts.
pub fn versioned_peer(dir: &Path) -> Invocation {
    script_peer(
        dir,
        "versioned_peer.sh",
        r#"id=0
while read line; do
  case "$line" in
    *'"id":'*) id=$((id+1)) ;;
    *) continue ;;
  esac
  case "$line" in
    *'"method":"initialize"'*)
      printf '%s\n' "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{\"protocolVersion\":\"2024-11-05\",\"capabilities\":{\"tools\":{},\"resources\":{},\"prompts\":{}},\"serverInfo\":{\"name\":\"versioned\",\"version\":\"2.0\"}}}" ;;
    *'"method":"tools/list"'*)
      printf '%s\n' "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{\"tools\":[{\"name\":\"echo\",\"inputSchema\":{\"type\":\"object\",\"properties\":{\"message\":{\"type\":\"string\"}}}}]}}" ;;
    *'"method":"resources/list"'*)
      printf '%s\n' "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{\"resources\":[{\"uri\":\"mock://greeting\",\"name\":\"greeting\"}]}}" ;;
    *'"method":"resources/read"'*)
      printf '%s\n' "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{\"contents\":[{\"uri\":\"mock://greeting\",\"text\":\"hello\"}]}}" ;;
    *'"method":"prompts/list"'*)
      printf '%s\n' "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{\"prompts\":[{\"name\":\"greet\",\"description\":\"say hi\"}]}}" ;;
    *'"method":"prompts/get"'*)
      printf '%s\n' "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{\"description\":\"greet\",\"messages\":[]}}" ;;
    *'"method":"tools/call"'*)
      printf '%s\n' "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{\"content\":[{\"type\":\"text\",\"text\":\"hi\"}]}}" ;;
  esac
done
"#,
    )
}

/// A legacy peer: rejects every initialize except `2024-09-24`.
pub fn legacy_peer(dir: &Path) -> Invocation {
    script_peer(
        dir,
        "legacy_peer.sh",
        r#"id=0
while read line; do
  case "$line" in
    *'"id":'*) id=$((id+1)) ;;
    *) continue ;;
  esac
  case "$line" in
    *'"method":"initialize"'*'2024-09-24'*)
      printf '%s\n' "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{\"protocolVersion\":\"2024-09-24\",\"capabilities\":{\"tools\":{}}}}" ;;
    *'"method":"initialize"'*)
      printf '%s\n' "{\"jsonrpc\":\"2.0\",\"id\":$id,\"error\":{\"code\":-32602,\"message\":\"unsupported protocol version\"}}" ;;
    *'"method":"tools/list"'*)
      printf '%s\n' "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{\"tools\":[]}}" ;;
  esac
done
"#,
    )
}

/// A peer that serves one handshake per marker file, then crashes with an
/// unusual exit code; later spawns die immediately. Drives the reconnect
/// policy into its latch.
pub fn crash_once_peer(dir: &Path) -> Invocation {
    let marker = dir.join("crash.marker");
    let body = format!(
        r#"if [ -f "{marker}" ]; then exit 9; fi
touch "{marker}"
read line
printf '%s\n' '{{"jsonrpc":"2.0","id":1,"result":{{"capabilities":{{"tools":{{}}}}}}}}'
read line
read line
printf '%s\n' '{{"jsonrpc":"2.0","id":2,"result":{{"tools":[]}}}}'
exit 9
"#,
        marker = marker.display()
    );
    script_peer(dir, "crash_once_peer.sh", &body)
}

/// A peer that crashes once after connecting, then behaves on respawn.
pub fn crash_then_recover_peer(dir: &Path) -> Invocation {
    let marker = dir.join("recover.marker");
    let body = format!(
        r#"read line
printf '%s\n' '{{"jsonrpc":"2.0","id":1,"result":{{"capabilities":{{"tools":{{}}}}}}}}'
read line
read line
printf '%s\n' '{{"jsonrpc":"2.0","id":2,"result":{{"tools":[]}}}}'
if [ ! -f "{marker}" ]; then
  touch "{marker}"
  exit 9
fi
read line
read line
"#,
        marker = marker.display()
    );
    script_peer(dir, "crash_recover_peer.sh", &body)
}

/// A peer that spews package-manager noise on stderr before serving.
pub fn noisy_peer(dir: &Path) -> Invocation {
    script_peer(
        dir,
        "noisy_peer.sh",
        r#"echo 'npm notice created a lockfile' >&2
echo 'mock server running on stdio' >&2
read line
printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"capabilities":{"tools":{}}}}'
read line
read line
printf '%s\n' '{"jsonrpc":"2.0","id":2,"result":{"tools":[]}}'
read line
read line
"#,
    )
}
