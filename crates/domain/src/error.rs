/// Shared error type used across all stevedore crates.
///
/// One enum per the host's error taxonomy: transport-level failures,
/// per-call timeouts, lifecycle violations, peer-reported errors,
/// installer failures, and persistence failures.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("transport: {0}")]
    Transport(String),

    #[error("timeout waiting for response to {method}")]
    Timeout { method: String },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("not connected")]
    NotConnected,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{method}: peer error {code}: {message}")]
    Peer {
        method: String,
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    #[error("validation: {0}")]
    Validation(String),

    #[error("unknown protocol version: {0}")]
    UnknownVersion(String),

    #[error("no compatible protocol version (peer offered: {0})")]
    NoCompatibleVersion(String),

    #[error("install: {0}")]
    Install(String),

    #[error("security: {0}")]
    SecurityBlocked(String),

    #[error("registry: {0}")]
    Registry(String),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn handshake(msg: impl Into<String>) -> Self {
        Self::Handshake(msg.into())
    }

    pub fn install(msg: impl Into<String>) -> Self {
        Self::Install(msg.into())
    }

    pub fn registry(msg: impl Into<String>) -> Self {
        Self::Registry(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn peer(
        method: impl Into<String>,
        code: i64,
        message: impl Into<String>,
        data: Option<serde_json::Value>,
    ) -> Self {
        Self::Peer {
            method: method.into(),
            code,
            message: message.into(),
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_display_includes_method() {
        let err = Error::Timeout {
            method: "tools/call".into(),
        };
        assert!(err.to_string().contains("tools/call"));
    }

    #[test]
    fn peer_error_prepends_method() {
        let err = Error::peer("tools/call", -32601, "Method not found", None);
        let text = err.to_string();
        assert!(text.starts_with("tools/call"));
        assert!(text.contains("-32601"));
    }

    #[test]
    fn io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
