use crate::upstream::UpstreamError;
use std::io;

/// Why an inbound session ended without establishing a tunnel
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Malformed handshake bytes from the client; the connection is dropped silently
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("client I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProxyError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        ProxyError::ProtocolViolation(msg.into())
    }

    /// Errors caused by the client rather than by the outbound leg
    pub fn is_client_side(&self) -> bool {
        !matches!(self, ProxyError::Upstream(_))
    }
}

/// Result type for inbound sessions
pub type ProxyResult<T> = Result<T, ProxyError>;
