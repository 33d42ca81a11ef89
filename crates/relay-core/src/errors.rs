//! Transport error types.

use thiserror::Error;

/// Failure reading from or writing to a connection's duplex stream.
///
/// Always local to one connection; the coordinator never sees the reason,
/// only the resulting removal.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The stream is already closed.
    #[error("connection closed")]
    Closed,
    /// Underlying socket I/O failed.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The peer violated the framing protocol.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Short classification string for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Io(_) => "io",
            Self::Protocol(_) => "protocol",
        }
    }
}
