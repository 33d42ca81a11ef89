//! Server error types.

use thiserror::Error;

/// Errors surfaced by the relay server.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The listener could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that was requested.
        addr: String,
        /// Underlying socket error.
        #[source]
        source: std::io::Error,
    },
    /// Other server I/O failure.
    #[error("server I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The dispatch loop has stopped; no more events can be submitted.
    #[error("coordinator is no longer running")]
    CoordinatorGone,
    /// The Prometheus recorder could not be installed.
    #[error("failed to install metrics recorder: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_error_names_address() {
        let err = RelayError::Bind {
            addr: "0.0.0.0:80".into(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        let msg = err.to_string();
        assert!(msg.contains("0.0.0.0:80"));
        assert!(msg.contains("denied"));
    }

    #[test]
    fn coordinator_gone_display() {
        assert_eq!(
            RelayError::CoordinatorGone.to_string(),
            "coordinator is no longer running"
        );
    }

    #[test]
    fn io_from_conversion() {
        let err: RelayError = std::io::Error::other("boom").into();
        assert!(matches!(err, RelayError::Io(_)));
    }
}
