//! Error types for fleetcoord

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Lock Errors ===
    /// The lease record does not exist yet (first-writer bootstrap).
    #[error("Lease record not found: {0}")]
    LeaseNotFound(String),

    #[error("Lease conflict: {0}")]
    LeaseConflict(String),

    #[error("Lock backend error: {0}")]
    Lock(String),

    // === Election Errors ===
    #[error("Leader has not renewed for {0:?}")]
    LeaderStale(std::time::Duration),

    // === Membership Errors ===
    #[error("Gossip transport error: {0}")]
    Transport(String),

    #[error("Join failed: {0}")]
    JoinFailed(String),

    #[error("Cluster bootstrap did not complete within {0:?}")]
    BootstrapTimeout(std::time::Duration),

    #[error("Metadata exceeds {limit} bytes ({size})")]
    MetadataTooLarge { size: usize, limit: usize },

    // === Routing Errors ===
    #[error("Unknown identifier: {0}")]
    UnknownIdentifier(String),

    #[error("No peer available for cluster {0}")]
    Unavailable(String),

    #[error("Upstream {peer} failed: {reason}")]
    Upstream { peer: String, reason: String },

    // === Network Errors ===
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    // === Serialization Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Config source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a transient coordination error worth another attempt?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::ConnectionFailed(_)
                | Error::Lock(_)
                | Error::LeaseConflict(_)
                | Error::Transport(_)
                | Error::JoinFailed(_)
                | Error::Io(_)
        )
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            // Routing misses are a domain answer, not a transport failure.
            Error::UnknownIdentifier(_) => StatusCode::OK,
            Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            Error::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Upstream { .. } | Error::Http(_) | Error::WebSocket(_) => {
                StatusCode::BAD_GATEWAY
            }
            Error::ConnectionFailed(_) => StatusCode::BAD_GATEWAY,
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Error::Timeout(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Lock("unreachable".into()).is_retryable());
        assert!(Error::Timeout("lock get".into()).is_retryable());
        assert!(!Error::InvalidConfig("bad".into()).is_retryable());
        assert!(!Error::UnknownIdentifier("s-1".into()).is_retryable());
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(
            Error::UnknownIdentifier("s-1".into()).to_http_status(),
            StatusCode::OK
        );
        assert_eq!(
            Error::Unavailable("east".into()).to_http_status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            Error::Upstream {
                peer: "10.0.0.2:8080".into(),
                reason: "502".into()
            }
            .to_http_status(),
            StatusCode::BAD_GATEWAY
        );
    }
}
