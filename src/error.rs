//! Error types for the discovery library.
//!
//! Probe-level failures never reach these variants: an unreachable or silent
//! address is simply "no device". What remains are input validation problems,
//! collaborator I/O, and orchestration failures of a scan itself.

/// Result type alias
pub type Result<T> = std::result::Result<T, DiscoveryError>;

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// Not a dotted-quad IPv4 address with octets in 0..=255
    #[error("invalid IPv4 address: {0}")]
    InvalidAddress(String),

    /// Port outside 1..=65535 or not a number
    #[error("invalid port: {0}")]
    InvalidPort(String),

    /// IR code that cannot be placed in the command URL
    #[error("invalid IR code: {0}")]
    InvalidIrCode(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// A probe task or the scan driver itself died (panic or abort)
    #[error("scan orchestration failed: {0}")]
    Orchestration(String),
}

impl From<tokio::task::JoinError> for DiscoveryError {
    fn from(err: tokio::task::JoinError) -> Self {
        DiscoveryError::Orchestration(err.to_string())
    }
}
