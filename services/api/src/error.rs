//! Connection-level errors of the relay.
//!
//! Tool failures never appear here: they are recovered inside the session and
//! sent upstream as structured tool results.

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("session limit of {limit} reached")]
    ResourceExhausted { limit: usize },
    #[error("the relay is shutting down")]
    ShuttingDown,
}

impl RelayError {
    /// Stable code reported to the caller in the terminal `error` message.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::ResourceExhausted { .. } => "resource_exhausted",
            Self::ShuttingDown => "server_shutdown",
        }
    }
}
