//! Opens upstream connections to the realtime AI backend.

pub mod openai;

use super::transport::Link;
use crate::error::RelayError;
use async_trait::async_trait;
use openai::RealtimeEndpoint;
use uuid::Uuid;

/// Opens one upstream connection per session.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    async fn connect(&self, session_id: Uuid) -> Result<Link, RelayError>;
}

/// Connects to the configured OpenAI or Azure realtime endpoint.
pub struct RealtimeConnector {
    endpoint: RealtimeEndpoint,
}

impl RealtimeConnector {
    pub fn new(endpoint: RealtimeEndpoint) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl UpstreamConnector for RealtimeConnector {
    async fn connect(&self, session_id: Uuid) -> Result<Link, RelayError> {
        tracing::debug!(%session_id, "Opening realtime upstream connection");
        self.endpoint.connect().await
    }
}
