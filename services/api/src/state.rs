//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds the shared resources
//! every handler needs: configuration, the tool registry and the session table.

use crate::{config::Config, ws::SessionManager};
use concierge_core::ToolRegistry;
use std::sync::Arc;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<ToolRegistry>,
    pub sessions: Arc<SessionManager>,
}
