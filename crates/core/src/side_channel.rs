//! Side-channel events: caller-bound information that is not a direct reply to
//! a tool call, such as proactive product recommendations.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideChannelKind {
    /// Search results the caller UI should render.
    Products,
    /// A cart mutation the caller UI should apply.
    CartAction,
    /// Related items the AI was not asked about.
    Recommendation,
    /// A suggested video or image.
    MediaSuggestion,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SideChannelEvent {
    pub kind: SideChannelKind,
    /// Name of the tool that produced the event, when there is one.
    pub tool: Option<String>,
    pub payload: Value,
}

impl SideChannelEvent {
    pub fn new(kind: SideChannelKind, payload: Value) -> Self {
        Self {
            kind,
            tool: None,
            payload,
        }
    }

    pub fn from_tool(kind: SideChannelKind, tool: impl Into<String>, payload: Value) -> Self {
        Self {
            kind,
            tool: Some(tool.into()),
            payload,
        }
    }
}

/// Pushes side-channel events to a live session's caller.
///
/// Emission is fire-and-forget: implementations must not block and must log,
/// not propagate, delivery failures.
#[cfg_attr(test, mockall::automock)]
pub trait SideChannelNotifier: Send + Sync {
    fn emit(&self, session_id: Uuid, event: SideChannelEvent);
}

/// A notifier that drops everything. Useful when tools run outside a session.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

impl SideChannelNotifier for NullNotifier {
    fn emit(&self, session_id: Uuid, event: SideChannelEvent) {
        tracing::debug!(%session_id, kind = ?event.kind, "Dropping side-channel event without a notifier");
    }
}
