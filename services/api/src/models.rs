//! API Models
//!
//! This module defines the data structures exposed by the HTTP status surface
//! and documented in the OpenAPI spec with `utoipa`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use utoipa::ToSchema;
use uuid::Uuid;

/// Lifecycle of a relay session. `Closed` is terminal.
#[derive(Debug, Serialize, Deserialize, ToSchema, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Connecting,
    Configuring,
    Active,
    Draining,
    Closed,
}

impl SessionState {
    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, Configuring)
                | (Connecting, Closed)
                | (Configuring, Active)
                | (Configuring, Closed)
                | (Active, Draining)
                | (Draining, Closed)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == SessionState::Closed
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Configuring => write!(f, "configuring"),
            SessionState::Active => write!(f, "active"),
            SessionState::Draining => write!(f, "draining"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct SessionSummary {
    #[schema(value_type = String, format = Uuid)]
    pub id: Uuid,
    #[schema(value_type = String, example = "active")]
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone)]
pub struct SessionsResponse {
    pub live_sessions: usize,
    pub sessions: Vec<SessionSummary>,
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone)]
pub struct HealthResponse {
    #[schema(example = "ok")]
    pub status: String,
    pub live_sessions: usize,
}

/// What the relay supports, for operational tooling.
#[derive(Serialize, Deserialize, ToSchema, Debug, Clone)]
pub struct RelayStatus {
    #[schema(example = "enabled")]
    pub status: String,
    #[schema(example = "openai")]
    pub provider: String,
    pub voice_to_voice: bool,
    pub barge_in: bool,
    #[schema(example = "server_side")]
    pub vad: String,
    pub tool_count: usize,
    pub tools: Vec<String>,
    pub max_sessions: usize,
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_session_state_serialization() {
        assert_eq!(serde_json::to_string(&SessionState::Active).unwrap(), "\"active\"");
        assert_eq!(serde_json::to_string(&SessionState::Draining).unwrap(), "\"draining\"");

        let closed: SessionState = serde_json::from_str("\"closed\"").unwrap();
        assert_eq!(closed, SessionState::Closed);
    }

    #[test]
    fn test_invalid_state_deserialization() {
        let result: Result<SessionState, _> = serde_json::from_str("\"Paused\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_session_state_display() {
        assert_eq!(format!("{}", SessionState::Configuring), "configuring");
        assert_eq!(format!("{}", SessionState::Closed), "closed");
    }

    #[test]
    fn test_state_machine_transitions() {
        use SessionState::*;
        assert!(Connecting.can_transition_to(Configuring));
        assert!(Connecting.can_transition_to(Closed));
        assert!(Configuring.can_transition_to(Active));
        assert!(Active.can_transition_to(Draining));
        assert!(Draining.can_transition_to(Closed));

        assert!(!Active.can_transition_to(Closed));
        assert!(!Active.can_transition_to(Active));
        assert!(!Draining.can_transition_to(Active));
        for next in [Connecting, Configuring, Active, Draining, Closed] {
            assert!(!Closed.can_transition_to(next));
        }
        assert!(Closed.is_terminal());
        assert!(!Draining.is_terminal());
    }

    #[test]
    fn test_session_summary_serialization() {
        let started_at = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap();
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let summary = SessionSummary {
            id,
            state: SessionState::Active,
            started_at,
        };

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["id"], "550e8400-e29b-41d4-a716-446655440000");
        assert_eq!(json["state"], "active");

        let deserialized: SessionSummary = serde_json::from_value(json).unwrap();
        assert_eq!(deserialized, summary);
    }

    #[test]
    fn test_error_response_serialization() {
        let error = ErrorResponse {
            message: "Session not found".to_string(),
        };
        let json = serde_json::to_string(&error).unwrap();
        assert_eq!(json, r#"{"message":"Session not found"}"#);
    }
}
