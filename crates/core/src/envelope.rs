//! Wire-neutral message envelope.
//!
//! Both codecs (caller-facing and upstream-facing) decode into and encode from
//! these types, so the session logic only ever matches on `EnvelopeKind`.

use crate::side_channel::SideChannelEvent;
use crate::tools::{ToolError, ToolSpec};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which side a message is travelling towards. Used only for routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    CallerBound,
    UpstreamBound,
}

/// A decoded message together with its routing direction.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub direction: Direction,
    pub kind: EnvelopeKind,
}

impl Envelope {
    pub fn caller_bound(kind: EnvelopeKind) -> Self {
        Self {
            direction: Direction::CallerBound,
            kind,
        }
    }

    pub fn upstream_bound(kind: EnvelopeKind) -> Self {
        Self {
            direction: Direction::UpstreamBound,
            kind,
        }
    }
}

/// Tagged message kinds. Every inbound frame is classified into exactly one of
/// these; new kinds must be handled wherever sessions match on them.
#[derive(Debug, Clone, PartialEq)]
pub enum EnvelopeKind {
    /// A chunk of base64-encoded PCM16 audio. Upstream audio names the
    /// response that produced it.
    AudioChunk {
        audio: String,
        response_id: Option<String>,
    },
    /// Speech activity, turn lifecycle and error signalling.
    Control(ControlSignal),
    /// The AI asks the relay to run a tool.
    ToolCallRequest(ToolCallRequest),
    /// The relay answers a previously issued tool call.
    ToolCallResult(ToolCallResult),
    /// A partial or final transcript of either party's speech.
    Transcript(Transcript),
    /// Typed user input, used instead of audio.
    TextInput { text: String },
    /// Caller-bound information not tied to any tool call.
    SideChannel(SideChannelEvent),
    /// The upstream configuration handshake.
    Configure(SessionConfig),
}

/// Control signals shared by both sides. Not every signal is meaningful in
/// both directions; codecs reject the ones their side cannot express.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlSignal {
    /// User speech started (caller-side or server-side voice detection).
    SpeechStarted,
    /// User speech stopped.
    SpeechStopped,
    /// Commit buffered input audio as a user turn.
    CommitAudio,
    /// Cancel the in-flight response.
    CancelResponse,
    /// Ask the upstream to generate a response.
    CreateResponse,
    /// The upstream started generating a response.
    ResponseStarted { response_id: Option<String> },
    /// The upstream finished (or cancelled) a response.
    ResponseDone {
        response_id: Option<String>,
        status: Option<String>,
    },
    /// The upstream connection opened its conversation.
    SessionCreated,
    /// The upstream acknowledged the configuration handshake.
    ConfigApplied,
    /// The relay is ready to stream for this session.
    SessionReady { session_id: String },
    /// The caller attempted to reconfigure the session. Ignored.
    ClientConfig,
    /// The caller uploaded an image for similarity search.
    ImageUploaded { image_id: String },
    /// The relay acknowledges an uploaded image.
    ImageReady { image_id: String, message: String },
    /// An error report; terminal for the session when sent by the relay itself.
    Error {
        code: Option<String>,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub call_id: String,
    pub tool_name: String,
    /// Raw JSON text as issued by the upstream.
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallResult {
    pub call_id: String,
    pub outcome: Result<Value, ToolError>,
}

impl ToolCallResult {
    /// Renders the outcome as the JSON text sent back upstream. Failures are
    /// wrapped as `{"error": {...}}` so the AI can narrate them.
    pub fn output_json(&self) -> String {
        let value = match &self.outcome {
            Ok(value) => value.clone(),
            Err(err) => serde_json::json!({ "error": err }),
        };
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub role: TranscriptRole,
    pub text: String,
    pub is_final: bool,
    /// Set for assistant speech.
    pub response_id: Option<String>,
}

impl EnvelopeKind {
    /// The response a streamed delta belongs to, if it names one.
    pub fn response_id(&self) -> Option<&str> {
        match self {
            EnvelopeKind::AudioChunk { response_id, .. } => response_id.as_deref(),
            EnvelopeKind::Transcript(transcript) => transcript.response_id.as_deref(),
            _ => None,
        }
    }
}

/// Turn detection policy sent in the handshake.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnDetection {
    ServerVad {
        threshold: f32,
        prefix_padding_ms: u32,
        silence_duration_ms: u32,
    },
    Disabled,
}

/// Side-neutral description of the upstream configuration handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub instructions: String,
    pub voice: String,
    pub audio_format: String,
    pub transcription_model: Option<String>,
    pub turn_detection: TurnDetection,
    pub tools: Vec<ToolSpec>,
    pub temperature: f32,
}

impl SessionConfig {
    pub fn new(instructions: impl Into<String>, tools: Vec<ToolSpec>) -> Self {
        Self {
            instructions: instructions.into(),
            voice: "alloy".to_string(),
            audio_format: "pcm16".to_string(),
            transcription_model: Some("whisper-1".to_string()),
            turn_detection: TurnDetection::ServerVad {
                threshold: 0.5,
                prefix_padding_ms: 300,
                silence_duration_ms: 500,
            },
            tools,
            temperature: 0.7,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_json_success() {
        let result = ToolCallResult {
            call_id: "c1".to_string(),
            outcome: Ok(serde_json::json!({ "count": 2 })),
        };
        assert_eq!(result.output_json(), r#"{"count":2}"#);
    }

    #[test]
    fn test_output_json_wraps_errors() {
        let result = ToolCallResult {
            call_id: "c1".to_string(),
            outcome: Err(ToolError::UnknownTool {
                tool: "teleport".to_string(),
            }),
        };
        let parsed: Value = serde_json::from_str(&result.output_json()).unwrap();
        assert_eq!(parsed["error"]["kind"], "unknown_tool");
        assert_eq!(parsed["error"]["tool"], "teleport");
    }

    #[test]
    fn test_session_config_defaults() {
        let config = SessionConfig::new("be helpful", vec![]);
        assert_eq!(config.voice, "alloy");
        assert_eq!(config.audio_format, "pcm16");
        assert!(matches!(
            config.turn_detection,
            TurnDetection::ServerVad { silence_duration_ms: 500, .. }
        ));
    }

    #[test]
    fn test_response_id_of_deltas() {
        let audio = EnvelopeKind::AudioChunk {
            audio: "AA".to_string(),
            response_id: Some("r1".to_string()),
        };
        assert_eq!(audio.response_id(), Some("r1"));
        let text = EnvelopeKind::Transcript(Transcript {
            role: TranscriptRole::User,
            text: "hi".to_string(),
            is_final: true,
            response_id: None,
        });
        assert_eq!(text.response_id(), None);
        assert_eq!(
            EnvelopeKind::Control(ControlSignal::ResponseStarted {
                response_id: Some("r1".to_string())
            })
            .response_id(),
            None
        );
    }

    #[test]
    fn test_envelope_constructors_set_direction() {
        let env = Envelope::caller_bound(EnvelopeKind::Control(ControlSignal::SpeechStarted));
        assert_eq!(env.direction, Direction::CallerBound);
        let env = Envelope::upstream_bound(EnvelopeKind::Control(ControlSignal::CancelResponse));
        assert_eq!(env.direction, Direction::UpstreamBound);
    }
}
