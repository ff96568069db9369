//! Defines the WebSocket message protocol between the browser client and the relay.

use super::{
    codec::{DecodeError, EncodeError, WireCodec, describe_binary},
    transport::Frame,
};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use concierge_core::{
    ControlSignal, Envelope, EnvelopeKind, SideChannelEvent, SideChannelKind, Transcript,
    TranscriptRole,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages sent from the client (browser) to the relay.
///
/// Struct variants with no fields tolerate extra keys such as `event_id`.
#[derive(Deserialize, Debug, PartialEq)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Base64 PCM16 audio from the microphone.
    #[serde(rename = "audio", alias = "input_audio_buffer.append")]
    Audio { audio: String },
    #[serde(rename = "audio.commit", alias = "input_audio_buffer.commit")]
    AudioCommit {},
    /// Client-side voice detection heard the user start talking.
    #[serde(rename = "speech.started")]
    SpeechStarted {},
    #[serde(rename = "speech.stopped")]
    SpeechStopped {},
    #[serde(rename = "response.cancel", alias = "cancel")]
    Cancel {},
    /// Typed input instead of speech.
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image.uploaded")]
    ImageUploaded { image_id: String },
    /// Client attempts at reconfiguring are acknowledged and ignored.
    #[serde(rename = "session.update")]
    SessionUpdate {
        #[serde(default)]
        session: Option<Value>,
    },
}

/// Messages sent from the relay to the client (browser).
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// The upstream accepted the configuration; streaming may begin.
    #[serde(rename = "session.ready")]
    SessionReady { session_id: String },
    /// A chunk of the AI's voice (base64 PCM16).
    #[serde(rename = "audio")]
    Audio { audio: String },
    #[serde(rename = "transcript")]
    Transcript {
        role: TranscriptRole,
        text: String,
        is_final: bool,
    },
    #[serde(rename = "user_speech_started")]
    UserSpeechStarted,
    #[serde(rename = "user_speech_stopped")]
    UserSpeechStopped,
    #[serde(rename = "response.started")]
    ResponseStarted { response_id: Option<String> },
    #[serde(rename = "response.complete")]
    ResponseComplete {
        response_id: Option<String>,
        status: Option<String>,
    },
    /// Reports an error; terminal when sent right before the relay closes.
    #[serde(rename = "error")]
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        message: String,
    },
    #[serde(rename = "image.ready")]
    ImageReady { image_id: String, message: String },
    #[serde(rename = "products")]
    Products { tool: Option<String>, data: Value },
    #[serde(rename = "cart_action")]
    CartAction { action: Option<String>, data: Value },
    #[serde(rename = "recommendations")]
    Recommendations { tool: Option<String>, data: Value },
    #[serde(rename = "media_suggestion")]
    MediaSuggestion { tool: Option<String>, data: Value },
}

impl ServerMessage {
    fn from_side_channel(event: &SideChannelEvent) -> Self {
        let tool = event.tool.clone();
        let data = event.payload.clone();
        match event.kind {
            SideChannelKind::Products => Self::Products { tool, data },
            SideChannelKind::CartAction => Self::CartAction {
                action: data
                    .get("action")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                data,
            },
            SideChannelKind::Recommendation => Self::Recommendations { tool, data },
            SideChannelKind::MediaSuggestion => Self::MediaSuggestion { tool, data },
        }
    }
}

impl From<ClientMessage> for EnvelopeKind {
    fn from(msg: ClientMessage) -> Self {
        match msg {
            ClientMessage::Audio { audio } => EnvelopeKind::AudioChunk {
                audio,
                response_id: None,
            },
            ClientMessage::AudioCommit {} => EnvelopeKind::Control(ControlSignal::CommitAudio),
            ClientMessage::SpeechStarted {} => EnvelopeKind::Control(ControlSignal::SpeechStarted),
            ClientMessage::SpeechStopped {} => EnvelopeKind::Control(ControlSignal::SpeechStopped),
            ClientMessage::Cancel {} => EnvelopeKind::Control(ControlSignal::CancelResponse),
            ClientMessage::Text { text } => EnvelopeKind::TextInput { text },
            ClientMessage::ImageUploaded { image_id } => {
                EnvelopeKind::Control(ControlSignal::ImageUploaded { image_id })
            }
            ClientMessage::SessionUpdate { .. } => EnvelopeKind::Control(ControlSignal::ClientConfig),
        }
    }
}

/// Codec for the caller-facing side.
#[derive(Debug, Default, Clone, Copy)]
pub struct CallerCodec;

impl CallerCodec {
    /// The message the caller receives for a relay-side failure.
    pub fn error_frame(code: &str, message: impl Into<String>) -> Result<Frame, EncodeError> {
        let msg = ServerMessage::Error {
            code: Some(code.to_string()),
            message: message.into(),
        };
        Ok(Frame::Text(serde_json::to_string(&msg)?))
    }

    fn to_server_message(kind: &EnvelopeKind) -> Result<ServerMessage, EncodeError> {
        let unsupported = |kind| EncodeError::Unsupported {
            kind,
            side: "caller",
        };
        let msg = match kind {
            EnvelopeKind::AudioChunk { audio, .. } => ServerMessage::Audio {
                audio: audio.clone(),
            },
            EnvelopeKind::Transcript(Transcript {
                role,
                text,
                is_final,
                ..
            }) => ServerMessage::Transcript {
                role: *role,
                text: text.clone(),
                is_final: *is_final,
            },
            EnvelopeKind::SideChannel(event) => ServerMessage::from_side_channel(event),
            EnvelopeKind::Control(signal) => match signal {
                ControlSignal::SessionReady { session_id } => ServerMessage::SessionReady {
                    session_id: session_id.clone(),
                },
                ControlSignal::SpeechStarted => ServerMessage::UserSpeechStarted,
                ControlSignal::SpeechStopped => ServerMessage::UserSpeechStopped,
                ControlSignal::ResponseStarted { response_id } => ServerMessage::ResponseStarted {
                    response_id: response_id.clone(),
                },
                ControlSignal::ResponseDone {
                    response_id,
                    status,
                } => ServerMessage::ResponseComplete {
                    response_id: response_id.clone(),
                    status: status.clone(),
                },
                ControlSignal::Error { code, message } => ServerMessage::Error {
                    code: code.clone(),
                    message: message.clone(),
                },
                ControlSignal::ImageReady { image_id, message } => ServerMessage::ImageReady {
                    image_id: image_id.clone(),
                    message: message.clone(),
                },
                ControlSignal::CommitAudio => return Err(unsupported("audio commit")),
                ControlSignal::CancelResponse => return Err(unsupported("response cancel")),
                ControlSignal::CreateResponse => return Err(unsupported("response create")),
                ControlSignal::SessionCreated => return Err(unsupported("session created")),
                ControlSignal::ConfigApplied => return Err(unsupported("config applied")),
                ControlSignal::ClientConfig => return Err(unsupported("client config")),
                ControlSignal::ImageUploaded { .. } => return Err(unsupported("image upload")),
            },
            EnvelopeKind::ToolCallRequest(_) => return Err(unsupported("tool call request")),
            EnvelopeKind::ToolCallResult(_) => return Err(unsupported("tool call result")),
            EnvelopeKind::TextInput { .. } => return Err(unsupported("text input")),
            EnvelopeKind::Configure(_) => return Err(unsupported("session configuration")),
        };
        Ok(msg)
    }
}

impl WireCodec for CallerCodec {
    fn decode(&self, frame: &Frame) -> Result<Option<Envelope>, DecodeError> {
        let kind = match frame {
            Frame::Text(text) => {
                let msg: ClientMessage =
                    serde_json::from_str(text).map_err(|e| DecodeError::malformed(text, e))?;
                EnvelopeKind::from(msg)
            }
            Frame::Binary(data) => {
                if data.len() % 2 != 0 {
                    return Err(DecodeError::Malformed {
                        raw: describe_binary(data.len()),
                        reason: "PCM16 audio must have an even number of bytes".to_string(),
                    });
                }
                EnvelopeKind::AudioChunk {
                    audio: BASE64.encode(data),
                    response_id: None,
                }
            }
            Frame::Close => return Ok(None),
        };
        Ok(Some(Envelope::upstream_bound(kind)))
    }

    fn encode(&self, envelope: &Envelope) -> Result<Frame, EncodeError> {
        let msg = Self::to_server_message(&envelope.kind)?;
        Ok(Frame::Text(serde_json::to_string(&msg)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use serde_json::json;

    fn decode(text: &str) -> Result<Option<Envelope>, DecodeError> {
        CallerCodec.decode(&Frame::Text(text.to_string()))
    }

    fn encode(kind: EnvelopeKind) -> Value {
        match CallerCodec.encode(&Envelope::caller_bound(kind)).unwrap() {
            Frame::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_decode_audio_and_its_alias() {
        for ty in ["audio", "input_audio_buffer.append"] {
            let env = decode(&json!({ "type": ty, "audio": "AAAA" }).to_string())
                .unwrap()
                .unwrap();
            assert_eq!(
                env.kind,
                EnvelopeKind::AudioChunk {
                    audio: "AAAA".to_string(),
                    response_id: None,
                }
            );
        }
    }

    #[test]
    fn test_decode_control_messages_with_extra_fields() {
        let env = decode(r#"{"type":"speech.started","event_id":"e1"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(env.kind, EnvelopeKind::Control(ControlSignal::SpeechStarted));

        let env = decode(r#"{"type":"cancel"}"#).unwrap().unwrap();
        assert_eq!(env.kind, EnvelopeKind::Control(ControlSignal::CancelResponse));

        let env = decode(r#"{"type":"input_audio_buffer.commit"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(env.kind, EnvelopeKind::Control(ControlSignal::CommitAudio));

        let env = decode(r#"{"type":"session.update","session":{"voice":"echo"}}"#)
            .unwrap()
            .unwrap();
        assert_eq!(env.kind, EnvelopeKind::Control(ControlSignal::ClientConfig));
    }

    #[test]
    fn test_decode_binary_audio_is_base64_encoded() {
        let env = CallerCodec
            .decode(&Frame::Binary(Bytes::from_static(&[1, 0, 2, 0])))
            .unwrap()
            .unwrap();
        assert_eq!(env.direction, concierge_core::Direction::UpstreamBound);
        assert_eq!(
            env.kind,
            EnvelopeKind::AudioChunk {
                audio: "AQACAA==".to_string(),
                response_id: None,
            }
        );
    }

    #[test]
    fn test_decode_odd_length_binary_is_rejected() {
        let err = CallerCodec
            .decode(&Frame::Binary(Bytes::from_static(&[1, 0, 2])))
            .unwrap_err();
        assert!(matches!(err, DecodeError::Malformed { .. }));
        assert!(err.raw().contains("3 bytes"));
    }

    #[test]
    fn test_decode_failures_carry_the_raw_payload() {
        let err = decode(r#"{"type":"teleport"}"#).unwrap_err();
        assert_eq!(err.raw(), r#"{"type":"teleport"}"#);

        let err = decode("not json at all").unwrap_err();
        assert_eq!(err.raw(), "not json at all");
    }

    #[test]
    fn test_close_frame_decodes_to_nothing() {
        assert_eq!(CallerCodec.decode(&Frame::Close).unwrap(), None);
    }

    #[test]
    fn test_encode_transcript_and_speech_signals() {
        let value = encode(EnvelopeKind::Transcript(Transcript {
            role: TranscriptRole::Assistant,
            text: "Hello".to_string(),
            is_final: false,
            response_id: Some("r1".to_string()),
        }));
        assert_eq!(
            value,
            json!({ "type": "transcript", "role": "assistant", "text": "Hello", "is_final": false })
        );

        let value = encode(EnvelopeKind::Control(ControlSignal::SpeechStarted));
        assert_eq!(value, json!({ "type": "user_speech_started" }));
    }

    #[test]
    fn test_encode_side_channel_events() {
        let value = encode(EnvelopeKind::SideChannel(SideChannelEvent::from_tool(
            SideChannelKind::Recommendation,
            "search_products",
            json!([{ "id": "p-1" }]),
        )));
        assert_eq!(value["type"], "recommendations");
        assert_eq!(value["tool"], "search_products");
        assert_eq!(value["data"][0]["id"], "p-1");

        let value = encode(EnvelopeKind::SideChannel(SideChannelEvent::from_tool(
            SideChannelKind::CartAction,
            "add_to_cart",
            json!({ "action": "add", "product_id": "p-1" }),
        )));
        assert_eq!(value["type"], "cart_action");
        assert_eq!(value["action"], "add");
    }

    #[test]
    fn test_encode_error_omits_missing_code() {
        let value = encode(EnvelopeKind::Control(ControlSignal::Error {
            code: None,
            message: "boom".to_string(),
        }));
        assert_eq!(value, json!({ "type": "error", "message": "boom" }));
    }

    #[test]
    fn test_encode_rejects_upstream_only_kinds() {
        let err = CallerCodec
            .encode(&Envelope::caller_bound(EnvelopeKind::Control(
                ControlSignal::CancelResponse,
            )))
            .unwrap_err();
        assert!(matches!(err, EncodeError::Unsupported { side: "caller", .. }));
    }

    #[test]
    fn test_error_frame() {
        let Frame::Text(text) = CallerCodec::error_frame("resource_exhausted", "full").unwrap() else {
            panic!("expected text frame");
        };
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["code"], "resource_exhausted");
        assert_eq!(value["message"], "full");
    }
}
