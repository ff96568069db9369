//! The OpenAI Realtime event protocol, used by both the OpenAI and Azure
//! upstream flavours.

use crate::{
    config::{Config, Provider},
    error::RelayError,
    ws::{
        codec::{DecodeError, EncodeError, WireCodec, describe_binary},
        transport::{Frame, Link},
    },
};
use anyhow::Context;
use concierge_core::{
    ControlSignal, Envelope, EnvelopeKind, SessionConfig, ToolCallRequest, ToolSpec, Transcript,
    TranscriptRole, TurnDetection,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, handshake::client::Request, http::HeaderValue},
};
use tracing::info;

// --- Client events (relay -> upstream) ---

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SessionUpdate {
    pub modalities: Vec<String>,
    pub instructions: String,
    pub voice: String,
    pub input_audio_format: String,
    pub output_audio_format: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<InputAudioTranscription>,
    /// `null` disables turn detection.
    pub turn_detection: Option<WireTurnDetection>,
    pub tools: Vec<ToolDef>,
    pub tool_choice: String,
    pub temperature: f32,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct InputAudioTranscription {
    pub model: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireTurnDetection {
    ServerVad {
        threshold: f32,
        prefix_padding_ms: u32,
        silence_duration_ms: u32,
    },
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ToolDef {
    #[serde(rename = "type")]
    pub tool_type: &'static str,
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl From<&ToolSpec> for ToolDef {
    fn from(spec: &ToolSpec) -> Self {
        Self {
            tool_type: "function",
            name: spec.name.clone(),
            description: spec.description.clone(),
            parameters: spec.parameters.clone(),
        }
    }
}

impl From<&SessionConfig> for SessionUpdate {
    fn from(config: &SessionConfig) -> Self {
        let turn_detection = match config.turn_detection {
            TurnDetection::ServerVad {
                threshold,
                prefix_padding_ms,
                silence_duration_ms,
            } => Some(WireTurnDetection::ServerVad {
                threshold,
                prefix_padding_ms,
                silence_duration_ms,
            }),
            TurnDetection::Disabled => None,
        };
        Self {
            modalities: vec!["text".to_string(), "audio".to_string()],
            instructions: config.instructions.clone(),
            voice: config.voice.clone(),
            input_audio_format: config.audio_format.clone(),
            output_audio_format: config.audio_format.clone(),
            input_audio_transcription: config
                .transcription_model
                .clone()
                .map(|model| InputAudioTranscription { model }),
            turn_detection,
            tools: config.tools.iter().map(ToolDef::from).collect(),
            tool_choice: "auto".to_string(),
            temperature: config.temperature,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationItem {
    Message {
        role: &'static str,
        content: Vec<ContentPart>,
    },
    FunctionCallOutput {
        call_id: String,
        output: String,
    },
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    InputText { text: String },
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionUpdate },
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },
    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioBufferCommit,
    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },
    #[serde(rename = "response.create")]
    ResponseCreate,
    #[serde(rename = "response.cancel")]
    ResponseCancel,
}

// --- Server events (upstream -> relay) ---

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ApiError {
    #[serde(default)]
    pub code: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ResponseInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// Only the events the relay acts on are modelled; everything else lands in
/// `Other` and is ignored.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "error")]
    Error { error: ApiError },
    #[serde(rename = "session.created")]
    SessionCreated {},
    #[serde(rename = "session.updated")]
    SessionUpdated {},
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted {},
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped {},
    #[serde(rename = "conversation.item.input_audio_transcription.delta")]
    InputTranscriptionDelta { delta: String },
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscriptionCompleted { transcript: String },
    #[serde(rename = "response.created")]
    ResponseCreated {
        #[serde(default)]
        response: ResponseInfo,
    },
    #[serde(rename = "response.done")]
    ResponseDone {
        #[serde(default)]
        response: ResponseInfo,
    },
    #[serde(rename = "response.audio.delta")]
    AudioDelta {
        delta: String,
        #[serde(default)]
        response_id: Option<String>,
    },
    #[serde(rename = "response.audio_transcript.delta")]
    AudioTranscriptDelta {
        delta: String,
        #[serde(default)]
        response_id: Option<String>,
    },
    #[serde(rename = "response.audio_transcript.done")]
    AudioTranscriptDone {
        transcript: String,
        #[serde(default)]
        response_id: Option<String>,
    },
    #[serde(rename = "response.text.delta")]
    TextDelta {
        delta: String,
        #[serde(default)]
        response_id: Option<String>,
    },
    #[serde(rename = "response.text.done")]
    TextDone {
        text: String,
        #[serde(default)]
        response_id: Option<String>,
    },
    /// `arguments` is JSON-encoded text; any other shape is kept so the call
    /// can still be answered.
    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallArgumentsDone {
        call_id: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        arguments: Value,
    },
    #[serde(other)]
    Other,
}

fn transcript(
    role: TranscriptRole,
    text: String,
    is_final: bool,
    response_id: Option<String>,
) -> EnvelopeKind {
    EnvelopeKind::Transcript(Transcript {
        role,
        text,
        is_final,
        response_id,
    })
}

/// The raw argument text of a function call, or why it cannot be used.
fn argument_text(arguments: Value) -> Result<String, (String, String)> {
    let raw = match arguments {
        Value::Null => return Ok(String::new()),
        Value::String(raw) => raw,
        other => {
            return Err((
                other.to_string(),
                format!("arguments must be a JSON-encoded string, got {}", json_type(&other)),
            ));
        }
    };
    if !raw.trim().is_empty() {
        if let Err(e) = serde_json::from_str::<Value>(&raw) {
            return Err((raw, e.to_string()));
        }
    }
    Ok(raw)
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Codec for the upstream side.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenAiCodec;

impl OpenAiCodec {
    fn classify(event: ServerEvent) -> Result<Option<EnvelopeKind>, DecodeError> {
        let kind = match event {
            ServerEvent::Error { error } => EnvelopeKind::Control(ControlSignal::Error {
                code: error.code,
                message: error.message,
            }),
            ServerEvent::SessionCreated {} => EnvelopeKind::Control(ControlSignal::SessionCreated),
            ServerEvent::SessionUpdated {} => EnvelopeKind::Control(ControlSignal::ConfigApplied),
            ServerEvent::SpeechStarted {} => EnvelopeKind::Control(ControlSignal::SpeechStarted),
            ServerEvent::SpeechStopped {} => EnvelopeKind::Control(ControlSignal::SpeechStopped),
            ServerEvent::InputTranscriptionDelta { delta } => {
                transcript(TranscriptRole::User, delta, false, None)
            }
            ServerEvent::InputTranscriptionCompleted { transcript: text } => {
                transcript(TranscriptRole::User, text, true, None)
            }
            ServerEvent::ResponseCreated { response } => {
                EnvelopeKind::Control(ControlSignal::ResponseStarted {
                    response_id: response.id,
                })
            }
            ServerEvent::ResponseDone { response } => {
                EnvelopeKind::Control(ControlSignal::ResponseDone {
                    response_id: response.id,
                    status: response.status,
                })
            }
            ServerEvent::AudioDelta { delta, response_id } => EnvelopeKind::AudioChunk {
                audio: delta,
                response_id,
            },
            ServerEvent::AudioTranscriptDelta { delta, response_id }
            | ServerEvent::TextDelta { delta, response_id } => {
                transcript(TranscriptRole::Assistant, delta, false, response_id)
            }
            ServerEvent::AudioTranscriptDone {
                transcript: text,
                response_id,
            }
            | ServerEvent::TextDone { text, response_id } => {
                transcript(TranscriptRole::Assistant, text, true, response_id)
            }
            ServerEvent::FunctionCallArgumentsDone {
                call_id,
                name,
                arguments,
            } => {
                let tool_name = name.unwrap_or_default();
                match argument_text(arguments) {
                    Ok(arguments) => EnvelopeKind::ToolCallRequest(ToolCallRequest {
                        call_id,
                        tool_name,
                        arguments,
                    }),
                    Err((raw_arguments, reason)) => {
                        return Err(DecodeError::MalformedToolCall {
                            call_id,
                            tool_name,
                            raw_arguments,
                            reason,
                        });
                    }
                }
            }
            ServerEvent::Other => return Ok(None),
        };
        Ok(Some(kind))
    }

    fn to_client_event(kind: &EnvelopeKind) -> Result<ClientEvent, EncodeError> {
        let unsupported = |kind| EncodeError::Unsupported {
            kind,
            side: "upstream",
        };
        let event = match kind {
            EnvelopeKind::Configure(config) => ClientEvent::SessionUpdate {
                session: SessionUpdate::from(config),
            },
            EnvelopeKind::AudioChunk { audio, .. } => ClientEvent::InputAudioBufferAppend {
                audio: audio.clone(),
            },
            EnvelopeKind::TextInput { text } => ClientEvent::ConversationItemCreate {
                item: ConversationItem::Message {
                    role: "user",
                    content: vec![ContentPart::InputText { text: text.clone() }],
                },
            },
            EnvelopeKind::ToolCallResult(result) => ClientEvent::ConversationItemCreate {
                item: ConversationItem::FunctionCallOutput {
                    call_id: result.call_id.clone(),
                    output: result.output_json(),
                },
            },
            EnvelopeKind::Control(signal) => match signal {
                ControlSignal::CommitAudio => ClientEvent::InputAudioBufferCommit,
                ControlSignal::CancelResponse => ClientEvent::ResponseCancel,
                ControlSignal::CreateResponse => ClientEvent::ResponseCreate,
                ControlSignal::SpeechStarted
                | ControlSignal::SpeechStopped
                | ControlSignal::ResponseStarted { .. }
                | ControlSignal::ResponseDone { .. }
                | ControlSignal::SessionCreated
                | ControlSignal::ConfigApplied
                | ControlSignal::SessionReady { .. }
                | ControlSignal::ClientConfig
                | ControlSignal::ImageUploaded { .. }
                | ControlSignal::ImageReady { .. }
                | ControlSignal::Error { .. } => return Err(unsupported("control signal")),
            },
            EnvelopeKind::ToolCallRequest(_) => return Err(unsupported("tool call request")),
            EnvelopeKind::Transcript(_) => return Err(unsupported("transcript")),
            EnvelopeKind::SideChannel(_) => return Err(unsupported("side-channel event")),
        };
        Ok(event)
    }
}

impl WireCodec for OpenAiCodec {
    fn decode(&self, frame: &Frame) -> Result<Option<Envelope>, DecodeError> {
        match frame {
            Frame::Text(text) => {
                let event: ServerEvent =
                    serde_json::from_str(text).map_err(|e| DecodeError::malformed(text, e))?;
                Ok(Self::classify(event)?.map(Envelope::caller_bound))
            }
            Frame::Binary(data) => Err(DecodeError::Unsupported {
                raw: describe_binary(data.len()),
                kind: "binary",
            }),
            Frame::Close => Ok(None),
        }
    }

    fn encode(&self, envelope: &Envelope) -> Result<Frame, EncodeError> {
        let event = Self::to_client_event(&envelope.kind)?;
        Ok(Frame::Text(serde_json::to_string(&event)?))
    }
}

// --- Connection ---

/// Where and how to open the upstream WebSocket.
#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeEndpoint {
    OpenAi {
        url: String,
        model: String,
        api_key: String,
    },
    Azure {
        endpoint: String,
        deployment: String,
        api_version: String,
        api_key: String,
    },
}

impl RealtimeEndpoint {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Ok(match config.provider {
            Provider::OpenAI => Self::OpenAi {
                url: config.realtime_url.clone(),
                model: config.realtime_model.clone(),
                api_key: config
                    .openai_api_key
                    .clone()
                    .context("OpenAI API key not found")?,
            },
            Provider::Azure => Self::Azure {
                endpoint: config
                    .azure_endpoint
                    .clone()
                    .context("Azure OpenAI endpoint not found")?,
                deployment: config.azure_deployment.clone(),
                api_version: config.azure_api_version.clone(),
                api_key: config
                    .azure_api_key
                    .clone()
                    .context("Azure OpenAI API key not found")?,
            },
        })
    }

    pub fn url(&self) -> String {
        match self {
            Self::OpenAi { url, model, .. } => format!("{url}?model={model}"),
            Self::Azure {
                endpoint,
                deployment,
                api_version,
                ..
            } => {
                let base = endpoint.trim_end_matches('/');
                let base = match base.strip_prefix("https://") {
                    Some(host) => format!("wss://{host}"),
                    None => base.to_string(),
                };
                format!("{base}/openai/realtime?api-version={api_version}&deployment={deployment}")
            }
        }
    }

    pub fn request(&self) -> Result<Request, RelayError> {
        let invalid = |e: &dyn std::fmt::Display| RelayError::UpstreamUnavailable(e.to_string());
        let mut request = self.url().into_client_request().map_err(|e| invalid(&e))?;
        let headers = request.headers_mut();
        match self {
            Self::OpenAi { api_key, .. } => {
                let auth = HeaderValue::from_str(&format!("Bearer {api_key}")).map_err(|e| invalid(&e))?;
                headers.insert("Authorization", auth);
                headers.insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));
            }
            Self::Azure { api_key, .. } => {
                let key = HeaderValue::from_str(api_key).map_err(|e| invalid(&e))?;
                headers.insert("api-key", key);
            }
        }
        Ok(request)
    }

    pub async fn connect(&self) -> Result<Link, RelayError> {
        let request = self.request()?;
        let (stream, _) = connect_async(request)
            .await
            .map_err(|e| RelayError::UpstreamUnavailable(e.to_string()))?;
        info!(url = %self.url(), "Connected to realtime upstream");
        Ok(Link::from_tungstenite(stream))
    }
}
