//! Wire protocol
//!
//! Every event travels as one WebSocket text frame:
//! `{"event": "<name>", "data": <payload>}`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::TransportError;
use crate::session::LocationSummary;

/// One encoded block of captured audio
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaChunk {
    pub mime_type: String,
    pub data: String, // Base64-encoded PCM bytes
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetupPayload {
    #[serde(rename = "userId")]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeInput {
    pub media_chunks: Vec<MediaChunk>,
}

/// Messages sent to the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    Setup {
        setup: SetupPayload,
    },
    StartInteraction {
        location: Option<LocationSummary>,
        language: String,
    },
    StopInteraction {},
    RealtimeInput {
        realtime_input: RealtimeInput,
    },
    Text {
        text: String,
    },
    GetSessionStatus {},
}

impl ClientMessage {
    pub fn setup(user_id: Option<String>) -> Self {
        Self::Setup {
            setup: SetupPayload { user_id },
        }
    }

    pub fn media(chunk: MediaChunk) -> Self {
        Self::RealtimeInput {
            realtime_input: RealtimeInput {
                media_chunks: vec![chunk],
            },
        }
    }

    pub fn to_json(&self) -> Result<String, TransportError> {
        serde_json::to_string(self).map_err(|e| TransportError::Protocol(e.to_string()))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Setup { .. } => "setup",
            Self::StartInteraction { .. } => "start_interaction",
            Self::StopInteraction {} => "stop_interaction",
            Self::RealtimeInput { .. } => "realtime_input",
            Self::Text { .. } => "text",
            Self::GetSessionStatus {} => "get_session_status",
        }
    }
}

/// Who produced a transcription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Speaker {
    User,
    #[serde(alias = "Gemini", alias = "Model")]
    Agent,
}

/// Incremental transcription of either side of the conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionEvent {
    pub text: String,
    pub sender: Speaker,
    #[serde(default)]
    pub finished: Option<bool>,
}

/// Backend bookkeeping report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatusReport {
    /// Missing is treated as a mismatch
    #[serde(rename = "counterAccurate", default)]
    pub counter_accurate: bool,
    #[serde(flatten)]
    pub details: serde_json::Map<String, Value>,
}

/// Messages received from the backend
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Audio { audio: String },
    Transcription(TranscriptionEvent),
    /// Legacy agent text, treated as a finished agent transcription
    Text { text: String },
    Interrupted,
    SetupComplete(Value),
    InteractionStarted(Value),
    InteractionStopped(Value),
    SessionCreated(Value),
    SessionStatus(SessionStatusReport),
}

#[derive(Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
struct AudioPayload {
    audio: String,
}

#[derive(Deserialize)]
struct TextPayload {
    text: String,
}

fn payload<T: serde::de::DeserializeOwned>(event: &str, data: Value) -> Result<T, TransportError> {
    serde_json::from_value(data)
        .map_err(|e| TransportError::Protocol(format!("malformed '{}' payload: {}", event, e)))
}

impl ServerMessage {
    /// Parse one inbound text frame.
    ///
    /// Unknown events and payloads of the wrong shape are protocol errors.
    pub fn parse(text: &str) -> Result<Self, TransportError> {
        let envelope: Envelope = serde_json::from_str(text)
            .map_err(|e| TransportError::Protocol(format!("invalid frame: {}", e)))?;
        let Envelope { event, data } = envelope;

        let message = match event.as_str() {
            "audio" => {
                let AudioPayload { audio } = payload(&event, data)?;
                Self::Audio { audio }
            }
            "transcription" => Self::Transcription(payload(&event, data)?),
            "text" => {
                let TextPayload { text } = payload(&event, data)?;
                Self::Text { text }
            }
            "interrupted" => Self::Interrupted,
            "setup_complete" => Self::SetupComplete(data),
            "interaction_started" => Self::InteractionStarted(data),
            "interaction_stopped" => Self::InteractionStopped(data),
            "session_created" => Self::SessionCreated(data),
            "session_status" => Self::SessionStatus(payload(&event, data)?),
            other => {
                return Err(TransportError::Protocol(format!("unknown event '{}'", other)));
            }
        };
        Ok(message)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Audio { .. } => "audio",
            Self::Transcription(_) => "transcription",
            Self::Text { .. } => "text",
            Self::Interrupted => "interrupted",
            Self::SetupComplete(_) => "setup_complete",
            Self::InteractionStarted(_) => "interaction_started",
            Self::InteractionStopped(_) => "interaction_stopped",
            Self::SessionCreated(_) => "session_created",
            Self::SessionStatus(_) => "session_status",
        }
    }

    /// Encode as a wire frame (used by backends and test servers).
    pub fn to_json(&self) -> String {
        let data = match self {
            Self::Audio { audio } => json!({ "audio": audio }),
            Self::Transcription(event) => json!(event),
            Self::Text { text } => json!({ "text": text }),
            Self::Interrupted => json!({}),
            Self::SetupComplete(v)
            | Self::InteractionStarted(v)
            | Self::InteractionStopped(v)
            | Self::SessionCreated(v) => v.clone(),
            Self::SessionStatus(report) => json!(report),
        };
        json!({ "event": self.name(), "data": data }).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_uses_camel_case_user_id() {
        let json = ClientMessage::setup(Some("user-1".into())).to_json().unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value, json!({"event": "setup", "data": {"setup": {"userId": "user-1"}}}));
    }

    #[test]
    fn realtime_input_shape() {
        let msg = ClientMessage::media(MediaChunk {
            mime_type: "audio/pcm".into(),
            data: "AAA=".into(),
        });
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "event": "realtime_input",
                "data": {"realtime_input": {"media_chunks": [{"mime_type": "audio/pcm", "data": "AAA="}]}}
            })
        );
    }

    #[test]
    fn stop_interaction_carries_empty_object() {
        let value: Value =
            serde_json::from_str(&ClientMessage::StopInteraction {}.to_json().unwrap()).unwrap();
        assert_eq!(value, json!({"event": "stop_interaction", "data": {}}));

        let back: ClientMessage = serde_json::from_value(value).unwrap();
        assert_eq!(back, ClientMessage::StopInteraction {});
    }

    #[test]
    fn parses_transcription_with_legacy_sender() {
        let msg = ServerMessage::parse(
            r#"{"event":"transcription","data":{"text":"Ciao","sender":"Gemini","finished":false}}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ServerMessage::Transcription(TranscriptionEvent {
                text: "Ciao".into(),
                sender: Speaker::Agent,
                finished: Some(false),
            })
        );
    }

    #[test]
    fn parses_interrupted_without_data() {
        assert_eq!(ServerMessage::parse(r#"{"event":"interrupted"}"#).unwrap(), ServerMessage::Interrupted);
        assert_eq!(
            ServerMessage::parse(r#"{"event":"interrupted","data":{}}"#).unwrap(),
            ServerMessage::Interrupted
        );
    }

    #[test]
    fn session_status_without_flag_is_inaccurate() {
        let msg = ServerMessage::parse(r#"{"event":"session_status","data":{"activeSessions":2}}"#).unwrap();
        match msg {
            ServerMessage::SessionStatus(report) => {
                assert!(!report.counter_accurate);
                assert_eq!(report.details["activeSessions"], json!(2));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn malformed_frames_are_protocol_errors() {
        for frame in [
            "not json",
            r#"{"event":"audio","data":{"pcm":"AAA="}}"#,
            r#"{"event":"telemetry","data":{}}"#,
            r#"{"data":{}}"#,
        ] {
            assert!(
                matches!(ServerMessage::parse(frame), Err(TransportError::Protocol(_))),
                "{} should be rejected",
                frame
            );
        }
    }

    #[test]
    fn server_messages_encode_back_to_frames() {
        let audio = ServerMessage::Audio { audio: "AAAA".into() };
        assert_eq!(ServerMessage::parse(&audio.to_json()).unwrap(), audio);

        let done = ServerMessage::SetupComplete(json!({"sessionId": "s1"}));
        assert_eq!(ServerMessage::parse(&done.to_json()).unwrap(), done);
    }
}
