//! Live API protocol types
//!
//! JSON messages exchanged with a `BidiGenerateContent` endpoint over
//! WebSocket. The `Content`/`Part`/`Blob` shapes are shared with the REST
//! `generateContent` calls in [`crate::tools`].
//!
//! # Protocol Overview
//!
//! 1. Connect to `wss://.../BidiGenerateContent?key=...`
//! 2. Send `setup` (model, modalities, voice, system instruction, tools)
//! 3. Receive `setupComplete`
//! 4. Stream microphone audio via `realtimeInput.mediaChunks`
//! 5. Receive `serverContent` (audio, transcripts, turn markers) and `toolCall`
//! 6. Answer every function call with `toolResponse.functionResponses`

use serde::{Deserialize, Serialize};

use super::LiveError;
use crate::audio::pcm::{encode_base64, pcm_mime_type};

/// Live API endpoint (API key is appended as a query parameter)
pub const LIVE_API_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Everything the duplex channel is opened with.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Model name, with or without the `models/` prefix
    pub model: String,
    pub voice_name: String,
    /// Behavioral policy sent as the system instruction
    pub system_instruction: String,
    pub tools: Vec<FunctionDeclaration>,
    /// Ask the server to emit transcripts of its own speech
    pub output_transcription: bool,
}

impl SessionConfig {
    pub fn model_path(&self) -> String {
        if self.model.starts_with("models/") {
            self.model.clone()
        } else {
            format!("models/{}", self.model)
        }
    }
}

// ============================================================================
// Shared content types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    /// Base64 payload
    pub data: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            inline_data: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Some("user".to_string()),
            parts: vec![Part::text(text)],
        }
    }

    /// Concatenated text of every text part
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| p.text.as_deref())
            .collect::<Vec<_>>()
            .join("")
    }

    /// First inline payload whose mime type starts with `prefix`
    pub fn inline_data(&self, prefix: &str) -> Option<&Blob> {
        self.parts
            .iter()
            .filter_map(|p| p.inline_data.as_ref())
            .find(|b| b.mime_type.starts_with(prefix))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

impl SpeechConfig {
    pub fn voice(name: impl Into<String>) -> Self {
        Self {
            voice_config: VoiceConfig {
                prebuilt_voice_config: PrebuiltVoiceConfig {
                    voice_name: name.into(),
                },
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

/// A function the remote engine may call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    /// OpenAPI-style parameter schema
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub function_declarations: Vec<FunctionDeclaration>,
}

// ============================================================================
// Client Messages (sent TO the server)
// ============================================================================

/// Empty object marker, e.g. `"outputAudioTranscription": {}`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Enabled {}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Tool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<Enabled>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<Blob>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionResult {
    pub result: String,
}

/// Correlated answer to one [`FunctionCall`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionResponse {
    pub id: String,
    pub name: String,
    pub response: FunctionResult,
}

impl FunctionResponse {
    pub fn new(id: impl Into<String>, name: impl Into<String>, result: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            response: FunctionResult {
                result: result.into(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponse {
    pub function_responses: Vec<FunctionResponse>,
}

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
    ToolResponse(ToolResponse),
}

impl ClientMessage {
    /// Build the opening `setup` message
    pub fn setup(config: &SessionConfig) -> Self {
        let system_instruction = if config.system_instruction.is_empty() {
            None
        } else {
            Some(Content {
                role: None,
                parts: vec![Part::text(config.system_instruction.clone())],
            })
        };

        let tools = if config.tools.is_empty() {
            Vec::new()
        } else {
            vec![Tool {
                function_declarations: config.tools.clone(),
            }]
        };

        Self::Setup(Setup {
            model: config.model_path(),
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: Some(SpeechConfig::voice(config.voice_name.clone())),
            },
            system_instruction,
            tools,
            output_audio_transcription: config.output_transcription.then(Enabled::default),
        })
    }

    /// Create a realtime audio message from float samples
    pub fn audio_input(samples: &[f32], sample_rate: u32) -> Self {
        Self::RealtimeInput(RealtimeInput {
            media_chunks: vec![Blob {
                mime_type: pcm_mime_type(sample_rate),
                data: encode_base64(samples),
            }],
        })
    }

    pub fn tool_response(response: FunctionResponse) -> Self {
        Self::ToolResponse(ToolResponse {
            function_responses: vec![response],
        })
    }
}

// ============================================================================
// Server Messages (received FROM the server)
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Transcription {
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<Content>,
    #[serde(default)]
    pub output_transcription: Option<Transcription>,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
}

/// One tool invocation requested by the server
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FunctionCall {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallMessage {
    #[serde(default)]
    pub function_calls: Vec<FunctionCall>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolCallCancellation {
    #[serde(default)]
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

/// A raw server frame. Exactly one field is normally present; unknown
/// fields are ignored so newer server messages do not break parsing.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub tool_call: Option<ToolCallMessage>,
    #[serde(default)]
    pub tool_call_cancellation: Option<ToolCallCancellation>,
    #[serde(default)]
    pub go_away: Option<GoAway>,
}

/// Inbound events the session consumes, flattened from server frames
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    SetupComplete,
    /// Base64 PCM16 audio with its mime metadata
    Audio {
        data: String,
        mime_type: String,
    },
    Transcript(String),
    ToolCall(Vec<FunctionCall>),
    ToolCallCancellation(Vec<String>),
    TurnComplete,
    Interrupted,
    GoAway {
        time_left: Option<String>,
    },
}

impl ServerMessage {
    pub fn parse(text: &str) -> Result<Self, LiveError> {
        serde_json::from_str(text).map_err(|e| LiveError::ProtocolError(e.to_string()))
    }

    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// Flatten into events, preserving the order parts appear in the frame.
    pub fn into_events(self) -> Vec<InboundEvent> {
        let mut events = Vec::new();

        if self.setup_complete.is_some() {
            events.push(InboundEvent::SetupComplete);
        }

        if let Some(content) = self.server_content {
            if let Some(turn) = content.model_turn {
                for part in turn.parts {
                    if let Some(blob) = part.inline_data {
                        if blob.mime_type.starts_with("audio/") {
                            events.push(InboundEvent::Audio {
                                data: blob.data,
                                mime_type: blob.mime_type,
                            });
                        }
                    }
                }
            }
            if let Some(text) = content.output_transcription.and_then(|t| t.text) {
                if !text.is_empty() {
                    events.push(InboundEvent::Transcript(text));
                }
            }
            if content.interrupted {
                events.push(InboundEvent::Interrupted);
            }
            if content.turn_complete {
                events.push(InboundEvent::TurnComplete);
            }
        }

        if let Some(call) = self.tool_call {
            if !call.function_calls.is_empty() {
                events.push(InboundEvent::ToolCall(call.function_calls));
            }
        }

        if let Some(cancel) = self.tool_call_cancellation {
            events.push(InboundEvent::ToolCallCancellation(cancel.ids));
        }

        if let Some(go_away) = self.go_away {
            events.push(InboundEvent::GoAway {
                time_left: go_away.time_left,
            });
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> SessionConfig {
        SessionConfig {
            model: "gemini-live-test".to_string(),
            voice_name: "Puck".to_string(),
            system_instruction: "Be brief.".to_string(),
            tools: vec![FunctionDeclaration {
                name: "generateImage".to_string(),
                description: "Draw".to_string(),
                parameters: json!({"type": "OBJECT"}),
            }],
            output_transcription: true,
        }
    }

    #[test]
    fn test_setup_serialization() {
        let value = serde_json::to_value(ClientMessage::setup(&config())).unwrap();
        let setup = &value["setup"];

        assert_eq!(setup["model"], "models/gemini-live-test");
        assert_eq!(setup["generationConfig"]["responseModalities"], json!(["AUDIO"]));
        assert_eq!(
            setup["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]
                ["voiceName"],
            "Puck"
        );
        assert_eq!(setup["systemInstruction"]["parts"][0]["text"], "Be brief.");
        assert_eq!(
            setup["tools"][0]["functionDeclarations"][0]["name"],
            "generateImage"
        );
        assert_eq!(setup["outputAudioTranscription"], json!({}));
    }

    #[test]
    fn test_setup_omits_disabled_fields() {
        let mut config = config();
        config.system_instruction.clear();
        config.tools.clear();
        config.output_transcription = false;
        config.model = "models/already-prefixed".to_string();

        let value = serde_json::to_value(ClientMessage::setup(&config)).unwrap();
        let setup = value["setup"].as_object().unwrap();
        assert_eq!(setup["model"], "models/already-prefixed");
        assert!(!setup.contains_key("systemInstruction"));
        assert!(!setup.contains_key("tools"));
        assert!(!setup.contains_key("outputAudioTranscription"));
    }

    #[test]
    fn test_audio_input_serialization() {
        let value = serde_json::to_value(ClientMessage::audio_input(&[0.0, 0.0], 16000)).unwrap();
        let chunk = &value["realtimeInput"]["mediaChunks"][0];
        assert_eq!(chunk["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(chunk["data"], "AAAAAA==");
    }

    #[test]
    fn test_tool_response_serialization() {
        let msg = ClientMessage::tool_response(FunctionResponse::new(
            "1",
            "generateImage",
            "Image generated and shown to the user.",
        ));
        let value = serde_json::to_value(msg).unwrap();
        assert_eq!(
            value,
            json!({
                "toolResponse": {
                    "functionResponses": [{
                        "id": "1",
                        "name": "generateImage",
                        "response": {"result": "Image generated and shown to the user."}
                    }]
                }
            })
        );
    }

    #[test]
    fn test_setup_complete() {
        let msg = ServerMessage::parse(r#"{"setupComplete": {}}"#).unwrap();
        assert!(msg.is_setup_complete());
        assert_eq!(msg.into_events(), vec![InboundEvent::SetupComplete]);
    }

    #[test]
    fn test_server_content_events_in_order() {
        let msg = ServerMessage::parse(
            r#"{
                "serverContent": {
                    "modelTurn": {"parts": [
                        {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AAA="}},
                        {"text": "ignored"},
                        {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "BBB="}}
                    ]},
                    "outputTranscription": {"text": "Hello"},
                    "turnComplete": true
                }
            }"#,
        )
        .unwrap();

        assert_eq!(
            msg.into_events(),
            vec![
                InboundEvent::Audio {
                    data: "AAA=".to_string(),
                    mime_type: "audio/pcm;rate=24000".to_string()
                },
                InboundEvent::Audio {
                    data: "BBB=".to_string(),
                    mime_type: "audio/pcm;rate=24000".to_string()
                },
                InboundEvent::Transcript("Hello".to_string()),
                InboundEvent::TurnComplete,
            ]
        );
    }

    #[test]
    fn test_tool_call_deserialization() {
        let msg = ServerMessage::parse(
            r#"{"toolCall": {"functionCalls": [
                {"id": "1", "name": "generateImage", "args": {"prompt": "a cat"}}
            ]}}"#,
        )
        .unwrap();

        match msg.into_events().as_slice() {
            [InboundEvent::ToolCall(calls)] => {
                assert_eq!(calls[0].id, "1");
                assert_eq!(calls[0].name, "generateImage");
                assert_eq!(calls[0].args["prompt"], "a cat");
            }
            other => panic!("Expected a tool call, got {:?}", other),
        }
    }

    #[test]
    fn test_cancellation_and_go_away() {
        let events = ServerMessage::parse(r#"{"toolCallCancellation": {"ids": ["7"]}}"#)
            .unwrap()
            .into_events();
        assert_eq!(
            events,
            vec![InboundEvent::ToolCallCancellation(vec!["7".to_string()])]
        );

        let events = ServerMessage::parse(r#"{"goAway": {"timeLeft": "10s"}}"#)
            .unwrap()
            .into_events();
        assert_eq!(
            events,
            vec![InboundEvent::GoAway {
                time_left: Some("10s".to_string())
            }]
        );
    }

    #[test]
    fn test_unknown_message_is_empty() {
        let msg = ServerMessage::parse(r#"{"usageMetadata": {"totalTokenCount": 5}}"#).unwrap();
        assert!(msg.into_events().is_empty());

        assert!(matches!(
            ServerMessage::parse("not json"),
            Err(LiveError::ProtocolError(_))
        ));
    }
}
