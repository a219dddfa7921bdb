//! Live API WebSocket wire layer: setup handshake, realtime audio input,
//! and the inbound server event stream.

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, trace, warn};

use opal_core::error::{OpalError, Result};
use opal_core::types::{AudioChunk, Blob, Content, Part};

use crate::DEFAULT_LIVE_BASE_URL;

const BIDI_PATH: &str = "/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// --- Outbound wire types ---

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveSetup {
    pub model: String,
    pub generation_config: LiveGenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    /// Presence of the empty config objects turns transcription on for each
    /// direction.
    pub input_audio_transcription: TranscriptionConfig,
    pub output_audio_transcription: TranscriptionConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveGenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TranscriptionConfig {}

impl LiveSetup {
    /// Audio-out session with transcription of both directions (the only
    /// shape Opal uses).
    pub fn audio(model: &str, voice: &str, system_instruction: &str) -> Self {
        Self {
            model: format!("models/{model}"),
            generation_config: LiveGenerationConfig {
                response_modalities: vec!["AUDIO".into()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: voice.into(),
                        },
                    },
                },
            },
            system_instruction: Some(Content::system(system_instruction)),
            input_audio_transcription: TranscriptionConfig {},
            output_audio_transcription: TranscriptionConfig {},
        }
    }
}

#[derive(Serialize)]
struct SetupEnvelope<'a> {
    setup: &'a LiveSetup,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeEnvelope {
    realtime_input: RealtimeInput,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput {
    media_chunks: Vec<Blob>,
}

// --- Inbound wire types ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    #[serde(default)]
    setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    server_content: Option<ServerContentWire>,
    #[serde(default)]
    go_away: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContentWire {
    #[serde(default)]
    model_turn: Option<Content>,
    #[serde(default)]
    input_transcription: Option<Transcription>,
    #[serde(default)]
    output_transcription: Option<Transcription>,
    #[serde(default)]
    turn_complete: bool,
    #[serde(default)]
    interrupted: bool,
}

#[derive(Debug, Deserialize)]
struct Transcription {
    #[serde(default)]
    text: String,
}

/// One message of server content, reduced to what the session consumes.
#[derive(Debug, Clone, Default)]
pub struct ServerContent {
    /// Transcript of what the user just said.
    pub input_transcript: Option<String>,
    /// Transcript of what the model is saying.
    pub output_transcript: Option<String>,
    /// Inline audio payloads from the model turn, in order.
    pub audio: Vec<Blob>,
    /// The conversational turn ended.
    pub turn_complete: bool,
    /// The user spoke over the model; queued playback should be flushed.
    pub interrupted: bool,
}

/// Events consumed from the live session.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// The remote session reported opened; audio may start flowing.
    Opened,
    Content(ServerContent),
    /// The remote session is closing or closed.
    Closed { reason: Option<String> },
    Error(String),
}

fn content_from_wire(wire: ServerContentWire) -> ServerContent {
    let audio = wire
        .model_turn
        .map(|turn| {
            turn.parts
                .into_iter()
                .filter_map(|p: Part| p.inline_data)
                .filter(Blob::is_audio)
                .collect()
        })
        .unwrap_or_default();

    ServerContent {
        input_transcript: wire.input_transcription.map(|t| t.text),
        output_transcript: wire.output_transcription.map(|t| t.text),
        audio,
        turn_complete: wire.turn_complete,
        interrupted: wire.interrupted,
    }
}

fn parse_server_message(raw: &str) -> Option<ServerEvent> {
    let message: ServerMessage = match serde_json::from_str(raw) {
        Ok(m) => m,
        Err(e) => {
            trace!(%e, "Unparseable live message");
            return None;
        }
    };

    if message.setup_complete.is_some() {
        return Some(ServerEvent::Opened);
    }
    if message.go_away.is_some() {
        return Some(ServerEvent::Closed {
            reason: Some("server is going away".into()),
        });
    }
    message
        .server_content
        .map(|c| ServerEvent::Content(content_from_wire(c)))
}

/// An override base URL may be given with an http(s) scheme; the live
/// endpoint always speaks WebSocket.
fn websocket_base(base: &str) -> String {
    if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    }
}

/// An open bidirectional live session.
pub struct LiveSession {
    ws: WsStream,
}

impl LiveSession {
    /// Open the WebSocket, send the setup message, and hand back the session.
    /// The session is not usable for audio until [`ServerEvent::Opened`]
    /// arrives.
    pub async fn connect(base_url: Option<&str>, api_key: &str, setup: &LiveSetup) -> Result<Self> {
        let base = base_url
            .map(websocket_base)
            .unwrap_or_else(|| DEFAULT_LIVE_BASE_URL.to_string());
        let base = base.trim_end_matches('/');
        let url = format!("{base}{BIDI_PATH}?key={api_key}");

        debug!(model = %setup.model, "Opening live session");

        let (mut ws, _) = connect_async(&url)
            .await
            .map_err(|e| OpalError::Session(format!("connect failed: {e}")))?;

        let payload = serde_json::to_string(&SetupEnvelope { setup })?;
        ws.send(Message::Text(payload.into()))
            .await
            .map_err(|e| OpalError::Session(format!("setup send failed: {e}")))?;

        Ok(Self { ws })
    }

    /// Split into the outbound audio sender and the inbound event stream.
    pub fn split(self) -> (LiveSender, LiveEvents) {
        let (tx, rx) = self.ws.split();
        (LiveSender { tx }, LiveEvents { rx })
    }
}

/// Outbound half: forwards encoded microphone chunks.
pub struct LiveSender {
    tx: SplitSink<WsStream, Message>,
}

impl LiveSender {
    /// Forward one encoded microphone chunk. Best-effort: a send failure is
    /// surfaced so the caller can drop the chunk and carry on.
    pub async fn send_audio(&mut self, chunk: &AudioChunk) -> Result<()> {
        let envelope = RealtimeEnvelope {
            realtime_input: RealtimeInput {
                media_chunks: vec![Blob::from_bytes(chunk.mime_type.clone(), &chunk.data)],
            },
        };
        let payload = serde_json::to_string(&envelope)?;
        self.tx
            .send(Message::Text(payload.into()))
            .await
            .map_err(|e| OpalError::Session(format!("audio send failed: {e}")))
    }

    /// Close the outbound half. Safe to call more than once.
    pub async fn close(&mut self) {
        let _ = self.tx.close().await;
    }
}

/// Inbound half: a single dispatch point turning wire messages into
/// [`ServerEvent`]s.
pub struct LiveEvents {
    rx: SplitStream<WsStream>,
}

impl LiveEvents {
    /// Next event, or `None` once the stream is exhausted.
    pub async fn next_event(&mut self) -> Option<ServerEvent> {
        loop {
            let message = match self.rx.next().await? {
                Ok(m) => m,
                Err(e) => {
                    warn!(%e, "Live transport error");
                    return Some(ServerEvent::Error(e.to_string()));
                }
            };

            let event = match message {
                Message::Text(text) => parse_server_message(text.as_str()),
                // The server may deliver JSON in binary frames.
                Message::Binary(bytes) => match std::str::from_utf8(&bytes) {
                    Ok(text) => parse_server_message(text),
                    Err(_) => None,
                },
                Message::Close(frame) => Some(ServerEvent::Closed {
                    reason: frame.map(|f| f.reason.to_string()),
                }),
                _ => None,
            };

            if let Some(event) = event {
                return Some(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_base_rewrites_scheme() {
        assert_eq!(websocket_base("https://example.com"), "wss://example.com");
        assert_eq!(websocket_base("http://localhost:9000"), "ws://localhost:9000");
        assert_eq!(websocket_base("wss://example.com"), "wss://example.com");
    }

    #[test]
    fn test_setup_serialization() {
        let setup = LiveSetup::audio("gemini-2.0-flash-live-001", "Puck", "Be brief.");
        let json = serde_json::to_value(SetupEnvelope { setup: &setup }).unwrap();
        let setup = &json["setup"];
        assert_eq!(setup["model"], "models/gemini-2.0-flash-live-001");
        assert_eq!(setup["generationConfig"]["responseModalities"][0], "AUDIO");
        assert_eq!(
            setup["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]
                ["voiceName"],
            "Puck"
        );
        assert_eq!(setup["systemInstruction"]["parts"][0]["text"], "Be brief.");
        assert!(setup["inputAudioTranscription"].is_object());
        assert!(setup["outputAudioTranscription"].is_object());
    }

    #[test]
    fn test_realtime_envelope_shape() {
        let envelope = RealtimeEnvelope {
            realtime_input: RealtimeInput {
                media_chunks: vec![Blob::from_bytes("audio/pcm;rate=16000", &[0, 1])],
            },
        };
        let json = serde_json::to_value(&envelope).unwrap();
        let chunk = &json["realtimeInput"]["mediaChunks"][0];
        assert_eq!(chunk["mimeType"], "audio/pcm;rate=16000");
        assert!(chunk["data"].is_string());
    }

    #[test]
    fn test_parse_setup_complete() {
        let event = parse_server_message(r#"{"setupComplete": {}}"#).unwrap();
        assert!(matches!(event, ServerEvent::Opened));
    }

    #[test]
    fn test_parse_server_content_full() {
        let raw = r#"{
            "serverContent": {
                "modelTurn": {
                    "parts": [
                        {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AAAA"}},
                        {"text": "spoken text part"}
                    ]
                },
                "inputTranscription": {"text": "hello there"},
                "outputTranscription": {"text": "hi!"},
                "turnComplete": true
            }
        }"#;
        let ServerEvent::Content(content) = parse_server_message(raw).unwrap() else {
            panic!("expected content event");
        };
        assert_eq!(content.input_transcript.as_deref(), Some("hello there"));
        assert_eq!(content.output_transcript.as_deref(), Some("hi!"));
        assert_eq!(content.audio.len(), 1);
        assert!(content.turn_complete);
        assert!(!content.interrupted);
    }

    #[test]
    fn test_parse_interrupted() {
        let raw = r#"{"serverContent": {"interrupted": true}}"#;
        let ServerEvent::Content(content) = parse_server_message(raw).unwrap() else {
            panic!("expected content event");
        };
        assert!(content.interrupted);
        assert!(content.audio.is_empty());
    }

    #[test]
    fn test_parse_go_away() {
        let event = parse_server_message(r#"{"goAway": {"timeLeft": "2s"}}"#).unwrap();
        assert!(matches!(event, ServerEvent::Closed { .. }));
    }

    #[test]
    fn test_unknown_message_is_skipped() {
        assert!(parse_server_message(r#"{"usageMetadata": {}}"#).is_none());
        assert!(parse_server_message("not json").is_none());
    }

    #[test]
    fn test_non_audio_inline_data_filtered() {
        let raw = r#"{
            "serverContent": {
                "modelTurn": {
                    "parts": [{"inlineData": {"mimeType": "image/png", "data": "AAAA"}}]
                }
            }
        }"#;
        let ServerEvent::Content(content) = parse_server_message(raw).unwrap() else {
            panic!("expected content event");
        };
        assert!(content.audio.is_empty());
    }
}
