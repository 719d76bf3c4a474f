//! # Gemini Live Transport
//!
//! [`LiveTransport`] over the Gemini Live bidirectional streaming WebSocket.
//!
//! ## Connection flow:
//! 1. Open `{endpoint}?key={api_key}` (the URL is never logged)
//! 2. Send the `setup` message (model, voice, system instruction)
//! 3. Server answers `setupComplete` → `LiveEvent::Open`
//! 4. Audio goes out as `realtimeInput.mediaChunks`; audio, interruptions and
//!    turn boundaries come back as `serverContent`
//!
//! Two tasks own the socket halves: a writer draining the command queue and
//! a reader translating server frames into events.

use crate::audio::frame::InboundAudioChunk;
use crate::audio::pcm::MediaType;
use crate::call::transport::{
    LiveCommand, LiveConnection, LiveEvent, LiveSetup, LiveTransport, ServerContent,
    TransportError,
};
use futures_util::future::BoxFuture;
use futures_util::{Sink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

/// Capacity of the event channel toward the session loop.
const EVENT_CHANNEL_CAPACITY: usize = 64;

pub struct GeminiLiveTransport {
    endpoint_url: String,
    api_key: Option<String>,
}

impl GeminiLiveTransport {
    pub fn new(endpoint_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            endpoint_url: endpoint_url.into(),
            api_key,
        }
    }
}

impl LiveTransport for GeminiLiveTransport {
    fn connect(
        &self,
        setup: LiveSetup,
        queue_capacity: usize,
    ) -> BoxFuture<'static, Result<LiveConnection, TransportError>> {
        let endpoint_url = self.endpoint_url.clone();
        let api_key = self
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty());

        Box::pin(async move {
            let api_key = api_key.ok_or(TransportError::MissingApiKey)?;
            let url = format!("{}?key={}", endpoint_url, api_key);

            let (socket, _) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(|e| TransportError::Connect(e.to_string()))?;
            let (mut sink, mut stream) = socket.split();

            let setup_json = serde_json::to_string(&ClientMessage::setup(&setup))
                .map_err(|e| TransportError::Protocol(e.to_string()))?;
            sink.send(WsMessage::Text(setup_json))
                .await
                .map_err(|e| TransportError::Connect(e.to_string()))?;

            info!(model = %setup.model, voice = %setup.voice, "Live session setup sent");

            let (command_tx, command_rx) = mpsc::channel::<LiveCommand>(queue_capacity);
            let (close_tx, close_rx) = oneshot::channel();
            let (event_tx, event_rx) = mpsc::channel::<LiveEvent>(EVENT_CHANNEL_CAPACITY);

            tokio::spawn(run_writer(sink, command_rx, close_rx));

            // Reader
            tokio::spawn(async move {
                while let Some(frame) = stream.next().await {
                    let payload = match frame {
                        Ok(WsMessage::Text(text)) => text.into_bytes(),
                        Ok(WsMessage::Binary(bytes)) => bytes,
                        Ok(WsMessage::Close(reason)) => {
                            debug!(?reason, "Live session closed by remote");
                            break;
                        }
                        Ok(_) => continue,
                        Err(e) => {
                            let _ = event_tx.send(LiveEvent::Error(e.to_string())).await;
                            break;
                        }
                    };

                    match parse_server_frame(&payload) {
                        Ok(events) => {
                            for event in events {
                                if event_tx.send(event).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => warn!(error = %e, "Skipping unreadable server frame"),
                    }
                }
                let _ = event_tx.send(LiveEvent::Closed).await;
            });

            Ok(LiveConnection {
                commands: command_tx,
                close: close_tx,
                events: event_rx,
            })
        })
    }
}

/// Drain the command queue into the socket until the session closes.
///
/// The close signal wins over queued audio. Once it fires, whatever is still
/// queued is discarded and a close frame goes out.
async fn run_writer<S>(
    mut sink: S,
    mut commands: mpsc::Receiver<LiveCommand>,
    mut close: oneshot::Receiver<()>,
) where
    S: Sink<WsMessage> + Unpin,
    S::Error: Display,
{
    loop {
        tokio::select! {
            biased;
            _ = &mut close => break,
            command = commands.recv() => match command {
                Some(LiveCommand::Audio(packet)) => {
                    let message = ClientMessage::realtime_audio(&packet.mime_type, packet.data);
                    let text = match serde_json::to_string(&message) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(error = %e, "Failed to encode audio packet");
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(WsMessage::Text(text)).await {
                        debug!(error = %e, "Audio packet not sent");
                    }
                }
                None => break,
            },
        }
    }

    commands.close();
    let mut discarded = 0usize;
    while commands.try_recv().is_ok() {
        discarded += 1;
    }
    if discarded > 0 {
        debug!(discarded, "Discarded queued audio on close");
    }

    if let Err(e) = sink.send(WsMessage::Close(None)).await {
        debug!(error = %e, "Close frame not sent");
    }
    let _ = sink.close().await;
    debug!("Live session writer stopped");
}

// Client → server wire types

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
enum ClientMessage {
    Setup(SetupPayload),
    RealtimeInput(RealtimeInput),
}

impl ClientMessage {
    fn setup(setup: &LiveSetup) -> Self {
        ClientMessage::Setup(SetupPayload {
            model: format!("models/{}", setup.model),
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: setup.voice.clone(),
                        },
                    },
                },
            },
            system_instruction: Content {
                parts: vec![TextPart {
                    text: setup.system_instruction.clone(),
                }],
            },
        })
    }

    fn realtime_audio(mime_type: &MediaType, data: String) -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            media_chunks: vec![Blob {
                mime_type: mime_type.to_string(),
                data,
            }],
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SetupPayload {
    model: String,
    generation_config: GenerationConfig,
    system_instruction: Content,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: Vec<String>,
    speech_config: SpeechConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig {
    voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig {
    prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoiceConfig {
    voice_name: String,
}

#[derive(Debug, Serialize)]
struct Content {
    parts: Vec<TextPart>,
}

#[derive(Debug, Serialize)]
struct TextPart {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput {
    media_chunks: Vec<Blob>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Blob {
    mime_type: String,
    data: String,
}

// Server → client wire types

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    setup_complete: Option<serde_json::Value>,
    server_content: Option<ServerContentPayload>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContentPayload {
    model_turn: Option<ModelTurn>,
    #[serde(default)]
    interrupted: bool,
    #[serde(default)]
    turn_complete: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<ModelPart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelPart {
    inline_data: Option<Blob>,
}

/// Translate one server frame into zero or more events.
///
/// Only the first part of a model turn is inspected for audio.
fn parse_server_frame(payload: &[u8]) -> Result<Vec<LiveEvent>, TransportError> {
    let message: ServerMessage =
        serde_json::from_slice(payload).map_err(|e| TransportError::Protocol(e.to_string()))?;

    let mut events = Vec::new();
    if message.setup_complete.is_some() {
        events.push(LiveEvent::Open);
    }

    if let Some(content) = message.server_content {
        let audio = content
            .model_turn
            .and_then(|turn| turn.parts.into_iter().next())
            .and_then(|part| part.inline_data)
            .map(|blob| InboundAudioChunk {
                mime_type: blob.mime_type.parse().ok(),
                data: blob.data,
            });

        events.push(LiveEvent::Message(ServerContent {
            audio,
            interrupted: content.interrupted,
            turn_complete: content.turn_complete,
        }));
    }

    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::frame::{CaptureFrame, OutboundAudioPacket};
    use serde_json::{json, Value};
    use std::convert::Infallible;
    use std::sync::{Arc, Mutex};

    type Sent = Arc<Mutex<Vec<WsMessage>>>;

    fn recording_sink(sent: Sent) -> impl Sink<WsMessage, Error = Infallible> + Unpin {
        Box::pin(futures_util::sink::unfold(sent, |sent, message: WsMessage| async move {
            sent.lock().unwrap().push(message);
            Ok::<_, Infallible>(sent)
        }))
    }

    fn silent_packet() -> LiveCommand {
        LiveCommand::Audio(OutboundAudioPacket::encode(
            &CaptureFrame::silence(16),
            MediaType::pcm(16000),
        ))
    }

    fn setup() -> LiveSetup {
        LiveSetup {
            model: "gemini-live".to_string(),
            voice: "Kore".to_string(),
            system_instruction: "You are Kira on a voice call.".to_string(),
            input_media_type: MediaType::pcm(16000),
        }
    }

    #[test]
    fn test_setup_message_shape() {
        let value: Value = serde_json::to_value(ClientMessage::setup(&setup())).unwrap();

        assert_eq!(value["setup"]["model"], "models/gemini-live");
        assert_eq!(value["setup"]["generationConfig"]["responseModalities"], json!(["AUDIO"]));
        assert_eq!(
            value["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]["voiceName"],
            "Kore"
        );
        assert_eq!(
            value["setup"]["systemInstruction"]["parts"][0]["text"],
            "You are Kira on a voice call."
        );
    }

    #[test]
    fn test_realtime_input_shape() {
        let message = ClientMessage::realtime_audio(&MediaType::pcm(16000), "AAAA".to_string());
        let value: Value = serde_json::to_value(message).unwrap();

        assert_eq!(
            value,
            json!({"realtimeInput": {"mediaChunks": [{"mimeType": "audio/pcm;rate=16000", "data": "AAAA"}]}})
        );
    }

    #[test]
    fn test_setup_complete_opens() {
        let events = parse_server_frame(br#"{"setupComplete": {}}"#).unwrap();
        assert_eq!(events, vec![LiveEvent::Open]);
    }

    #[test]
    fn test_server_content_with_audio_and_interrupt() {
        let frame = json!({
            "serverContent": {
                "modelTurn": {"parts": [
                    {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AAA="}},
                    {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "ignored"}}
                ]},
                "interrupted": true
            }
        });

        let events = parse_server_frame(frame.to_string().as_bytes()).unwrap();

        match events.as_slice() {
            [LiveEvent::Message(content)] => {
                let audio = content.audio.as_ref().unwrap();
                assert_eq!(audio.data, "AAA=");
                assert_eq!(audio.mime_type, Some(MediaType::pcm(24000)));
                assert!(content.interrupted);
                assert!(!content.turn_complete);
            }
            other => panic!("unexpected events: {:?}", other),
        }
    }

    #[test]
    fn test_turn_complete_without_audio() {
        let events = parse_server_frame(br#"{"serverContent": {"turnComplete": true}}"#).unwrap();
        assert_eq!(
            events,
            vec![LiveEvent::Message(ServerContent {
                audio: None,
                interrupted: false,
                turn_complete: true,
            })]
        );
    }

    #[test]
    fn test_unreadable_frame_is_an_error() {
        assert!(parse_server_frame(b"not json").is_err());
        assert!(parse_server_frame(b"{}").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_api_key_fails_connect() {
        let transport = GeminiLiveTransport::new("wss://example.invalid/live", None);
        let result = transport.connect(setup(), 4).await;
        assert!(matches!(result, Err(TransportError::MissingApiKey)));
    }

    #[tokio::test]
    async fn test_writer_close_discards_queued_audio() {
        let sent: Sent = Arc::default();
        let (command_tx, command_rx) = mpsc::channel(2);
        let (close_tx, close_rx) = oneshot::channel();
        command_tx.try_send(silent_packet()).unwrap();
        command_tx.try_send(silent_packet()).unwrap();
        assert!(command_tx.try_send(silent_packet()).is_err());

        close_tx.send(()).unwrap();
        run_writer(recording_sink(sent.clone()), command_rx, close_rx).await;

        assert_eq!(*sent.lock().unwrap(), vec![WsMessage::Close(None)]);
        assert!(command_tx.is_closed());
    }

    #[tokio::test]
    async fn test_writer_sends_audio_then_closes_when_queue_drops() {
        let sent: Sent = Arc::default();
        let (command_tx, command_rx) = mpsc::channel(4);
        let (_close_tx, close_rx) = oneshot::channel();
        command_tx.try_send(silent_packet()).unwrap();
        drop(command_tx);

        run_writer(recording_sink(sent.clone()), command_rx, close_rx).await;

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        match &sent[0] {
            WsMessage::Text(text) => assert!(text.contains("realtimeInput")),
            other => panic!("unexpected frame: {:?}", other),
        }
        assert_eq!(sent[1], WsMessage::Close(None));
    }
}
