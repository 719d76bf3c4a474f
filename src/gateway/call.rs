//! # Call WebSocket Gateway
//!
//! Lets a browser drive a voice call. The socket doubles as the call's audio
//! devices: binary frames from the browser are the microphone, `play` / `stop`
//! messages back to it are the speaker.
//!
//! ## WebSocket Protocol:
//! 1. **Start**: client sends `{"type": "start_call", "target": {"id", "name"}}`
//! 2. **Audio in**: binary messages of mono f32 little-endian samples
//! 3. **Audio out**: server sends `play` with base64 16-bit PCM and a start
//!    time on the output clock (seconds since the output was opened), and
//!    `stop` to cut a buffer short
//! 4. **Status**: server sends `call_status` on every transition and once a
//!    second while active
//! 5. **End**: client sends `end_call` or closes the socket
//!
//! A browser that could not open its microphone sends `microphone_denied`;
//! starting a call afterwards fails acquisition.

use crate::audio::device::{CaptureDevice, DeviceError, PlaybackOutput};
use crate::audio::frame::{CaptureFrame, PlaybackBuffer};
use crate::audio::pcm::{self, MediaType};
use crate::audio::playback::PlaybackHandle;
use crate::call::session::CallSession;
use crate::call::state::{format_call_duration, CallStatus};
use crate::call::transport::CallTarget;
use crate::error::CallError;
use crate::state::{AppState, CallOutcome};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);
const STATUS_TICK: Duration = Duration::from_secs(1);
/// Capture frames buffered between the socket and the session loop.
const CAPTURE_BUFFER: usize = 32;

/// Messages sent by the browser.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallClientMessage {
    StartCall { target: CallTarget },
    EndCall,
    MicrophoneDenied,
}

/// Messages sent to the browser.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallServerMessage {
    CallStatus {
        call_id: String,
        status: CallStatus,
        duration_secs: u64,
        /// `MM:SS`
        duration: String,
    },
    Play {
        handle: u64,
        start_at: f64,
        duration: f64,
        mime_type: String,
        data: String,
    },
    Stop {
        handle: u64,
    },
    Error {
        code: String,
        message: String,
    },
}

/// Queue a server message on the socket.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Outgoing(pub CallServerMessage);

/// A status transition, tagged with the call it belongs to.
#[derive(Debug, Clone)]
struct CallStatusUpdate {
    call_id: String,
    status: CallStatus,
}

/// Result of the asynchronous `CallSession::start`.
#[derive(Message)]
#[rtype(result = "()")]
struct CallStarted {
    call_id: String,
    result: Result<(), CallError>,
}

/// Microphone side of the socket, shared between the actor and the capture device.
#[derive(Debug, Default)]
struct CaptureGate {
    denied: AtomicBool,
    open: AtomicBool,
}

/// [`CaptureDevice`] fed by binary frames from the browser.
pub struct BrowserCapture {
    frames: Option<mpsc::Receiver<CaptureFrame>>,
    gate: Arc<CaptureGate>,
}

impl CaptureDevice for BrowserCapture {
    fn open(
        &mut self,
        sample_rate: u32,
        frame_size: usize,
    ) -> Result<mpsc::Receiver<CaptureFrame>, DeviceError> {
        if self.gate.denied.load(Ordering::SeqCst) {
            return Err(DeviceError::Unavailable(
                "microphone permission denied".to_string(),
            ));
        }
        let frames = self.frames.take().ok_or(DeviceError::AlreadyOpen)?;
        self.gate.open.store(true, Ordering::SeqCst);
        debug!(sample_rate, frame_size, "Browser microphone opened");
        Ok(frames)
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        self.gate.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// [`PlaybackOutput`] that forwards scheduled buffers to the browser.
pub struct BrowserPlayback {
    outbox: Recipient<Outgoing>,
    opened_at: Option<Instant>,
}

impl BrowserPlayback {
    pub fn new(outbox: Recipient<Outgoing>) -> Self {
        Self {
            outbox,
            opened_at: None,
        }
    }
}

impl PlaybackOutput for BrowserPlayback {
    fn open(&mut self, sample_rate: u32) -> Result<(), DeviceError> {
        if self.opened_at.is_some() {
            return Err(DeviceError::AlreadyOpen);
        }
        self.opened_at = Some(Instant::now());
        debug!(sample_rate, "Browser output opened");
        Ok(())
    }

    fn current_time(&self) -> f64 {
        self.opened_at
            .map_or(0.0, |opened| opened.elapsed().as_secs_f64())
    }

    fn start(
        &mut self,
        handle: PlaybackHandle,
        buffer: &PlaybackBuffer,
        at: f64,
    ) -> Result<(), DeviceError> {
        if self.opened_at.is_none() {
            return Err(DeviceError::Closed);
        }
        if !self.outbox.connected() {
            return Err(DeviceError::Backend("browser connection closed".to_string()));
        }
        self.outbox.do_send(Outgoing(CallServerMessage::Play {
            handle: handle.id(),
            start_at: at,
            duration: buffer.duration_secs(),
            mime_type: MediaType::pcm(buffer.sample_rate()).to_string(),
            data: pcm::encode_samples(buffer.samples()),
        }));
        Ok(())
    }

    fn stop(&mut self, handle: PlaybackHandle) {
        if self.opened_at.is_some() {
            self.outbox
                .do_send(Outgoing(CallServerMessage::Stop { handle: handle.id() }));
        }
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        self.opened_at.take().map(|_| ()).ok_or(DeviceError::Closed)
    }
}

/// WebSocket actor for one browser. Runs at most one call at a time.
pub struct CallWebSocket {
    state: web::Data<AppState>,
    call: Option<Arc<CallSession>>,
    capture_tx: Option<mpsc::Sender<CaptureFrame>>,
    capture_gate: Arc<CaptureGate>,
    microphone_denied: bool,
    reached_active: bool,
    last_heartbeat: Instant,
}

impl CallWebSocket {
    pub fn new(state: web::Data<AppState>) -> Self {
        Self {
            state,
            call: None,
            capture_tx: None,
            capture_gate: Arc::new(CaptureGate::default()),
            microphone_denied: false,
            reached_active: false,
            last_heartbeat: Instant::now(),
        }
    }

    fn send(&self, ctx: &mut ws::WebsocketContext<Self>, message: &CallServerMessage) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(e) => error!("Failed to encode call message: {}", e),
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, code: &str, message: &str) {
        warn!("Call gateway error {}: {}", code, message);
        self.send(
            ctx,
            &CallServerMessage::Error {
                code: code.to_string(),
                message: message.to_string(),
            },
        );
    }

    fn status_message(session: &CallSession, status: CallStatus) -> CallServerMessage {
        let duration = session.duration();
        CallServerMessage::CallStatus {
            call_id: session.id().to_string(),
            status,
            duration_secs: duration.as_secs(),
            duration: format_call_duration(duration),
        }
    }

    fn start_call(&mut self, target: CallTarget, ctx: &mut ws::WebsocketContext<Self>) {
        if self.call.is_some() {
            self.send_error(ctx, "invalid_state", "a call is already in progress");
            return;
        }

        let config = self.state.get_config();
        let call_id = Uuid::new_v4().to_string();

        let (capture_tx, capture_rx) = mpsc::channel(CAPTURE_BUFFER);
        let gate = Arc::new(CaptureGate::default());
        gate.denied.store(self.microphone_denied, Ordering::SeqCst);
        let capture = BrowserCapture {
            frames: Some(capture_rx),
            gate: gate.clone(),
        };
        let playback = BrowserPlayback::new(ctx.address().recipient());

        let session = Arc::new(CallSession::new(
            call_id.clone(),
            config.call,
            self.state.transport.clone(),
            Box::new(capture),
            Box::new(playback),
        ));

        if let Err(e) = self.state.calls.register(session.clone()) {
            self.state.record_call(CallOutcome::Failed);
            self.send_error(ctx, e.code(), &e.to_string());
            return;
        }

        info!(call_id = %call_id, target = %target.name, "Call requested");
        self.call = Some(session.clone());
        self.capture_tx = Some(capture_tx);
        self.capture_gate = gate;
        self.reached_active = false;
        let status_call_id = call_id.clone();
        ctx.add_stream(
            WatchStream::new(session.subscribe_status()).map(move |status| CallStatusUpdate {
                call_id: status_call_id.clone(),
                status,
            }),
        );

        let addr = ctx.address();
        tokio::spawn(async move {
            let result = session.start(&target).await;
            addr.do_send(CallStarted { call_id, result });
        });
    }

    /// Detach the current call and end it in the background.
    fn finish_call(&mut self) {
        self.capture_tx = None;
        let Some(session) = self.call.take() else {
            return;
        };

        self.state.calls.remove(session.id());
        if self.reached_active {
            self.state.record_call(CallOutcome::Completed);
        }
        tokio::spawn(async move {
            session.end().await;
        });
    }

    fn handle_audio(&mut self, bytes: &[u8], ctx: &mut ws::WebsocketContext<Self>) {
        if !self.capture_gate.open.load(Ordering::SeqCst) {
            return;
        }
        let Some(capture_tx) = &self.capture_tx else {
            return;
        };

        let frame = match CaptureFrame::from_le_bytes(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                self.send_error(ctx, "audio_error", &e.to_string());
                return;
            }
        };

        if capture_tx.try_send(frame).is_err() {
            debug!("Capture buffer full, dropping browser frame");
        }
    }
}

impl Actor for CallWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("Call WebSocket connection started");

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!("Call WebSocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });

        ctx.run_interval(STATUS_TICK, |act, ctx| {
            if let Some(session) = &act.call {
                if session.status() == CallStatus::Active {
                    let message = Self::status_message(session, CallStatus::Active);
                    act.send(ctx, &message);
                }
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!("Call WebSocket connection stopped");
        self.finish_call();
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for CallWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<CallClientMessage>(&text) {
                Ok(CallClientMessage::StartCall { target }) => self.start_call(target, ctx),
                Ok(CallClientMessage::EndCall) => {
                    if self.call.is_none() {
                        self.send_error(ctx, "invalid_state", "no call in progress");
                    }
                    self.finish_call();
                }
                Ok(CallClientMessage::MicrophoneDenied) => {
                    warn!("Browser reported microphone permission denied");
                    self.microphone_denied = true;
                    self.capture_gate.denied.store(true, Ordering::SeqCst);
                }
                Err(err) => {
                    self.send_error(ctx, "invalid_json", &format!("Invalid JSON: {}", err));
                }
            },
            Ok(ws::Message::Binary(data)) => self.handle_audio(&data, ctx),
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!("Call WebSocket closed: {:?}", reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!("Call WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

/// Status transitions of the current call. Updates from earlier calls are ignored.
impl StreamHandler<CallStatusUpdate> for CallWebSocket {
    fn handle(&mut self, update: CallStatusUpdate, ctx: &mut Self::Context) {
        let Some(session) = self.call.clone() else {
            return;
        };
        if session.id() != update.call_id {
            return;
        }

        let status = update.status;
        let message = Self::status_message(&session, status);
        self.send(ctx, &message);

        match status {
            CallStatus::Active => self.reached_active = true,
            CallStatus::Ended => self.finish_call(),
            CallStatus::Connecting => {}
        }
    }

    // A finished status stream must not stop the socket
    fn finished(&mut self, _ctx: &mut Self::Context) {}
}

impl Handler<Outgoing> for CallWebSocket {
    type Result = ();

    fn handle(&mut self, msg: Outgoing, ctx: &mut Self::Context) {
        self.send(ctx, &msg.0);
    }
}

impl Handler<CallStarted> for CallWebSocket {
    type Result = ();

    fn handle(&mut self, msg: CallStarted, ctx: &mut Self::Context) {
        match msg.result {
            Ok(()) => {
                self.state.record_call(CallOutcome::Started);
                debug!(call_id = %msg.call_id, "Call connected");
            }
            Err(e) => {
                self.state.record_call(CallOutcome::Failed);
                self.send_error(ctx, e.code(), &e.to_string());
                if self.call.as_ref().map_or(false, |call| call.id() == msg.call_id) {
                    self.finish_call();
                } else {
                    self.state.calls.remove(&msg.call_id);
                }
            }
        }
    }
}

/// WebSocket endpoint handler for `/ws/call`.
pub async fn call_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!(
        "New call WebSocket connection request from: {:?}",
        req.connection_info().peer_addr()
    );
    ws::start(CallWebSocket::new(state), &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::playback::PlaybackScheduler;
    use std::sync::Mutex;

    #[derive(Message)]
    #[rtype(result = "Vec<CallServerMessage>")]
    struct Drain;

    struct Collector(Arc<Mutex<Vec<CallServerMessage>>>);

    impl Actor for Collector {
        type Context = Context<Self>;
    }

    impl Handler<Outgoing> for Collector {
        type Result = ();

        fn handle(&mut self, msg: Outgoing, _ctx: &mut Self::Context) {
            self.0.lock().unwrap().push(msg.0);
        }
    }

    impl Handler<Drain> for Collector {
        type Result = MessageResult<Drain>;

        fn handle(&mut self, _msg: Drain, _ctx: &mut Self::Context) -> Self::Result {
            MessageResult(std::mem::take(&mut *self.0.lock().unwrap()))
        }
    }

    #[test]
    fn test_client_messages() {
        let start: CallClientMessage = serde_json::from_str(
            r#"{"type": "start_call", "target": {"id": "c1", "name": "Kira"}}"#,
        )
        .unwrap();
        assert_eq!(
            start,
            CallClientMessage::StartCall {
                target: CallTarget {
                    id: "c1".to_string(),
                    name: "Kira".to_string(),
                }
            }
        );

        let end: CallClientMessage = serde_json::from_str(r#"{"type": "end_call"}"#).unwrap();
        assert_eq!(end, CallClientMessage::EndCall);
        assert!(serde_json::from_str::<CallClientMessage>(r#"{"type": "dial"}"#).is_err());
    }

    #[test]
    fn test_status_message_shape() {
        let message = CallServerMessage::CallStatus {
            call_id: "abc".to_string(),
            status: CallStatus::Active,
            duration_secs: 63,
            duration: "01:03".to_string(),
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "call_status");
        assert_eq!(value["status"], "active");
        assert_eq!(value["duration"], "01:03");
    }

    #[test]
    fn test_browser_capture_respects_denial() {
        let (_tx, rx) = mpsc::channel(1);
        let gate = Arc::new(CaptureGate::default());
        gate.denied.store(true, Ordering::SeqCst);
        let mut capture = BrowserCapture {
            frames: Some(rx),
            gate: gate.clone(),
        };

        assert!(matches!(
            capture.open(16000, 4096),
            Err(DeviceError::Unavailable(_))
        ));
        assert!(!gate.open.load(Ordering::SeqCst));

        gate.denied.store(false, Ordering::SeqCst);
        assert!(capture.open(16000, 4096).is_ok());
        assert!(gate.open.load(Ordering::SeqCst));
        assert_eq!(capture.open(16000, 4096).unwrap_err(), DeviceError::AlreadyOpen);

        capture.close().unwrap();
        assert!(!gate.open.load(Ordering::SeqCst));
    }

    #[actix_web::test]
    async fn test_browser_playback_forwards_play_and_stop() {
        let addr = Collector(Arc::new(Mutex::new(Vec::new()))).start();
        let mut output = BrowserPlayback::new(addr.clone().recipient());
        output.open(24000).unwrap();

        let mut scheduler = PlaybackScheduler::new(Box::new(output));
        let buffer = PlaybackBuffer::new(vec![0.25; 12000], 24000);
        let scheduled = scheduler.schedule(&buffer).unwrap();
        assert_eq!(scheduler.interrupt(), 1);

        let sent = addr.send(Drain).await.unwrap();
        assert_eq!(sent.len(), 2);
        match &sent[0] {
            CallServerMessage::Play {
                handle,
                duration,
                mime_type,
                data,
                ..
            } => {
                assert_eq!(*handle, scheduled.handle.id());
                assert!((duration - 0.5).abs() < 1e-9);
                assert_eq!(mime_type, "audio/pcm;rate=24000");
                assert_eq!(pcm::decode_samples(data).unwrap().len(), 12000);
            }
            other => panic!("expected play, got {:?}", other),
        }
        assert_eq!(
            sent[1],
            CallServerMessage::Stop {
                handle: scheduled.handle.id()
            }
        );

        let mut output = scheduler.into_output();
        output.close().unwrap();
        assert_eq!(output.close(), Err(DeviceError::Closed));
    }

    #[actix_web::test]
    async fn test_unopened_playback_rejects_buffers() {
        let addr = Collector(Arc::new(Mutex::new(Vec::new()))).start();
        let output = BrowserPlayback::new(addr.clone().recipient());
        assert_eq!(output.current_time(), 0.0);

        let mut scheduler = PlaybackScheduler::new(Box::new(output));
        let buffer = PlaybackBuffer::new(vec![0.0; 240], 24000);
        assert_eq!(scheduler.schedule(&buffer).unwrap_err(), DeviceError::Closed);
        assert_eq!(scheduler.cursor(), 0.0);
        assert!(addr.send(Drain).await.unwrap().is_empty());
    }

    struct Departed;

    impl Actor for Departed {
        type Context = Context<Self>;

        fn started(&mut self, ctx: &mut Self::Context) {
            ctx.stop();
        }
    }

    impl Handler<Outgoing> for Departed {
        type Result = ();

        fn handle(&mut self, _msg: Outgoing, _ctx: &mut Self::Context) {}
    }

    #[actix_web::test]
    async fn test_playback_to_closed_socket_is_rejected() {
        let recipient = Departed.start().recipient::<Outgoing>();
        for _ in 0..200 {
            if !recipient.connected() {
                break;
            }
            actix_web::rt::time::sleep(Duration::from_millis(5)).await;
        }
        let mut output = BrowserPlayback::new(recipient);
        output.open(24000).unwrap();

        let mut scheduler = PlaybackScheduler::new(Box::new(output));
        let buffer = PlaybackBuffer::new(vec![0.0; 240], 24000);

        assert!(matches!(
            scheduler.schedule(&buffer),
            Err(DeviceError::Backend(_))
        ));
        assert_eq!(scheduler.cursor(), 0.0);
    }
}
