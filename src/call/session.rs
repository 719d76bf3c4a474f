//! # Call Session
//!
//! Owns one full-duplex voice call: microphone capture toward the remote
//! endpoint, remote audio scheduled gaplessly on the output, interruption
//! handling and teardown.
//!
//! ## Ownership:
//! - **CallSession**: the public handle. `start` and `end` serialize on the
//!   lifecycle lock; status, playback and stats are observable from anywhere.
//! - **SessionLoop**: one task per call. It exclusively owns the scheduler
//!   (cursor, active set, output), the capture device and the outbound queue
//!   sender, and `select!`s over shutdown, remote events, playback
//!   completions and capture frames.
//!
//! ## Teardown:
//! `end()` signals the loop, waits for it to hand its resources back, then
//! releases them one by one. A resource that fails to release is logged and
//! the rest are still released.

use crate::audio::device::{CaptureDevice, PlaybackOutput};
use crate::audio::frame::{CaptureFrame, InboundAudioChunk, OutboundAudioPacket};
use crate::audio::pcm::MediaType;
use crate::audio::playback::{PlaybackHandle, PlaybackScheduler, PlaybackSnapshot};
use crate::call::state::{CallClock, CallEvent, CallStatus};
use crate::call::transport::{
    CallTarget, LiveCommand, LiveConnection, LiveEvent, LiveSetup, LiveTransport, ServerContent,
};
use crate::config::CallConfig;
use crate::error::CallError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Counters for one call.
#[derive(Debug, Default)]
struct CallStats {
    frames_captured: AtomicU64,
    packets_queued: AtomicU64,
    packets_dropped: AtomicU64,
    chunks_scheduled: AtomicU64,
    chunks_rejected: AtomicU64,
    interruptions: AtomicU64,
}

impl CallStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CallStatsSnapshot {
        CallStatsSnapshot {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            packets_queued: self.packets_queued.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            chunks_scheduled: self.chunks_scheduled.load(Ordering::Relaxed),
            chunks_rejected: self.chunks_rejected.load(Ordering::Relaxed),
            interruptions: self.interruptions.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CallStatsSnapshot {
    pub frames_captured: u64,
    pub packets_queued: u64,
    pub packets_dropped: u64,
    pub chunks_scheduled: u64,
    pub chunks_rejected: u64,
    pub interruptions: u64,
}

/// JSON view of a call for the HTTP API.
#[derive(Debug, Clone, Serialize)]
pub struct CallSummary {
    pub call_id: String,
    pub target: Option<CallTarget>,
    pub status: CallStatus,
    pub duration_secs: u64,
    pub created_at: DateTime<Utc>,
    pub stats: CallStatsSnapshot,
    pub playback: PlaybackSnapshot,
}

/// State shared between the handle and the loop task.
struct SessionShared {
    status: watch::Sender<CallStatus>,
    playback: watch::Sender<PlaybackSnapshot>,
    clock: Mutex<CallClock>,
    stats: CallStats,
}

impl SessionShared {
    /// Apply a lifecycle event. Returns the new status if it was accepted.
    fn advance(&self, event: CallEvent) -> Option<CallStatus> {
        let mut accepted = None;
        self.status.send_if_modified(|status| match status.on_event(event) {
            Ok(next) => {
                *status = next;
                self.clock
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .record(next);
                accepted = Some(next);
                true
            }
            Err(rejected) => {
                debug!(%rejected, "Ignoring call event");
                false
            }
        });
        accepted
    }

    fn status(&self) -> CallStatus {
        *self.status.borrow()
    }
}

enum Lifecycle {
    /// Devices handed over but not opened yet
    Idle {
        capture: Box<dyn CaptureDevice>,
        output: Box<dyn PlaybackOutput>,
    },
    Running {
        shutdown: oneshot::Sender<()>,
        task: JoinHandle<CallResources>,
    },
    Released,
}

/// Everything a call holds open.
struct CallResources {
    commands: Option<mpsc::Sender<LiveCommand>>,
    close: Option<oneshot::Sender<()>>,
    capture: Box<dyn CaptureDevice>,
    scheduler: PlaybackScheduler,
}

impl CallResources {
    /// Release the remote session, the capture device and the output, in that
    /// order, each independently of the others.
    fn release(self, call_id: &str) {
        let CallResources {
            commands,
            close,
            mut capture,
            mut scheduler,
        } = self;

        // Close before dropping the queue so queued audio is discarded
        if let Some(close) = close {
            if close.send(()).is_err() {
                debug!(call_id, "Remote session already closed");
            }
        }
        drop(commands);

        if let Err(e) = capture.close() {
            warn!(call_id, error = %e, "Failed to release capture device");
        }

        let stopped = scheduler.interrupt();
        let mut output = scheduler.into_output();
        if let Err(e) = output.close() {
            warn!(call_id, error = %e, "Failed to release output");
        }

        debug!(call_id, stopped, "Call resources released");
    }
}

pub struct CallSession {
    id: String,
    config: CallConfig,
    transport: Arc<dyn LiveTransport>,
    shared: Arc<SessionShared>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
    cancel: watch::Sender<bool>,
    target: Mutex<Option<CallTarget>>,
    created_at: DateTime<Utc>,
}

impl CallSession {
    pub fn new(
        id: impl Into<String>,
        config: CallConfig,
        transport: Arc<dyn LiveTransport>,
        capture: Box<dyn CaptureDevice>,
        output: Box<dyn PlaybackOutput>,
    ) -> Self {
        let (status, _) = watch::channel(CallStatus::Connecting);
        let (playback, _) = watch::channel(PlaybackSnapshot::default());
        let (cancel, _) = watch::channel(false);

        Self {
            id: id.into(),
            config,
            transport,
            shared: Arc::new(SessionShared {
                status,
                playback,
                clock: Mutex::new(CallClock::default()),
                stats: CallStats::default(),
            }),
            lifecycle: tokio::sync::Mutex::new(Lifecycle::Idle { capture, output }),
            cancel,
            target: Mutex::new(None),
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> CallStatus {
        self.shared.status()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<CallStatus> {
        self.shared.status.subscribe()
    }

    pub fn playback(&self) -> PlaybackSnapshot {
        *self.shared.playback.borrow()
    }

    pub fn stats(&self) -> CallStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Time spent `Active`, frozen once the call ended.
    pub fn duration(&self) -> Duration {
        self.shared
            .clock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .duration()
    }

    pub fn target(&self) -> Option<CallTarget> {
        self.target
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn summary(&self) -> CallSummary {
        CallSummary {
            call_id: self.id.clone(),
            target: self.target(),
            status: self.status(),
            duration_secs: self.duration().as_secs(),
            created_at: self.created_at,
            stats: self.stats(),
            playback: self.playback(),
        }
    }

    /// Start the call.
    ///
    /// ## Steps:
    /// 1. Open the capture device at the input rate
    /// 2. Open the output at the output rate
    /// 3. Connect the remote session, bounded by the connect timeout
    /// 4. Spawn the session loop
    ///
    /// Any failure releases what was acquired, ends the call and returns the
    /// error. The call becomes `Active` when the remote signals open.
    pub async fn start(&self, target: &CallTarget) -> Result<(), CallError> {
        let mut lifecycle = self.lifecycle.lock().await;

        let (mut capture, mut output) = match std::mem::replace(&mut *lifecycle, Lifecycle::Released) {
            Lifecycle::Idle { capture, output } if !*self.cancel.borrow() => (capture, output),
            Lifecycle::Running { shutdown, task } => {
                *lifecycle = Lifecycle::Running { shutdown, task };
                return Err(CallError::InvalidState("call already started".to_string()));
            }
            _ => return Err(CallError::InvalidState("call already ended".to_string())),
        };

        *self
            .target
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(target.clone());
        info!(call_id = %self.id, target = %target.name, "Starting call");

        let frames = match capture.open(self.config.input_sample_rate, self.config.frame_size) {
            Ok(frames) => frames,
            Err(e) => {
                warn!(call_id = %self.id, error = %e, "Microphone acquisition failed");
                return Err(self.fail_setup(CallError::Acquisition(e.to_string())));
            }
        };

        if let Err(e) = output.open(self.config.output_sample_rate) {
            warn!(call_id = %self.id, error = %e, "Output acquisition failed");
            if let Err(e) = capture.close() {
                warn!(call_id = %self.id, error = %e, "Failed to release capture device");
            }
            return Err(self.fail_setup(CallError::Acquisition(e.to_string())));
        }

        let resources = CallResources {
            commands: None,
            close: None,
            capture,
            scheduler: PlaybackScheduler::new(output),
        };

        let connection = match self.connect(target).await {
            Ok(connection) => connection,
            Err(e) => {
                warn!(call_id = %self.id, error = %e, "Remote session setup failed");
                resources.release(&self.id);
                return Err(self.fail_setup(e));
            }
        };

        let LiveConnection {
            commands,
            close,
            events,
        } = connection;
        let session_loop = SessionLoop {
            call_id: self.id.clone(),
            output_sample_rate: self.config.output_sample_rate,
            input_media_type: self.config.input_media_type(),
            shared: self.shared.clone(),
            resources: CallResources {
                commands: Some(commands),
                close: Some(close),
                ..resources
            },
            events,
            frames,
        };

        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(session_loop.run(shutdown_rx));
        *lifecycle = Lifecycle::Running { shutdown, task };

        debug!(call_id = %self.id, "Remote session connected, waiting for open");
        Ok(())
    }

    async fn connect(&self, target: &CallTarget) -> Result<LiveConnection, CallError> {
        let setup = LiveSetup::for_target(&self.config, target);
        let timeout = self.config.connect_timeout();
        let connect = tokio::time::timeout(
            timeout,
            self.transport
                .connect(setup, self.config.outbound_queue_capacity),
        );
        let mut cancel = self.cancel.subscribe();

        tokio::select! {
            result = connect => match result {
                Ok(Ok(connection)) => Ok(connection),
                Ok(Err(e)) => Err(CallError::Connect(e.to_string())),
                Err(_) => Err(CallError::Connect(format!(
                    "timed out after {}ms",
                    timeout.as_millis()
                ))),
            },
            _ = cancelled(&mut cancel) => {
                Err(CallError::Connect("call ended during setup".to_string()))
            }
        }
    }

    fn fail_setup(&self, error: CallError) -> CallError {
        self.shared.advance(CallEvent::SetupFailed);
        error
    }

    /// End the call. Safe to call in any state and more than once.
    pub async fn end(&self) {
        self.cancel.send_replace(true);
        if self.shared.advance(CallEvent::LocalEnd).is_some() {
            info!(
                call_id = %self.id,
                duration_secs = self.duration().as_secs(),
                "Call ended locally"
            );
        }

        let mut lifecycle = self.lifecycle.lock().await;
        match std::mem::replace(&mut *lifecycle, Lifecycle::Released) {
            Lifecycle::Running { shutdown, task } => {
                let _ = shutdown.send(());
                match task.await {
                    Ok(resources) => resources.release(&self.id),
                    Err(e) => warn!(call_id = %self.id, error = %e, "Session loop did not stop cleanly"),
                }
            }
            Lifecycle::Idle { .. } => debug!(call_id = %self.id, "Call ended before it started"),
            Lifecycle::Released => {}
        }
    }
}

/// Resolves once `end()` has been requested.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|requested| *requested).await;
}

struct SessionLoop {
    call_id: String,
    output_sample_rate: u32,
    input_media_type: MediaType,
    shared: Arc<SessionShared>,
    resources: CallResources,
    events: mpsc::Receiver<LiveEvent>,
    frames: mpsc::Receiver<CaptureFrame>,
}

impl SessionLoop {
    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) -> CallResources {
        let (completion_tx, mut completions) = mpsc::unbounded_channel::<PlaybackHandle>();
        let mut remote_open = true;
        let mut capture_open = true;

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                event = self.events.recv(), if remote_open => match event {
                    Some(LiveEvent::Closed) | None => {
                        remote_open = false;
                        self.on_remote_closed();
                    }
                    Some(event) => self.on_live_event(event, &completion_tx),
                },
                Some(handle) = completions.recv() => self.on_playback_complete(handle),
                frame = self.frames.recv(), if capture_open => match frame {
                    Some(frame) => self.on_capture_frame(frame),
                    None => {
                        debug!(call_id = %self.call_id, "Capture stream ended");
                        capture_open = false;
                    }
                },
            }
        }

        self.resources
    }

    fn on_live_event(&mut self, event: LiveEvent, completions: &mpsc::UnboundedSender<PlaybackHandle>) {
        match event {
            LiveEvent::Open => {
                if self.shared.advance(CallEvent::RemoteOpened).is_some() {
                    info!(call_id = %self.call_id, "Call active");
                }
            }
            LiveEvent::Message(content) => self.on_server_content(content, completions),
            LiveEvent::Error(message) => {
                warn!(call_id = %self.call_id, error = %message, "Remote session error");
            }
            LiveEvent::Closed => self.on_remote_closed(),
        }
    }

    /// Audio first, then interruption.
    fn on_server_content(
        &mut self,
        content: ServerContent,
        completions: &mpsc::UnboundedSender<PlaybackHandle>,
    ) {
        if self.shared.status() != CallStatus::Active {
            return;
        }

        if let Some(chunk) = content.audio {
            self.schedule_chunk(&chunk, completions);
        }

        if content.interrupted {
            let stopped = self.resources.scheduler.interrupt();
            CallStats::bump(&self.shared.stats.interruptions);
            self.publish_playback();
            debug!(call_id = %self.call_id, stopped, "Remote interrupted playback");
        }

        if content.turn_complete {
            debug!(call_id = %self.call_id, "Remote turn complete");
        }
    }

    fn schedule_chunk(
        &mut self,
        chunk: &InboundAudioChunk,
        completions: &mpsc::UnboundedSender<PlaybackHandle>,
    ) {
        let buffer = match chunk.decode(self.output_sample_rate) {
            Ok(buffer) => buffer,
            Err(e) => {
                warn!(call_id = %self.call_id, error = %e, "Dropping undecodable audio chunk");
                CallStats::bump(&self.shared.stats.chunks_rejected);
                return;
            }
        };

        let scheduler = &mut self.resources.scheduler;
        let scheduled = match scheduler.schedule(&buffer) {
            Ok(scheduled) => scheduled,
            Err(e) => {
                warn!(call_id = %self.call_id, error = %e, "Could not schedule audio chunk");
                CallStats::bump(&self.shared.stats.chunks_rejected);
                return;
            }
        };
        CallStats::bump(&self.shared.stats.chunks_scheduled);

        let delay = Duration::try_from_secs_f64((scheduled.end_at - scheduler.now()).max(0.0))
            .unwrap_or_default();
        let completions = completions.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = completions.send(scheduled.handle);
        });

        self.publish_playback();
    }

    fn on_playback_complete(&mut self, handle: PlaybackHandle) {
        if self.resources.scheduler.complete(handle) {
            self.publish_playback();
        }
    }

    /// Never waits on the network: a full queue drops the packet.
    fn on_capture_frame(&mut self, frame: CaptureFrame) {
        if self.shared.status() != CallStatus::Active {
            return;
        }
        let Some(commands) = &self.resources.commands else {
            return;
        };

        let stats = &self.shared.stats;
        CallStats::bump(&stats.frames_captured);

        let packet = OutboundAudioPacket::encode(&frame, self.input_media_type);
        match commands.try_send(LiveCommand::Audio(packet)) {
            Ok(()) => CallStats::bump(&stats.packets_queued),
            Err(mpsc::error::TrySendError::Full(_)) => CallStats::bump(&stats.packets_dropped),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                CallStats::bump(&stats.packets_dropped);
                debug!(call_id = %self.call_id, "Outbound queue closed, dropping frame");
            }
        }
    }

    fn on_remote_closed(&mut self) {
        if self.shared.advance(CallEvent::RemoteClosed).is_some() {
            info!(call_id = %self.call_id, "Remote closed the call");
        }
    }

    fn publish_playback(&self) {
        self.shared
            .playback
            .send_replace(self.resources.scheduler.snapshot());
    }
}
