//! # Live Transport
//!
//! The seam between a call session and the remote conversational audio
//! endpoint. A transport opens one streaming session and hands back a
//! [`LiveConnection`]: a bounded command queue toward the remote, a close
//! signal that bypasses that queue, and a stream of lifecycle events.
//!
//! ## Event order:
//! `Open` first (once the remote accepted the setup), then any number of
//! `Message` / `Error`, then `Closed` exactly once.

use crate::audio::frame::{InboundAudioChunk, OutboundAudioPacket};
use crate::audio::pcm::MediaType;
use crate::config::CallConfig;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::{mpsc, oneshot};

/// The contact being called.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallTarget {
    pub id: String,
    pub name: String,
}

/// Everything the remote needs to open a session.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveSetup {
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
    pub input_media_type: MediaType,
}

impl LiveSetup {
    pub fn for_target(config: &CallConfig, target: &CallTarget) -> Self {
        Self {
            model: config.model.clone(),
            voice: config.voice.clone(),
            system_instruction: system_instruction(&target.name),
            input_media_type: config.input_media_type(),
        }
    }
}

/// Persona prompt for the remote voice.
pub fn system_instruction(name: &str) -> String {
    format!(
        "You are {} on a voice call. Sound natural, warm, and speak naturally as if you are catching up with a friend. Keep responses reasonably brief.",
        name
    )
}

/// Payload of one server message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerContent {
    pub audio: Option<InboundAudioChunk>,
    pub interrupted: bool,
    pub turn_complete: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    Open,
    Message(ServerContent),
    Error(String),
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LiveCommand {
    Audio(OutboundAudioPacket),
}

/// An open (or opening) remote session.
///
/// Firing or dropping `close` ends the session. Commands still queued at
/// that point are discarded, never sent.
#[derive(Debug)]
pub struct LiveConnection {
    pub commands: mpsc::Sender<LiveCommand>,
    pub close: oneshot::Sender<()>,
    pub events: mpsc::Receiver<LiveEvent>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportError {
    MissingApiKey,
    Connect(String),
    Protocol(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::MissingApiKey => write!(f, "no API key configured"),
            TransportError::Connect(msg) => write!(f, "connection failed: {}", msg),
            TransportError::Protocol(msg) => write!(f, "protocol error: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {}

pub trait LiveTransport: Send + Sync {
    /// Open a streaming session.
    ///
    /// Resolves once the connection is established and the setup was sent.
    /// `LiveEvent::Open` arrives on the event channel when the remote is ready.
    fn connect(
        &self,
        setup: LiveSetup,
        queue_capacity: usize,
    ) -> BoxFuture<'static, Result<LiveConnection, TransportError>>;
}

#[cfg(test)]
pub mod testing {
    //! A transport driven by the test body.

    use super::*;
    use std::sync::Mutex;

    /// The remote end of a scripted connection.
    pub struct ScriptedRemote {
        pub events: mpsc::Sender<LiveEvent>,
        pub commands: mpsc::Receiver<LiveCommand>,
        pub close: oneshot::Receiver<()>,
        pub setup: LiveSetup,
    }

    impl ScriptedRemote {
        /// Drain every command currently queued.
        pub fn drain_commands(&mut self) -> Vec<LiveCommand> {
            let mut drained = Vec::new();
            while let Ok(command) = self.commands.try_recv() {
                drained.push(command);
            }
            drained
        }

        /// Whether the session asked for the remote to close.
        pub fn close_requested(&mut self) -> bool {
            self.close.try_recv().is_ok()
        }
    }

    enum Mode {
        Accept,
        Fail,
        Hang,
    }

    pub struct ScriptedTransport {
        mode: Mode,
        remote: Mutex<Option<ScriptedRemote>>,
    }

    impl ScriptedTransport {
        pub fn new() -> Self {
            Self {
                mode: Mode::Accept,
                remote: Mutex::new(None),
            }
        }

        pub fn failing() -> Self {
            Self {
                mode: Mode::Fail,
                ..Self::new()
            }
        }

        /// Never completes the connect.
        pub fn hanging() -> Self {
            Self {
                mode: Mode::Hang,
                ..Self::new()
            }
        }

        pub fn take_remote(&self) -> Option<ScriptedRemote> {
            self.remote.lock().unwrap().take()
        }
    }

    impl LiveTransport for ScriptedTransport {
        fn connect(
            &self,
            setup: LiveSetup,
            queue_capacity: usize,
        ) -> BoxFuture<'static, Result<LiveConnection, TransportError>> {
            match self.mode {
                Mode::Fail => Box::pin(futures_util::future::ready(Err::<LiveConnection, _>(
                    TransportError::Connect("connection refused".to_string()),
                ))),
                Mode::Hang => Box::pin(futures_util::future::pending::<
                    Result<LiveConnection, TransportError>,
                >()),
                Mode::Accept => {
                    let (command_tx, command_rx) = mpsc::channel(queue_capacity);
                    let (event_tx, event_rx) = mpsc::channel(64);
                    let (close_tx, close_rx) = oneshot::channel();
                    *self.remote.lock().unwrap() = Some(ScriptedRemote {
                        events: event_tx,
                        commands: command_rx,
                        close: close_rx,
                        setup,
                    });
                    Box::pin(async move {
                        Ok::<_, TransportError>(LiveConnection {
                            commands: command_tx,
                            close: close_tx,
                            events: event_rx,
                        })
                    })
                }
            }
        }
    }
}
