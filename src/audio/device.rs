//! # Audio Devices
//!
//! Abstractions over the two audio contexts a call owns: the capture device
//! (microphone at the input rate) and the playback output (speaker at the
//! output rate, with its own clock).
//!
//! Implementations:
//! - `gateway::call::BrowserCapture` / `BrowserPlayback`: a browser connected
//!   over WebSocket acts as microphone and speaker.
//! - `testing::FakeCapture` / `FakeOutput`: for tests (no hardware).

use crate::audio::frame::{CaptureFrame, PlaybackBuffer};
use crate::audio::playback::PlaybackHandle;
use std::fmt;
use tokio::sync::mpsc;

/// Errors raised by audio devices.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceError {
    /// Device missing or permission denied
    Unavailable(String),
    /// Device was already opened by someone else
    AlreadyOpen,
    /// Operation on a device that is not open
    Closed,
    /// Any other backend failure
    Backend(String),
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::Unavailable(msg) => write!(f, "device unavailable: {}", msg),
            DeviceError::AlreadyOpen => write!(f, "device is already open"),
            DeviceError::Closed => write!(f, "device is closed"),
            DeviceError::Backend(msg) => write!(f, "device error: {}", msg),
        }
    }
}

impl std::error::Error for DeviceError {}

/// Microphone input.
pub trait CaptureDevice: Send {
    /// Start capturing mono frames of `frame_size` samples at `sample_rate`.
    ///
    /// Frames are delivered on the returned channel until the device is
    /// closed. Implementations must not block the caller.
    fn open(
        &mut self,
        sample_rate: u32,
        frame_size: usize,
    ) -> Result<mpsc::Receiver<CaptureFrame>, DeviceError>;

    /// Stop capturing and release the input stream and its context.
    fn close(&mut self) -> Result<(), DeviceError>;
}

/// Speaker output with a monotonic clock in seconds.
pub trait PlaybackOutput: Send {
    fn open(&mut self, sample_rate: u32) -> Result<(), DeviceError>;

    /// Current position of the output clock, in seconds since open.
    fn current_time(&self) -> f64;

    /// Schedule `buffer` to start at output time `at`.
    fn start(
        &mut self,
        handle: PlaybackHandle,
        buffer: &PlaybackBuffer,
        at: f64,
    ) -> Result<(), DeviceError>;

    /// Stop a scheduled or playing buffer immediately.
    fn stop(&mut self, handle: PlaybackHandle);

    fn close(&mut self) -> Result<(), DeviceError>;
}

#[cfg(test)]
pub mod testing {
    //! In-memory devices that record every call made on them.

    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default)]
    pub struct CaptureLog {
        pub opened: usize,
        pub closed: usize,
        pub sender: Option<mpsc::Sender<CaptureFrame>>,
    }

    /// Microphone fake. Tests push frames through [`FakeCapture::log`].
    pub struct FakeCapture {
        log: Arc<Mutex<CaptureLog>>,
        deny: bool,
    }

    impl FakeCapture {
        pub fn new() -> (Self, Arc<Mutex<CaptureLog>>) {
            let log = Arc::new(Mutex::new(CaptureLog::default()));
            (
                Self {
                    log: log.clone(),
                    deny: false,
                },
                log,
            )
        }

        pub fn denied() -> (Self, Arc<Mutex<CaptureLog>>) {
            let (mut capture, log) = Self::new();
            capture.deny = true;
            (capture, log)
        }
    }

    impl CaptureDevice for FakeCapture {
        fn open(
            &mut self,
            _sample_rate: u32,
            _frame_size: usize,
        ) -> Result<mpsc::Receiver<CaptureFrame>, DeviceError> {
            if self.deny {
                return Err(DeviceError::Unavailable("permission denied".to_string()));
            }
            let (tx, rx) = mpsc::channel(64);
            let mut log = self.log.lock().unwrap();
            log.opened += 1;
            log.sender = Some(tx);
            Ok(rx)
        }

        fn close(&mut self) -> Result<(), DeviceError> {
            let mut log = self.log.lock().unwrap();
            log.closed += 1;
            log.sender = None;
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    pub struct OutputLog {
        pub clock: f64,
        pub opened: usize,
        pub closed: usize,
        /// (handle, start time, duration)
        pub started: Vec<(PlaybackHandle, f64, f64)>,
        pub stopped: Vec<PlaybackHandle>,
        pub fail_next_start: bool,
    }

    /// Speaker fake with a manually driven clock.
    pub struct FakeOutput {
        log: Arc<Mutex<OutputLog>>,
    }

    impl FakeOutput {
        pub fn new() -> (Self, Arc<Mutex<OutputLog>>) {
            let log = Arc::new(Mutex::new(OutputLog::default()));
            (Self { log: log.clone() }, log)
        }
    }

    impl PlaybackOutput for FakeOutput {
        fn open(&mut self, _sample_rate: u32) -> Result<(), DeviceError> {
            self.log.lock().unwrap().opened += 1;
            Ok(())
        }

        fn current_time(&self) -> f64 {
            self.log.lock().unwrap().clock
        }

        fn start(
            &mut self,
            handle: PlaybackHandle,
            buffer: &PlaybackBuffer,
            at: f64,
        ) -> Result<(), DeviceError> {
            let mut log = self.log.lock().unwrap();
            if log.fail_next_start {
                log.fail_next_start = false;
                return Err(DeviceError::Backend("output underrun".to_string()));
            }
            log.started.push((handle, at, buffer.duration_secs()));
            Ok(())
        }

        fn stop(&mut self, handle: PlaybackHandle) {
            self.log.lock().unwrap().stopped.push(handle);
        }

        fn close(&mut self) -> Result<(), DeviceError> {
            self.log.lock().unwrap().closed += 1;
            Ok(())
        }
    }
}
