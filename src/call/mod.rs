//! # Voice Calls
//!
//! ## Key Components:
//! - **State**: the Connecting → Active → Ended lifecycle and the call clock
//! - **Transport**: the seam toward the remote conversational audio endpoint
//! - **Gemini**: the Gemini Live implementation of that seam
//! - **Session**: one full-duplex call (capture, playback, interruption, teardown)
//! - **Registry**: the calls currently running on this server

pub mod gemini;
pub mod registry;
pub mod session;
pub mod state;
pub mod transport;
