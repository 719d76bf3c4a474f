//! # Audio Pipeline Module
//!
//! Building blocks of the realtime call audio path.
//!
//! ## Key Components:
//! - **PCM**: float ↔ 16-bit PCM conversion, byte layout, base64 text encoding
//! - **Frames**: capture frames, outbound packets, inbound chunks, playback buffers
//! - **Devices**: capture and playback device traits
//! - **Playback**: the gapless schedule cursor and active playback set
//!
//! ## Audio Format:
//! - **Input**: mono, 16kHz, 4096-sample frames (configurable)
//! - **Output**: mono, 24kHz (configurable, independent of the input rate)
//! - **Wire**: 16-bit little-endian PCM, base64 encoded

pub mod device;     // Capture / playback device abstractions
pub mod frame;      // Capture frames, packets, chunks, buffers
pub mod pcm;        // PCM quantization and text encoding
pub mod playback;   // Playback schedule cursor and active set
