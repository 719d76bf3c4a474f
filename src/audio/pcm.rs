//! # PCM Encoding
//!
//! Conversions between the floating-point samples produced by capture devices
//! and the 16-bit linear PCM carried on the wire to the conversational audio
//! endpoint.
//!
//! ## Wire Format:
//! - **Samples**: signed 16-bit integers, little-endian
//! - **Channels**: mono
//! - **Text encoding**: standard base64 so a packet fits inside a JSON envelope
//! - **Media type**: `audio/pcm;rate=<hz>` (plus `;channels=<n>` when not mono)

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::Cursor;
use std::str::FromStr;

/// Base MIME type for linear PCM audio.
pub const PCM_MIME: &str = "audio/pcm";

/// Errors produced while decoding audio payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum PcmError {
    /// Payload decoded to zero samples
    Empty,
    /// Byte length is not a whole number of samples
    Misaligned { len: usize, sample_width: usize },
    /// Text payload is not valid base64
    Base64(String),
    /// Media type string could not be parsed
    InvalidMediaType(String),
}

impl fmt::Display for PcmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PcmError::Empty => write!(f, "audio payload is empty"),
            PcmError::Misaligned { len, sample_width } => write!(
                f,
                "audio payload of {} bytes is not a multiple of the {}-byte sample width",
                len, sample_width
            ),
            PcmError::Base64(msg) => write!(f, "invalid base64 audio payload: {}", msg),
            PcmError::InvalidMediaType(value) => write!(f, "invalid media type '{}'", value),
        }
    }
}

impl std::error::Error for PcmError {}

/// Media-type tag attached to every audio packet and chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaType {
    pub sample_rate: u32,
    pub channels: u8,
}

impl MediaType {
    /// Mono linear PCM at the given sample rate.
    pub fn pcm(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: 1,
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};rate={}", PCM_MIME, self.sample_rate)?;
        if self.channels != 1 {
            write!(f, ";channels={}", self.channels)?;
        }
        Ok(())
    }
}

impl FromStr for MediaType {
    type Err = PcmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || PcmError::InvalidMediaType(s.to_string());
        let mut parts = s.split(';').map(str::trim);

        let essence = parts.next().ok_or_else(invalid)?;
        if !essence.eq_ignore_ascii_case(PCM_MIME) {
            return Err(invalid());
        }

        let mut sample_rate = None;
        let mut channels = 1u8;
        for param in parts.filter(|p| !p.is_empty()) {
            let (key, value) = param.split_once('=').ok_or_else(invalid)?;
            match key.trim().to_ascii_lowercase().as_str() {
                "rate" => sample_rate = Some(value.trim().parse::<u32>().map_err(|_| invalid())?),
                "channels" => channels = value.trim().parse::<u8>().map_err(|_| invalid())?,
                // Unknown parameters (codec hints and the like) are ignored
                _ => {}
            }
        }

        match sample_rate {
            Some(rate) if rate > 0 && channels > 0 => Ok(Self {
                sample_rate: rate,
                channels,
            }),
            _ => Err(invalid()),
        }
    }
}

/// Quantize floating-point samples to 16-bit PCM.
///
/// Samples are clamped to [-1.0, 1.0] first, so out-of-range input saturates
/// at the extreme representable values instead of wrapping around.
pub fn float_to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&sample| {
            let s = sample.clamp(-1.0, 1.0);
            if s < 0.0 {
                (s * 32768.0).round() as i16
            } else {
                (s * 32767.0).round() as i16
            }
        })
        .collect()
}

/// Expand 16-bit PCM back to floating point in [-1.0, 1.0].
///
/// Inverse of [`float_to_pcm16`]: negative samples scale by 32768, positive by
/// 32767, so both extremes map back to exactly -1.0 and 1.0.
pub fn pcm16_to_float(samples: &[i16]) -> Vec<f32> {
    samples
        .iter()
        .map(|&sample| {
            if sample < 0 {
                sample as f32 / 32768.0
            } else {
                sample as f32 / 32767.0
            }
        })
        .collect()
}

/// Serialize samples as little-endian bytes.
pub fn pcm16_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        // Writing into a Vec cannot fail
        let _ = bytes.write_i16::<LittleEndian>(sample);
    }
    bytes
}

/// Parse little-endian 16-bit samples.
pub fn le_bytes_to_pcm16(bytes: &[u8]) -> Result<Vec<i16>, PcmError> {
    if bytes.len() % 2 != 0 {
        return Err(PcmError::Misaligned {
            len: bytes.len(),
            sample_width: 2,
        });
    }

    let mut cursor = Cursor::new(bytes);
    let mut samples = Vec::with_capacity(bytes.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample);
    }
    Ok(samples)
}

/// Parse little-endian 32-bit float samples (the browser capture format).
pub fn le_bytes_to_f32(bytes: &[u8]) -> Result<Vec<f32>, PcmError> {
    if bytes.len() % 4 != 0 {
        return Err(PcmError::Misaligned {
            len: bytes.len(),
            sample_width: 4,
        });
    }

    let mut cursor = Cursor::new(bytes);
    let mut samples = Vec::with_capacity(bytes.len() / 4);
    while let Ok(sample) = cursor.read_f32::<LittleEndian>() {
        samples.push(sample);
    }
    Ok(samples)
}

/// Full outbound path: float samples → 16-bit PCM → little-endian → base64.
pub fn encode_samples(samples: &[f32]) -> String {
    STANDARD.encode(pcm16_to_le_bytes(&float_to_pcm16(samples)))
}

/// Full inbound path: base64 → little-endian 16-bit PCM → float samples.
pub fn decode_samples(data: &str) -> Result<Vec<f32>, PcmError> {
    let bytes = STANDARD
        .decode(data.trim())
        .map_err(|e| PcmError::Base64(e.to_string()))?;
    let pcm = le_bytes_to_pcm16(&bytes)?;
    if pcm.is_empty() {
        return Err(PcmError::Empty);
    }
    Ok(pcm16_to_float(&pcm))
}
