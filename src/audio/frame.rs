//! # Audio Frames
//!
//! The transient units of audio that flow through a call. Nothing here is
//! stored past the lifetime of the call that produced it.

use crate::audio::pcm::{self, MediaType, PcmError};

/// One fixed-size block of mono samples read from the microphone.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureFrame {
    pub samples: Vec<f32>,
}

impl CaptureFrame {
    /// Build a frame from little-endian f32 bytes as sent by the browser.
    pub fn from_le_bytes(bytes: &[u8]) -> Result<Self, PcmError> {
        let samples = pcm::le_bytes_to_f32(bytes)?;
        if samples.is_empty() {
            return Err(PcmError::Empty);
        }
        Ok(Self { samples })
    }
}

#[cfg(test)]
impl CaptureFrame {
    /// A frame of all-zero samples.
    pub fn silence(len: usize) -> Self {
        Self {
            samples: vec![0.0; len],
        }
    }
}

/// A capture frame quantized to 16-bit PCM and text-encoded for transmission.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundAudioPacket {
    /// base64 of little-endian 16-bit samples
    pub data: String,
    pub mime_type: MediaType,
}

impl OutboundAudioPacket {
    pub fn encode(frame: &CaptureFrame, mime_type: MediaType) -> Self {
        Self {
            data: pcm::encode_samples(&frame.samples),
            mime_type,
        }
    }
}

/// Encoded audio received from the remote endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundAudioChunk {
    pub data: String,
    /// Tag sent by the remote; informational only
    pub mime_type: Option<MediaType>,
}

impl InboundAudioChunk {
    /// Decode into a playable buffer at the fixed output rate.
    pub fn decode(&self, output_sample_rate: u32) -> Result<PlaybackBuffer, PcmError> {
        let samples = pcm::decode_samples(&self.data)?;
        Ok(PlaybackBuffer::new(samples, output_sample_rate))
    }
}

/// Decoded audio ready to be scheduled on an output.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackBuffer {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl PlaybackBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Playback length in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silent_frame_encodes_to_zero_pcm() {
        let packet = OutboundAudioPacket::encode(&CaptureFrame::silence(4096), MediaType::pcm(16000));

        assert_eq!(packet.mime_type.to_string(), "audio/pcm;rate=16000");
        let decoded = pcm::decode_samples(&packet.data).unwrap();
        assert_eq!(decoded.len(), 4096);
        assert!(decoded.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_chunk_decodes_at_output_rate() {
        let chunk = InboundAudioChunk {
            data: pcm::encode_samples(&vec![0.1; 12000]),
            mime_type: Some(MediaType::pcm(16000)),
        };

        let buffer = chunk.decode(24000).unwrap();

        assert_eq!(buffer.sample_rate(), 24000);
        assert_eq!(buffer.samples().len(), 12000);
        assert!((buffer.duration_secs() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_frame_from_browser_bytes() {
        let bytes: Vec<u8> = [0.5f32, -0.25].iter().flat_map(|s| s.to_le_bytes()).collect();
        let frame = CaptureFrame::from_le_bytes(&bytes).unwrap();
        assert_eq!(frame.samples, vec![0.5, -0.25]);

        assert!(CaptureFrame::from_le_bytes(&[]).is_err());
        assert!(CaptureFrame::from_le_bytes(&[1, 2, 3]).is_err());
    }
}
