use base64::Engine;
use tokio::sync::mpsc;

use super::format::AudioFormat;
use crate::error::CaptureError;

/// Audio sample data (16-bit PCM, interleaved)
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Raw audio samples (i16 PCM, interleaved)
    pub samples: Vec<i16>,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of channels
    pub channels: u16,
    /// Timestamp in milliseconds since capture started
    pub timestamp_ms: u64,
}

impl AudioFrame {
    pub fn duration_ms(&self) -> u64 {
        let per_second = self.sample_rate as u64 * self.channels.max(1) as u64;
        if per_second == 0 {
            return 0;
        }
        self.samples.len() as u64 * 1000 / per_second
    }
}

/// A chunk of encoded audio belonging to a turn, tagged with its format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFragment {
    pub mime_type: String,
    /// Base64-encoded PCM bytes
    pub data: String,
}

impl AudioFragment {
    /// Encode little-endian i16 PCM samples
    pub fn from_samples(samples: &[i16], format: &AudioFormat) -> Self {
        let pcm: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        Self::from_pcm(&pcm, format)
    }

    pub fn from_pcm(pcm: &[u8], format: &AudioFormat) -> Self {
        Self {
            mime_type: format.mime_type(),
            data: base64::engine::general_purpose::STANDARD.encode(pcm),
        }
    }

    pub fn format(&self) -> AudioFormat {
        AudioFormat::from_mime_type(&self.mime_type)
    }

    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        base64::engine::general_purpose::STANDARD.decode(self.data.as_bytes())
    }
}

/// Configuration for a capture device
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Target sample rate (will resample if needed)
    pub sample_rate: u32,
    /// Target channel count (1 = mono)
    pub channels: u16,
    /// Device buffer size in milliseconds (affects latency)
    pub buffer_duration_ms: u64,
    /// Duration of each outbound fragment in milliseconds
    pub chunk_duration_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,        // 16kHz input
            channels: 1,               // Mono
            buffer_duration_ms: 100,   // 100ms device buffers
            chunk_duration_ms: 1000,   // 1s fragments
        }
    }
}

impl CaptureConfig {
    pub fn format(&self) -> AudioFormat {
        AudioFormat {
            num_channels: self.channels,
            bits_per_sample: 16,
            sample_rate: self.sample_rate,
        }
    }

    /// Number of interleaved samples in one outbound fragment
    pub fn samples_per_chunk(&self) -> usize {
        (self.sample_rate as u64 * self.channels as u64 * self.chunk_duration_ms / 1000) as usize
    }
}

/// Microphone capture device
///
/// Implementations:
/// - File: replay a WAV file in real time (CLI and tests)
/// - Platform microphones live outside this crate and plug in here
#[async_trait::async_trait]
pub trait CaptureDevice: Send + Sync {
    /// Acquire the device and start delivering frames
    async fn open(&mut self, config: &CaptureConfig)
        -> Result<mpsc::Receiver<AudioFrame>, CaptureError>;

    /// Release the device handle
    async fn close(&mut self) -> Result<(), CaptureError>;

    /// Check if the device handle is currently held
    fn is_open(&self) -> bool;

    /// Get device name for logging
    fn name(&self) -> &str;
}
