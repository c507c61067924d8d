use serde::{Deserialize, Serialize};

use crate::error::PlaybackError;

pub const DEFAULT_NUM_CHANNELS: u16 = 1;
pub const DEFAULT_BITS_PER_SAMPLE: u16 = 16;
pub const DEFAULT_SAMPLE_RATE: u32 = 24000;

pub const MAX_NUM_CHANNELS: u16 = 8;
pub const MAX_SAMPLE_RATE: u32 = 384_000;
const SUPPORTED_BITS: [u16; 4] = [8, 16, 24, 32];

/// PCM layout derived from a fragment's MIME type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub num_channels: u16,
    pub bits_per_sample: u16,
    pub sample_rate: u32,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            num_channels: DEFAULT_NUM_CHANNELS,
            bits_per_sample: DEFAULT_BITS_PER_SAMPLE,
            sample_rate: DEFAULT_SAMPLE_RATE,
        }
    }
}

impl AudioFormat {
    /// Parse parameters out of a MIME type such as `audio/L16;rate=24000`.
    ///
    /// `L{bits}` in the subtype sets bits per sample, `rate=` and `channels=`
    /// parameters set the rest. Anything absent, unparseable or outside the
    /// supported ranges (8/16/24/32 bits, 1..=8 channels, up to 384 kHz) keeps
    /// its default.
    pub fn from_mime_type(mime_type: &str) -> Self {
        let mut format = Self::default();
        let mut segments = mime_type.split(';').map(str::trim);

        if let Some(essence) = segments.next() {
            let subtype = essence.rsplit('/').next().unwrap_or(essence);
            if let Some(bits) = subtype
                .strip_prefix('L')
                .or_else(|| subtype.strip_prefix('l'))
                .and_then(|b| b.parse::<u16>().ok())
                .filter(|b| SUPPORTED_BITS.contains(b))
            {
                format.bits_per_sample = bits;
            }
        }

        for param in segments {
            let Some((key, value)) = param.split_once('=') else {
                continue;
            };
            match key.trim().to_ascii_lowercase().as_str() {
                "rate" => {
                    if let Some(rate) = value.trim().parse::<u32>().ok().filter(|r| (1..=MAX_SAMPLE_RATE).contains(r)) {
                        format.sample_rate = rate;
                    }
                }
                "channels" => {
                    if let Some(ch) = value.trim().parse::<u16>().ok().filter(|c| (1..=MAX_NUM_CHANNELS).contains(c)) {
                        format.num_channels = ch;
                    }
                }
                _ => {}
            }
        }

        format
    }

    /// MIME type describing this format for outbound fragments
    pub fn mime_type(&self) -> String {
        if self.num_channels == 1 {
            format!("audio/pcm;rate={}", self.sample_rate)
        } else {
            format!(
                "audio/pcm;rate={};channels={}",
                self.sample_rate, self.num_channels
            )
        }
    }

    /// Bytes per sample frame, `None` if it does not fit the header field
    pub fn block_align(&self) -> Option<u16> {
        let bytes = u32::from(self.num_channels).checked_mul(u32::from(self.bits_per_sample))? / 8;
        u16::try_from(bytes).ok()
    }

    /// Bytes per second, `None` if it does not fit the header field
    pub fn byte_rate(&self) -> Option<u32> {
        let bytes = u64::from(self.sample_rate)
            .checked_mul(u64::from(self.num_channels))?
            .checked_mul(u64::from(self.bits_per_sample))?
            / 8;
        u32::try_from(bytes).ok()
    }

    /// Reject layouts the canonical header cannot describe
    pub fn validate(&self) -> Result<(), PlaybackError> {
        if self.num_channels == 0 || self.bits_per_sample == 0 || self.sample_rate == 0 {
            return Err(PlaybackError::DecodeFailure(format!(
                "empty audio layout: {:?}",
                self
            )));
        }
        match (self.block_align(), self.byte_rate()) {
            (Some(_), Some(_)) => Ok(()),
            _ => Err(PlaybackError::DecodeFailure(format!(
                "audio layout overflows the container header: {:?}",
                self
            ))),
        }
    }

    /// Playback duration of `len` bytes of PCM in this format
    pub fn duration_of(&self, len: usize) -> std::time::Duration {
        let rate = u128::from(self.byte_rate().unwrap_or(0).max(1));
        let micros = len as u128 * 1_000_000 / rate;
        std::time::Duration::from_micros(u64::try_from(micros).unwrap_or(u64::MAX))
    }
}
