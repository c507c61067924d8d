use tracing::{debug, warn};

use super::backend::AudioFragment;
use super::container::{wrap_pcm, WAV_HEADER_LEN};
use super::format::AudioFormat;
use crate::error::PlaybackError;

/// A playable WAV container built from one turn's fragments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledAudio {
    /// Turn ordinal the audio belongs to
    pub turn: u64,
    pub format: AudioFormat,
    /// Header followed by concatenated PCM
    pub bytes: Vec<u8>,
}

impl AssembledAudio {
    pub fn data_len(&self) -> usize {
        self.bytes.len().saturating_sub(WAV_HEADER_LEN)
    }

    pub fn duration(&self) -> std::time::Duration {
        self.format.duration_of(self.data_len())
    }
}

/// Reconstructs a playable container from a turn's ordered raw fragments
///
/// The format is parsed once from the first fragment of a turn; later
/// fragments are assumed to share it. The buffer is emptied at every turn
/// boundary so audio never bleeds into the next turn.
#[derive(Debug, Default)]
pub struct AudioAssembler {
    format: Option<AudioFormat>,
    pcm: Vec<u8>,
    fragments: usize,
}

impl AudioAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode and append a fragment in arrival order
    pub fn push(&mut self, fragment: &AudioFragment) -> Result<(), PlaybackError> {
        let decoded = fragment
            .decode()
            .map_err(|e| PlaybackError::DecodeFailure(e.to_string()))?;

        let format = match self.format {
            Some(format) => format,
            None => {
                let format = AudioFormat::from_mime_type(&fragment.mime_type);
                format.validate()?;
                self.format = Some(format);
                format
            }
        };

        let block_align = format.block_align().unwrap_or(1).max(1);
        if decoded.len() % block_align as usize != 0 {
            warn!(
                "Fragment of {} bytes is not aligned to {}-byte frames",
                decoded.len(),
                block_align
            );
        }

        self.pcm.extend_from_slice(&decoded);
        self.fragments += 1;

        debug!(
            "Assembled fragment {} ({} bytes, {} buffered)",
            self.fragments,
            decoded.len(),
            self.pcm.len()
        );

        Ok(())
    }

    /// Bytes of header plus payload the flushed container would hold
    pub fn len(&self) -> usize {
        if self.format.is_none() {
            0
        } else {
            WAV_HEADER_LEN + self.pcm.len()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.format.is_none()
    }

    pub fn fragment_count(&self) -> usize {
        self.fragments
    }

    pub fn format(&self) -> Option<AudioFormat> {
        self.format
    }

    /// Synthesize the container for the finished turn and reset.
    ///
    /// Returns `Ok(None)` when the turn carried no audio. The buffer is reset
    /// even when the container cannot be built.
    pub fn flush(&mut self, turn: u64) -> Result<Option<AssembledAudio>, PlaybackError> {
        let Some(format) = self.format.take() else {
            return Ok(None);
        };
        let pcm = std::mem::take(&mut self.pcm);
        self.fragments = 0;

        let bytes = wrap_pcm(&format, &pcm)?;

        Ok(Some(AssembledAudio {
            turn,
            format,
            bytes,
        }))
    }

    /// Drop everything buffered for the current turn
    pub fn discard(&mut self) -> usize {
        let dropped = self.pcm.len();
        self.format = None;
        self.pcm = Vec::new();
        self.fragments = 0;
        dropped
    }
}
