// Canonical 44-byte RIFF/WAVE header for raw PCM payloads
//
// All multi-byte fields are little-endian. The header is synthesized once per
// turn when the assembled payload is flushed.

use byteorder::{LittleEndian, WriteBytesExt};

use super::format::AudioFormat;
use crate::error::PlaybackError;

pub const WAV_HEADER_LEN: usize = 44;

/// Largest payload whose RIFF chunk size still fits in 32 bits
pub const MAX_DATA_LEN: u32 = u32::MAX - 36;

/// Build the canonical header for `data_len` bytes of PCM in `format`
pub fn wav_header(format: &AudioFormat, data_len: u32) -> Result<[u8; WAV_HEADER_LEN], PlaybackError> {
    format.validate()?;
    let (Some(byte_rate), Some(block_align)) = (format.byte_rate(), format.block_align()) else {
        return Err(PlaybackError::DecodeFailure(format!("unsupported layout {:?}", format)));
    };
    if data_len > MAX_DATA_LEN {
        return Err(PlaybackError::DecodeFailure(format!(
            "{} bytes of audio exceed the container limit",
            data_len
        )));
    }

    let mut header = [0u8; WAV_HEADER_LEN];
    let mut cursor = &mut header[..];
    write_fields(&mut cursor, format, byte_rate, block_align, data_len)
        .map_err(|e| PlaybackError::Output(e.to_string()))?;

    Ok(header)
}

fn write_fields(
    out: &mut impl std::io::Write,
    format: &AudioFormat,
    byte_rate: u32,
    block_align: u16,
    data_len: u32,
) -> std::io::Result<()> {
    out.write_all(b"RIFF")?;
    out.write_u32::<LittleEndian>(36 + data_len)?;
    out.write_all(b"WAVE")?;

    out.write_all(b"fmt ")?;
    out.write_u32::<LittleEndian>(16)?;
    out.write_u16::<LittleEndian>(1)?; // PCM
    out.write_u16::<LittleEndian>(format.num_channels)?;
    out.write_u32::<LittleEndian>(format.sample_rate)?;
    out.write_u32::<LittleEndian>(byte_rate)?;
    out.write_u16::<LittleEndian>(block_align)?;
    out.write_u16::<LittleEndian>(format.bits_per_sample)?;

    out.write_all(b"data")?;
    out.write_u32::<LittleEndian>(data_len)?;
    Ok(())
}

/// Wrap raw PCM into a complete in-memory WAV container
pub fn wrap_pcm(format: &AudioFormat, pcm: &[u8]) -> Result<Vec<u8>, PlaybackError> {
    let data_len = u32::try_from(pcm.len()).map_err(|_| {
        PlaybackError::DecodeFailure(format!(
            "{} bytes of audio exceed the container limit",
            pcm.len()
        ))
    })?;
    let header = wav_header(format, data_len)?;

    let mut out = Vec::with_capacity(WAV_HEADER_LEN + pcm.len());
    out.extend_from_slice(&header);
    out.extend_from_slice(pcm);
    Ok(out)
}
