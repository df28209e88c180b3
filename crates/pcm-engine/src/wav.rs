//! RIFF/WAVE header validation.
//!
//! Only the container is inspected; the `data` chunk is handed to the player as-is.
//! Chunks between `fmt ` and `data` (`LIST`, `fact`, ...) are skipped.

use std::ops::Range;

use crate::error::{AudioError, ErrorKind};
use crate::format::PcmFormat;

const RIFF_HEADER_SIZE: usize = 12;
const CHUNK_HEADER_SIZE: usize = 8;
const FMT_PCM_SIZE: usize = 16;
const MIN_FILE_SIZE: usize = RIFF_HEADER_SIZE + CHUNK_HEADER_SIZE + FMT_PCM_SIZE + CHUNK_HEADER_SIZE;

const FORMAT_PCM: u16 = 0x0001;
const FORMAT_EXTENSIBLE: u16 = 0xFFFE;
/// Leading bytes of `KSDATAFORMAT_SUBTYPE_PCM`; the rest of the GUID is the fixed base.
const SUBFORMAT_PCM_PREFIX: [u8; 4] = [0x01, 0x00, 0x00, 0x00];

/// Result of parsing a WAVE buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WaveLayout {
    pub format: PcmFormat,
    /// Byte range of whole frames inside the original buffer.
    pub data: Range<usize>,
}

/// Validate `bytes` as a RIFF/WAVE file with integer PCM samples.
pub fn parse(bytes: &[u8]) -> Result<WaveLayout, AudioError> {
    if bytes.len() < MIN_FILE_SIZE {
        return Err(fail(ErrorKind::FileTooSmall));
    }
    if &bytes[0..4] != b"RIFF" {
        return Err(fail(ErrorKind::InvalidRiffMagic));
    }
    if &bytes[8..12] != b"WAVE" {
        return Err(fail(ErrorKind::InvalidWaveMagic));
    }
    let riff_size = read_u32(bytes, 4) as usize;
    if riff_size != bytes.len() - CHUNK_HEADER_SIZE {
        return Err(fail(ErrorKind::InvalidFileSize));
    }

    let mut format: Option<PcmFormat> = None;
    let mut offset = RIFF_HEADER_SIZE;
    while offset + CHUNK_HEADER_SIZE <= bytes.len() {
        let id = &bytes[offset..offset + 4];
        let size = read_u32(bytes, offset + 4) as usize;
        let body = offset + CHUNK_HEADER_SIZE;

        match id {
            b"fmt " if format.is_none() => {
                if body + size > bytes.len() {
                    return Err(fail(ErrorKind::InvalidFmtSize));
                }
                format = Some(parse_fmt(&bytes[body..body + size])?);
            }
            b"data" => {
                let Some(format) = format else {
                    return Err(fail(ErrorKind::FmtChunkNotFound));
                };
                if size > bytes.len() - body {
                    return Err(fail(ErrorKind::InvalidDataSize));
                }
                let whole = size - size % format.block_align();
                return Ok(WaveLayout {
                    format,
                    data: body..body + whole,
                });
            }
            _ => {}
        }

        // Chunks are word aligned.
        offset = body.saturating_add(size).saturating_add(size & 1);
    }

    if format.is_none() {
        Err(fail(ErrorKind::FmtChunkNotFound))
    } else {
        Err(fail(ErrorKind::DataChunkNotFound))
    }
}

fn parse_fmt(fmt: &[u8]) -> Result<PcmFormat, AudioError> {
    if !matches!(fmt.len(), 16 | 18 | 40) {
        return Err(fail(ErrorKind::InvalidFmtSize));
    }
    let tag = read_u16(fmt, 0);
    let channels = read_u16(fmt, 2);
    let sample_rate = read_u32(fmt, 4);
    let byte_rate = read_u32(fmt, 8);
    let block_align = read_u16(fmt, 12);
    let bits = read_u16(fmt, 14);

    let is_pcm = match tag {
        FORMAT_PCM => true,
        FORMAT_EXTENSIBLE => fmt.len() == 40 && fmt[24..28] == SUBFORMAT_PCM_PREFIX,
        _ => false,
    };
    if !is_pcm {
        return Err(fail(ErrorKind::NotPcmFormat));
    }
    if channels == 0 || sample_rate == 0 {
        return Err(fail(ErrorKind::InvalidFormat));
    }

    let format = PcmFormat::new(sample_rate, channels, bits);
    if !format.is_supported() {
        return Err(fail(ErrorKind::UnsupportedBitsPerSample));
    }
    if u64::from(byte_rate) != format.byte_rate() {
        return Err(fail(ErrorKind::InvalidByteRate));
    }
    if usize::from(block_align) != format.block_align() {
        return Err(fail(ErrorKind::InvalidBlockAlign));
    }
    Ok(format)
}

fn fail(kind: ErrorKind) -> AudioError {
    AudioError::error(kind)
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// Build a canonical 44-byte-header WAVE file around `data`.
///
/// Used by tests and demos to synthesize fixtures.
pub fn encode(format: PcmFormat, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(44 + data.len());
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&((36 + data.len()) as u32).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&(FMT_PCM_SIZE as u32).to_le_bytes());
    out.extend_from_slice(&FORMAT_PCM.to_le_bytes());
    out.extend_from_slice(&format.channels.to_le_bytes());
    out.extend_from_slice(&format.sample_rate.to_le_bytes());
    out.extend_from_slice(&(format.byte_rate() as u32).to_le_bytes());
    out.extend_from_slice(&(format.block_align() as u16).to_le_bytes());
    out.extend_from_slice(&format.bits_per_sample.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(data);
    out
}
