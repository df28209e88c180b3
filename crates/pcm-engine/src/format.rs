//! PCM sample layout.
//!
//! Integer PCM as stored in RIFF/WAVE data chunks:
//! - 8-bit samples are unsigned (silence = 0x80)
//! - 16/24/32-bit samples are signed little-endian
//!
//! Frames are interleaved: `frame0[ch0], frame0[ch1], ..., frame1[ch0], ...`

use serde::Serialize;

/// Format parameters of a PCM buffer. Immutable once a player is initialized.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct PcmFormat {
    /// Frames per second.
    pub sample_rate: u32,
    /// Interleaved channel count.
    pub channels: u16,
    /// Bits per sample (8, 16, 24 or 32).
    pub bits_per_sample: u16,
}

impl PcmFormat {
    pub fn new(sample_rate: u32, channels: u16, bits_per_sample: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bits_per_sample,
        }
    }

    /// Bytes per sample of a single channel.
    pub fn bytes_per_sample(&self) -> usize {
        usize::from(self.bits_per_sample / 8)
    }

    /// Bytes per frame (one sample from every channel).
    pub fn block_align(&self) -> usize {
        self.bytes_per_sample() * usize::from(self.channels)
    }

    /// Bytes per second of audio.
    pub fn byte_rate(&self) -> u64 {
        u64::from(self.sample_rate) * self.block_align() as u64
    }

    /// Whether the sample width is one the sinks can convert.
    pub fn is_supported(&self) -> bool {
        matches!(self.bits_per_sample, 8 | 16 | 24 | 32)
            && self.channels > 0
            && self.sample_rate > 0
    }
}

/// Convert interleaved PCM bytes into interleaved `f32` samples in `[-1.0, 1.0)`.
///
/// Trailing bytes that do not form a whole sample are ignored.
pub fn samples_to_f32(format: PcmFormat, bytes: &[u8], out: &mut Vec<f32>) {
    let width = format.bytes_per_sample();
    if width == 0 {
        return;
    }
    out.reserve(bytes.len() / width);
    for s in bytes.chunks_exact(width) {
        let v = match width {
            1 => (f32::from(s[0]) - 128.0) / 128.0,
            2 => f32::from(i16::from_le_bytes([s[0], s[1]])) / 32_768.0,
            3 => {
                // Sign-extend by placing the 24-bit value in the top of an i32.
                let v = i32::from_le_bytes([0, s[0], s[1], s[2]]) >> 8;
                v as f32 / 8_388_608.0
            }
            4 => i32::from_le_bytes([s[0], s[1], s[2], s[3]]) as f32 / 2_147_483_648.0,
            _ => 0.0,
        };
        out.push(v);
    }
}
