//! Byte/frame offsets ↔ milliseconds.
//!
//! All conversions are integer-only so results do not depend on float rounding:
//! - offsets → milliseconds floor
//! - milliseconds → frames round half up, so byte offsets always land on a frame boundary

use crate::format::PcmFormat;

const MILLIS_PER_SECOND: u64 = 1000;

/// Stateless converter bound to one PCM format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeBase {
    sample_rate: u64,
    block_align: u64,
}

impl TimeBase {
    pub fn new(format: PcmFormat) -> Self {
        Self {
            sample_rate: u64::from(format.sample_rate).max(1),
            block_align: (format.block_align() as u64).max(1),
        }
    }

    pub fn block_align(&self) -> u64 {
        self.block_align
    }

    /// `floor(offset / bytes_per_millisecond)`, computed as `offset * 1000 / byte_rate`.
    pub fn bytes_to_millis(&self, offset: u64) -> u64 {
        let byte_rate = self.sample_rate * self.block_align;
        mul_div(offset, MILLIS_PER_SECOND, byte_rate)
    }

    pub fn frames_to_millis(&self, frames: u64) -> u64 {
        mul_div(frames, MILLIS_PER_SECOND, self.sample_rate)
    }

    /// Nearest whole frame for `millis`.
    pub fn millis_to_frames(&self, millis: u64) -> u64 {
        let scaled = u128::from(millis) * u128::from(self.sample_rate) + 500;
        u64::try_from(scaled / u128::from(MILLIS_PER_SECOND)).unwrap_or(u64::MAX)
    }

    /// Byte offset of the frame nearest to `millis`.
    pub fn millis_to_bytes(&self, millis: u64) -> u64 {
        self.millis_to_frames(millis).saturating_mul(self.block_align)
    }

    pub fn frames_to_bytes(&self, frames: u64) -> u64 {
        frames.saturating_mul(self.block_align)
    }

    pub fn bytes_to_frames(&self, bytes: u64) -> u64 {
        bytes / self.block_align
    }

    /// Round a byte offset down to the start of its frame.
    pub fn align_down(&self, bytes: u64) -> u64 {
        bytes - bytes % self.block_align
    }
}

fn mul_div(value: u64, mul: u64, div: u64) -> u64 {
    let out = u128::from(value) * u128::from(mul) / u128::from(div.max(1));
    u64::try_from(out).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tb(rate: u32, channels: u16, bits: u16) -> TimeBase {
        TimeBase::new(PcmFormat::new(rate, channels, bits))
    }

    #[test]
    fn one_second_of_audio_is_1000_ms_for_all_formats() {
        for rate in [8_000u32, 44_100] {
            for channels in [1u16, 2, 3, 5] {
                for bits in [8u16, 16, 24, 32] {
                    let format = PcmFormat::new(rate, channels, bits);
                    let t = TimeBase::new(format);
                    let bytes = format.byte_rate();
                    assert_eq!(t.bytes_to_millis(bytes), 1000, "{format:?}");
                    assert_eq!(t.millis_to_bytes(1000), bytes, "{format:?}");
                }
            }
        }
    }

    #[test]
    fn bytes_to_millis_floors_non_integer_rates() {
        // 44.1 kHz mono 8-bit: 44.1 bytes per millisecond.
        let t = tb(44_100, 1, 8);
        assert_eq!(t.bytes_to_millis(44), 0);
        assert_eq!(t.bytes_to_millis(45), 1);
        assert_eq!(t.bytes_to_millis(88), 1);
        assert_eq!(t.bytes_to_millis(89), 2);
    }

    #[test]
    fn exact_rates_divide_evenly() {
        let t = tb(8_000, 1, 8);
        assert_eq!(t.bytes_to_millis(8), 1);
        assert_eq!(t.bytes_to_millis(7), 0);
        assert_eq!(t.millis_to_bytes(250), 2_000);
    }

    #[test]
    fn millis_to_bytes_is_frame_aligned() {
        let t = tb(44_100, 3, 24);
        for ms in [0u64, 1, 7, 333, 999, 12_345] {
            assert_eq!(t.millis_to_bytes(ms) % 9, 0, "ms={ms}");
        }
    }

    #[test]
    fn millis_to_frames_rounds_to_nearest() {
        let t = tb(44_100, 2, 16);
        // 1 ms = 44.1 frames, 5 ms = 220.5 frames, 7 ms = 308.7 frames.
        assert_eq!(t.millis_to_frames(1), 44);
        assert_eq!(t.millis_to_frames(5), 221);
        assert_eq!(t.millis_to_frames(7), 309);
    }

    #[test]
    fn round_trip_stays_within_one_millisecond_of_frames() {
        for (rate, channels, bits) in [(44_100u32, 2u16, 16u16), (8_000, 5, 24), (44_100, 3, 8)] {
            let t = tb(rate, channels, bits);
            let align = t.block_align();
            let frames_per_ms = u64::from(rate).div_ceil(1000);
            let tolerance = (frames_per_ms + 1) * align;
            for x in (0..200_000u64).step_by(997) {
                let back = t.millis_to_bytes(t.bytes_to_millis(x));
                assert_eq!(back % align, 0);
                assert!(back.abs_diff(x) <= tolerance, "x={x} back={back}");
            }
        }
    }

    #[test]
    fn align_down_snaps_to_frame_start() {
        let t = tb(8_000, 2, 16);
        assert_eq!(t.align_down(0), 0);
        assert_eq!(t.align_down(3), 0);
        assert_eq!(t.align_down(4), 4);
        assert_eq!(t.align_down(10), 8);
    }

    #[test]
    fn frames_to_millis_matches_elapsed_formula() {
        let t = tb(48_000, 2, 16);
        assert_eq!(t.frames_to_millis(96_000), 2_000);
        assert_eq!(t.frames_to_millis(47_999), 999);
    }
}
