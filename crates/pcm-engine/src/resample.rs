//! Inline sample-rate conversion for sinks whose device rate differs from the source.
//!
//! Uses Rubato's sinc resampler in fixed-input mode. Input is accumulated until a whole
//! chunk is available, so a few milliseconds of audio may sit in [`StreamResampler`]
//! before reaching the device; [`StreamResampler::pending_frames`] reports how much.

use anyhow::{Result, anyhow};
use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};

pub struct StreamResampler {
    resampler: Box<dyn Resampler<f32>>,
    channels: usize,
    chunk_frames: usize,
    ratio: f64,
    pending: Vec<f32>,
    out: Vec<f32>,
    indexing: Indexing,
}

impl StreamResampler {
    pub fn new(src_rate: u32, dst_rate: u32, channels: usize, chunk_frames: usize) -> Result<Self> {
        if src_rate == 0 || dst_rate == 0 {
            return Err(anyhow!("invalid resample rates {src_rate} -> {dst_rate}"));
        }
        let ratio = f64::from(dst_rate) / f64::from(src_rate);
        let chunk_frames = chunk_frames.max(1);

        let sinc_len = 128;
        let window = WindowFunction::BlackmanHarris2;
        let params = SincInterpolationParameters {
            sinc_len,
            f_cutoff: calculate_cutoff(sinc_len, window),
            interpolation: SincInterpolationType::Cubic,
            oversampling_factor: 256,
            window,
        };

        let resampler =
            Async::<f32>::new_sinc(ratio, 1.1, &params, chunk_frames, channels, FixedAsync::Input)?;

        let out_frames = (chunk_frames as f64 * ratio * 1.1).ceil() as usize + 64;
        tracing::info!(
            from_hz = src_rate,
            to_hz = dst_rate,
            chunk_frames,
            "resampling"
        );
        Ok(Self {
            resampler: Box::new(resampler),
            channels,
            chunk_frames,
            ratio,
            pending: Vec::with_capacity(chunk_frames * channels * 2),
            out: vec![0.0; out_frames * channels],
            indexing: Indexing {
                input_offset: 0,
                output_offset: 0,
                active_channels_mask: None,
                partial_len: None,
            },
        })
    }

    /// Output frames per input frame.
    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    /// Source frames accepted but not yet converted.
    pub fn pending_frames(&self) -> usize {
        self.pending.len() / self.channels
    }

    /// Queue `input` and hand every completed output chunk to `emit`.
    pub fn process(&mut self, input: &[f32], mut emit: impl FnMut(&[f32])) -> Result<()> {
        self.pending.extend_from_slice(input);
        let chunk_samples = self.chunk_frames * self.channels;
        let mut consumed = 0;

        while self.pending.len() - consumed >= chunk_samples {
            let chunk = &self.pending[consumed..consumed + chunk_samples];
            let input_adapter = InterleavedSlice::new(chunk, self.channels, self.chunk_frames)
                .map_err(|e| anyhow!("interleaved slice (input) error: {e}"))?;
            let out_capacity_frames = self.out.len() / self.channels;
            let mut output_adapter =
                InterleavedSlice::new_mut(&mut self.out, self.channels, out_capacity_frames)
                    .map_err(|e| anyhow!("interleaved slice (output) error: {e}"))?;

            self.indexing.input_offset = 0;
            self.indexing.output_offset = 0;
            self.indexing.partial_len = None;

            let (_nbr_in, nbr_out) = self.resampler.process_into_buffer(
                &input_adapter,
                &mut output_adapter,
                Some(&self.indexing),
            )?;

            emit(&self.out[..nbr_out * self.channels]);
            consumed += chunk_samples;
        }

        self.pending.drain(..consumed);
        Ok(())
    }

    /// Convert whatever input is still pending, padding the last chunk with silence.
    ///
    /// Only the output that corresponds to real input is emitted.
    pub fn flush(&mut self, mut emit: impl FnMut(&[f32])) -> Result<()> {
        let pending = self.pending_frames();
        if pending == 0 {
            return Ok(());
        }
        let mut wanted = (pending as f64 * self.ratio).round() as usize * self.channels;
        let padding = (self.chunk_frames - pending) * self.channels;
        let silence = vec![0.0; padding];
        self.process(&silence, |out| {
            let take = out.len().min(wanted);
            if take > 0 {
                emit(&out[..take]);
                wanted -= take;
            }
        })
    }

    /// Forget buffered input and filter state (after a seek or drop).
    pub fn reset(&mut self) {
        self.pending.clear();
        self.resampler.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_rates() {
        assert!(StreamResampler::new(0, 48_000, 2, 256).is_err());
        assert!(StreamResampler::new(8_000, 0, 2, 256).is_err());
    }

    #[test]
    fn holds_input_until_a_chunk_is_complete() {
        let mut r = StreamResampler::new(8_000, 48_000, 1, 256).unwrap();
        let mut produced = 0usize;
        r.process(&[0.0; 100], |out| produced += out.len()).unwrap();
        assert_eq!(produced, 0);
        assert_eq!(r.pending_frames(), 100);
    }

    #[test]
    fn upsampling_produces_about_ratio_times_input() {
        let mut r = StreamResampler::new(8_000, 48_000, 2, 256).unwrap();
        let input = vec![0.1f32; 256 * 2 * 20];
        let mut produced = 0usize;
        r.process(&input, |out| produced += out.len() / 2).unwrap();
        assert_eq!(r.pending_frames(), 0);
        let expected = 256.0 * 20.0 * r.ratio();
        // Sinc delay holds back a little output at the start.
        assert!(produced as f64 > expected * 0.9, "produced={produced}");
        assert!(produced as f64 <= expected * 1.01, "produced={produced}");
    }

    #[test]
    fn flush_emits_the_tail() {
        let mut r = StreamResampler::new(24_000, 48_000, 1, 256).unwrap();
        r.process(&[0.2; 100], |_| {}).unwrap();
        let mut produced = 0usize;
        r.flush(|out| produced += out.len()).unwrap();
        assert_eq!(r.pending_frames(), 0);
        assert!(produced > 0 && produced <= 200, "produced={produced}");
    }

    #[test]
    fn reset_discards_pending_input() {
        let mut r = StreamResampler::new(44_100, 48_000, 2, 512).unwrap();
        r.process(&[0.0; 200], |_| {}).unwrap();
        assert_eq!(r.pending_frames(), 100);
        r.reset();
        assert_eq!(r.pending_frames(), 0);
    }
}
