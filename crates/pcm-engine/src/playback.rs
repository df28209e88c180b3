//! Hardware sink (CPAL output stream).
//!
//! [`CpalSink`] converts written PCM bytes to `f32`, resamples them when the device
//! runs at a different rate, and queues them for the real-time callback. The callback:
//! - outputs silence without draining while paused
//! - pulls only what the current buffer needs from the queue, never blocking
//! - applies basic channel mapping (mono↔stereo, best-effort otherwise)
//! - applies the player volume and converts to the device sample format

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Result, anyhow};
use cpal::traits::{DeviceTrait, StreamTrait};

use crate::device::{self, DeviceError, SinkOptions, SoundDevice};
use crate::format::{PcmFormat, samples_to_f32};
use crate::queue::SampleQueue;
use crate::resample::StreamResampler;

pub struct CpalSink {
    name: String,
    format: PcmFormat,
    capacity: u64,
    device_rate: u32,
    queue: Arc<SampleQueue>,
    resampler: Option<StreamResampler>,
    shared: Arc<CallbackShared>,
    reported_underruns: u64,
    scratch: Vec<f32>,
    stream: Option<cpal::Stream>,
}

/// State shared between the sink and its output callback.
struct CallbackShared {
    paused: AtomicBool,
    /// Set by writes, cleared when the callback runs dry or the queue is dropped.
    armed: AtomicBool,
    underruns: AtomicU64,
    volume_percent: Arc<AtomicU8>,
    fault: Mutex<Option<DeviceError>>,
}

impl CallbackShared {
    fn set_fault(&self, err: DeviceError) {
        let mut slot = self.fault.lock().unwrap_or_else(PoisonError::into_inner);
        // Keep the first fatal error around; later noise must not hide it.
        if slot.as_ref().is_some_and(|e| e.fatal) {
            return;
        }
        *slot = Some(err);
    }

    fn take_fault(&self) -> Option<DeviceError> {
        let mut slot = self.fault.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref() {
            Some(e) if e.fatal => Some(e.clone()),
            _ => slot.take(),
        }
    }
}

impl CpalSink {
    /// Open the output device matching `needle` (or the host default) for `format`.
    pub fn open(needle: Option<&str>, format: PcmFormat, opts: &SinkOptions) -> Result<Self> {
        let host = cpal::default_host();
        let device = device::pick_device(&host, needle)?;
        let name = device
            .description()
            .map(|d| d.to_string())
            .unwrap_or_else(|_| device::DEFAULT_DEVICE.to_string());

        let config = device::pick_output_config(&device, format.sample_rate, format.channels)?;
        let mut stream_config: cpal::StreamConfig = config.clone().into();
        if let Some(buf) = device::pick_buffer_size(&config, opts.tuning.max_callback_frames) {
            stream_config.buffer_size = buf;
        }
        let device_rate = stream_config.sample_rate;
        let channels = usize::from(format.channels);

        tracing::info!(
            device = %name,
            source_rate_hz = format.sample_rate,
            output_rate_hz = device_rate,
            output_channels = stream_config.channels,
            sample_format = ?config.sample_format(),
            buffer_size = ?stream_config.buffer_size,
            "output device"
        );

        let capacity = opts.capacity_frames.max(1);
        let resampler = if device_rate != format.sample_rate {
            Some(StreamResampler::new(
                format.sample_rate,
                device_rate,
                channels,
                opts.tuning.resample_chunk_frames,
            )?)
        } else {
            None
        };
        let headroom = resampler
            .as_ref()
            .map(|r| (opts.tuning.resample_chunk_frames as f64 * r.ratio() * 1.1).ceil() as u64)
            .unwrap_or(0);
        let queue_frames = src_to_dst_frames(capacity, format.sample_rate, device_rate) + headroom;
        let queue = Arc::new(SampleQueue::new(channels, queue_frames as usize));

        let shared = Arc::new(CallbackShared {
            paused: AtomicBool::new(true),
            armed: AtomicBool::new(false),
            underruns: AtomicU64::new(0),
            volume_percent: opts.volume_percent.clone(),
            fault: Mutex::new(None),
        });

        let stream = build_output_stream(
            &device,
            &stream_config,
            config.sample_format(),
            &queue,
            &shared,
            opts.tuning.refill_max_frames,
        )?;
        stream.play()?;

        Ok(Self {
            name,
            format,
            capacity,
            device_rate,
            queue,
            resampler,
            shared,
            reported_underruns: 0,
            scratch: Vec::new(),
            stream: Some(stream),
        })
    }

    fn enqueue(&mut self, samples: &[f32]) -> Result<(), DeviceError> {
        let queue = &self.queue;
        match self.resampler.as_mut() {
            Some(r) => r
                .process(samples, |out| push_all(queue, out))
                .map_err(|e| DeviceError::backend(format!("resample failed: {e:#}"))),
            None => {
                push_all(queue, samples);
                Ok(())
            }
        }
    }
}

fn push_all(queue: &SampleQueue, samples: &[f32]) {
    let accepted = queue.push(samples);
    let offered = samples.len() / queue.channels();
    if accepted < offered {
        tracing::debug!(dropped_frames = offered - accepted, "output queue overflow");
    }
}

fn src_to_dst_frames(frames: u64, src_rate: u32, dst_rate: u32) -> u64 {
    let num = u128::from(frames) * u128::from(dst_rate);
    let den = u128::from(src_rate.max(1));
    u64::try_from(num.div_ceil(den)).unwrap_or(u64::MAX)
}

fn dst_to_src_frames(frames: u64, src_rate: u32, dst_rate: u32) -> u64 {
    src_to_dst_frames(frames, dst_rate, src_rate)
}

impl SoundDevice for CpalSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn format(&self) -> PcmFormat {
        self.format
    }

    fn capacity_frames(&self) -> u64 {
        self.capacity
    }

    fn delay_frames(&self) -> u64 {
        let queued = dst_to_src_frames(
            self.queue.len_frames() as u64,
            self.format.sample_rate,
            self.device_rate,
        );
        let pending = self.resampler.as_ref().map_or(0, |r| r.pending_frames() as u64);
        queued + pending
    }

    fn write(&mut self, bytes: &[u8]) -> Result<u64, DeviceError> {
        if self.stream.is_none() {
            return Err(DeviceError::lost("output stream is closed"));
        }
        if let Some(err) = self.shared.take_fault() {
            return Err(err);
        }
        let underruns = self.shared.underruns.load(Ordering::Relaxed);
        if underruns > self.reported_underruns {
            self.reported_underruns = underruns;
            return Err(DeviceError::underrun());
        }

        let align = self.format.block_align().max(1);
        let frames = ((bytes.len() / align) as u64).min(self.available_frames());
        if frames == 0 {
            return Ok(0);
        }
        let mut scratch = std::mem::take(&mut self.scratch);
        scratch.clear();
        samples_to_f32(self.format, &bytes[..frames as usize * align], &mut scratch);
        let res = self.enqueue(&scratch);
        self.scratch = scratch;
        res?;
        self.shared.armed.store(true, Ordering::Relaxed);
        Ok(frames)
    }

    fn set_paused(&mut self, paused: bool) {
        self.shared.paused.store(paused, Ordering::Relaxed);
    }

    fn drop_pending(&mut self) {
        self.shared.armed.store(false, Ordering::Relaxed);
        self.queue.clear();
        if let Some(r) = self.resampler.as_mut() {
            r.reset();
        }
    }

    fn flush(&mut self) {
        let queue = &self.queue;
        if let Some(r) = self.resampler.as_mut() {
            if let Err(e) = r.flush(|out| push_all(queue, out)) {
                tracing::warn!(error = %format!("{e:#}"), "resampler flush failed");
            }
        }
    }

    fn close(&mut self) {
        self.shared.paused.store(true, Ordering::Relaxed);
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.pause() {
                tracing::debug!(error = %e, "stream pause on close failed");
            }
            drop(stream);
            tracing::debug!(device = %self.name, "output stream closed");
        }
        self.queue.clear();
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.close();
    }
}

fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    queue: &Arc<SampleQueue>,
    shared: &Arc<CallbackShared>,
    refill_max_frames: usize,
) -> Result<cpal::Stream> {
    match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, queue, shared, refill_max_frames),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, queue, shared, refill_max_frames),
        cpal::SampleFormat::I32 => build_stream::<i32>(device, config, queue, shared, refill_max_frames),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, queue, shared, refill_max_frames),
        other => Err(anyhow!("Unsupported sample format: {other:?}")),
    }
}

/// Type-specialized stream builder for CPAL sample formats.
///
/// Each callback pulls at most the frames it is about to play, so everything not yet
/// heard stays countable in the queue.
fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    queue: &Arc<SampleQueue>,
    shared: &Arc<CallbackShared>,
    refill_max_frames: usize,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32> + Send + 'static,
{
    let channels_out = usize::from(config.channels).max(1);
    let mut st = MappingState {
        pos: 0,
        src_channels: queue.channels(),
        src: Vec::new(),
    };
    let refill_max_frames = refill_max_frames.max(1);
    let queue_cb = queue.clone();
    let shared_cb = shared.clone();
    let shared_err = shared.clone();
    let silence = <T as cpal::Sample>::from_sample::<f32>(0.0);

    let err_fn = move |err: cpal::StreamError| {
        tracing::warn!("stream error: {err}");
        let mapped = match err {
            cpal::StreamError::DeviceNotAvailable => DeviceError::lost(err.to_string()),
            _ => DeviceError::backend(err.to_string()),
        };
        shared_err.set_fault(mapped);
    };

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            if shared_cb.paused.load(Ordering::Relaxed) {
                data.fill(silence);
                return;
            }
            let gain = f32::from(shared_cb.volume_percent.load(Ordering::Relaxed).min(100)) / 100.0;
            let frames = data.len() / channels_out;

            for frame in 0..frames {
                if st.pos >= st.src.len() {
                    st.pos = 0;
                    st.src.clear();
                    let wanted = (frames - frame).min(refill_max_frames);
                    match queue_cb.pop_up_to(wanted) {
                        Some(v) => st.src = v,
                        None => {
                            if shared_cb.armed.swap(false, Ordering::Relaxed) {
                                shared_cb.underruns.fetch_add(1, Ordering::Relaxed);
                            }
                            data[frame * channels_out..].fill(silence);
                            break;
                        }
                    }
                }
                for ch in 0..channels_out {
                    let sample = next_sample_mapped(&mut st, channels_out, ch) * gain;
                    data[frame * channels_out + ch] = <T as cpal::Sample>::from_sample::<f32>(sample);
                }
            }
        },
        err_fn,
        None,
    )?;

    Ok(stream)
}

/// Frames popped from the queue for the current callback.
struct MappingState {
    pos: usize,
    src_channels: usize,
    src: Vec<f32>,
}

/// Read one output sample for `dst_ch`, applying a simple channel mapping.
///
/// Mapping rules:
/// - mono → any: duplicate channel 0
/// - stereo → mono: average L/R
/// - other layouts: clamp to the available source channels
///
/// `st.pos` advances once per destination frame (after the last channel).
fn next_sample_mapped(st: &mut MappingState, dst_channels: usize, dst_ch: usize) -> f32 {
    if st.pos >= st.src.len() {
        return 0.0;
    }

    let frame_start = st.pos;
    let get_src = |ch: usize, st: &MappingState| -> f32 {
        if ch < st.src_channels && frame_start + ch < st.src.len() {
            st.src[frame_start + ch]
        } else {
            0.0
        }
    };

    let out = match (st.src_channels, dst_channels) {
        (1, _) => get_src(0, st),
        (2, 1) => 0.5 * (get_src(0, st) + get_src(1, st)),
        _ => get_src(dst_ch.min(st.src_channels.saturating_sub(1)), st),
    };

    if dst_ch + 1 == dst_channels {
        st.pos += st.src_channels;
    }
    out
}
