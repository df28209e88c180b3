//! Bounded queue of interleaved `f32` samples between the render thread and the
//! CPAL output callback.
//!
//! Neither side ever waits on the other:
//! - the render thread pushes at most the free space it was told about
//! - the callback pops whatever is ready and fills the rest with silence

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

/// Thread-safe bounded queue for interleaved `f32` audio samples.
///
/// The `channels` count is fixed for the lifetime of the queue; capacity is counted in
/// whole frames.
pub struct SampleQueue {
    channels: usize,
    inner: Mutex<VecDeque<f32>>,
    max_samples: usize,
}

impl SampleQueue {
    pub fn new(channels: usize, max_frames: usize) -> Self {
        let channels = channels.max(1);
        Self {
            channels,
            inner: Mutex::new(VecDeque::with_capacity(max_frames * channels)),
            max_samples: max_frames.saturating_mul(channels),
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Current buffered frames (best-effort snapshot).
    pub fn len_frames(&self) -> usize {
        self.lock().len() / self.channels
    }

    /// Push whole frames from `samples` until the queue is full.
    ///
    /// Returns the number of frames accepted.
    pub fn push(&self, samples: &[f32]) -> usize {
        let mut q = self.lock();
        let free_frames = (self.max_samples - q.len()) / self.channels;
        let frames = (samples.len() / self.channels).min(free_frames);
        q.extend(&samples[..frames * self.channels]);
        frames
    }

    /// Pop up to `max_frames` frames, or `None` if the queue is empty.
    pub fn pop_up_to(&self, max_frames: usize) -> Option<Vec<f32>> {
        let mut q = self.lock();
        let take_frames = (q.len() / self.channels).min(max_frames);
        if take_frames == 0 {
            return None;
        }
        Some(q.drain(..take_frames * self.channels).collect())
    }

    /// Drop everything queued.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<f32>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn pop_empty_returns_none() {
        let q = SampleQueue::new(2, 16);
        assert!(q.pop_up_to(4).is_none());
    }

    #[test]
    fn push_is_bounded_by_capacity() {
        let q = SampleQueue::new(2, 3);
        let pushed = q.push(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
        assert_eq!(pushed, 3);
        assert_eq!(q.len_frames(), 3);
        assert_eq!(q.push(&[9.0, 10.0]), 0);
    }

    #[test]
    fn push_ignores_partial_frames() {
        let q = SampleQueue::new(2, 8);
        assert_eq!(q.push(&[1.0, 2.0, 3.0]), 1);
        assert_eq!(q.pop_up_to(8), Some(vec![1.0, 2.0]));
    }

    #[test]
    fn pop_returns_available_frames_in_order() {
        let q = SampleQueue::new(2, 64);
        q.push(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

        let out = q.pop_up_to(2).unwrap();
        assert_eq!(out, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(q.len_frames(), 1);
    }

    #[test]
    fn clear_drops_everything() {
        let q = SampleQueue::new(1, 8);
        q.push(&[1.0, 2.0, 3.0]);
        q.clear();
        assert_eq!(q.len_frames(), 0);
    }

    #[test]
    fn producer_and_consumer_threads_see_every_frame() {
        let q = Arc::new(SampleQueue::new(1, 32));
        let consumer = {
            let q = q.clone();
            thread::spawn(move || {
                let mut seen = 0usize;
                while seen < 1_000 {
                    if let Some(v) = q.pop_up_to(7) {
                        seen += v.len();
                    } else {
                        thread::yield_now();
                    }
                }
                seen
            })
        };

        let samples = vec![0.25f32; 1_000];
        let mut offset = 0;
        while offset < samples.len() {
            offset += q.push(&samples[offset..]);
            thread::yield_now();
        }
        assert_eq!(consumer.join().unwrap(), 1_000);
    }
}
