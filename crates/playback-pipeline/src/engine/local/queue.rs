//! Bounded queues for interleaved `f32` samples.
//!
//! [`SharedAudio`] carries decoded audio between the stages of a unit:
//! - decode thread → queue
//! - resampler thread → queue
//! - the join point drains the active link's queue from the output callback
//!
//! Closing a queue wakes every waiter; blocking pops drain what is left and
//! then return `None`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::stream::lock;

pub(super) struct SharedAudio {
    channels: usize,
    inner: Mutex<SharedInner>,
    cv: Condvar,
    max_buffered_samples: usize,
    created: Instant,
    low_watermark_ms: AtomicU64,
}

struct SharedInner {
    queue: VecDeque<f32>,
    done: bool,
}

pub(super) enum PopStrategy {
    /// Block until exactly `frames` are available, or `None` if closed first.
    BlockingExact { frames: usize },
    /// Block until at least one frame is available, then take up to `max_frames`.
    BlockingUpTo { max_frames: usize },
    /// Take up to `max_frames` right away, or `None` if empty.
    NonBlocking { max_frames: usize },
}

/// Queue capacity in samples for `buffer_seconds` of audio.
///
/// Non-finite or non-positive durations fall back to two seconds.
pub(super) fn calc_max_buffered_samples(rate_hz: u32, channels: usize, buffer_seconds: f32) -> usize {
    let secs = if buffer_seconds.is_finite() && buffer_seconds > 0.0 {
        buffer_seconds
    } else {
        2.0
    };

    let frames = (rate_hz as f32 * secs).ceil() as usize;
    frames.saturating_mul(channels).max(channels)
}

impl SharedAudio {
    pub(super) fn new(channels: usize, max_buffered_samples: usize) -> Self {
        let channels = channels.max(1);
        Self {
            channels,
            inner: Mutex::new(SharedInner {
                queue: VecDeque::new(),
                done: false,
            }),
            cv: Condvar::new(),
            max_buffered_samples: max_buffered_samples.max(channels),
            created: Instant::now(),
            low_watermark_ms: AtomicU64::new(0),
        }
    }

    pub(super) fn channels(&self) -> usize {
        self.channels
    }

    pub(super) fn len_frames(&self) -> usize {
        lock(&self.inner).queue.len() / self.channels
    }

    pub(super) fn is_done(&self) -> bool {
        lock(&self.inner).done
    }

    /// Closed by its producer and fully drained.
    pub(super) fn is_drained(&self) -> bool {
        let g = lock(&self.inner);
        g.done && g.queue.is_empty()
    }

    /// Mark the queue finished and wake all waiters. Idempotent.
    pub(super) fn close(&self) {
        lock(&self.inner).done = true;
        self.cv.notify_all();
    }

    fn wait<'a>(&self, g: MutexGuard<'a, SharedInner>) -> MutexGuard<'a, SharedInner> {
        self.cv.wait(g).unwrap_or_else(|e| e.into_inner())
    }

    /// Push samples, blocking while the queue is full.
    ///
    /// Returns `false` if the queue was closed before everything was pushed.
    pub(super) fn push_interleaved_blocking(&self, samples: &[f32]) -> bool {
        let mut offset = 0;

        while offset < samples.len() {
            let mut g = lock(&self.inner);

            while g.queue.len() >= self.max_buffered_samples && !g.done {
                g = self.wait(g);
            }
            if g.done {
                return false;
            }

            let room = self.max_buffered_samples - g.queue.len();
            let end = (offset + room).min(samples.len());
            g.queue.extend(&samples[offset..end]);
            offset = end;

            drop(g);
            self.cv.notify_all();
        }
        true
    }

    pub(super) fn pop(&self, strategy: PopStrategy) -> Option<Vec<f32>> {
        let mut g = lock(&self.inner);
        let take_samples = match strategy {
            PopStrategy::BlockingExact { frames } => {
                let want = frames * self.channels;
                while g.queue.len() < want && !g.done {
                    g = self.wait(g);
                }
                if g.queue.len() < want {
                    return None;
                }
                want
            }
            PopStrategy::BlockingUpTo { max_frames } => {
                while g.queue.is_empty() && !g.done {
                    g = self.wait(g);
                }
                if g.queue.is_empty() {
                    return None;
                }
                (g.queue.len() / self.channels).min(max_frames) * self.channels
            }
            PopStrategy::NonBlocking { max_frames } => {
                (g.queue.len() / self.channels).min(max_frames) * self.channels
            }
        };
        if take_samples == 0 {
            return None;
        }

        let out: Vec<f32> = g.queue.drain(..take_samples).collect();
        let queued = g.queue.len();
        drop(g);
        self.cv.notify_all();
        self.log_low_watermark(queued);
        Some(out)
    }

    fn log_low_watermark(&self, queued: usize) {
        let threshold = (self.max_buffered_samples / 8).max(self.channels * 16);
        if queued == 0 || queued >= threshold {
            return;
        }
        let now = self.created.elapsed().as_millis() as u64;
        let last = self.low_watermark_ms.load(Ordering::Relaxed);
        if now.saturating_sub(last) > 1000 {
            self.low_watermark_ms.store(now, Ordering::Relaxed);
            tracing::debug!(
                queued_samples = queued,
                threshold_samples = threshold,
                "audio queue low watermark"
            );
        }
    }

    /// Wait briefly for buffered audio or the end of the stream.
    pub(super) fn wait_for_any(&self, timeout: Duration) -> bool {
        let g = lock(&self.inner);
        if !g.queue.is_empty() || g.done {
            return true;
        }
        let (g, _timeout) = self
            .cv
            .wait_timeout(g, timeout)
            .unwrap_or_else(|e| e.into_inner());
        !g.queue.is_empty() || g.done
    }
}
