//! Per-channel sample accumulation between flushes.

use crate::data::stats::Sample;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

struct Inner {
    queue: Vec<Sample>,
    last_cleared_at: Instant,
}

/// Samples of one logical channel collected since the last flush.
///
/// The queue and the time of the last clear sit behind a single lock, so
/// [`fetch_and_clear`](Self::fetch_and_clear) is atomic with respect to
/// [`add`](Self::add): every sample lands in exactly one flushed window. The lock
/// is never held across an `.await`.
///
/// Time is read from `tokio::time::Instant`, which lets tests drive the window
/// with a paused clock.
pub struct ChannelBuffer {
    channel_id: String,
    averaging_window: Duration,
    inner: Mutex<Inner>,
}

impl ChannelBuffer {
    /// Empty buffer whose window starts now.
    pub fn new(channel_id: impl Into<String>, averaging_window: Duration) -> Self {
        Self {
            channel_id: channel_id.into(),
            averaging_window,
            inner: Mutex::new(Inner {
                queue: Vec::new(),
                last_cleared_at: Instant::now(),
            }),
        }
    }

    /// Channel identifier.
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Minimum time between flushes.
    pub fn averaging_window(&self) -> Duration {
        self.averaging_window
    }

    /// Append one sample per value, all sharing `timestamp`.
    pub fn add(&self, timestamp: f64, values: &[i64]) {
        let mut inner = self.inner.lock();
        inner
            .queue
            .extend(values.iter().map(|&value| Sample::new(timestamp, value)));
        debug!(channel = %self.channel_id, added = values.len(), "Dataset added to buffer");
    }

    /// Whether the buffer holds samples and its window has elapsed.
    pub fn ready(&self) -> bool {
        let inner = self.inner.lock();
        if inner.queue.is_empty() {
            return false;
        }
        inner.last_cleared_at.elapsed() >= self.averaging_window
    }

    /// Take every buffered sample and restart the window.
    pub fn fetch_and_clear(&self) -> Vec<Sample> {
        let samples = {
            let mut inner = self.inner.lock();
            inner.last_cleared_at = Instant::now();
            std::mem::take(&mut inner.queue)
        };
        info!(channel = %self.channel_id, count = samples.len(), "Buffer fetched and cleared");
        samples
    }

    /// Time elapsed since the last clear (or construction).
    pub fn time_since_last_clear(&self) -> Duration {
        self.inner.lock().last_cleared_at.elapsed()
    }

    /// Number of buffered samples.
    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Whether no samples are buffered.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }
}

impl std::fmt::Debug for ChannelBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelBuffer")
            .field("channel_id", &self.channel_id)
            .field("averaging_window", &self.averaging_window)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_not_ready_until_window_elapsed() {
        let buffer = ChannelBuffer::new("EHZ", Duration::from_secs(10));
        buffer.add(1.0, &[1, 2, 3]);
        assert!(!buffer.ready());

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(!buffer.ready());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(buffer.ready());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_buffer_is_never_ready() {
        let buffer = ChannelBuffer::new("EHZ", Duration::from_secs(1));
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(!buffer.ready());
        assert!(buffer.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_fetch_returns_all_then_nothing() {
        let buffer = ChannelBuffer::new("EHZ", Duration::from_secs(10));
        buffer.add(1.0, &[5, 6]);
        buffer.add(2.0, &[7]);
        tokio::time::advance(Duration::from_secs(4)).await;

        let first = buffer.fetch_and_clear();
        assert_eq!(
            first,
            vec![
                Sample::new(1.0, 5),
                Sample::new(1.0, 6),
                Sample::new(2.0, 7)
            ]
        );
        assert_eq!(buffer.time_since_last_clear(), Duration::ZERO);

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(buffer.fetch_and_clear().is_empty());
        assert_eq!(buffer.time_since_last_clear(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_restarts_window() {
        let buffer = ChannelBuffer::new("EHZ", Duration::from_secs(5));
        buffer.add(1.0, &[1]);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(buffer.ready());

        buffer.fetch_and_clear();
        buffer.add(2.0, &[2]);
        assert!(!buffer.ready());
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_concurrent_adds_are_all_flushed_once() {
        let buffer = Arc::new(ChannelBuffer::new("EHZ", Duration::ZERO));
        let writers: Vec<_> = (0..4)
            .map(|t| {
                let buffer = buffer.clone();
                std::thread::spawn(move || {
                    for i in 0..250 {
                        buffer.add(t as f64, &[i]);
                    }
                })
            })
            .collect();

        let mut flushed = 0;
        while writers.iter().any(|w| !w.is_finished()) {
            flushed += buffer.fetch_and_clear().len();
        }
        for writer in writers {
            writer.join().unwrap();
        }
        flushed += buffer.fetch_and_clear().len();

        assert_eq!(flushed, 1000);
    }
}
