//! Circular buffer of recent frames for short-term lookback
//!
//! The producer pushes every stamped frame here, independently of the work
//! queue. Capacity is recomputed periodically from the achieved sampling
//! rate so the buffer spans roughly a fixed time window.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::types::TelemetryFrame;

/// Fixed-capacity ring of the most recent frames, oldest first.
#[derive(Debug, Clone)]
pub struct CircularBuffer {
    frames: VecDeque<TelemetryFrame>,
    capacity: usize,
    total_pushed: u64,
}

impl CircularBuffer {
    /// Create an empty buffer. A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { frames: VecDeque::with_capacity(capacity), capacity, total_pushed: 0 }
    }

    /// Append a frame, evicting the oldest if full.
    pub fn push(&mut self, frame: TelemetryFrame) {
        if self.frames.len() == self.capacity {
            self.frames.pop_front();
        }
        self.frames.push_back(frame);
        self.total_pushed += 1;
    }

    /// Change capacity, keeping the most recent `min(len, new_capacity)` frames.
    ///
    /// The retained tail is copied into a fresh allocation.
    pub fn resize(&mut self, new_capacity: usize) {
        let new_capacity = new_capacity.max(1);
        if new_capacity == self.capacity {
            return;
        }

        let keep = self.frames.len().min(new_capacity);
        let skip = self.frames.len() - keep;
        let mut resized = VecDeque::with_capacity(new_capacity);
        resized.extend(self.frames.iter().skip(skip).cloned());

        self.frames = resized;
        self.capacity = new_capacity;
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames pushed over the buffer's lifetime, including evicted ones.
    pub fn total_pushed(&self) -> u64 {
        self.total_pushed
    }

    /// Up to `n` most recent frames, oldest first.
    pub fn latest(&self, n: usize) -> Vec<TelemetryFrame> {
        let skip = self.frames.len().saturating_sub(n);
        self.frames.iter().skip(skip).cloned().collect()
    }

    /// Copy of every buffered frame, oldest first.
    pub fn snapshot(&self) -> Vec<TelemetryFrame> {
        self.frames.iter().cloned().collect()
    }

    pub fn newest(&self) -> Option<&TelemetryFrame> {
        self.frames.back()
    }

    /// Wall-clock span between the oldest and newest capture stamps.
    pub fn window_duration(&self) -> Duration {
        match (self.frames.front(), self.frames.back()) {
            (Some(oldest), Some(newest)) => {
                (newest.captured_at - oldest.captured_at).to_std().unwrap_or_default()
            }
            _ => Duration::ZERO,
        }
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

/// Shared handle to the producer's buffer.
///
/// The lock is held only for the duration of each call.
#[derive(Debug, Clone)]
pub struct BufferHandle {
    inner: Arc<Mutex<CircularBuffer>>,
}

impl BufferHandle {
    pub fn new(capacity: usize) -> Self {
        Self { inner: Arc::new(Mutex::new(CircularBuffer::new(capacity))) }
    }

    pub fn push(&self, frame: TelemetryFrame) {
        self.inner.lock().push(frame);
    }

    pub fn resize(&self, new_capacity: usize) {
        self.inner.lock().resize(new_capacity);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity()
    }

    pub fn latest(&self, n: usize) -> Vec<TelemetryFrame> {
        self.inner.lock().latest(n)
    }

    pub fn snapshot(&self) -> Vec<TelemetryFrame> {
        self.inner.lock().snapshot()
    }

    pub fn window_duration(&self) -> Duration {
        self.inner.lock().window_duration()
    }

    pub fn total_pushed(&self) -> u64 {
        self.inner.lock().total_pushed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::frame_at;
    use proptest::prelude::*;

    fn sequences(frames: &[TelemetryFrame]) -> Vec<u64> {
        frames.iter().map(|f| f.sequence).collect()
    }

    #[test]
    fn evicts_oldest_when_full() {
        let mut buffer = CircularBuffer::new(3);
        for seq in 0..5 {
            buffer.push(frame_at(seq, 0.0));
        }
        assert_eq!(sequences(&buffer.snapshot()), vec![2, 3, 4]);
        assert_eq!(buffer.total_pushed(), 5);
    }

    #[test]
    fn latest_returns_tail() {
        let mut buffer = CircularBuffer::new(10);
        for seq in 0..6 {
            buffer.push(frame_at(seq, 0.0));
        }
        assert_eq!(sequences(&buffer.latest(2)), vec![4, 5]);
        assert_eq!(buffer.latest(100).len(), 6);
    }

    #[test]
    fn grow_keeps_everything() {
        let mut buffer = CircularBuffer::new(2);
        buffer.push(frame_at(0, 0.0));
        buffer.push(frame_at(1, 0.0));
        buffer.resize(4);
        buffer.push(frame_at(2, 0.0));
        assert_eq!(sequences(&buffer.snapshot()), vec![0, 1, 2]);
        assert_eq!(buffer.capacity(), 4);
    }

    #[test]
    fn window_spans_capture_stamps() {
        let mut buffer = CircularBuffer::new(100);
        assert_eq!(buffer.window_duration(), Duration::ZERO);
        for seq in 0..61 {
            buffer.push(frame_at(seq, 0.0));
        }
        let window = buffer.window_duration();
        assert!((window.as_secs_f64() - 1.0).abs() < 1e-6, "{window:?}");
    }

    #[test]
    fn handle_shares_state() {
        let handle = BufferHandle::new(4);
        let other = handle.clone();
        handle.push(frame_at(7, 0.0));
        assert_eq!(other.len(), 1);
        assert_eq!(sequences(&other.latest(1)), vec![7]);
    }

    proptest! {
        #[test]
        fn shrink_keeps_most_recent_in_order(
            capacity in 1usize..200,
            pushed in 0u64..400,
            new_capacity in 1usize..200,
        ) {
            let mut buffer = CircularBuffer::new(capacity);
            for seq in 0..pushed {
                buffer.push(frame_at(seq, 0.0));
            }
            let before = sequences(&buffer.snapshot());
            buffer.resize(new_capacity);
            let after = sequences(&buffer.snapshot());

            let keep = before.len().min(new_capacity);
            prop_assert_eq!(&after[..], &before[before.len() - keep..]);
            prop_assert_eq!(buffer.capacity(), new_capacity);
        }
    }
}
