//! FIFO of decoded frames awaiting consumption.

use std::collections::VecDeque;

use crate::frame::Frame;

/// Ordered buffer of decoded frames.
///
/// A single packet can decode into more audio than the current buffer budget allows; the
/// leftover frames wait here for the next pull. The head frame is only removed once the caller
/// has actually consumed it, so a frame rejected by a full buffer is retried without re-decoding.
#[derive(Debug, Default)]
pub struct FrameQueue {
    frames: VecDeque<Frame>,
}

impl FrameQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, frame: Frame) {
        self.frames.push_back(frame);
    }

    pub fn enqueue_all(&mut self, frames: impl IntoIterator<Item = Frame>) {
        self.frames.extend(frames);
    }

    /// Put a frame back at the head (used for the remainder of a frame split at a loop end).
    pub fn push_front(&mut self, frame: Frame) {
        self.frames.push_front(frame);
    }

    pub fn peek(&self) -> Option<&Frame> {
        self.frames.front()
    }

    pub fn peek_mut(&mut self) -> Option<&mut Frame> {
        self.frames.front_mut()
    }

    pub fn dequeue(&mut self) -> Option<Frame> {
        self.frames.pop_front()
    }

    pub fn dequeue_all(&mut self) -> Vec<Frame> {
        self.frames.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Total effective samples (per channel) held by the queue.
    pub fn sample_count(&self) -> usize {
        self.frames.iter().map(Frame::sample_count).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::SampleData;

    fn frame(n: usize, marker: f32) -> Frame {
        Frame::new(SampleData::F32(vec![marker; n]), 1, 1_000)
    }

    #[test]
    fn preserves_fifo_order_and_peek_does_not_consume() {
        let mut q = FrameQueue::new();
        q.enqueue(frame(4, 1.0));
        q.enqueue_all([frame(2, 2.0), frame(3, 3.0)]);
        assert_eq!(q.sample_count(), 9);
        assert_eq!(q.peek().and_then(|f| f.f32_samples()).map(|s| s[0]), Some(1.0));
        assert_eq!(q.len(), 3);

        q.dequeue();
        q.push_front(frame(1, 9.0));
        let rest: Vec<f32> = q
            .dequeue_all()
            .iter()
            .map(|f| f.f32_samples().unwrap()[0])
            .collect();
        assert_eq!(rest, vec![9.0, 2.0, 3.0]);
        assert!(q.is_empty());
    }
}
