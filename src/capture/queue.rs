//! Bounded capture-event queue between the sniffer and its consumer.
//!
//! Single producer (the sniff loop), single consumer (whoever drains the
//! session). Ring-buffer semantics: when full, the oldest frame is dropped
//! and a loss counter incremented so consumers can detect the gap. The
//! producer never blocks on a slow consumer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::config;

/// Wall-clock capture timestamp, split the way the wire tools expect it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Timestamp {
    pub secs: u64,
    pub usecs: u32,
}

impl Timestamp {
    pub fn now() -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            secs: since_epoch.as_secs(),
            usecs: since_epoch.subsec_micros(),
        }
    }
}

/// One captured frame as delivered to consumers. A value, not a shared
/// reference: consumers own their copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapturedFrame {
    pub bytes: Vec<u8>,
    pub captured_at: Timestamp,
    /// Index into the session's target table at the moment of capture.
    pub target_index: u32,
}

/// Bounded FIFO of captured frames with drop-oldest overflow.
#[derive(Debug)]
pub struct FrameQueue {
    frames: Mutex<VecDeque<CapturedFrame>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::with_capacity(config::FRAME_QUEUE_CAPACITY)
    }
}

impl FrameQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue a frame, evicting the oldest when full. Never blocks beyond
    /// the short critical section.
    pub fn push(&self, frame: CapturedFrame) {
        let mut frames = self.frames.lock().unwrap();
        if frames.len() >= self.capacity {
            frames.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        frames.push_back(frame);
    }

    /// Dequeue the oldest frame, if any.
    pub fn pop(&self) -> Option<CapturedFrame> {
        self.frames.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total frames lost to overflow since the queue was created.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(tag: u8) -> CapturedFrame {
        CapturedFrame {
            bytes: vec![tag; 14],
            captured_at: Timestamp { secs: 1, usecs: 0 },
            target_index: 0,
        }
    }

    #[test]
    fn test_fifo_order_preserved() {
        let q = FrameQueue::with_capacity(8);
        for i in 0..5 {
            q.push(frame(i));
        }
        for i in 0..5 {
            assert_eq!(q.pop().unwrap().bytes[0], i);
        }
        assert!(q.pop().is_none());
    }

    #[test]
    fn test_overflow_drops_oldest_and_counts() {
        let q = FrameQueue::with_capacity(3);
        for i in 0..5 {
            q.push(frame(i));
        }
        assert_eq!(q.dropped(), 2);
        assert_eq!(q.len(), 3);
        // Frames 0 and 1 were evicted; 2 is now the oldest.
        assert_eq!(q.pop().unwrap().bytes[0], 2);
    }

    #[test]
    fn test_empty_queue_reports_no_loss() {
        let q = FrameQueue::default();
        assert!(q.is_empty());
        assert_eq!(q.dropped(), 0);
    }
}
