//! Capture buffer
//!
//! Bounded single-producer/single-consumer frame queue between the capture
//! thread and the analysis thread. Writing never blocks: a full buffer evicts
//! its oldest unread frame so live capture keeps priority over completeness.

use std::sync::Arc;

use crossbeam::queue::ArrayQueue;

use crate::frame::AudioFrame;

/// Fixed-capacity frame storage, split into its two ends before use.
pub struct CaptureBuffer {
    queue: Arc<ArrayQueue<AudioFrame>>,
}

impl CaptureBuffer {
    /// Allocate room for `capacity` frames (at least one).
    pub fn new(capacity: usize) -> Self {
        CaptureBuffer {
            queue: Arc::new(ArrayQueue::new(capacity.max(1))),
        }
    }

    /// Separate the writing and reading ends.
    pub fn split(self) -> (CaptureProducer, CaptureConsumer) {
        let producer = CaptureProducer {
            queue: Arc::clone(&self.queue),
        };
        let consumer = CaptureConsumer { queue: self.queue };
        (producer, consumer)
    }
}

/// Writing end, owned by the capture thread.
pub struct CaptureProducer {
    queue: Arc<ArrayQueue<AudioFrame>>,
}

impl CaptureProducer {
    /// Append a frame. Returns `true` when the oldest unread frame was evicted
    /// to make room.
    pub fn write(&mut self, frame: AudioFrame) -> bool {
        self.queue.force_push(frame).is_some()
    }

    /// Frames currently waiting to be read.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// `true` when nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Maximum number of frames held.
    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }
}

/// Reading end, owned by the analysis thread.
pub struct CaptureConsumer {
    queue: Arc<ArrayQueue<AudioFrame>>,
}

impl CaptureConsumer {
    /// Take the oldest unread frame without blocking.
    pub fn try_read(&mut self) -> Option<AudioFrame> {
        self.queue.pop()
    }

    /// Frames currently waiting to be read.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// `true` when nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Maximum number of frames held.
    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }
}
