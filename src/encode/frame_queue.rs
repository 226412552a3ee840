// Bounded hand-off queue between the capture workers and the encode
// consumer.
//
// Offers never block: when the consumer cannot keep up the frame is dropped
// and counted, because stalling the test under recording is worse than an
// occasional missing frame. The consumer takes with a short timeout so it
// stays responsive to the end-of-stream signal.

use crate::frame::CapturedFrame;
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

pub(crate) struct FrameQueue {
    tx: Sender<CapturedFrame>,
    rx: Receiver<CapturedFrame>,
    end_of_stream: AtomicBool,
    dropped: AtomicU64,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        FrameQueue {
            tx,
            rx,
            end_of_stream: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Non-blocking offer. Returns `false` (and counts a drop) when the
    /// queue is full or already closed.
    pub fn offer(&self, frame: CapturedFrame) -> bool {
        if self.end_of_stream.load(Ordering::Acquire) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Blocking take with a poll timeout. Returns `None` on timeout; after
    /// end-of-stream, `None` means the queue is fully drained.
    pub fn take(&self, timeout: Duration) -> Option<CapturedFrame> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn signal_end_of_stream(&self) {
        self.end_of_stream.store(true, Ordering::Release);
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.end_of_stream.load(Ordering::Acquire)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Discard all buffered frames. Used by the abrupt shutdown path.
    pub fn clear(&self) {
        loop {
            match self.rx.try_recv() {
                Ok(_) => continue,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::TargetId;
    use image::RgbImage;
    use std::time::Instant;

    fn frame(seq: u64) -> CapturedFrame {
        CapturedFrame {
            seq,
            target: TargetId::new("t1"),
            captured_at: Instant::now(),
            image: RgbImage::new(2, 2),
            fingerprint: [0u8; 32],
        }
    }

    #[test]
    fn test_offer_take_roundtrip() {
        let queue = FrameQueue::new(4);
        assert!(queue.offer(frame(1)));
        assert!(queue.offer(frame(2)));
        assert_eq!(queue.len(), 2);

        let first = queue.take(Duration::from_millis(10)).unwrap();
        assert_eq!(first.seq, 1);
        let second = queue.take(Duration::from_millis(10)).unwrap();
        assert_eq!(second.seq, 2);
        assert!(queue.take(Duration::from_millis(1)).is_none());
    }

    #[test]
    fn test_full_queue_drops_without_blocking() {
        let queue = FrameQueue::new(2);
        assert!(queue.offer(frame(1)));
        assert!(queue.offer(frame(2)));

        let started = Instant::now();
        assert!(!queue.offer(frame(3)));
        assert!(!queue.offer(frame(4)));
        // The rejected offers must return immediately.
        assert!(started.elapsed() < Duration::from_millis(50));
        assert_eq!(queue.dropped(), 2);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_dropped_counter_matches_rejections() {
        let queue = FrameQueue::new(1);
        let mut rejected = 0u64;
        for i in 0..10 {
            if !queue.offer(frame(i)) {
                rejected += 1;
            }
        }
        assert_eq!(queue.dropped(), rejected);
        assert_eq!(rejected, 9);
    }

    #[test]
    fn test_end_of_stream_rejects_new_offers() {
        let queue = FrameQueue::new(4);
        assert!(queue.offer(frame(1)));
        queue.signal_end_of_stream();
        assert!(!queue.offer(frame(2)));
        // Buffered frames still drain.
        assert!(queue.take(Duration::from_millis(10)).is_some());
        assert!(queue.take(Duration::from_millis(1)).is_none());
        assert!(queue.is_end_of_stream());
    }

    #[test]
    fn test_clear_discards_buffered_frames() {
        let queue = FrameQueue::new(4);
        queue.offer(frame(1));
        queue.offer(frame(2));
        queue.clear();
        assert_eq!(queue.len(), 0);
        assert!(queue.take(Duration::from_millis(1)).is_none());
    }
}
