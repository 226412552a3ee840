// Rolling performance window for frame processing.
//
// Two views over the same stream of samples:
// - a fixed-size ring of recent (processing time, success) pairs, read by
//   the adaptive-interval adjuster
// - cumulative totals since the start of the run, exposed as stats

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
struct Sample {
    processing: Duration,
    success: bool,
}

/// Cumulative capture statistics snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct CaptureStats {
    pub total_frames: u64,
    pub successful_frames: u64,
    pub max_processing_ms: u64,
    pub avg_processing_ms: f64,
}

impl CaptureStats {
    pub fn success_rate(&self) -> f64 {
        if self.total_frames == 0 {
            0.0
        } else {
            self.successful_frames as f64 / self.total_frames as f64
        }
    }
}

/// Fixed-size rolling buffer of recent frame-processing samples plus
/// cumulative counters. Mutated on every processed frame.
pub struct PerformanceWindow {
    ring: Mutex<Ring>,
    total: AtomicU64,
    successful: AtomicU64,
    total_processing_us: AtomicU64,
    max_processing_us: AtomicU64,
}

struct Ring {
    buffer: Vec<Option<Sample>>,
    head: usize,
    len: usize,
}

impl PerformanceWindow {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "window capacity must be positive");
        PerformanceWindow {
            ring: Mutex::new(Ring {
                buffer: vec![None; capacity],
                head: 0,
                len: 0,
            }),
            total: AtomicU64::new(0),
            successful: AtomicU64::new(0),
            total_processing_us: AtomicU64::new(0),
            max_processing_us: AtomicU64::new(0),
        }
    }

    pub fn record(&self, processing: Duration, success: bool) {
        {
            let mut ring = self.ring.lock().unwrap();
            let capacity = ring.buffer.len();
            let head = ring.head;
            ring.buffer[head] = Some(Sample {
                processing,
                success,
            });
            ring.head = (head + 1) % capacity;
            if ring.len < capacity {
                ring.len += 1;
            }
        }

        let us = processing.as_micros() as u64;
        self.total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful.fetch_add(1, Ordering::Relaxed);
        }
        self.total_processing_us.fetch_add(us, Ordering::Relaxed);
        self.max_processing_us.fetch_max(us, Ordering::Relaxed);
    }

    /// Samples currently held in the ring.
    pub fn sample_count(&self) -> usize {
        self.ring.lock().unwrap().len
    }

    /// Success rate over the recent window, or `None` while empty.
    pub fn success_rate(&self) -> Option<f64> {
        let ring = self.ring.lock().unwrap();
        if ring.len == 0 {
            return None;
        }
        let ok = ring
            .buffer
            .iter()
            .flatten()
            .filter(|s| s.success)
            .count();
        Some(ok as f64 / ring.len as f64)
    }

    /// Average processing time over the recent window.
    pub fn avg_processing(&self) -> Duration {
        let ring = self.ring.lock().unwrap();
        if ring.len == 0 {
            return Duration::ZERO;
        }
        let total: Duration = ring.buffer.iter().flatten().map(|s| s.processing).sum();
        total / ring.len as u32
    }

    pub fn stats(&self) -> CaptureStats {
        let total = self.total.load(Ordering::Relaxed);
        let total_us = self.total_processing_us.load(Ordering::Relaxed);
        CaptureStats {
            total_frames: total,
            successful_frames: self.successful.load(Ordering::Relaxed),
            max_processing_ms: self.max_processing_us.load(Ordering::Relaxed) / 1000,
            avg_processing_ms: if total == 0 {
                0.0
            } else {
                total_us as f64 / total as f64 / 1000.0
            },
        }
    }
}
