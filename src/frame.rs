//! The accepted-frame type shared by the capture and encode pipelines.

use crate::driver::TargetId;
use image::RgbImage;
use std::time::Instant;

/// One accepted frame. Created when a frame-ready event survives
/// deduplication and validation; consumed exactly once by the encode
/// pipeline; never mutated after creation.
pub struct CapturedFrame {
    /// Strictly increasing, gap-free sequence number assigned at
    /// acceptance.
    pub seq: u64,
    /// Target the frame was captured from.
    pub target: TargetId,
    /// When the frame event was received.
    pub captured_at: Instant,
    /// Decoded pixel data.
    pub image: RgbImage,
    /// SHA-256 of the wire payload, used for duplicate suppression.
    pub fingerprint: [u8; 32],
}

impl CapturedFrame {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

impl std::fmt::Debug for CapturedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapturedFrame")
            .field("seq", &self.seq)
            .field("target", &self.target)
            .field("dimensions", &(self.image.width(), self.image.height()))
            .finish()
    }
}
