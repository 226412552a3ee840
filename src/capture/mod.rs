//! Frame capture: deduplication, validation, sequencing and adaptive
//! pacing of the incoming frame stream.

mod pacing;
mod perf;
mod pipeline;

pub use pacing::{AdaptivePacer, MechanismState};
pub use perf::{CaptureStats, PerformanceWindow};
pub use pipeline::{FrameCapturePipeline, FrameSink};
