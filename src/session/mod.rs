//! Instrumentation session pooling.

mod pool;

pub use pool::{RecordingSession, SessionMetrics, SessionPool};
