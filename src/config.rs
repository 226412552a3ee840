//! Recorder configuration.
//!
//! Every timing constant the engine relies on is exposed here with a
//! documented default. The defaults are the empirically tuned values the
//! engine ships with; optimal values depend on the environment, so they are
//! all overridable.

use crate::driver::FrameStreamOptions;
use std::path::PathBuf;
use std::time::Duration;

/// Playback speed presets for the generated video. Each preset maps to the
/// frame rate handed to the encoder: fewer frames per second of output
/// stretches the same captured frames over more wall-clock playback time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoSpeed {
    /// Playback roughly matches test wall-clock time.
    RealTime,
    /// 2x slower than real time.
    SlowMotion,
    /// 4x slower than real time.
    VerySlow,
    /// 2x faster than real time.
    Fast,
}

impl VideoSpeed {
    pub fn frame_rate(self) -> f64 {
        match self {
            VideoSpeed::RealTime => 5.0,
            VideoSpeed::SlowMotion => 2.0,
            VideoSpeed::VerySlow => 1.0,
            VideoSpeed::Fast => 10.0,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            VideoSpeed::RealTime => "real-time playback",
            VideoSpeed::SlowMotion => "2x slower than real-time",
            VideoSpeed::VerySlow => "4x slower than real-time",
            VideoSpeed::Fast => "2x faster than real-time",
        }
    }
}

/// Full configuration for one recording engine instance.
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    // Session pool
    /// Number of generic sessions created eagerly at startup.
    pub pool_size: usize,
    /// Hard cap on a single session creation attempt.
    pub session_timeout: Duration,
    /// Retry attempts before `acquire` gives up.
    pub session_max_retries: u32,
    /// Base backoff delay between attempts; multiplied by the attempt
    /// number, so delays increase strictly.
    pub session_retry_delay: Duration,
    /// Sessions older than this are evicted by the health monitor.
    pub session_max_age: Duration,
    /// Period of the health check / pool replenishment task.
    pub health_check_interval: Duration,
    /// Overall deadline for pre-warming; partial success is fine.
    pub prewarm_timeout: Duration,
    /// How long `acquire` waits for a pooled session before creating fresh.
    pub pool_wait: Duration,

    // Frame capture
    /// Initial synthetic-trigger interval.
    pub capture_interval: Duration,
    /// Lower bound for the adaptive interval.
    pub min_capture_interval: Duration,
    /// Upper bound for the adaptive interval.
    pub max_capture_interval: Duration,
    /// Two frames with identical content within this window are duplicates.
    pub dedup_window: Duration,
    /// Rolling performance window size (samples).
    pub adaptive_window_size: usize,
    /// Below this recent success rate the interval is increased.
    pub success_rate_floor: f64,
    /// Above this success rate (with comfortable processing time) the
    /// interval is decreased.
    pub speed_up_rate: f64,
    pub interval_increase_step: Duration,
    pub interval_decrease_step: Duration,
    /// Period of the adaptive-interval adjuster.
    pub adjust_period: Duration,
    /// Frame decode/validate worker threads.
    pub worker_threads: usize,
    /// Consecutive failures before the DOM trigger self-disables.
    pub trigger_failure_limit: u32,
    /// Consecutive failures before the timed-capture mechanism
    /// self-disables.
    pub timer_failure_limit: u32,
    /// Frames narrower or shorter than this are rejected as corrupt.
    pub min_frame_dim: u32,
    /// Edge length of the corner sample checked for uniform content.
    pub uniform_sample_dim: u32,

    // Frame stream
    pub frame_format: String,
    pub frame_quality: u32,
    pub max_stream_width: u32,
    pub max_stream_height: u32,

    // Encoding
    pub video_speed: VideoSpeed,
    pub width: u32,
    pub height: u32,
    pub codec: String,
    pub preset: String,
    pub crf: u32,
    pub hardware_acceleration: bool,
    /// Capacity of the capture-to-encode frame queue; offers beyond this
    /// drop the frame rather than block the producer.
    pub frame_queue_capacity: usize,
    /// Encoder executable. Resolved through `PATH` unless absolute.
    pub encoder_binary: PathBuf,
    /// Directory the finished video is written into.
    pub output_dir: PathBuf,
    /// Bounded wait for the encode queue to drain during finish.
    pub drain_timeout: Duration,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        RecorderConfig {
            pool_size: 5,
            session_timeout: Duration::from_secs(3),
            session_max_retries: 3,
            session_retry_delay: Duration::from_millis(500),
            session_max_age: Duration::from_secs(300),
            health_check_interval: Duration::from_secs(5),
            prewarm_timeout: Duration::from_secs(10),
            pool_wait: Duration::from_millis(100),

            capture_interval: Duration::from_millis(200),
            min_capture_interval: Duration::from_millis(50),
            max_capture_interval: Duration::from_millis(1000),
            dedup_window: Duration::from_secs(1),
            adaptive_window_size: 10,
            success_rate_floor: 0.80,
            speed_up_rate: 0.95,
            interval_increase_step: Duration::from_millis(50),
            interval_decrease_step: Duration::from_millis(25),
            adjust_period: Duration::from_secs(5),
            worker_threads: 3,
            trigger_failure_limit: 5,
            timer_failure_limit: 3,
            min_frame_dim: 100,
            uniform_sample_dim: 50,

            frame_format: "png".to_string(),
            frame_quality: 90,
            max_stream_width: 1920,
            max_stream_height: 1080,

            video_speed: VideoSpeed::SlowMotion,
            width: 1280,
            height: 720,
            codec: "libx264".to_string(),
            preset: "veryfast".to_string(),
            crf: 23,
            hardware_acceleration: false,
            frame_queue_capacity: 100,
            encoder_binary: PathBuf::from("ffmpeg"),
            output_dir: PathBuf::from("videos"),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl RecorderConfig {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn set_video_speed(mut self, speed: VideoSpeed) -> Self {
        self.video_speed = speed;
        self
    }

    pub fn set_resolution(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn set_codec(mut self, codec: impl Into<String>) -> Self {
        self.codec = codec.into();
        self
    }

    pub fn set_preset(mut self, preset: impl Into<String>) -> Self {
        self.preset = preset.into();
        self
    }

    pub fn set_hardware_acceleration(mut self, enabled: bool) -> Self {
        self.hardware_acceleration = enabled;
        self
    }

    pub fn set_capture_interval(mut self, interval: Duration) -> Self {
        self.capture_interval = interval;
        self
    }

    pub fn set_encoder_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.encoder_binary = binary.into();
        self
    }

    pub fn set_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn set_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    /// Effective output frame rate for the encoder.
    pub fn frame_rate(&self) -> f64 {
        self.video_speed.frame_rate()
    }

    pub(crate) fn stream_options(&self) -> FrameStreamOptions {
        FrameStreamOptions {
            format: self.frame_format.clone(),
            quality: self.frame_quality,
            max_width: self.max_stream_width,
            max_height: self.max_stream_height,
        }
    }
}
