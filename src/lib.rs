//! # pagecast
//!
//! Records a live browser tab as a video while an automated test suite
//! drives it, compensating for the unreliability of the browser's remote
//! instrumentation channel: session-creation stalls, duplicate or missing
//! frame events, and loss of the recording target when tabs open or close.
//!
//! The engine is built from four cooperating components:
//!
//! - a [`session::SessionPool`] that hides session-creation latency and
//!   failure behind pooling, timeouts and retries;
//! - a [`capture::FrameCapturePipeline`] that deduplicates, validates and
//!   paces incoming frames with adaptive timing;
//! - an [`encode::EncodePipeline`] that streams accepted frames straight
//!   into an external encoder subprocess, with no intermediate disk
//!   storage;
//! - a [`Recorder`] that tracks browser targets and rebinds recording
//!   across them, keeping some recording alive through tab churn.
//!
//! The browser automation driver is abstracted behind the traits in
//! [`driver`]; implement [`driver::InstrumentationDriver`] for your
//! automation stack and hand it to [`Recorder::new`].
//!
//! ```no_run
//! use pagecast::{Recorder, RecorderConfig, VideoSpeed};
//! # fn driver() -> std::sync::Arc<dyn pagecast::driver::InstrumentationDriver> { unimplemented!() }
//!
//! let config = RecorderConfig::new().set_video_speed(VideoSpeed::SlowMotion);
//! let recorder = Recorder::new(driver(), config);
//! recorder.set_auto_rebind_enabled(true);
//! recorder.start_recording().unwrap();
//! // ... drive the browser ...
//! let video = recorder.stop_recording_and_generate_video().unwrap();
//! println!("video written to {}", video.display());
//! recorder.close();
//! ```

pub mod capture;
pub mod config;
pub mod driver;
pub mod encode;
pub mod error;
pub mod frame;
pub mod recorder;
pub mod session;

pub use config::{RecorderConfig, VideoSpeed};
pub use encode::{EncodeResult, EncodeState};
pub use error::{Error, Result};
pub use frame::CapturedFrame;
pub use recorder::Recorder;
pub use session::SessionMetrics;
