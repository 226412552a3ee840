//! Streaming encode pipeline: bounded frame queue, external encoder
//! subprocess, stderr monitoring.

mod frame_queue;
mod monitor;
mod pipeline;

pub use pipeline::{EncodePipeline, EncodeResult, EncodeState, EncoderSettings};
