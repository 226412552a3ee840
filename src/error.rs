use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the recording engine.
///
/// Only caller-invoked entry points return these; anything that originates
/// inside a driver callback or a background thread is logged at its origin
/// and converted into a state change instead of propagating.
#[derive(Error, Debug)]
pub enum Error {
    /// Session acquisition timed out or exhausted its retries.
    #[error("failed to acquire instrumentation session after {attempts} attempts: {last}")]
    SessionCreation { attempts: u32, last: String },

    /// A single frame failed to decode or validate. The frame is dropped
    /// and the run continues.
    #[error("frame processing failed: {0}")]
    FrameProcessing(String),

    /// The recorded target was destroyed and the full recovery procedure
    /// found no replacement. Fatal for the run, not for the process.
    #[error("recorded target lost with no replacement: {0}")]
    TargetLoss(String),

    /// The encoder subprocess exited with a non-zero code. Normally carried
    /// inside the encode result rather than raised.
    #[error("encoder subprocess exited with code {exit_code}")]
    EncoderProcess { exit_code: i32 },

    /// Zero frames were captured by the time the run was finalized.
    #[error("no frames were captured")]
    NoFramesCaptured,

    /// An operation was invoked in a state that does not permit it.
    #[error("invalid state: expected {expected}, found {actual}")]
    InvalidState {
        expected: &'static str,
        actual: String,
    },

    /// Error reported by the automation driver or instrumentation protocol.
    #[error("driver error: {0}")]
    Driver(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
