//! Boundary to the browser automation driver and its remote
//! instrumentation protocol.
//!
//! The engine never talks to a browser directly; everything flows through
//! the two traits below. Listener callbacks registered here are invoked on
//! driver-owned dispatch threads and must return quickly - implementations
//! of the engine only enqueue work from them, never block.

use crate::error::Result;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

/// Stable identifier of a browser target (tab/page) as assigned by the
/// instrumentation protocol.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetId(String);

impl TargetId {
    pub fn new(id: impl Into<String>) -> Self {
        TargetId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TargetId {
    fn from(id: &str) -> Self {
        TargetId(id.to_string())
    }
}

impl From<String> for TargetId {
    fn from(id: String) -> Self {
        TargetId(id)
    }
}

/// What kind of target the driver reported. Only pages are recordable;
/// workers, extensions and the like are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Page,
    Other,
}

/// One entry from the driver's target enumeration.
#[derive(Debug, Clone)]
pub struct TargetDescriptor {
    pub id: TargetId,
    pub kind: TargetKind,
    pub url: String,
}

impl TargetDescriptor {
    pub fn is_page(&self) -> bool {
        self.kind == TargetKind::Page
    }
}

/// Target lifecycle event delivered by the driver.
#[derive(Debug, Clone)]
pub enum TargetEvent {
    Created(TargetDescriptor),
    Destroyed(TargetId),
}

/// One frame-ready event from an instrumentation session. `data` holds the
/// base64-encoded still image exactly as it arrived on the wire; `timestamp`
/// is the protocol capture timestamp in epoch seconds.
#[derive(Debug, Clone)]
pub struct FrameEvent {
    pub session_id: String,
    pub data: Bytes,
    pub timestamp: f64,
}

/// Parameters for `start_frame_stream`.
#[derive(Debug, Clone)]
pub struct FrameStreamOptions {
    pub format: String,
    pub quality: u32,
    pub max_width: u32,
    pub max_height: u32,
}

pub type TargetListener = Box<dyn Fn(TargetEvent) + Send + Sync>;
pub type FrameListener = Box<dyn Fn(FrameEvent) + Send + Sync>;

/// The automation driver: source of target lifecycle events, factory for
/// instrumentation sessions, and host of the DOM execution primitive used
/// to force synthetic repaints and to resolve the active window.
pub trait InstrumentationDriver: Send + Sync {
    /// Create an instrumentation session, either bound to a specific target
    /// or generic (pre-warmable, re-bindable later).
    fn create_session(&self, target: Option<&TargetId>)
        -> Result<Arc<dyn InstrumentationSession>>;

    /// Enumerate all currently known targets.
    fn list_targets(&self) -> Result<Vec<TargetDescriptor>>;

    /// Resolve the driver's currently active window to a target id.
    fn active_target(&self) -> Result<TargetId>;

    /// Execute a script in the active page and return its string result.
    fn execute_script(&self, script: &str) -> Result<String>;

    /// Register the listener for target created/destroyed events. Invoked
    /// on driver dispatch threads.
    fn set_target_listener(&self, listener: TargetListener);
}

/// A protocol-level handle bound to one target, through which capture
/// commands and frame events flow.
pub trait InstrumentationSession: Send + Sync {
    /// Enable the instrumentation domains required for frame capture.
    fn enable_instrumentation(&self) -> Result<()>;

    fn start_frame_stream(&self, options: &FrameStreamOptions) -> Result<()>;

    fn stop_frame_stream(&self) -> Result<()>;

    /// Acknowledge a frame-ready event. Mandatory after every event,
    /// processed or discarded - the driver stops emitting frames otherwise.
    fn acknowledge_frame(&self, session_id: &str) -> Result<()>;

    /// Register the frame-ready listener. Invoked on driver dispatch
    /// threads.
    fn set_frame_listener(&self, listener: FrameListener);

    /// Drop all registered listeners.
    fn clear_listeners(&self);

    /// Re-attach a pooled generic session to a new target, clearing any
    /// prior listeners and state.
    fn rebind(&self, target: &TargetId) -> Result<()>;

    fn is_healthy(&self) -> bool;
}
