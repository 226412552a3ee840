//! End-to-end scenarios for the recorder against a scripted driver and a
//! stub encoder executable.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use image::{Rgb, RgbImage};
use pagecast::driver::{
    FrameEvent, FrameListener, FrameStreamOptions, InstrumentationDriver,
    InstrumentationSession, TargetDescriptor, TargetEvent, TargetId, TargetKind,
    TargetListener,
};
use pagecast::error::{Error, Result};
use pagecast::{Recorder, RecorderConfig};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

// ----------------------------------------------------------------------
// Mock instrumentation stack
// ----------------------------------------------------------------------

struct MockSession {
    bound: Mutex<Option<TargetId>>,
    listener: Mutex<Option<FrameListener>>,
    streaming: AtomicBool,
    healthy: AtomicBool,
    acks: AtomicU64,
    stream_starts: AtomicU64,
    stream_stops: AtomicU64,
    rebinds: AtomicU64,
}

impl MockSession {
    fn new(target: Option<&TargetId>) -> Arc<Self> {
        Arc::new(MockSession {
            bound: Mutex::new(target.cloned()),
            listener: Mutex::new(None),
            streaming: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
            acks: AtomicU64::new(0),
            stream_starts: AtomicU64::new(0),
            stream_stops: AtomicU64::new(0),
            rebinds: AtomicU64::new(0),
        })
    }

    fn deliver(&self, event: FrameEvent) {
        let guard = self.listener.lock().unwrap();
        if let Some(listener) = guard.as_ref() {
            listener(event);
        }
    }
}

impl InstrumentationSession for MockSession {
    fn enable_instrumentation(&self) -> Result<()> {
        Ok(())
    }
    fn start_frame_stream(&self, _options: &FrameStreamOptions) -> Result<()> {
        self.streaming.store(true, Ordering::SeqCst);
        self.stream_starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    fn stop_frame_stream(&self) -> Result<()> {
        self.streaming.store(false, Ordering::SeqCst);
        self.stream_stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    fn acknowledge_frame(&self, _session_id: &str) -> Result<()> {
        self.acks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    fn set_frame_listener(&self, listener: FrameListener) {
        *self.listener.lock().unwrap() = Some(listener);
    }
    fn clear_listeners(&self) {
        *self.listener.lock().unwrap() = None;
    }
    fn rebind(&self, target: &TargetId) -> Result<()> {
        self.rebinds.fetch_add(1, Ordering::SeqCst);
        *self.listener.lock().unwrap() = None;
        *self.bound.lock().unwrap() = Some(target.clone());
        Ok(())
    }
    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

struct MockDriver {
    targets: Mutex<Vec<TargetDescriptor>>,
    sessions: Mutex<Vec<Arc<MockSession>>>,
    listener: Mutex<Option<TargetListener>>,
    root: TargetId,
    create_calls: AtomicUsize,
}

impl MockDriver {
    fn with_root() -> Arc<Self> {
        let root = TargetId::new("root");
        Arc::new(MockDriver {
            targets: Mutex::new(vec![TargetDescriptor {
                id: root.clone(),
                kind: TargetKind::Page,
                url: "about:blank".to_string(),
            }]),
            sessions: Mutex::new(Vec::new()),
            listener: Mutex::new(None),
            root,
            create_calls: AtomicUsize::new(0),
        })
    }

    fn open_tab(&self, id: &str) -> TargetId {
        let target = TargetId::new(id);
        let descriptor = TargetDescriptor {
            id: target.clone(),
            kind: TargetKind::Page,
            url: format!("https://example.test/{id}"),
        };
        self.targets.lock().unwrap().push(descriptor.clone());
        if let Some(listener) = self.listener.lock().unwrap().as_ref() {
            listener(TargetEvent::Created(descriptor));
        }
        target
    }

    fn close_tab(&self, target: &TargetId) {
        self.targets.lock().unwrap().retain(|t| &t.id != target);
        if let Some(listener) = self.listener.lock().unwrap().as_ref() {
            listener(TargetEvent::Destroyed(target.clone()));
        }
    }

    /// The session currently bound to `target`, preferring the most
    /// recently bound one.
    fn session_for(&self, target: &TargetId) -> Option<Arc<MockSession>> {
        self.sessions
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|s| s.bound.lock().unwrap().as_ref() == Some(target))
            .cloned()
    }

    /// Deliver one frame event to whichever session is streaming `target`.
    fn emit_frame(&self, target: &TargetId, seed: u32) {
        let session = self
            .session_for(target)
            .expect("no session bound to target");
        assert!(
            session.streaming.load(Ordering::SeqCst),
            "target {target} is not streaming"
        );
        session.deliver(png_event(seed));
    }
}

impl InstrumentationDriver for MockDriver {
    fn create_session(
        &self,
        target: Option<&TargetId>,
    ) -> Result<Arc<dyn InstrumentationSession>> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let session = MockSession::new(target);
        self.sessions.lock().unwrap().push(Arc::clone(&session));
        Ok(session)
    }

    fn list_targets(&self) -> Result<Vec<TargetDescriptor>> {
        Ok(self.targets.lock().unwrap().clone())
    }

    fn active_target(&self) -> Result<TargetId> {
        let targets = self.targets.lock().unwrap();
        if targets.iter().any(|t| t.id == self.root) {
            Ok(self.root.clone())
        } else {
            targets
                .iter()
                .find(|t| t.kind == TargetKind::Page)
                .map(|t| t.id.clone())
                .ok_or_else(|| Error::Driver("no window available".to_string()))
        }
    }

    fn execute_script(&self, _script: &str) -> Result<String> {
        Ok("ok".to_string())
    }

    fn set_target_listener(&self, listener: TargetListener) {
        *self.listener.lock().unwrap() = Some(listener);
    }
}

// ----------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------

/// A unique 8x8 gradient frame, base64-encoded as on the wire.
fn png_event(seed: u32) -> FrameEvent {
    let image = RgbImage::from_fn(8, 8, |x, y| {
        Rgb([
            (seed % 251) as u8,
            (seed / 251 % 251) as u8 ^ x as u8,
            x as u8 ^ (y as u8).wrapping_mul(3),
        ])
    });
    let mut png = Vec::new();
    image::DynamicImage::ImageRgb8(image)
        .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
        .unwrap();
    FrameEvent {
        session_id: "cast-1".to_string(),
        data: Bytes::from(BASE64.encode(&png).into_bytes()),
        timestamp: seed as f64,
    }
}

#[cfg(unix)]
fn stub_encoder(dir: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("stub-encoder.sh");
    std::fs::write(&path, "#!/bin/sh\ncat > /dev/null\nexit 0\n").unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn test_config(dir: &Path) -> RecorderConfig {
    let mut cfg = RecorderConfig::default();
    cfg.pool_size = 1;
    cfg.pool_wait = Duration::from_millis(5);
    cfg.prewarm_timeout = Duration::from_secs(2);
    cfg.session_timeout = Duration::from_millis(500);
    cfg.session_retry_delay = Duration::from_millis(10);
    cfg.health_check_interval = Duration::from_secs(60);
    cfg.worker_threads = 2;
    cfg.min_frame_dim = 4;
    cfg.uniform_sample_dim = 4;
    cfg.width = 64;
    cfg.height = 48;
    cfg.encoder_binary = stub_encoder(dir);
    cfg.output_dir = dir.join("videos");
    cfg
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {what}");
}

// ----------------------------------------------------------------------
// Scenarios
// ----------------------------------------------------------------------

/// Scenario A: single target, 50 unique frames, clean finish.
#[test]
#[cfg(unix)]
fn test_fifty_unique_frames_single_target() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let driver = MockDriver::with_root();
    let recorder = Recorder::new(
        Arc::clone(&driver) as Arc<dyn InstrumentationDriver>,
        test_config(dir.path()),
    );

    recorder.start_recording().unwrap();
    assert!(recorder.is_recording());
    let root = recorder.current_target().unwrap();
    assert_eq!(root.as_str(), "root");

    for seed in 0..50 {
        driver.emit_frame(&root, seed * 7 + 1);
    }
    wait_until("all frames accepted", || recorder.frames_accepted() == 50);

    let video = recorder.stop_recording_and_generate_video().unwrap();
    assert!(video.to_string_lossy().ends_with(".mp4"));

    let result = recorder.last_encode_result().unwrap();
    assert!(result.success);
    assert_eq!(result.frames_written, 50);
    assert_eq!(result.frames_dropped, 0);
    recorder.close();
}

/// Scenario B: a new tab with auto-rebind on moves the recording and the
/// old target's session is released exactly once.
#[test]
#[cfg(unix)]
fn test_auto_rebind_moves_recording_to_new_tab() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let driver = MockDriver::with_root();
    let recorder = Recorder::new(
        Arc::clone(&driver) as Arc<dyn InstrumentationDriver>,
        test_config(dir.path()),
    );
    recorder.set_auto_rebind_enabled(true);
    recorder.start_recording().unwrap();

    let root = recorder.current_target().unwrap();
    let root_session = driver.session_for(&root).unwrap();
    driver.emit_frame(&root, 1);
    wait_until("root frame accepted", || recorder.frames_accepted() >= 1);

    let tab = driver.open_tab("tab-1");
    wait_until("recording switched to the new tab", || {
        recorder.current_target().as_ref() == Some(&tab)
    });

    // The old target's stream was stopped exactly once, and the session
    // went through the pool exactly once: with a pool of one, the new tab
    // can only be served by the released root session, rebound.
    assert_eq!(root_session.stream_stops.load(Ordering::SeqCst), 1);
    assert_eq!(
        root_session.bound.lock().unwrap().as_ref(),
        Some(&tab),
        "released root session should have been recycled for the new tab"
    );
    assert_eq!(root_session.rebinds.load(Ordering::SeqCst), 2);

    driver.emit_frame(&tab, 100);
    wait_until("tab frame accepted", || recorder.frames_accepted() >= 2);
    assert_eq!(recorder.frames_for(&tab), 1);

    recorder.stop_recording_and_generate_video().unwrap();
    recorder.close();
}

/// Scenario C: three tabs opened and closed in sequence while recorded;
/// recording falls back to the original root target and keeps attributing
/// frames to it.
#[test]
#[cfg(unix)]
fn test_tab_churn_falls_back_to_root() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let driver = MockDriver::with_root();
    let recorder = Recorder::new(
        Arc::clone(&driver) as Arc<dyn InstrumentationDriver>,
        test_config(dir.path()),
    );
    recorder.set_auto_rebind_enabled(true);
    recorder.start_recording().unwrap();
    let root = recorder.current_target().unwrap();

    driver.emit_frame(&root, 1);
    driver.emit_frame(&root, 2);
    wait_until("frames before the churn", || {
        recorder.frames_for(&root) == 2
    });

    // Open three tabs; auto-rebind follows each one.
    let mut tabs = Vec::new();
    for i in 1..=3 {
        let tab = driver.open_tab(&format!("tab-{i}"));
        wait_until("rebind to opened tab", || {
            recorder.current_target().as_ref() == Some(&tab)
        });
        driver.emit_frame(&tab, 1000 + i);
        tabs.push(tab);
    }

    // Close them newest-first; each closure of the recorded target must
    // recover onto some remaining page, ending on the root.
    for tab in tabs.iter().rev() {
        driver.close_tab(tab);
        wait_until("recovery after tab closure", || {
            recorder.current_target().map_or(false, |t| &t != tab)
        });
    }
    wait_until("recording back on the root target", || {
        recorder.current_target().as_ref() == Some(&root)
    });
    assert!(!recorder.is_target_lost());
    assert!(recorder.is_recording());

    let before = recorder.frames_for(&root);
    driver.emit_frame(&root, 5001);
    driver.emit_frame(&root, 5002);
    wait_until("frames after the churn", || {
        recorder.frames_for(&root) == before + 2
    });
    wait_until("all emitted frames accepted", || {
        recorder.frames_accepted() == 7
    });

    recorder.stop_recording_and_generate_video().unwrap();
    let result = recorder.last_encode_result().unwrap();
    assert!(result.frames_written >= 7);
    recorder.close();
}

/// Scenario D: finishing with zero frames ever accepted raises
/// `NoFramesCaptured`.
#[test]
#[cfg(unix)]
fn test_zero_frames_is_a_hard_error() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let driver = MockDriver::with_root();
    let recorder = Recorder::new(
        Arc::clone(&driver) as Arc<dyn InstrumentationDriver>,
        test_config(dir.path()),
    );

    recorder.start_recording().unwrap();
    let err = recorder.stop_recording_and_generate_video().unwrap_err();
    assert!(matches!(err, Error::NoFramesCaptured));
    recorder.close();
}

/// Manual rebind path: auto-rebind off, explicit switch to the newest tab.
#[test]
#[cfg(unix)]
fn test_manual_rebind_to_newest_tab() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let driver = MockDriver::with_root();
    let recorder = Recorder::new(
        Arc::clone(&driver) as Arc<dyn InstrumentationDriver>,
        test_config(dir.path()),
    );
    recorder.start_recording().unwrap();
    let root = recorder.current_target().unwrap();

    // Without a created tab the manual switch is refused.
    assert!(matches!(
        recorder.record_newly_opened_tab(),
        Err(Error::InvalidState { .. })
    ));

    let tab = driver.open_tab("tab-1");
    // Auto-rebind is off: recording stays on the root until asked.
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(recorder.current_target(), Some(root));

    recorder.record_newly_opened_tab().unwrap();
    assert_eq!(recorder.current_target(), Some(tab.clone()));

    driver.emit_frame(&tab, 42);
    wait_until("frame on manually selected tab", || {
        recorder.frames_for(&tab) == 1
    });
    recorder.stop_recording_and_generate_video().unwrap();
    recorder.close();
}

/// Destroying the only target leaves the run explicitly target-lost, not
/// silently stuck.
#[test]
#[cfg(unix)]
fn test_total_target_loss_is_explicit() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let driver = MockDriver::with_root();
    let recorder = Recorder::new(
        Arc::clone(&driver) as Arc<dyn InstrumentationDriver>,
        test_config(dir.path()),
    );
    recorder.start_recording().unwrap();
    let root = recorder.current_target().unwrap();
    driver.emit_frame(&root, 9);
    wait_until("frame accepted", || recorder.frames_accepted() >= 1);

    driver.close_tab(&root);
    wait_until("run marked target-lost", || recorder.is_target_lost());
    assert!(!recorder.is_recording());

    // The frames captured before the loss still produce a video.
    let video = recorder.stop_recording_and_generate_video().unwrap();
    assert!(video.to_string_lossy().ends_with(".mp4"));
    let result = recorder.last_encode_result().unwrap();
    assert_eq!(result.frames_written, 1);
    recorder.close();
}

/// Session metrics are visible through the recorder.
#[test]
#[cfg(unix)]
fn test_session_metrics_exposed() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let driver = MockDriver::with_root();
    let recorder = Recorder::new(
        Arc::clone(&driver) as Arc<dyn InstrumentationDriver>,
        test_config(dir.path()),
    );
    recorder.start_recording().unwrap();

    let metrics = recorder.session_metrics();
    assert!(metrics.attempts >= 1);
    assert_eq!(metrics.attempts, metrics.successes);
    assert!(metrics.success_rate() > 0.99);

    recorder.close();
}
