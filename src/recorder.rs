//! Target lifecycle coordination and the public recording API.
//!
//! The [`Recorder`] reacts to target created/destroyed events from the
//! driver, decides which target should currently be recorded, and drives
//! the session pool, capture pipeline and encode pipeline accordingly.
//! Driver callbacks only enqueue commands; all blocking work (session
//! acquisition can take seconds) happens on a dedicated rebind worker
//! thread, and switches are serialized so two sessions never feed the
//! encode queue concurrently.

use crate::capture::{AdaptivePacer, CaptureStats, FrameCapturePipeline, FrameSink};
use crate::config::{RecorderConfig, VideoSpeed};
use crate::driver::{InstrumentationDriver, TargetEvent, TargetId};
use crate::encode::{EncodePipeline, EncodeResult, EncoderSettings};
use crate::error::{Error, Result};
use crate::session::{SessionMetrics, SessionPool};
use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};

const COMMAND_QUEUE_CAPACITY: usize = 64;

enum SwitchCommand {
    /// Move recording to this target (auto-rebind path).
    SwitchTo(TargetId),
    /// The currently recorded target was destroyed; run recovery.
    HandleLoss(TargetId),
    /// A non-recorded target went away; clean up its session.
    Release(TargetId),
    Shutdown,
}

/// One recording engine instance. Owns its own session pool, capture
/// pipeline and encode job; multiple independent recorders can coexist in
/// a process.
///
/// A recorder drives exactly one recording run: the encode job's state
/// machine is monotonic and is never rewound. Create a fresh `Recorder`
/// per run.
pub struct Recorder {
    driver: Arc<dyn InstrumentationDriver>,
    config: RecorderConfig,
    pool: Arc<SessionPool>,
    capture: Arc<FrameCapturePipeline>,
    pacer: Arc<AdaptivePacer>,
    encode: Arc<EncodePipeline>,

    current: Mutex<Option<TargetId>>,
    last_created: Mutex<Option<TargetId>>,
    recording: AtomicBool,
    auto_rebind: AtomicBool,
    target_lost: AtomicBool,
    video_speed: Mutex<VideoSpeed>,
    /// Serializes switches: stop-old always completes before start-new.
    switch_lock: Mutex<()>,

    output_path: Mutex<Option<PathBuf>>,
    last_result: Mutex<Option<EncodeResult>>,

    cmd_tx: Sender<SwitchCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Recorder {
    /// Build a recorder against a driver: pre-warms the session pool,
    /// starts the pacing and rebind workers, and registers for target
    /// lifecycle events.
    pub fn new(driver: Arc<dyn InstrumentationDriver>, config: RecorderConfig) -> Arc<Recorder> {
        let settings = encoder_settings(&config, config.video_speed);
        let encode = Arc::new(EncodePipeline::new(
            settings,
            config.frame_queue_capacity,
            config.drain_timeout,
        ));
        let capture =
            FrameCapturePipeline::new(Arc::clone(&encode) as Arc<dyn FrameSink>, &config);
        let pacer = AdaptivePacer::new(Arc::clone(&driver), capture.performance(), &config);
        pacer.start();

        let pool = SessionPool::new(Arc::clone(&driver), &config);
        pool.prewarm(config.pool_size, config.prewarm_timeout);

        let (cmd_tx, cmd_rx) = bounded(COMMAND_QUEUE_CAPACITY);
        let recorder = Arc::new(Recorder {
            driver: Arc::clone(&driver),
            video_speed: Mutex::new(config.video_speed),
            config,
            pool,
            capture,
            pacer,
            encode,
            current: Mutex::new(None),
            last_created: Mutex::new(None),
            recording: AtomicBool::new(false),
            auto_rebind: AtomicBool::new(false),
            target_lost: AtomicBool::new(false),
            switch_lock: Mutex::new(()),
            output_path: Mutex::new(None),
            last_result: Mutex::new(None),
            cmd_tx,
            worker: Mutex::new(None),
        });

        let weak = Arc::downgrade(&recorder);
        match std::thread::Builder::new()
            .name("recorder-rebind".to_string())
            .spawn(move || worker_loop(weak, cmd_rx))
        {
            Ok(handle) => *recorder.worker.lock().unwrap() = Some(handle),
            Err(e) => error!("failed to start rebind worker: {}", e),
        }

        let weak = Arc::downgrade(&recorder);
        driver.set_target_listener(Box::new(move |event| {
            if let Some(recorder) = weak.upgrade() {
                recorder.on_target_event(event);
            }
        }));

        info!("recorder initialized");
        recorder
    }

    // ------------------------------------------------------------------
    // Driver event entry points (driver dispatch threads - enqueue only)
    // ------------------------------------------------------------------

    fn on_target_event(&self, event: TargetEvent) {
        match event {
            TargetEvent::Created(descriptor) => {
                if !descriptor.is_page() {
                    return;
                }
                debug!(
                    "page target created: {} ({})",
                    descriptor.id, descriptor.url
                );
                *self.last_created.lock().unwrap() = Some(descriptor.id.clone());

                if self.auto_rebind.load(Ordering::Acquire)
                    && self.recording.load(Ordering::Acquire)
                {
                    let current = self.current.lock().unwrap().clone();
                    if current.as_ref() != Some(&descriptor.id) {
                        self.enqueue(SwitchCommand::SwitchTo(descriptor.id));
                    }
                }
            }
            TargetEvent::Destroyed(target) => {
                debug!("target destroyed: {}", target);
                let is_current = self.current.lock().unwrap().as_ref() == Some(&target);
                if is_current {
                    self.enqueue(SwitchCommand::HandleLoss(target));
                } else {
                    self.enqueue(SwitchCommand::Release(target));
                }
            }
        }
    }

    fn enqueue(&self, command: SwitchCommand) {
        if self.cmd_tx.try_send(command).is_err() {
            warn!("rebind command queue full, dropping command");
        }
    }

    // ------------------------------------------------------------------
    // Recording lifecycle
    // ------------------------------------------------------------------

    /// Start recording the driver's current page target and the encoder
    /// subprocess behind it.
    pub fn start_recording(&self) -> Result<()> {
        if self.recording.load(Ordering::Acquire) {
            return Err(Error::InvalidState {
                expected: "idle recorder",
                actual: "already recording".to_string(),
            });
        }
        self.target_lost.store(false, Ordering::Release);

        let output = self.output_file_path()?;
        self.encode.start_processing(&output)?;

        let target = match self.initial_target() {
            Ok(target) => target,
            Err(e) => {
                self.encode.shutdown();
                return Err(e);
            }
        };

        {
            let _guard = self.switch_lock.lock().unwrap();
            if let Err(e) = self.start_capture_on(&target) {
                self.encode.shutdown();
                return Err(e);
            }
            *self.current.lock().unwrap() = Some(target.clone());
        }

        *self.output_path.lock().unwrap() = Some(output);
        self.recording.store(true, Ordering::Release);
        self.pacer.set_active(true);
        info!(
            "recording started on target {} ({})",
            target,
            self.video_speed.lock().unwrap().description()
        );
        Ok(())
    }

    /// Stop capture, drain and finalize the encoder, and return the path
    /// of the finished video. Raises [`Error::NoFramesCaptured`] when the
    /// run produced nothing - a zero-length video is never useful.
    pub fn stop_recording_and_generate_video(&self) -> Result<PathBuf> {
        let was_recording = self.recording.swap(false, Ordering::AcqRel);
        // A target-lost run stopped capturing on its own but still holds
        // the frames captured so far; finalizing those is allowed.
        if !was_recording && !self.target_lost.load(Ordering::Acquire) {
            return Err(Error::InvalidState {
                expected: "an active recording",
                actual: "idle".to_string(),
            });
        }
        self.pacer.set_active(false);

        {
            let _guard = self.switch_lock.lock().unwrap();
            if let Some(target) = self.current.lock().unwrap().take() {
                self.stop_capture_on(&target);
            }
        }

        let result = self.encode.finish_processing()?;
        if !result.success {
            // Reported in the result rather than raised; the caller still
            // gets the path of whatever the encoder managed to write.
            error!(
                "{}; video may be unusable",
                Error::EncoderProcess {
                    exit_code: result.exit_code.unwrap_or(-1)
                }
            );
        }
        info!(
            "recording finished: {} frames written, {} dropped, {} duplicates suppressed",
            result.frames_written,
            result.frames_dropped,
            self.capture.duplicates_suppressed()
        );
        *self.last_result.lock().unwrap() = Some(result);

        match self.output_path.lock().unwrap().clone() {
            Some(path) => Ok(path),
            None => Err(Error::InvalidState {
                expected: "a recorded output path",
                actual: "missing".to_string(),
            }),
        }
    }

    /// Manually move recording to the most recently created page target.
    /// For callers that disable auto-rebind and want deterministic
    /// control; runs synchronously relative to the caller.
    pub fn record_newly_opened_tab(&self) -> Result<()> {
        let target = self
            .last_created
            .lock()
            .unwrap()
            .clone()
            .ok_or(Error::InvalidState {
                expected: "a newly created page target",
                actual: "none observed".to_string(),
            })?;
        info!("manual rebind to most recently created target {}", target);
        self.switch_to(&target)
    }

    /// Enable or disable automatic rebinding to newly created tabs.
    pub fn set_auto_rebind_enabled(&self, enabled: bool) {
        self.auto_rebind.store(enabled, Ordering::Release);
        info!("auto-rebind {}", if enabled { "enabled" } else { "disabled" });
    }

    /// Change the playback speed preset. Only valid before the recording
    /// starts, since it reconfigures the encoder.
    pub fn set_video_speed(&self, speed: VideoSpeed) -> Result<()> {
        self.encode
            .configure(encoder_settings(&self.config, speed))?;
        *self.video_speed.lock().unwrap() = speed;
        info!("video speed set to {}", speed.description());
        Ok(())
    }

    // ------------------------------------------------------------------
    // Switching and recovery
    // ------------------------------------------------------------------

    fn switch_to(&self, target: &TargetId) -> Result<()> {
        let _guard = self.switch_lock.lock().unwrap();
        // Re-checked under the lock: a stop that raced ahead of a queued
        // switch must not leave a fresh session streaming into a finished
        // encode job.
        if !self.recording.load(Ordering::Acquire) {
            return Err(Error::InvalidState {
                expected: "an active recording",
                actual: "idle".to_string(),
            });
        }
        let old = self.current.lock().unwrap().clone();
        if old.as_ref() == Some(target) {
            debug!("already recording target {}", target);
            return Ok(());
        }

        if let Some(old_target) = old {
            // Best-effort: a failure to stop the old stream must not
            // prevent the new one from starting.
            self.stop_capture_on(&old_target);
        }

        self.start_capture_on(target)?;
        *self.current.lock().unwrap() = Some(target.clone());
        info!("recording switched to target {}", target);
        Ok(())
    }

    fn start_capture_on(&self, target: &TargetId) -> Result<()> {
        let session = self.pool.acquire(target)?;
        let handle = Arc::clone(session.handle());

        let started: Result<()> = (|| {
            handle.enable_instrumentation()?;
            handle.set_frame_listener(
                self.capture
                    .make_listener(target.clone(), Arc::clone(&handle)),
            );
            handle.start_frame_stream(&self.config.stream_options())?;
            Ok(())
        })();

        if let Err(e) = started {
            // The acquired session is always released, error path included.
            self.pool.release(session);
            return Err(e);
        }
        Ok(())
    }

    fn stop_capture_on(&self, target: &TargetId) {
        if let Some(session) = self.pool.get_active(target) {
            if let Err(e) = session.handle().stop_frame_stream() {
                warn!("failed to stop frame stream on {}: {}", target, e);
            }
            self.pool.release(session);
            info!(
                "stopped recording on target {} ({} frames captured from it)",
                target,
                self.capture.frames_for(target)
            );
        }
    }

    /// Recovery after the recorded target is destroyed: prefer any other
    /// page target, then the driver's root window, then one more
    /// enumeration pass before declaring the run target-lost.
    fn recover_from_loss(&self, lost: &TargetId) {
        warn!("recorded target {} destroyed, attempting recovery", lost);
        self.pool.release_target(lost);
        {
            let mut current = self.current.lock().unwrap();
            if current.as_ref() == Some(lost) {
                *current = None;
            }
        }
        if !self.recording.load(Ordering::Acquire) {
            return;
        }

        for pass in 0..2 {
            if !self.recording.load(Ordering::Acquire) {
                return;
            }
            if let Some(candidate) = self.find_replacement(lost) {
                match self.switch_to(&candidate) {
                    Ok(()) => {
                        info!("recovered recording onto target {}", candidate);
                        return;
                    }
                    Err(e) => warn!("switch to replacement {} failed: {}", candidate, e),
                }
            }
            if pass == 0 {
                // No replacement among the remaining targets: fall back to
                // the original/root window before the final retry.
                match self.driver.active_target() {
                    Ok(root) if &root != lost => match self.switch_to(&root) {
                        Ok(()) => {
                            info!("recovered recording onto root target {}", root);
                            return;
                        }
                        Err(e) => warn!("switch to root target {} failed: {}", root, e),
                    },
                    Ok(_) => debug!("root target resolves to the destroyed target"),
                    Err(e) => warn!("failed to resolve root target: {}", e),
                }
            }
        }

        self.target_lost.store(true, Ordering::Release);
        self.recording.store(false, Ordering::Release);
        self.pacer.set_active(false);
        error!(
            "{}",
            Error::TargetLoss(format!(
                "no recordable target remained after {} was destroyed",
                lost
            ))
        );
    }

    fn find_replacement(&self, excluding: &TargetId) -> Option<TargetId> {
        match self.driver.list_targets() {
            Ok(targets) => targets
                .into_iter()
                .filter(|t| t.is_page() && &t.id != excluding)
                .map(|t| t.id)
                .next(),
            Err(e) => {
                warn!("target enumeration failed during recovery: {}", e);
                None
            }
        }
    }

    fn initial_target(&self) -> Result<TargetId> {
        if let Ok(target) = self.driver.active_target() {
            return Ok(target);
        }
        self.driver
            .list_targets()?
            .into_iter()
            .find(|t| t.is_page())
            .map(|t| t.id)
            .ok_or_else(|| Error::Driver("no page target found".to_string()))
    }

    fn output_file_path(&self) -> Result<PathBuf> {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| Error::Driver(format!("system clock error: {e}")))?
            .as_secs();
        Ok(self
            .config
            .output_dir
            .join(format!("recording_{stamp}.mp4")))
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Acquire)
    }

    /// The run hit total target loss and recording stopped.
    pub fn is_target_lost(&self) -> bool {
        self.target_lost.load(Ordering::Acquire)
    }

    pub fn current_target(&self) -> Option<TargetId> {
        self.current.lock().unwrap().clone()
    }

    pub fn session_metrics(&self) -> SessionMetrics {
        self.pool.metrics()
    }

    pub fn capture_stats(&self) -> CaptureStats {
        self.capture.performance().stats()
    }

    pub fn frames_accepted(&self) -> u64 {
        self.capture.frames_accepted()
    }

    /// Accepted frames attributed to one target.
    pub fn frames_for(&self, target: &TargetId) -> u64 {
        self.capture.frames_for(target)
    }

    /// Result of the last finished encode run, if any.
    pub fn last_encode_result(&self) -> Option<EncodeResult> {
        self.last_result.lock().unwrap().clone()
    }

    /// Tear the engine down: stops any active recording (best-effort),
    /// then shuts down the worker, pipelines and pool.
    pub fn close(&self) {
        info!("closing recorder");
        if self.recording.load(Ordering::Acquire) {
            if let Err(e) = self.stop_recording_and_generate_video() {
                warn!("recording did not finalize cleanly during close: {}", e);
            }
        }

        let _ = self.cmd_tx.send(SwitchCommand::Shutdown);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }

        self.pacer.stop();
        self.capture.shutdown();
        self.encode.shutdown();
        self.pool.shutdown();
        info!("recorder closed");
    }
}

fn worker_loop(recorder: Weak<Recorder>, rx: Receiver<SwitchCommand>) {
    while let Ok(command) = rx.recv() {
        let Some(recorder) = recorder.upgrade() else {
            break;
        };
        match command {
            SwitchCommand::Shutdown => break,
            SwitchCommand::SwitchTo(target) => {
                if recorder.recording.load(Ordering::Acquire) {
                    if let Err(e) = recorder.switch_to(&target) {
                        error!("auto-rebind to {} failed: {}", target, e);
                    }
                }
            }
            SwitchCommand::HandleLoss(target) => recorder.recover_from_loss(&target),
            SwitchCommand::Release(target) => {
                debug!("background cleanup for destroyed target {}", target);
                recorder.pool.release_target(&target);
            }
        }
    }
}

fn encoder_settings(config: &RecorderConfig, speed: VideoSpeed) -> EncoderSettings {
    EncoderSettings {
        binary: config.encoder_binary.clone(),
        width: config.width,
        height: config.height,
        frame_rate: speed.frame_rate(),
        codec: config.codec.clone(),
        preset: config.preset.clone(),
        crf: config.crf,
        hardware_acceleration: config.hardware_acceleration,
    }
}
