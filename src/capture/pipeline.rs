// Frame capture pipeline.
//
// Turns the raw, possibly-duplicated, bursty stream of frame-ready events
// into a clean, monotonically sequenced stream of accepted frames. The
// driver callback path only fingerprints and enqueues; decoding and
// validation happen on a bounded worker pool so the event-dispatch thread
// is never blocked. Every event is acknowledged to the driver whether
// processing succeeds or fails - an unacknowledged frame stalls the whole
// stream.

use crate::capture::perf::PerformanceWindow;
use crate::config::RecorderConfig;
use crate::driver::{FrameEvent, FrameListener, InstrumentationSession, TargetId};
use crate::error::Error;
use crate::frame::CapturedFrame;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use dashmap::DashMap;
use image::RgbImage;
use log::{debug, error, warn};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const STATUS_RUN: usize = 1;
const STATUS_END: usize = 2;

const WORKER_POLL: Duration = Duration::from_millis(200);
/// Pending decode jobs beyond this are discarded (and acknowledged) so the
/// driver callback never blocks behind a saturated worker pool.
const WORK_QUEUE_CAPACITY: usize = 256;
/// Fingerprint map is pruned once it grows past this many entries.
const FINGERPRINT_PRUNE_LEN: usize = 100;
/// Entries older than this many dedup windows are pruned.
const FINGERPRINT_MAX_AGE_WINDOWS: u32 = 10;

/// Destination for accepted frames. Returns `false` when the frame could
/// not be taken (the sink accounts for its own drops).
pub trait FrameSink: Send + Sync {
    fn submit(&self, frame: CapturedFrame) -> bool;
}

struct FrameJob {
    target: TargetId,
    session: Arc<dyn InstrumentationSession>,
    event: FrameEvent,
    fingerprint: [u8; 32],
    received: Instant,
}

pub struct FrameCapturePipeline {
    sink: Arc<dyn FrameSink>,
    perf: Arc<PerformanceWindow>,

    seq: AtomicU64,
    /// Held across sequence assignment and sink hand-off so the encoder
    /// receives frames in acceptance order even with parallel workers.
    accept_lock: Mutex<()>,
    seen: DashMap<[u8; 32], Instant>,
    per_target: DashMap<TargetId, u64>,
    dedup_window: Duration,
    min_frame_dim: u32,
    uniform_sample_dim: u32,

    duplicates: AtomicU64,
    failures: AtomicU64,

    work_tx: Sender<FrameJob>,
    status: Arc<AtomicUsize>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl FrameCapturePipeline {
    pub fn new(sink: Arc<dyn FrameSink>, config: &RecorderConfig) -> Arc<Self> {
        let (work_tx, work_rx) = bounded(WORK_QUEUE_CAPACITY);
        let pipeline = Arc::new(FrameCapturePipeline {
            sink,
            perf: Arc::new(PerformanceWindow::new(config.adaptive_window_size)),
            seq: AtomicU64::new(0),
            accept_lock: Mutex::new(()),
            seen: DashMap::new(),
            per_target: DashMap::new(),
            dedup_window: config.dedup_window,
            min_frame_dim: config.min_frame_dim,
            uniform_sample_dim: config.uniform_sample_dim,
            duplicates: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            work_tx,
            status: Arc::new(AtomicUsize::new(STATUS_RUN)),
            workers: Mutex::new(Vec::new()),
        });
        pipeline.spawn_workers(config.worker_threads.max(1), work_rx);
        pipeline
    }

    fn spawn_workers(self: &Arc<Self>, count: usize, work_rx: Receiver<FrameJob>) {
        let mut workers = self.workers.lock().unwrap();
        for i in 0..count {
            let pipeline = Arc::clone(self);
            let rx = work_rx.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("frame-worker-{i}"))
                .spawn(move || pipeline.worker_loop(rx));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => error!("failed to spawn frame worker: {}", e),
            }
        }
    }

    /// Rolling performance window, shared with the adaptive pacer.
    pub fn performance(&self) -> Arc<PerformanceWindow> {
        Arc::clone(&self.perf)
    }

    /// Build the frame listener to register on a session. The returned
    /// closure runs on a driver dispatch thread and never blocks.
    pub fn make_listener(
        self: &Arc<Self>,
        target: TargetId,
        session: Arc<dyn InstrumentationSession>,
    ) -> FrameListener {
        let pipeline = Arc::clone(self);
        Box::new(move |event| {
            pipeline.on_frame_event(target.clone(), Arc::clone(&session), event);
        })
    }

    fn on_frame_event(
        &self,
        target: TargetId,
        session: Arc<dyn InstrumentationSession>,
        event: FrameEvent,
    ) {
        let fingerprint = fingerprint_payload(&event.data);

        if self.is_duplicate(fingerprint) {
            debug!("duplicate frame suppressed for target {}", target);
            self.duplicates.fetch_add(1, Ordering::Relaxed);
            acknowledge(&session, &event);
            return;
        }

        let job = FrameJob {
            target,
            session,
            event,
            fingerprint,
            received: Instant::now(),
        };
        match self.work_tx.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(job)) | Err(TrySendError::Disconnected(job)) => {
                // The worker pool is saturated; the frame is lost but the
                // driver must still be unblocked.
                warn!("frame worker queue full, discarding frame for {}", job.target);
                self.failures.fetch_add(1, Ordering::Relaxed);
                acknowledge(&job.session, &job.event);
            }
        }
    }

    /// Identical payload seen within the recency window?
    fn is_duplicate(&self, fingerprint: [u8; 32]) -> bool {
        let now = Instant::now();
        if let Some(last_seen) = self.seen.get(&fingerprint) {
            if now.duration_since(*last_seen) < self.dedup_window {
                return true;
            }
        }
        self.seen.insert(fingerprint, now);
        if self.seen.len() > FINGERPRINT_PRUNE_LEN {
            let max_age = self.dedup_window * FINGERPRINT_MAX_AGE_WINDOWS;
            self.seen
                .retain(|_, seen_at| now.duration_since(*seen_at) <= max_age);
        }
        false
    }

    fn worker_loop(&self, rx: Receiver<FrameJob>) {
        loop {
            match rx.recv_timeout(WORKER_POLL) {
                Ok(job) => self.process_job(job),
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                    if self.status.load(Ordering::Acquire) == STATUS_END {
                        break;
                    }
                }
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    fn process_job(&self, job: FrameJob) {
        let started = Instant::now();
        let mut success = false;

        match self.decode_and_validate(&job.event) {
            Ok(image) => {
                // Acceptance is atomic: sequence assignment and hand-off
                // to the sink happen under one lock, decode stays parallel.
                let seq = {
                    let _guard = self.accept_lock.lock().unwrap();
                    let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
                    let frame = CapturedFrame {
                        seq,
                        target: job.target.clone(),
                        captured_at: job.received,
                        image,
                        fingerprint: job.fingerprint,
                    };
                    if !self.sink.submit(frame) {
                        debug!("sink refused frame {} from {}", seq, job.target);
                    }
                    seq
                };
                *self.per_target.entry(job.target.clone()).or_insert(0) += 1;
                debug!("accepted frame {} from {}", seq, job.target);
                success = true;
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!("dropped frame from {}: {}", job.target, e);
            }
        }

        // Acknowledge in every path or the driver stops sending frames.
        acknowledge(&job.session, &job.event);
        self.perf.record(started.elapsed(), success);
    }

    fn decode_and_validate(&self, event: &FrameEvent) -> crate::error::Result<RgbImage> {
        let bytes = BASE64
            .decode(&event.data[..])
            .map_err(|e| Error::FrameProcessing(format!("payload is not valid base64: {e}")))?;
        let image = image::load_from_memory(&bytes)
            .map_err(|e| Error::FrameProcessing(format!("payload is not a decodable image: {e}")))?
            .to_rgb8();

        if image.width() < self.min_frame_dim || image.height() < self.min_frame_dim {
            return Err(Error::FrameProcessing(format!(
                "implausible dimensions {}x{}",
                image.width(),
                image.height()
            )));
        }
        if is_uniform_sample(&image, self.uniform_sample_dim) {
            return Err(Error::FrameProcessing(
                "uniform sample region, likely blank or corrupt capture".to_string(),
            ));
        }
        Ok(image)
    }

    /// Frames accepted so far (equals the highest assigned sequence
    /// number).
    pub fn frames_accepted(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    pub fn duplicates_suppressed(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Accepted-frame count attributed to one target.
    pub fn frames_for(&self, target: &TargetId) -> u64 {
        self.per_target.get(target).map(|c| *c).unwrap_or(0)
    }

    pub fn shutdown(&self) {
        self.status.store(STATUS_END, Ordering::Release);
        let mut workers = self.workers.lock().unwrap();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
        self.seen.clear();
    }
}

fn fingerprint_payload(data: &[u8]) -> [u8; 32] {
    let digest = Sha256::digest(data);
    digest.into()
}

fn acknowledge(session: &Arc<dyn InstrumentationSession>, event: &FrameEvent) {
    if let Err(e) = session.acknowledge_frame(&event.session_id) {
        error!("failed to acknowledge frame: {}", e);
    }
}

/// Heuristic for a blank or corrupt capture: every pixel in the top-left
/// sample region is identical.
fn is_uniform_sample(image: &RgbImage, sample_dim: u32) -> bool {
    let w = image.width().min(sample_dim);
    let h = image.height().min(sample_dim);
    if w == 0 || h == 0 {
        return true;
    }
    let first = image.get_pixel(0, 0);
    for y in 0..h {
        for x in 0..w {
            if image.get_pixel(x, y) != first {
                return false;
            }
        }
    }
    true
}
