// Streaming encode pipeline.
//
// Frames are piped to an external encoder subprocess as raw RGB24 over its
// stdin while capture is still running; nothing is spooled to disk first.
// A bounded queue decouples frame arrival rate from encode throughput, and
// a single consumer thread preserves frame order into the encoder.

use crate::capture::FrameSink;
use crate::encode::frame_queue::FrameQueue;
use crate::encode::monitor::spawn_stderr_monitor;
use crate::error::{Error, Result};
use crate::frame::CapturedFrame;
use crossbeam_channel::{bounded, Receiver, Sender};
use image::imageops::FilterType;
use image::RgbImage;
use log::{debug, error, info, warn};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const TAKE_POLL: Duration = Duration::from_secs(1);
const DROP_WARN_EVERY: u64 = 10;
const PROGRESS_LOG_EVERY: u64 = 50;

// ============================================================================
// State machine
// ============================================================================

/// Encode job lifecycle. Transitions are monotonic; no state is revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeState {
    Idle,
    Starting,
    Processing,
    Finishing,
    Completed,
    Error,
    ShuttingDown,
}

impl EncodeState {
    fn as_usize(self) -> usize {
        match self {
            EncodeState::Idle => 0,
            EncodeState::Starting => 1,
            EncodeState::Processing => 2,
            EncodeState::Finishing => 3,
            EncodeState::Completed => 4,
            EncodeState::Error => 5,
            EncodeState::ShuttingDown => 6,
        }
    }

    fn from_usize(value: usize) -> EncodeState {
        match value {
            0 => EncodeState::Idle,
            1 => EncodeState::Starting,
            2 => EncodeState::Processing,
            3 => EncodeState::Finishing,
            4 => EncodeState::Completed,
            5 => EncodeState::Error,
            _ => EncodeState::ShuttingDown,
        }
    }
}

// ============================================================================
// Settings and result
// ============================================================================

/// Encoder subprocess configuration.
#[derive(Debug, Clone)]
pub struct EncoderSettings {
    pub binary: PathBuf,
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    pub codec: String,
    pub preset: String,
    pub crf: u32,
    pub hardware_acceleration: bool,
}

impl EncoderSettings {
    /// Command line for the encoder: raw RGB24 on stdin at the configured
    /// dimensions and rate, codec settings, even-dimension padding for
    /// picky codecs, fast-start container flags.
    pub(crate) fn build_args(&self, output: &Path) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-y".into(),
            "-f".into(),
            "rawvideo".into(),
            "-pix_fmt".into(),
            "rgb24".into(),
            "-s".into(),
            format!("{}x{}", self.width, self.height),
            "-r".into(),
            format!("{}", self.frame_rate),
            "-i".into(),
            "pipe:0".into(),
        ];

        if self.hardware_acceleration {
            args.push("-hwaccel".into());
            if cfg!(target_os = "macos") {
                args.push("videotoolbox".into());
            } else if cfg!(target_os = "windows") {
                args.push("dxva2".into());
            } else {
                args.push("vaapi".into());
            }
        }

        args.push("-c:v".into());
        args.push(self.codec.clone());
        if self.codec == "libx264" || self.codec == "libx265" {
            args.push("-preset".into());
            args.push(self.preset.clone());
            args.push("-crf".into());
            args.push(self.crf.to_string());
        }

        args.push("-pix_fmt".into());
        args.push("yuv420p".into());
        args.push("-movflags".into());
        args.push("+faststart".into());
        args.push("-threads".into());
        args.push("0".into());
        args.push("-vf".into());
        args.push("pad=ceil(iw/2)*2:ceil(ih/2)*2,format=yuv420p".into());
        args.push(output.to_string_lossy().into_owned());

        args
    }
}

/// Outcome of one encode run, returned by `finish_processing`. A non-zero
/// encoder exit is reported here rather than raised.
#[derive(Debug, Clone)]
pub struct EncodeResult {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub frames_written: u64,
    pub frames_dropped: u64,
    pub avg_processing_ms: f64,
    pub total_processing_ms: u64,
}

// ============================================================================
// Pipeline
// ============================================================================

pub struct EncodePipeline {
    state: AtomicUsize,
    settings: Mutex<EncoderSettings>,
    queue: Arc<FrameQueue>,
    drain_timeout: Duration,

    child: Mutex<Option<Child>>,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
    consumer_done: Mutex<Option<Receiver<()>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    last_progress: Arc<Mutex<Option<String>>>,

    frames_written: Arc<AtomicU64>,
    total_processing_us: Arc<AtomicU64>,
    max_processing_us: Arc<AtomicU64>,
}

impl EncodePipeline {
    pub fn new(settings: EncoderSettings, queue_capacity: usize, drain_timeout: Duration) -> Self {
        EncodePipeline {
            state: AtomicUsize::new(EncodeState::Idle.as_usize()),
            settings: Mutex::new(settings),
            queue: Arc::new(FrameQueue::new(queue_capacity)),
            drain_timeout,
            child: Mutex::new(None),
            stdin: Arc::new(Mutex::new(None)),
            consumer: Mutex::new(None),
            consumer_done: Mutex::new(None),
            monitor: Mutex::new(None),
            last_progress: Arc::new(Mutex::new(None)),
            frames_written: Arc::new(AtomicU64::new(0)),
            total_processing_us: Arc::new(AtomicU64::new(0)),
            max_processing_us: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn state(&self) -> EncodeState {
        EncodeState::from_usize(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: EncodeState, to: EncodeState) -> bool {
        self.state
            .compare_exchange(
                from.as_usize(),
                to.as_usize(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn force_state(&self, to: EncodeState) {
        self.state.store(to.as_usize(), Ordering::Release);
    }

    /// Replace the encoder settings. Only valid while idle.
    pub fn configure(&self, settings: EncoderSettings) -> Result<()> {
        let state = self.state();
        if state != EncodeState::Idle {
            return Err(Error::InvalidState {
                expected: "idle",
                actual: format!("{:?}", state),
            });
        }
        info!(
            "encoder configured: {}x{} @ {} fps, codec={}, preset={}, hwaccel={}",
            settings.width,
            settings.height,
            settings.frame_rate,
            settings.codec,
            settings.preset,
            settings.hardware_acceleration
        );
        *self.settings.lock().unwrap() = settings;
        Ok(())
    }

    /// Spawn the encoder subprocess and the consumer thread, then accept
    /// frames. Valid only in the idle state.
    pub fn start_processing(&self, output: &Path) -> Result<()> {
        if !self.transition(EncodeState::Idle, EncodeState::Starting) {
            return Err(Error::InvalidState {
                expected: "idle",
                actual: format!("{:?}", self.state()),
            });
        }

        if let Some(parent) = output.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let settings = self.settings.lock().unwrap().clone();
        let args = settings.build_args(output);
        info!(
            "starting encoder: {} {}",
            settings.binary.display(),
            args.join(" ")
        );

        let mut child = match Command::new(&settings.binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                self.force_state(EncodeState::Error);
                error!("failed to spawn encoder {}: {}", settings.binary.display(), e);
                return Err(e.into());
            }
        };

        let stdin = match child.stdin.take() {
            Some(stdin) => stdin,
            None => {
                let _ = child.kill();
                self.force_state(EncodeState::Error);
                return Err(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "encoder stdin was not captured",
                )
                .into());
            }
        };
        *self.stdin.lock().unwrap() = Some(stdin);

        if let Some(stderr) = child.stderr.take() {
            let handle = spawn_stderr_monitor(stderr, Arc::clone(&self.last_progress))?;
            *self.monitor.lock().unwrap() = Some(handle);
        }
        *self.child.lock().unwrap() = Some(child);

        let (done_tx, done_rx) = bounded(1);
        *self.consumer_done.lock().unwrap() = Some(done_rx);
        let consumer = self.spawn_consumer(settings, done_tx)?;
        *self.consumer.lock().unwrap() = Some(consumer);

        self.force_state(EncodeState::Processing);
        info!("encode pipeline processing to {}", output.display());
        Ok(())
    }

    fn spawn_consumer(
        &self,
        settings: EncoderSettings,
        done_tx: Sender<()>,
    ) -> Result<JoinHandle<()>> {
        let queue = Arc::clone(&self.queue);
        let stdin = Arc::clone(&self.stdin);
        let frames_written = Arc::clone(&self.frames_written);
        let total_us = Arc::clone(&self.total_processing_us);
        let max_us = Arc::clone(&self.max_processing_us);

        let handle = std::thread::Builder::new()
            .name("encode-consumer".to_string())
            .spawn(move || {
                loop {
                    let frame = match queue.take(TAKE_POLL) {
                        Some(frame) => frame,
                        None => {
                            if queue.is_end_of_stream() {
                                debug!("encode consumer drained, exiting");
                                break;
                            }
                            continue;
                        }
                    };

                    let started = Instant::now();
                    let raw = to_raw_rgb24(frame.image, settings.width, settings.height);

                    let write_result = {
                        let mut guard = stdin.lock().unwrap();
                        match guard.as_mut() {
                            Some(pipe) => pipe.write_all(&raw).and_then(|_| pipe.flush()),
                            None => break,
                        }
                    };

                    match write_result {
                        Ok(()) => {
                            let written = frames_written.fetch_add(1, Ordering::Relaxed) + 1;
                            let us = started.elapsed().as_micros() as u64;
                            total_us.fetch_add(us, Ordering::Relaxed);
                            max_us.fetch_max(us, Ordering::Relaxed);
                            if written % PROGRESS_LOG_EVERY == 0 {
                                info!("encoded frame {} ({} us)", written, us);
                            }
                        }
                        Err(e) => {
                            error!("failed to write frame {} to encoder: {}", frame.seq, e);
                            break;
                        }
                    }
                }
                let _ = done_tx.send(());
            })?;
        Ok(handle)
    }

    /// Offer a frame for encoding. Only accepted while processing; a full
    /// queue drops the frame rather than blocking the caller.
    pub fn add_frame(&self, frame: CapturedFrame) -> bool {
        let state = self.state();
        if state != EncodeState::Processing {
            warn!(
                "frame {} rejected, encoder not processing (state {:?})",
                frame.seq, state
            );
            return false;
        }

        let seq = frame.seq;
        if self.queue.offer(frame) {
            true
        } else {
            let dropped = self.queue.dropped();
            if dropped % DROP_WARN_EVERY == 0 {
                warn!(
                    "encode queue full, dropped frame {} ({} dropped total)",
                    seq, dropped
                );
            }
            false
        }
    }

    /// Drain the queue, close the encoder's input and wait for it to exit.
    /// Returns the run result; a non-zero exit code is reported in the
    /// result, zero frames ever written is an error.
    pub fn finish_processing(&self) -> Result<EncodeResult> {
        if !self.transition(EncodeState::Processing, EncodeState::Finishing) {
            return Err(Error::InvalidState {
                expected: "processing",
                actual: format!("{:?}", self.state()),
            });
        }
        info!("finishing encode: draining {} queued frames", self.queue.len());

        self.queue.signal_end_of_stream();

        if let Some(done) = self.consumer_done.lock().unwrap().take() {
            if done.recv_timeout(self.drain_timeout).is_err() {
                warn!(
                    "encode consumer did not drain within {:?}, continuing",
                    self.drain_timeout
                );
            }
        }
        if let Some(handle) = self.consumer.lock().unwrap().take() {
            let _ = handle.join();
        }

        // Closing stdin signals the encoder that input is complete.
        drop(self.stdin.lock().unwrap().take());

        let exit_code = match self.child.lock().unwrap().take() {
            Some(mut child) => match child.wait() {
                Ok(status) => status.code(),
                Err(e) => {
                    error!("failed waiting for encoder exit: {}", e);
                    None
                }
            },
            None => None,
        };
        if let Some(handle) = self.monitor.lock().unwrap().take() {
            let _ = handle.join();
        }

        let frames_written = self.frames_written.load(Ordering::Relaxed);
        if frames_written == 0 {
            self.force_state(EncodeState::Error);
            return Err(Error::NoFramesCaptured);
        }

        let success = exit_code == Some(0);
        self.force_state(if success {
            EncodeState::Completed
        } else {
            EncodeState::Error
        });

        let total_us = self.total_processing_us.load(Ordering::Relaxed);
        let result = EncodeResult {
            success,
            exit_code,
            frames_written,
            frames_dropped: self.queue.dropped(),
            avg_processing_ms: total_us as f64 / frames_written as f64 / 1000.0,
            total_processing_ms: total_us / 1000,
        };

        if success {
            info!(
                "encode completed: {} frames written, {} dropped",
                result.frames_written, result.frames_dropped
            );
        } else {
            error!("encoder exited with code {:?}", exit_code);
        }
        Ok(result)
    }

    /// Abrupt teardown: force-close the encoder and discard buffered
    /// frames. Available in any state.
    pub fn shutdown(&self) {
        let state = self.state();
        if state == EncodeState::ShuttingDown {
            return;
        }
        info!("encode pipeline shutting down from {:?}", state);
        self.force_state(EncodeState::ShuttingDown);

        self.queue.signal_end_of_stream();
        drop(self.stdin.lock().unwrap().take());

        if let Some(mut child) = self.child.lock().unwrap().take() {
            if let Err(e) = child.kill() {
                debug!("encoder kill failed (may have exited): {}", e);
            }
            let _ = child.wait();
        }

        self.queue.clear();

        if let Some(done) = self.consumer_done.lock().unwrap().take() {
            let _ = done.recv_timeout(Duration::from_secs(1));
        }
        if let Some(handle) = self.consumer.lock().unwrap().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.monitor.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.queue.dropped()
    }

    /// Most recent progress line reported by the encoder, if any.
    pub fn last_progress(&self) -> Option<String> {
        self.last_progress.lock().unwrap().clone()
    }
}

impl FrameSink for EncodePipeline {
    fn submit(&self, frame: CapturedFrame) -> bool {
        self.add_frame(frame)
    }
}

/// Resize to the configured output dimensions if needed and flatten to the
/// exact `width * height * 3` bytes the encoder expects.
fn to_raw_rgb24(image: RgbImage, width: u32, height: u32) -> Vec<u8> {
    if image.width() == width && image.height() == height {
        image.into_raw()
    } else {
        image::imageops::resize(&image, width, height, FilterType::Triangle).into_raw()
    }
}
