// Adaptive capture pacing.
//
// The protocol only pushes frames on repaint, so visually idle stretches
// (a fixed wait inside a test step) would freeze the video for far less
// wall-clock time than actually elapsed. A periodic synthetic DOM mutation
// forces a repaint; a second periodic task tunes the trigger interval from
// the rolling capture performance window. Either mechanism self-disables
// after repeated failures and the pipeline falls back to natural repaints.

use crate::capture::perf::PerformanceWindow;
use crate::config::RecorderConfig;
use crate::driver::InstrumentationDriver;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Minimum window samples before the adjuster acts.
const MIN_SAMPLES_FOR_ADJUSTMENT: usize = 5;

/// Script injected to force a repaint: a sub-pixel transform flip on a
/// near-invisible element, plus a periodic forced layout as a backstop.
pub(crate) const TRIGGER_SCRIPT: &str = r#"
(function () {
    try {
        if (!window.__pagecastTick) {
            window.__pagecastTick = 0;
        }
        window.__pagecastTick++;

        var trigger = document.getElementById('pagecast-repaint-trigger');
        if (!trigger) {
            trigger = document.createElement('div');
            trigger.id = 'pagecast-repaint-trigger';
            trigger.style.cssText = 'position:absolute;top:-1px;left:-1px;' +
                'width:1px;height:1px;opacity:0.01;pointer-events:none;';
            document.body.appendChild(trigger);
        }
        trigger.setAttribute('data-tick', window.__pagecastTick);
        trigger.style.transform = 'translateZ(' + (window.__pagecastTick % 2) + 'px)';

        if (window.__pagecastTick % 10 === 0) {
            void document.body.offsetHeight;
        }
        return 'ok';
    } catch (e) {
        return 'error: ' + e.message;
    }
})();
"#;

/// Explicit enabled/disabled state of a fallback-capable mechanism, with
/// its failure budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MechanismState {
    Enabled { failures: u32 },
    Disabled,
}

impl MechanismState {
    fn new() -> Self {
        MechanismState::Enabled { failures: 0 }
    }

    pub fn is_enabled(self) -> bool {
        matches!(self, MechanismState::Enabled { .. })
    }

    /// Count a failure; returns `true` when this failure crossed the
    /// threshold and disabled the mechanism.
    fn record_failure(&mut self, limit: u32) -> bool {
        match *self {
            MechanismState::Enabled { failures } => {
                let failures = failures + 1;
                if failures >= limit {
                    *self = MechanismState::Disabled;
                    true
                } else {
                    *self = MechanismState::Enabled { failures };
                    false
                }
            }
            MechanismState::Disabled => false,
        }
    }

    fn record_success(&mut self) {
        if let MechanismState::Enabled { .. } = *self {
            *self = MechanismState::Enabled { failures: 0 };
        }
    }
}

pub struct AdaptivePacer {
    driver: Arc<dyn InstrumentationDriver>,
    perf: Arc<PerformanceWindow>,

    interval_ms: AtomicU64,
    min_interval_ms: u64,
    max_interval_ms: u64,
    increase_step_ms: u64,
    decrease_step_ms: u64,
    success_rate_floor: f64,
    speed_up_rate: f64,
    adjust_period: Duration,
    trigger_failure_limit: u32,
    timer_failure_limit: u32,

    trigger_state: Mutex<MechanismState>,
    timer_state: Mutex<MechanismState>,
    active: AtomicBool,

    shutdown_tx: Mutex<Option<Sender<()>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl AdaptivePacer {
    pub fn new(
        driver: Arc<dyn InstrumentationDriver>,
        perf: Arc<PerformanceWindow>,
        config: &RecorderConfig,
    ) -> Arc<Self> {
        Arc::new(AdaptivePacer {
            driver,
            perf,
            interval_ms: AtomicU64::new(config.capture_interval.as_millis() as u64),
            min_interval_ms: config.min_capture_interval.as_millis() as u64,
            max_interval_ms: config.max_capture_interval.as_millis() as u64,
            increase_step_ms: config.interval_increase_step.as_millis() as u64,
            decrease_step_ms: config.interval_decrease_step.as_millis() as u64,
            success_rate_floor: config.success_rate_floor,
            speed_up_rate: config.speed_up_rate,
            adjust_period: config.adjust_period,
            trigger_failure_limit: config.trigger_failure_limit,
            timer_failure_limit: config.timer_failure_limit,
            trigger_state: Mutex::new(MechanismState::new()),
            timer_state: Mutex::new(MechanismState::new()),
            active: AtomicBool::new(false),
            shutdown_tx: Mutex::new(None),
            threads: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the trigger and adjuster threads. Triggers only fire while
    /// the pacer is marked active.
    pub fn start(self: &Arc<Self>) {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(2);
        *self.shutdown_tx.lock().unwrap() = Some(shutdown_tx);

        let mut threads = self.threads.lock().unwrap();

        let pacer = Arc::clone(self);
        let rx = shutdown_rx.clone();
        if let Ok(handle) = std::thread::Builder::new()
            .name("pacer-trigger".to_string())
            .spawn(move || pacer.trigger_loop(rx))
        {
            threads.push(handle);
        }

        let pacer = Arc::clone(self);
        if let Ok(handle) = std::thread::Builder::new()
            .name("pacer-adjust".to_string())
            .spawn(move || pacer.adjust_loop(shutdown_rx))
        {
            threads.push(handle);
        }
    }

    /// Gate for the synthetic trigger: only fire while a recording is
    /// live.
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    pub fn current_interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(Ordering::Relaxed))
    }

    pub fn trigger_state(&self) -> MechanismState {
        *self.trigger_state.lock().unwrap()
    }

    pub fn timer_state(&self) -> MechanismState {
        *self.timer_state.lock().unwrap()
    }

    fn trigger_loop(&self, shutdown_rx: Receiver<()>) {
        loop {
            let interval = Duration::from_millis(self.interval_ms.load(Ordering::Relaxed));
            match shutdown_rx.recv_timeout(interval) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
            if !self.active.load(Ordering::Acquire) {
                continue;
            }
            if !self.trigger_state.lock().unwrap().is_enabled()
                || !self.timer_state.lock().unwrap().is_enabled()
            {
                continue;
            }
            self.fire_trigger();
        }
    }

    fn fire_trigger(&self) {
        match self.driver.execute_script(TRIGGER_SCRIPT) {
            Ok(result) if result.starts_with("error") => {
                warn!("repaint trigger script failed: {}", result);
                self.record_trigger_failure();
            }
            Ok(_) => {
                self.trigger_state.lock().unwrap().record_success();
                self.timer_state.lock().unwrap().record_success();
            }
            Err(e) => {
                warn!("repaint trigger execution failed: {}", e);
                self.record_trigger_failure();
                self.record_timer_failure();
            }
        }
    }

    fn record_trigger_failure(&self) {
        if self
            .trigger_state
            .lock()
            .unwrap()
            .record_failure(self.trigger_failure_limit)
        {
            error!("disabling DOM repaint triggers after repeated failures");
        }
    }

    fn record_timer_failure(&self) {
        if self
            .timer_state
            .lock()
            .unwrap()
            .record_failure(self.timer_failure_limit)
        {
            error!("disabling timed capture after repeated failures, relying on natural repaints");
        }
    }

    fn adjust_loop(&self, shutdown_rx: Receiver<()>) {
        loop {
            match shutdown_rx.recv_timeout(self.adjust_period) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
            if let Some(new_interval) = self.compute_adjustment() {
                let old = self.interval_ms.swap(new_interval, Ordering::Relaxed);
                if new_interval != old {
                    info!(
                        "adjusted capture interval from {}ms to {}ms",
                        old, new_interval
                    );
                }
            }
        }
    }

    /// Decide the next trigger interval from recent capture performance.
    /// Returns `None` when there is not enough data to act on.
    fn compute_adjustment(&self) -> Option<u64> {
        if self.perf.sample_count() < MIN_SAMPLES_FOR_ADJUSTMENT {
            return None;
        }
        let success_rate = self.perf.success_rate()?;
        let avg_ms = self.perf.avg_processing().as_millis() as u64;
        let current = self.interval_ms.load(Ordering::Relaxed);

        if success_rate < self.success_rate_floor {
            let slower = (current + self.increase_step_ms).min(self.max_interval_ms);
            if slower != current {
                warn!(
                    "poor capture performance ({:.1}%), increasing interval to {}ms",
                    success_rate * 100.0,
                    slower
                );
            }
            Some(slower)
        } else if success_rate > self.speed_up_rate && avg_ms < current / 2 {
            let faster = current
                .saturating_sub(self.decrease_step_ms)
                .max(self.min_interval_ms);
            if faster != current {
                debug!(
                    "capture performance headroom, decreasing interval to {}ms",
                    faster
                );
            }
            Some(faster)
        } else {
            Some(current)
        }
    }

    pub fn stop(&self) {
        drop(self.shutdown_tx.lock().unwrap().take());
        let mut threads = self.threads.lock().unwrap();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }
}
