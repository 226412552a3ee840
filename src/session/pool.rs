// Instrumentation session pool.
//
// Session creation against a live browser is the single largest source of
// end-to-end latency and intermittent failure in this domain. The pool
// hides it: generic sessions are pre-warmed and re-bound on demand, fresh
// creation runs under a hard timeout, and failures are retried with
// strictly increasing backoff. A background monitor evicts unhealthy or
// aged sessions and keeps the pool topped up.

use crate::config::RecorderConfig;
use crate::driver::{InstrumentationDriver, InstrumentationSession, TargetId};
use crate::error::{Error, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use dashmap::DashMap;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// A session currently bound to a target. Owned by whichever target holds
/// it; returned to the pool (if healthy) or discarded on release.
pub struct RecordingSession {
    target: TargetId,
    handle: Arc<dyn InstrumentationSession>,
    created: Instant,
    pooled: bool,
}

impl std::fmt::Debug for RecordingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingSession")
            .field("target", &self.target)
            .field("created", &self.created)
            .field("pooled", &self.pooled)
            .finish_non_exhaustive()
    }
}

impl RecordingSession {
    pub fn target(&self) -> &TargetId {
        &self.target
    }

    pub fn handle(&self) -> &Arc<dyn InstrumentationSession> {
        &self.handle
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    pub fn is_healthy(&self) -> bool {
        self.handle.is_healthy()
    }

    /// Whether this session came from the pre-warmed pool rather than a
    /// fresh creation.
    pub fn was_pooled(&self) -> bool {
        self.pooled
    }
}

/// Session creation metrics, for operational visibility.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionMetrics {
    pub attempts: u64,
    pub successes: u64,
    pub max_creation_ms: u64,
    pub avg_creation_ms: f64,
}

impl SessionMetrics {
    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.successes as f64 / self.attempts as f64
        }
    }
}

pub struct SessionPool {
    driver: Arc<dyn InstrumentationDriver>,

    pool_tx: Sender<Arc<dyn InstrumentationSession>>,
    pool_rx: Receiver<Arc<dyn InstrumentationSession>>,
    active: DashMap<TargetId, Arc<RecordingSession>>,

    pool_size: usize,
    pool_wait: Duration,
    session_timeout: Duration,
    max_retries: u32,
    retry_delay: Duration,
    max_age: Duration,

    attempts: AtomicU64,
    successes: AtomicU64,
    max_creation_us: AtomicU64,
    total_creation_us: AtomicU64,

    shutdown_tx: Mutex<Option<Sender<()>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl SessionPool {
    pub fn new(driver: Arc<dyn InstrumentationDriver>, config: &RecorderConfig) -> Arc<Self> {
        let (pool_tx, pool_rx) = bounded(config.pool_size.max(1));
        let pool = Arc::new(SessionPool {
            driver,
            pool_tx,
            pool_rx,
            active: DashMap::new(),
            pool_size: config.pool_size,
            pool_wait: config.pool_wait,
            session_timeout: config.session_timeout,
            max_retries: config.session_max_retries,
            retry_delay: config.session_retry_delay,
            max_age: config.session_max_age,
            attempts: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            max_creation_us: AtomicU64::new(0),
            total_creation_us: AtomicU64::new(0),
            shutdown_tx: Mutex::new(None),
            monitor: Mutex::new(None),
        });
        pool.start_health_monitor(config.health_check_interval);
        pool
    }

    /// Eagerly create `n` generic sessions in parallel. Partial success is
    /// acceptable; sessions that miss the deadline simply arrive later (or
    /// not at all).
    pub fn prewarm(&self, n: usize, timeout: Duration) {
        if n == 0 {
            return;
        }
        info!("pre-warming {} instrumentation sessions", n);
        let (done_tx, done_rx) = bounded(n);
        for i in 0..n {
            let driver = Arc::clone(&self.driver);
            let pool_tx = self.pool_tx.clone();
            let done_tx = done_tx.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("session-prewarm-{i}"))
                .spawn(move || {
                    match driver.create_session(None) {
                        Ok(session) => {
                            if pool_tx.try_send(session).is_ok() {
                                debug!("pre-warmed session added to pool");
                            }
                        }
                        Err(e) => warn!("failed to pre-warm session: {}", e),
                    }
                    let _ = done_tx.send(());
                });
            if let Err(e) = spawned {
                warn!("failed to spawn pre-warm thread: {}", e);
            }
        }
        drop(done_tx);

        let deadline = Instant::now() + timeout;
        let mut completed = 0;
        while completed < n {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(
                    "session pre-warm timed out with {}/{} completed, continuing with partial pool",
                    completed, n
                );
                return;
            }
            match done_rx.recv_timeout(remaining) {
                Ok(()) => completed += 1,
                Err(_) => break,
            }
        }
        info!("session pool pre-warm completed ({} in pool)", self.pool_rx.len());
    }

    /// Return a working session bound to `target` within a bounded time.
    ///
    /// Tries a pooled generic session first (re-binding it to the target);
    /// falls back to fresh creation under the session timeout. Retries up
    /// to the configured count with backoff delays that increase strictly
    /// per attempt, then fails with `SessionCreation` carrying the last
    /// cause.
    pub fn acquire(&self, target: &TargetId) -> Result<Arc<RecordingSession>> {
        let mut last = String::from("no attempts made");

        for attempt in 1..=self.max_retries {
            self.attempts.fetch_add(1, Ordering::Relaxed);
            let started = Instant::now();
            debug!("acquiring session for target {} (attempt {})", target, attempt);

            match self.acquire_once(target) {
                Ok((handle, pooled)) => {
                    let elapsed = started.elapsed();
                    self.record_creation(elapsed);
                    self.successes.fetch_add(1, Ordering::Relaxed);
                    info!(
                        "acquired {} session for target {} in {:?}",
                        if pooled { "pooled" } else { "fresh" },
                        target,
                        elapsed
                    );

                    let session = Arc::new(RecordingSession {
                        target: target.clone(),
                        handle,
                        created: Instant::now(),
                        pooled,
                    });
                    // At most one active session per target; a stale entry
                    // is torn down, never leaked.
                    if let Some(prev) = self.active.insert(target.clone(), Arc::clone(&session)) {
                        warn!("replacing stale session for target {}", target);
                        prev.handle.clear_listeners();
                    }
                    return Ok(session);
                }
                Err(e) => {
                    self.record_creation(started.elapsed());
                    warn!(
                        "session acquisition attempt {} failed for target {}: {}",
                        attempt, target, e
                    );
                    last = e.to_string();
                    if attempt < self.max_retries {
                        std::thread::sleep(self.retry_delay * attempt);
                    }
                }
            }
        }

        error!(
            "failed to acquire session for target {} after {} attempts",
            target, self.max_retries
        );
        Err(Error::SessionCreation {
            attempts: self.max_retries,
            last,
        })
    }

    fn acquire_once(&self, target: &TargetId) -> Result<(Arc<dyn InstrumentationSession>, bool)> {
        // Pooled fast path: short bounded wait, then rebind. A rebind
        // failure discards the pooled session and falls through to fresh
        // creation.
        if let Ok(session) = self.pool_rx.recv_timeout(self.pool_wait) {
            session.clear_listeners();
            match session.rebind(target) {
                Ok(()) => return Ok((session, true)),
                Err(e) => {
                    debug!("pooled session rebind failed for {}: {}", target, e);
                }
            }
        }

        let session = self.create_with_timeout(Some(target))?;
        Ok((session, false))
    }

    /// Run session creation on a helper thread so a driver hang becomes a
    /// bounded timeout instead of an indefinite stall.
    fn create_with_timeout(
        &self,
        target: Option<&TargetId>,
    ) -> Result<Arc<dyn InstrumentationSession>> {
        let driver = Arc::clone(&self.driver);
        let target = target.cloned();
        let (tx, rx) = bounded(1);

        std::thread::Builder::new()
            .name("session-create".to_string())
            .spawn(move || {
                let result = driver.create_session(target.as_ref());
                let _ = tx.send(result);
            })?;

        match rx.recv_timeout(self.session_timeout) {
            Ok(result) => result,
            Err(_) => Err(Error::Driver(format!(
                "session creation timed out after {:?}",
                self.session_timeout
            ))),
        }
    }

    /// Release a session: healthy sessions go back to the pool (up to
    /// capacity) as generic sessions; everything else is discarded.
    pub fn release(&self, session: Arc<RecordingSession>) {
        self.active
            .remove_if(session.target(), |_, held| Arc::ptr_eq(held, &session));
        session.handle.clear_listeners();

        if session.is_healthy() {
            if self.pool_tx.try_send(Arc::clone(&session.handle)).is_ok() {
                debug!("returned session for {} to pool", session.target());
                return;
            }
        }
        debug!("discarded session for {}", session.target());
    }

    /// Release whatever session is bound to `target`, if any. Used for
    /// background cleanup when a non-recorded target goes away.
    pub fn release_target(&self, target: &TargetId) {
        if let Some((_, session)) = self.active.remove(target) {
            session.handle.clear_listeners();
            if session.is_healthy() && self.pool_tx.try_send(Arc::clone(&session.handle)).is_ok() {
                debug!("returned session for {} to pool", target);
            }
        }
    }

    pub fn get_active(&self, target: &TargetId) -> Option<Arc<RecordingSession>> {
        self.active.get(target).map(|entry| Arc::clone(entry.value()))
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn pooled_count(&self) -> usize {
        self.pool_rx.len()
    }

    pub fn metrics(&self) -> SessionMetrics {
        let attempts = self.attempts.load(Ordering::Relaxed);
        let total_us = self.total_creation_us.load(Ordering::Relaxed);
        SessionMetrics {
            attempts,
            successes: self.successes.load(Ordering::Relaxed),
            max_creation_ms: self.max_creation_us.load(Ordering::Relaxed) / 1000,
            avg_creation_ms: if attempts == 0 {
                0.0
            } else {
                total_us as f64 / attempts as f64 / 1000.0
            },
        }
    }

    fn record_creation(&self, elapsed: Duration) {
        let us = elapsed.as_micros() as u64;
        self.total_creation_us.fetch_add(us, Ordering::Relaxed);
        self.max_creation_us.fetch_max(us, Ordering::Relaxed);
    }

    fn start_health_monitor(self: &Arc<Self>, interval: Duration) {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        *self.shutdown_tx.lock().unwrap() = Some(shutdown_tx);

        let pool = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name("session-health".to_string())
            .spawn(move || loop {
                match shutdown_rx.recv_timeout(interval) {
                    // Any message or a disconnect ends the monitor.
                    Ok(()) | Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                        pool.run_health_check();
                    }
                }
            });
        match spawned {
            Ok(handle) => *self.monitor.lock().unwrap() = Some(handle),
            Err(e) => error!("failed to start session health monitor: {}", e),
        }
    }

    fn run_health_check(&self) {
        let mut evicted = 0;
        let stale: Vec<TargetId> = self
            .active
            .iter()
            .filter(|entry| !entry.value().is_healthy() || entry.value().age() > self.max_age)
            .map(|entry| entry.key().clone())
            .collect();
        for target in stale {
            if let Some((_, session)) = self.active.remove(&target) {
                warn!("evicting unhealthy or aged session for target {}", target);
                session.handle.clear_listeners();
                evicted += 1;
            }
        }
        if evicted > 0 {
            info!("session health check evicted {} sessions", evicted);
        }
        self.replenish();
    }

    /// Top the pool back up to its target size with generic sessions.
    fn replenish(&self) {
        let needed = self.pool_size.saturating_sub(self.pool_rx.len());
        if needed == 0 {
            return;
        }
        debug!("replenishing session pool, need {} more", needed);
        for _ in 0..needed {
            let driver = Arc::clone(&self.driver);
            let pool_tx = self.pool_tx.clone();
            let spawned = std::thread::Builder::new()
                .name("session-replenish".to_string())
                .spawn(move || match driver.create_session(None) {
                    Ok(session) => {
                        let _ = pool_tx.try_send(session);
                    }
                    Err(e) => debug!("pool replenishment failed: {}", e),
                });
            if spawned.is_err() {
                break;
            }
        }
    }

    /// Stop the monitor, drop pooled sessions and clear the active map.
    pub fn shutdown(&self) {
        info!("shutting down session pool");
        drop(self.shutdown_tx.lock().unwrap().take());
        if let Some(handle) = self.monitor.lock().unwrap().take() {
            let _ = handle.join();
        }
        while let Ok(session) = self.pool_rx.try_recv() {
            session.clear_listeners();
        }
        for entry in self.active.iter() {
            entry.value().handle.clear_listeners();
        }
        self.active.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{
        FrameListener, FrameStreamOptions, TargetDescriptor, TargetListener,
    };
    use std::sync::atomic::AtomicBool;

    struct StubSession {
        healthy: AtomicBool,
        rebinds: AtomicU64,
        fail_rebind: bool,
    }

    impl StubSession {
        fn new(fail_rebind: bool) -> Arc<Self> {
            Arc::new(StubSession {
                healthy: AtomicBool::new(true),
                rebinds: AtomicU64::new(0),
                fail_rebind,
            })
        }
    }

    impl InstrumentationSession for StubSession {
        fn enable_instrumentation(&self) -> Result<()> {
            Ok(())
        }
        fn start_frame_stream(&self, _options: &FrameStreamOptions) -> Result<()> {
            Ok(())
        }
        fn stop_frame_stream(&self) -> Result<()> {
            Ok(())
        }
        fn acknowledge_frame(&self, _session_id: &str) -> Result<()> {
            Ok(())
        }
        fn set_frame_listener(&self, _listener: FrameListener) {}
        fn clear_listeners(&self) {}
        fn rebind(&self, _target: &TargetId) -> Result<()> {
            if self.fail_rebind {
                return Err(Error::Driver("rebind refused".into()));
            }
            self.rebinds.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
        fn is_healthy(&self) -> bool {
            self.healthy.load(Ordering::Relaxed)
        }
    }

    /// Driver whose session creation fails a configurable number of times
    /// before succeeding, recording the instant of every attempt and every
    /// session it hands out.
    struct FlakyDriver {
        failures_remaining: Mutex<u32>,
        attempt_times: Mutex<Vec<Instant>>,
        created: Mutex<Vec<Arc<StubSession>>>,
        rebind_fails: AtomicBool,
    }

    impl FlakyDriver {
        fn failing(times: u32) -> Self {
            FlakyDriver {
                failures_remaining: Mutex::new(times),
                attempt_times: Mutex::new(Vec::new()),
                created: Mutex::new(Vec::new()),
                rebind_fails: AtomicBool::new(false),
            }
        }

        fn last_created(&self) -> Arc<StubSession> {
            self.created.lock().unwrap().last().unwrap().clone()
        }
    }

    impl InstrumentationDriver for FlakyDriver {
        fn create_session(
            &self,
            _target: Option<&TargetId>,
        ) -> Result<Arc<dyn InstrumentationSession>> {
            self.attempt_times.lock().unwrap().push(Instant::now());
            let mut remaining = self.failures_remaining.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::Driver("simulated creation failure".into()));
            }
            let session = StubSession::new(self.rebind_fails.load(Ordering::Relaxed));
            self.created.lock().unwrap().push(Arc::clone(&session));
            Ok(session)
        }
        fn list_targets(&self) -> Result<Vec<TargetDescriptor>> {
            Ok(Vec::new())
        }
        fn active_target(&self) -> Result<TargetId> {
            Err(Error::Driver("no active target".into()))
        }
        fn execute_script(&self, _script: &str) -> Result<String> {
            Ok("ok".into())
        }
        fn set_target_listener(&self, _listener: TargetListener) {}
    }

    fn fast_config() -> RecorderConfig {
        let mut cfg = RecorderConfig::default();
        cfg.pool_size = 2;
        cfg.pool_wait = Duration::from_millis(5);
        cfg.session_timeout = Duration::from_millis(500);
        cfg.session_retry_delay = Duration::from_millis(20);
        cfg.health_check_interval = Duration::from_secs(60);
        cfg
    }

    #[test]
    fn test_acquire_retries_then_fails_with_increasing_backoff() {
        let driver = Arc::new(FlakyDriver::failing(u32::MAX));
        let pool = SessionPool::new(Arc::clone(&driver) as Arc<dyn InstrumentationDriver>, &fast_config());

        let started = Instant::now();
        let err = pool.acquire(&TargetId::new("t1")).unwrap_err();
        let elapsed = started.elapsed();
        pool.shutdown();

        match err {
            Error::SessionCreation { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(last.contains("simulated creation failure"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // Exactly one creation attempt per retry.
        assert_eq!(driver.attempt_times.lock().unwrap().len(), 3);
        // Backoff delays: 20ms after attempt 1, 40ms after attempt 2.
        assert!(elapsed >= Duration::from_millis(60), "elapsed {elapsed:?}");
        let times = driver.attempt_times.lock().unwrap();
        let gap1 = times[1] - times[0];
        let gap2 = times[2] - times[1];
        assert!(gap2 > gap1, "backoff must increase: {gap1:?} vs {gap2:?}");
    }

    #[test]
    fn test_acquire_succeeds_after_transient_failures() {
        let driver = Arc::new(FlakyDriver::failing(2));
        let pool = SessionPool::new(driver as Arc<dyn InstrumentationDriver>, &fast_config());

        let session = pool.acquire(&TargetId::new("t1")).unwrap();
        assert!(!session.was_pooled());
        assert_eq!(pool.active_count(), 1);

        let metrics = pool.metrics();
        assert_eq!(metrics.attempts, 3);
        assert_eq!(metrics.successes, 1);
        pool.shutdown();
    }

    #[test]
    fn test_pooled_session_is_rebound() {
        let driver = Arc::new(FlakyDriver::failing(0));
        let pool = SessionPool::new(driver as Arc<dyn InstrumentationDriver>, &fast_config());
        pool.prewarm(1, Duration::from_secs(2));
        assert_eq!(pool.pooled_count(), 1);

        let session = pool.acquire(&TargetId::new("t1")).unwrap();
        assert!(session.was_pooled());
        pool.shutdown();
    }

    #[test]
    fn test_release_returns_healthy_session_to_pool() {
        let driver = Arc::new(FlakyDriver::failing(0));
        let pool = SessionPool::new(driver as Arc<dyn InstrumentationDriver>, &fast_config());

        let target = TargetId::new("t1");
        let session = pool.acquire(&target).unwrap();
        assert_eq!(pool.active_count(), 1);

        pool.release(session);
        assert_eq!(pool.active_count(), 0);
        assert_eq!(pool.pooled_count(), 1);
        pool.shutdown();
    }

    #[test]
    fn test_release_discards_unhealthy_session() {
        let driver = Arc::new(FlakyDriver::failing(0));
        let pool = SessionPool::new(
            Arc::clone(&driver) as Arc<dyn InstrumentationDriver>,
            &fast_config(),
        );

        let session = pool.acquire(&TargetId::new("t1")).unwrap();
        driver.last_created().healthy.store(false, Ordering::Relaxed);

        pool.release(session);
        assert_eq!(pool.active_count(), 0);
        assert_eq!(pool.pooled_count(), 0, "unhealthy sessions are discarded");
        pool.shutdown();
    }

    #[test]
    fn test_failed_rebind_falls_through_to_fresh_creation() {
        let driver = Arc::new(FlakyDriver::failing(0));
        driver.rebind_fails.store(true, Ordering::Relaxed);
        let pool = SessionPool::new(
            Arc::clone(&driver) as Arc<dyn InstrumentationDriver>,
            &fast_config(),
        );
        pool.prewarm(1, Duration::from_secs(2));
        assert_eq!(pool.pooled_count(), 1);
        driver.rebind_fails.store(false, Ordering::Relaxed);

        // The pooled session refuses to rebind; acquire must still succeed
        // on the same attempt by creating a fresh session.
        let session = pool.acquire(&TargetId::new("t1")).unwrap();
        assert!(!session.was_pooled());
        assert_eq!(pool.metrics().attempts, 1);
        pool.shutdown();
    }

    #[test]
    fn test_single_active_session_per_target() {
        let driver = Arc::new(FlakyDriver::failing(0));
        let pool = SessionPool::new(driver as Arc<dyn InstrumentationDriver>, &fast_config());

        let target = TargetId::new("t1");
        let first = pool.acquire(&target).unwrap();
        let second = pool.acquire(&target).unwrap();
        assert_eq!(pool.active_count(), 1);
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&pool.get_active(&target).unwrap(), &second));
        pool.shutdown();
    }
}
