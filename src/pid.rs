//! Host-wide adaptive rejection: a PID controller in shared memory.
//!
//! All worker processes on the host record request and ping outcomes into
//! one shared state block and read back a common rejection probability.
//! The block lives in a POSIX shared-memory mapping and is guarded by a
//! process-shared *robust* pthread mutex: if a worker dies while holding
//! the lock, the next locker is told, marks the state consistent, and
//! carries on. The state is written so that at most one window of
//! observations can be stale after such a recovery.

use std::sync::atomic::{AtomicI32, Ordering, fence};
use std::time::{Duration, Instant};

use log::warn;
use rand::Rng;
use shared_memory::{Shmem, ShmemConf};

use crate::clock::monotonic_secs;
use crate::error::{Error, Result};
use crate::key::{PID_KEY_SUFFIX, aux_key};

/// One hour of ten-second windows.
const HISTORY_SIZE: usize = 360;

/// Budget for waiting on the creator's initialization.
const INIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Initial poll interval while waiting; doubles up to [`INIT_POLL_MAX`].
const INIT_POLL_START: Duration = Duration::from_millis(1);
const INIT_POLL_MAX: Duration = Duration::from_millis(100);

/// Fallback ideal error rate when no history exists yet.
const DEFAULT_IDEAL_ERROR_RATE: f64 = 0.01;

/// Ceiling for the adaptive (p90-derived) ideal error rate.
const MAX_IDEAL_ERROR_RATE: f64 = 0.1;

// Cache-line aligned so the hot mutex does not false-share with the
// counters behind it.
#[repr(C, align(64))]
struct SharedMutex(libc::pthread_mutex_t);

#[repr(C)]
struct PidState {
    lock: SharedMutex,

    rejection_rate: f64,
    integral: f64,
    previous_error: f64,
    last_update_time: f64,

    window_start_time: u64,
    window_success: u64,
    window_error: u64,
    window_rejected: u64,
    window_ping_success: u64,
    window_ping_failure: u64,

    last_error_rate: f64,
    last_ping_failure_rate: f64,

    // Immutable after initialization.
    kp: f64,
    ki: f64,
    kd: f64,
    window_size: f64,
    target_error_rate: f64,

    error_rate_history: [f64; HISTORY_SIZE],
    history_index: i32,
    history_count: i32,

    // Published last; waiters poll it to know the block is usable.
    initialized: AtomicI32,
    creator_pid: libc::pid_t,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestOutcome {
    Success,
    Error,
    Rejected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PingOutcome {
    Success,
    Failure,
}

/// Snapshot of the controller state, taken under one lock acquisition.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PidMetrics {
    pub rejection_rate: f64,
    pub error_rate: f64,
    pub ping_failure_rate: f64,
    pub integral: f64,
    pub previous_error: f64,
    pub window_success: u64,
    pub window_error: u64,
    pub window_rejected: u64,
    pub window_ping_success: u64,
    pub window_ping_failure: u64,
}

pub struct SharedPidController {
    shmem: Shmem,
    state: *mut PidState,
    name: String,
}

// The mapping is shared mutable state across processes already; within a
// process every access goes through the embedded process-shared mutex.
unsafe impl Send for SharedPidController {}
unsafe impl Sync for SharedPidController {}

impl SharedPidController {
    /// Create or attach the controller for `name`.
    ///
    /// The creator zeroes the block, initializes the robust mutex, writes
    /// the gains, and only then publishes `initialized`; attachers poll
    /// that flag with exponential back-off. `target_error_rate <= 0`
    /// selects the adaptive p90 target.
    pub fn new(
        name: &str,
        kp: f64,
        ki: f64,
        kd: f64,
        window_size: f64,
        target_error_rate: f64,
        permissions: u32,
    ) -> Result<SharedPidController> {
        if !(window_size > 0.0) {
            return Err(Error::bad_config("window_size must be positive seconds"));
        }

        let os_id = format!(
            "semian-pid-{:08x}",
            aux_key(name, PID_KEY_SUFFIX) as u32
        );
        let size = std::mem::size_of::<PidState>();

        let (shmem, created) = match ShmemConf::new().size(size).os_id(&os_id).create() {
            Ok(mut mapping) => {
                // Lifetime is managed explicitly via `remove`, never by
                // whichever process happens to drop its handle first.
                mapping.set_owner(false);
                set_segment_permissions(&os_id, permissions);
                (mapping, true)
            }
            Err(create_err) => {
                let mapping = ShmemConf::new()
                    .size(size)
                    .os_id(&os_id)
                    .open()
                    .map_err(|open_err| {
                        Error::internal(format!(
                            "could not create ({create_err}) or open ({open_err}) \
                             shared memory for '{name}'"
                        ))
                    })?;
                (mapping, false)
            }
        };

        let state = shmem.as_ptr() as *mut PidState;
        let controller = SharedPidController {
            shmem,
            state,
            name: name.to_owned(),
        };

        if created {
            controller.initialize_state(kp, ki, kd, window_size, target_error_rate)?;
        } else {
            controller.wait_for_initialization()?;
        }

        Ok(controller)
    }

    fn initialize_state(
        &self,
        kp: f64,
        ki: f64,
        kd: f64,
        window_size: f64,
        target_error_rate: f64,
    ) -> Result<()> {
        unsafe {
            std::ptr::write_bytes(self.state as *mut u8, 0, std::mem::size_of::<PidState>());
            init_robust_mutex(&raw mut (*self.state).lock.0)?;

            (*self.state).kp = kp;
            (*self.state).ki = ki;
            (*self.state).kd = kd;
            (*self.state).window_size = window_size;
            (*self.state).target_error_rate = target_error_rate;

            let now = monotonic_secs();
            (*self.state).last_update_time = now;
            (*self.state).window_start_time = now as u64;
            (*self.state).creator_pid = libc::getpid();

            // Everything above must be visible before the flag flips.
            fence(Ordering::SeqCst);
            (*self.state).initialized.store(1, Ordering::Release);
        }
        Ok(())
    }

    fn wait_for_initialization(&self) -> Result<()> {
        let begin = Instant::now();
        let mut poll = INIT_POLL_START;
        loop {
            let flag = unsafe { (*self.state).initialized.load(Ordering::Acquire) };
            if flag != 0 {
                return Ok(());
            }
            if begin.elapsed() > INIT_TIMEOUT {
                return Err(Error::internal(format!(
                    "timeout waiting for PID controller '{}' to initialize",
                    self.name
                )));
            }
            std::thread::sleep(poll);
            poll = (poll * 2).min(INIT_POLL_MAX);
        }
    }

    /// Lock the shared mutex. A dead previous owner is recovered by
    /// marking the mutex consistent; the state may then be one partial
    /// update stale, which callers tolerate.
    fn lock(&self) -> Result<PidLockGuard<'_>> {
        let mutex = unsafe { &raw mut (*self.state).lock.0 };
        let rc = unsafe { libc::pthread_mutex_lock(mutex) };
        if rc == libc::EOWNERDEAD {
            warn!(
                "PID controller '{}' mutex owner died; recovering",
                self.name
            );
            let rc = unsafe { libc::pthread_mutex_consistent(mutex) };
            if rc != 0 {
                return Err(Error::internal(format!(
                    "pthread_mutex_consistent failed: {rc}"
                )));
            }
        } else if rc != 0 {
            return Err(Error::internal(format!("pthread_mutex_lock failed: {rc}")));
        }
        Ok(PidLockGuard {
            mutex,
            _marker: std::marker::PhantomData,
        })
    }

    /// Count one gated request outcome in the open window.
    pub fn record_request(&self, outcome: RequestOutcome) -> Result<()> {
        let _guard = self.lock()?;
        unsafe {
            match outcome {
                RequestOutcome::Success => (*self.state).window_success += 1,
                RequestOutcome::Error => (*self.state).window_error += 1,
                RequestOutcome::Rejected => (*self.state).window_rejected += 1,
            }
        }
        Ok(())
    }

    /// Count one ungated health-check outcome in the open window.
    pub fn record_ping(&self, outcome: PingOutcome) -> Result<()> {
        let _guard = self.lock()?;
        unsafe {
            match outcome {
                PingOutcome::Success => (*self.state).window_ping_success += 1,
                PingOutcome::Failure => (*self.state).window_ping_failure += 1,
            }
        }
        Ok(())
    }

    /// Close the current window and run one PID step. Call once per
    /// `window_size` seconds; returns the new rejection rate.
    pub fn update(&self) -> Result<f64> {
        let _guard = self.lock()?;
        let s = unsafe { &mut *self.state };

        let total_requests = s.window_success + s.window_error;
        let error_rate = if total_requests > 0 {
            s.window_error as f64 / total_requests as f64
        } else {
            0.0
        };
        s.last_error_rate = error_rate;

        let total_pings = s.window_ping_success + s.window_ping_failure;
        let ping_failure_rate = if total_pings > 0 {
            s.window_ping_failure as f64 / total_pings as f64
        } else {
            0.0
        };
        s.last_ping_failure_rate = ping_failure_rate;

        s.error_rate_history[s.history_index as usize] = error_rate;
        s.history_index = (s.history_index + 1) % HISTORY_SIZE as i32;
        if s.history_count < HISTORY_SIZE as i32 {
            s.history_count += 1;
        }

        s.window_success = 0;
        s.window_error = 0;
        s.window_rejected = 0;
        s.window_ping_success = 0;
        s.window_ping_failure = 0;

        let now = monotonic_secs();
        s.window_start_time = now as u64;

        let ideal = if s.target_error_rate > 0.0 {
            s.target_error_rate
        } else {
            p90(&s.error_rate_history[..s.history_count as usize])
        };

        // Health signal: positive when errors exceed the ideal beyond what
        // current shedding (net of ping failures) already accounts for.
        let health = (error_rate - ideal) - (s.rejection_rate - ping_failure_rate);

        let dt = s.window_size;
        s.integral += health * dt;
        let control = s.kp * health
            + s.ki * s.integral
            + s.kd * (health - s.previous_error) / dt;

        s.rejection_rate = (s.rejection_rate + control).clamp(0.0, 1.0);
        s.previous_error = health;
        s.last_update_time = now;

        Ok(s.rejection_rate)
    }

    /// Sample a uniform real in [0, 1) against the current rejection rate.
    pub fn should_reject(&self) -> Result<bool> {
        let rate = self.rejection_rate()?;
        Ok(rand::thread_rng().r#gen::<f64>() < rate)
    }

    pub fn rejection_rate(&self) -> Result<f64> {
        let _guard = self.lock()?;
        Ok(unsafe { (*self.state).rejection_rate })
    }

    /// All rates, PID terms, and open-window counters in one locked read.
    pub fn metrics(&self) -> Result<PidMetrics> {
        let _guard = self.lock()?;
        let s = unsafe { &*self.state };
        Ok(PidMetrics {
            rejection_rate: s.rejection_rate,
            error_rate: s.last_error_rate,
            ping_failure_rate: s.last_ping_failure_rate,
            integral: s.integral,
            previous_error: s.previous_error,
            window_success: s.window_success,
            window_error: s.window_error,
            window_rejected: s.window_rejected,
            window_ping_success: s.window_ping_success,
            window_ping_failure: s.window_ping_failure,
        })
    }

    /// Detach from the shared state. Other processes are unaffected.
    pub fn destroy(self) {
        drop(self);
    }

    /// Mark the mapping for deletion and detach. Processes still attached
    /// keep a valid mapping until they detach in turn.
    pub fn remove(mut self) {
        self.shmem.set_owner(true);
    }
}

struct PidLockGuard<'a> {
    mutex: *mut libc::pthread_mutex_t,
    _marker: std::marker::PhantomData<&'a ()>,
}

impl Drop for PidLockGuard<'_> {
    fn drop(&mut self) {
        let rc = unsafe { libc::pthread_mutex_unlock(self.mutex) };
        if rc != 0 {
            warn!("pthread_mutex_unlock failed: {rc}");
        }
    }
}

fn init_robust_mutex(mutex: *mut libc::pthread_mutex_t) -> Result<()> {
    unsafe {
        let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
        let rc = libc::pthread_mutexattr_init(&mut attr);
        if rc != 0 {
            return Err(Error::internal(format!(
                "pthread_mutexattr_init failed: {rc}"
            )));
        }
        let rc = libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
        if rc == 0 {
            let rc = libc::pthread_mutexattr_setrobust(&mut attr, libc::PTHREAD_MUTEX_ROBUST);
            if rc == 0 {
                let rc = libc::pthread_mutex_init(mutex, &attr);
                if rc != 0 {
                    libc::pthread_mutexattr_destroy(&mut attr);
                    return Err(Error::internal(format!(
                        "pthread_mutex_init failed: {rc}"
                    )));
                }
                libc::pthread_mutexattr_destroy(&mut attr);
                return Ok(());
            }
            libc::pthread_mutexattr_destroy(&mut attr);
            return Err(Error::internal(format!(
                "pthread_mutexattr_setrobust failed: {rc}"
            )));
        }
        libc::pthread_mutexattr_destroy(&mut attr);
        Err(Error::internal(format!(
            "pthread_mutexattr_setpshared failed: {rc}"
        )))
    }
}

/// 90th percentile of the recorded per-window error rates, capped at
/// [`MAX_IDEAL_ERROR_RATE`]. An empty history falls back to
/// [`DEFAULT_IDEAL_ERROR_RATE`].
fn p90(history: &[f64]) -> f64 {
    if history.is_empty() {
        return DEFAULT_IDEAL_ERROR_RATE;
    }
    let mut sorted = history.to_vec();
    sorted.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let index = ((sorted.len() as f64 * 0.9) as usize).saturating_sub(1);
    sorted[index].min(MAX_IDEAL_ERROR_RATE)
}

fn set_segment_permissions(os_id: &str, permissions: u32) {
    use std::os::unix::fs::PermissionsExt;
    let path = format!("/dev/shm/{os_id}");
    if let Err(err) =
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(permissions))
    {
        warn!("could not set permissions on {path}: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        use std::sync::atomic::{AtomicU32, Ordering};
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        format!(
            "pid-test-{tag}-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        )
    }

    fn controller(name: &str, kp: f64, ki: f64, kd: f64, target: f64) -> SharedPidController {
        SharedPidController::new(name, kp, ki, kd, 1.0, target, 0o660).unwrap()
    }

    #[test]
    fn proportional_step_matches_the_health_signal() {
        let name = unique_name("prop");
        let pid = controller(&name, 0.9, 0.0, 0.0, 0.01);
        for _ in 0..10 {
            pid.record_request(RequestOutcome::Success).unwrap();
        }
        for _ in 0..90 {
            pid.record_request(RequestOutcome::Error).unwrap();
        }
        let rate = pid.update().unwrap();
        assert!((rate - 0.801).abs() < 1e-9, "rate = {rate}");

        // An idle window must not push the rate up.
        let next = pid.update().unwrap();
        assert!(next <= rate, "idle window raised the rate: {next} > {rate}");
        assert!(next.is_finite());
        pid.remove();
    }

    #[test]
    fn rejection_rate_stays_clamped() {
        let name = unique_name("clamp");
        let pid = controller(&name, 100.0, 0.0, 0.0, 0.01);
        for _ in 0..50 {
            pid.record_request(RequestOutcome::Error).unwrap();
        }
        let rate = pid.update().unwrap();
        assert_eq!(rate, 1.0);

        // Many healthy windows drive it back to the floor, never below.
        for _ in 0..50 {
            pid.record_request(RequestOutcome::Success).unwrap();
            let rate = pid.update().unwrap();
            assert!((0.0..=1.0).contains(&rate));
        }
        assert_eq!(pid.rejection_rate().unwrap(), 0.0);
        pid.remove();
    }

    #[test]
    fn idle_window_produces_zero_error_rate_not_nan() {
        let name = unique_name("idle");
        let pid = controller(&name, 0.5, 0.1, 0.1, -1.0);
        let rate = pid.update().unwrap();
        assert!(rate.is_finite());
        let metrics = pid.metrics().unwrap();
        assert_eq!(metrics.error_rate, 0.0);
        assert_eq!(metrics.ping_failure_rate, 0.0);
        pid.remove();
    }

    #[test]
    fn should_reject_follows_the_rate_extremes() {
        let name = unique_name("extremes");
        let pid = controller(&name, 10.0, 0.0, 0.0, 0.01);
        for _ in 0..100 {
            assert!(!pid.should_reject().unwrap(), "rate 0 must never reject");
        }

        // One all-error window with a large gain saturates the rate.
        pid.record_request(RequestOutcome::Error).unwrap();
        pid.update().unwrap();
        assert_eq!(pid.rejection_rate().unwrap(), 1.0);
        for _ in 0..100 {
            assert!(pid.should_reject().unwrap(), "rate 1 must always reject");
        }
        pid.remove();
    }

    #[test]
    fn metrics_reflect_window_counters_and_reset_on_update() {
        let name = unique_name("metrics");
        let pid = controller(&name, 0.9, 0.0, 0.0, 0.01);
        pid.record_request(RequestOutcome::Success).unwrap();
        pid.record_request(RequestOutcome::Error).unwrap();
        pid.record_request(RequestOutcome::Rejected).unwrap();
        pid.record_ping(PingOutcome::Success).unwrap();
        pid.record_ping(PingOutcome::Failure).unwrap();

        let metrics = pid.metrics().unwrap();
        assert_eq!(metrics.window_success, 1);
        assert_eq!(metrics.window_error, 1);
        assert_eq!(metrics.window_rejected, 1);
        assert_eq!(metrics.window_ping_success, 1);
        assert_eq!(metrics.window_ping_failure, 1);

        pid.update().unwrap();
        let metrics = pid.metrics().unwrap();
        assert_eq!(metrics.window_success, 0);
        assert_eq!(metrics.window_error, 0);
        assert_eq!(metrics.error_rate, 0.5);
        assert_eq!(metrics.ping_failure_rate, 0.5);
        pid.remove();
    }

    #[test]
    fn attacher_shares_the_creator_state() {
        let name = unique_name("attach");
        let a = controller(&name, 0.9, 0.0, 0.0, 0.01);
        let b = controller(&name, 0.123, 0.456, 0.789, 0.5); // gains ignored: attach
        a.record_request(RequestOutcome::Error).unwrap();
        let metrics = b.metrics().unwrap();
        assert_eq!(metrics.window_error, 1);
        b.destroy();
        a.remove();
    }

    #[test]
    fn p90_of_empty_history_defaults() {
        assert_eq!(p90(&[]), DEFAULT_IDEAL_ERROR_RATE);
    }

    #[test]
    fn p90_is_capped() {
        let history = vec![0.5; 40];
        assert_eq!(p90(&history), MAX_IDEAL_ERROR_RATE);
    }

    #[test]
    fn p90_picks_the_ninetieth_percentile() {
        let history: Vec<f64> = (1..=100).map(|i| i as f64 / 1000.0).collect();
        let p = p90(&history);
        assert!((p - 0.090).abs() < 1e-9, "p90 = {p}");
    }

    #[test]
    fn owner_dead_mutex_is_recovered() {
        let name = unique_name("robust");
        let pid = controller(&name, 0.9, 0.0, 0.0, 0.01);
        pid.record_request(RequestOutcome::Success).unwrap();

        // A child takes the mutex and dies holding it.
        let child = unsafe { libc::fork() };
        assert!(child >= 0, "fork failed");
        if child == 0 {
            let guard = pid.lock();
            std::mem::forget(guard);
            unsafe { libc::_exit(0) };
        }
        let mut status = 0;
        unsafe { libc::waitpid(child, &mut status, 0) };

        // Survivors must get the lock back and keep functioning.
        pid.record_request(RequestOutcome::Error).unwrap();
        let rate = pid.update().unwrap();
        assert!((0.0..=1.0).contains(&rate));
        assert!(rate.is_finite());
        pid.remove();
    }
}
