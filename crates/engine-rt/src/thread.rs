//! Realtime thread setup.
//!
//! None of these steps is fatal: a backend that cannot get SCHED_FIFO or
//! locked memory keeps running at normal priority and logs a warning.

use std::thread::{self, JoinHandle};

use anyhow::anyhow;
use tracing::{debug, warn};

/// Scheduling requests applied when a realtime thread starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RealtimeHints {
    /// SCHED_FIFO priority, `None` to stay at normal priority.
    pub priority: Option<i32>,
    pub lock_memory: bool,
}

impl Default for RealtimeHints {
    fn default() -> Self {
        Self {
            priority: Some(70),
            lock_memory: true,
        }
    }
}

/// Spawns a named thread that prepares itself for realtime work before
/// running `body`.
pub fn spawn_realtime<F, T>(name: &str, hints: RealtimeHints, body: F) -> std::io::Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    thread::Builder::new().name(name.to_string()).spawn(move || {
        prepare_current_thread(&hints);
        body()
    })
}

pub fn prepare_current_thread(hints: &RealtimeHints) {
    enable_ftz_daz();
    if let Some(priority) = hints.priority {
        match apply_realtime_priority(priority) {
            Ok(()) => debug!(priority, "realtime scheduling enabled"),
            Err(err) => warn!(%err, "running the process thread at normal priority"),
        }
    }
    if hints.lock_memory {
        if let Err(err) = lock_memory() {
            warn!(%err, "unable to lock process memory");
        }
    }
}

/// Enables flush-to-zero and denormals-are-zero on supported CPUs.
#[inline]
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub fn enable_ftz_daz() {
    unsafe {
        #[cfg(target_arch = "x86")]
        use std::arch::x86::{_mm_getcsr, _mm_setcsr};
        #[cfg(target_arch = "x86_64")]
        use std::arch::x86_64::{_mm_getcsr, _mm_setcsr};

        const FTZ: u32 = 1 << 15;
        const DAZ: u32 = 1 << 6;
        let csr = _mm_getcsr();
        _mm_setcsr(csr | FTZ | DAZ);
    }
}

#[inline]
#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
pub fn enable_ftz_daz() {}

#[cfg(target_os = "linux")]
pub fn apply_realtime_priority(priority: i32) -> anyhow::Result<()> {
    unsafe {
        let sched_param = libc::sched_param {
            sched_priority: priority,
        };
        let result =
            libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &sched_param);
        if result != 0 {
            return Err(anyhow!("failed to elevate thread priority: errno {result}"));
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn apply_realtime_priority(_priority: i32) -> anyhow::Result<()> {
    Err(anyhow!("realtime scheduling is not supported on this platform"))
}

/// Locks current and future pages. Missing privileges are not an error.
#[cfg(target_os = "linux")]
pub fn lock_memory() -> anyhow::Result<()> {
    unsafe {
        let flags = libc::MCL_CURRENT | libc::MCL_FUTURE;
        if libc::mlockall(flags) != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EPERM) {
                return Err(anyhow!("mlockall failed: {err}"));
            }
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn lock_memory() -> anyhow::Result<()> {
    Ok(())
}
