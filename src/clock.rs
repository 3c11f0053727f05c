//! Monotonic time and timespec conversions.
//!
//! Wait-time measurement uses CLOCK_MONOTONIC; `semtimedop` interprets its
//! timespec as a relative interval, so the conversion helpers only ever deal
//! in durations.

use std::time::Duration;

/// Milliseconds on the monotonic clock. Only differences are meaningful.
pub fn now_ms() -> u64 {
    let ts = monotonic_timespec();
    (ts.tv_sec as u64) * 1_000 + (ts.tv_nsec as u64) / 1_000_000
}

/// Seconds on the monotonic clock, with sub-millisecond precision.
pub(crate) fn monotonic_secs() -> f64 {
    let ts = monotonic_timespec();
    ts.tv_sec as f64 + ts.tv_nsec as f64 / 1_000_000_000.0
}

pub fn diff_ms(end_ms: u64, begin_ms: u64) -> u64 {
    end_ms.saturating_sub(begin_ms)
}

pub fn ms_to_timespec(ms: u64) -> libc::timespec {
    libc::timespec {
        tv_sec: (ms / 1_000) as libc::time_t,
        tv_nsec: ((ms % 1_000) * 1_000_000) as _,
    }
}

pub(crate) fn duration_to_timespec(d: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as _,
    }
}

fn monotonic_timespec() -> libc::timespec {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // CLOCK_MONOTONIC cannot fail with a valid timespec pointer.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts
}
