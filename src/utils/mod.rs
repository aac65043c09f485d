//! Small helpers shared across the compositor.

use std::time::Duration;

pub mod geometry;
pub mod region;

pub fn get_monotonic_time() -> Duration {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // Returns EFAULT or EINVAL only for invalid arguments, which these are not.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32)
}

/// Multiplies a duration by a factor, saturating instead of panicking.
pub fn mul_duration(duration: Duration, factor: f64) -> Duration {
    if factor <= 0. {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(duration.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}
