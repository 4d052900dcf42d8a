//! Monotonic tick source for bounded waits.
//!
//! Deadlines in the data plane are expressed in raw counter ticks; the
//! process-wide frequency is detected once where the architecture allows it
//! and can otherwise be installed by platform glue at startup.

use core::sync::atomic::{AtomicU64, Ordering};
use core::time::Duration;

static TICKS_FREQ: AtomicU64 = AtomicU64::new(0);

const NS_PER_SEC: u64 = 1_000_000_000;
const ESTIMATED_FREQ: u64 = 1_000_000_000;

#[cfg(target_arch = "x86_64")]
#[inline]
fn get_ticks_arch() -> u64 {
    unsafe { core::arch::x86_64::_rdtsc() }
}

#[cfg(target_arch = "x86_64")]
fn get_ticks_freq_arch() -> u64 {
    0
}

#[cfg(target_arch = "aarch64")]
#[inline]
fn get_ticks_arch() -> u64 {
    let cnt: u64;

    unsafe { core::arch::asm!("mrs {}, cntvct_el0", out(reg) cnt, options(nomem, nostack)) };

    cnt
}

#[cfg(target_arch = "aarch64")]
fn get_ticks_freq_arch() -> u64 {
    let freq: u64;

    unsafe { core::arch::asm!("mrs {}, cntfrq_el0", out(reg) freq, options(nomem, nostack)) };

    freq
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("unsupported architecture");

/// Current tick counter value.
#[inline]
pub fn now() -> u64 {
    get_ticks_arch()
}

/// Install the tick frequency, overriding detection. Intended for platform
/// glue that has a calibrated value.
pub fn set_freq(hz: u64) {
    TICKS_FREQ.store(hz, Ordering::Relaxed);
}

/// The tick frequency in Hz, detected on first use.
pub fn freq() -> u64 {
    let freq = TICKS_FREQ.load(Ordering::Relaxed);
    if freq != 0 {
        return freq;
    }

    let mut freq = get_ticks_freq_arch();
    if freq == 0 {
        log::debug!("estimating tick frequency; clock timings may be inaccurate");
        freq = ESTIMATED_FREQ;
    }

    TICKS_FREQ.store(freq, Ordering::Relaxed);

    freq
}

/// Convert a duration to a tick count at the current frequency.
pub fn from_duration(d: Duration) -> u64 {
    let hz = freq();

    d.as_secs()
        .saturating_mul(hz)
        .saturating_add(d.subsec_nanos() as u64 * hz / NS_PER_SEC)
}
