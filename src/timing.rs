//! Cycle-counter timing.
//!
//! Packet-loss epochs and event-loop deadlines are measured in
//! timestamp-counter cycles so that wall-clock adjustments never affect
//! them. The counter frequency is calibrated once per process.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Read the timestamp counter.
#[inline]
pub fn rdtsc() -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        unsafe { std::arch::x86_64::_rdtsc() }
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        static START: OnceLock<Instant> = OnceLock::new();
        let start = START.get_or_init(Instant::now);
        start.elapsed().as_nanos() as u64
    }
}

/// Cycles per millisecond, calibrated once against the monotonic clock.
pub fn cycles_per_ms() -> u64 {
    static FREQ: OnceLock<u64> = OnceLock::new();
    *FREQ.get_or_init(|| {
        let t0 = Instant::now();
        let c0 = rdtsc();
        std::thread::sleep(Duration::from_millis(2));
        let c1 = rdtsc();
        let elapsed = t0.elapsed();
        let cycles = c1.saturating_sub(c0).max(1);
        let ns = elapsed.as_nanos().max(1) as u64;
        (cycles.saturating_mul(1_000_000) / ns).max(1)
    })
}

/// Convert milliseconds to cycle-counter ticks.
#[inline]
pub fn ms_to_cycles(ms: u64) -> u64 {
    ms.saturating_mul(cycles_per_ms())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rdtsc_monotonic() {
        let a = rdtsc();
        let b = rdtsc();
        assert!(b >= a);
    }

    #[test]
    fn test_calibration_sane() {
        // Any plausible clock runs between 1 kHz and 10 GHz.
        let f = cycles_per_ms();
        assert!(f >= 1);
        assert!(f < 10_000_000_000);
    }

    #[test]
    fn test_ms_to_cycles_scales() {
        assert_eq!(ms_to_cycles(10), 10 * cycles_per_ms());
    }
}
