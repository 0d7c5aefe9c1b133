use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// A free-running cycle counter with a known frequency
pub trait CycleClock: Send + Sync {
    fn now_cycles(&self) -> u64;
    fn frequency_hz(&self) -> u64;
}

/// Nanoseconds since the clock was created, as a 1 GHz cycle counter
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl CycleClock for MonotonicClock {
    fn now_cycles(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }

    fn frequency_hz(&self) -> u64 {
        1_000_000_000
    }
}

/// The time stamp counter, with its frequency measured against the monotonic clock
#[cfg(target_arch = "x86_64")]
pub struct TscClock {
    hz: u64,
}

#[cfg(target_arch = "x86_64")]
impl TscClock {
    /// Measures the TSC frequency over `window` (longer windows give better estimates)
    pub fn calibrate(window: std::time::Duration) -> Self {
        let start = Instant::now();
        let start_cycles = read_tsc();
        while start.elapsed() < window {
            std::hint::spin_loop();
        }
        let cycles = read_tsc().wrapping_sub(start_cycles);
        let elapsed_ns = start.elapsed().as_nanos().max(1);

        Self {
            hz: (cycles as u128 * 1_000_000_000 / elapsed_ns) as u64,
        }
    }
}

#[cfg(target_arch = "x86_64")]
fn read_tsc() -> u64 {
    // SAFETY: rdtsc is available on every x86_64 processor
    unsafe { std::arch::x86_64::_rdtsc() }
}

#[cfg(target_arch = "x86_64")]
impl CycleClock for TscClock {
    fn now_cycles(&self) -> u64 {
        read_tsc()
    }

    fn frequency_hz(&self) -> u64 {
        self.hz
    }
}

/// A clock that only moves when told to
pub struct ManualClock {
    cycles: AtomicU64,
    hz: u64,
}

impl ManualClock {
    pub fn new(hz: u64) -> Self {
        Self {
            cycles: AtomicU64::new(0),
            hz,
        }
    }

    pub fn advance(&self, cycles: u64) {
        self.cycles.fetch_add(cycles, Ordering::Relaxed);
    }
}

impl CycleClock for ManualClock {
    fn now_cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    fn frequency_hz(&self) -> u64 {
        self.hz
    }
}

/// Converts the cycles elapsed between two readings into nanoseconds
///
/// The counter is allowed to wrap between readings. A clock reporting a zero frequency yields 0,
/// and intervals too long for a u64 of nanoseconds saturate.
pub fn delta_ns(previous: u64, current: u64, hz: u64) -> u64 {
    if hz == 0 {
        return 0;
    }

    let cycles = current.wrapping_sub(previous) as u128;
    u64::try_from(cycles * 1_000_000_000 / hz as u128).unwrap_or(u64::MAX)
}
