use crate::hardware::{CMAC_BASE, CMAC_STRIDE, CounterLayout, LATCH_VALUE, RegisterAccess, TICK};
use parking_lot::Mutex;
use std::collections::HashMap;

/// A register file that behaves like a latched counter block
///
/// Counters accumulate in a hidden set of registers and only become readable when a latch
/// value is written to one of the configured latch registers. Anything that is not a latch
/// register reads back the last value written to it.
#[derive(Default)]
pub struct MemoryRegisters {
    inner: Mutex<MemoryRegistersInner>,
}

#[derive(Default)]
struct MemoryRegistersInner {
    accumulators: HashMap<u32, u32>,
    visible: HashMap<u32, u32>,
    latches: HashMap<u32, u64>,
}

impl MemoryRegisters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `delta` to a counter's hidden accumulator (wrapping like the real 32-bit counters)
    pub fn bump(&self, offset: u32, delta: u32) {
        let mut inner = self.inner.lock();
        let counter = inner.accumulators.entry(offset).or_default();
        *counter = counter.wrapping_add(delta);
    }

    /// Counts frames crossing the wire in one direction of the block described by `layout`
    pub fn count_frames(&self, layout: &CounterLayout, receive: bool, frames: u32, bytes: u32) {
        let (pkts, good_pkts, total_bytes, good_bytes) = if receive {
            (
                layout.rx_total_pkts,
                layout.rx_total_good_pkts,
                layout.rx_total_bytes,
                layout.rx_total_good_bytes,
            )
        } else {
            (
                layout.tx_total_pkts,
                layout.tx_total_good_pkts,
                layout.tx_total_bytes,
                layout.tx_total_good_bytes,
            )
        };

        self.bump(pkts, frames);
        self.bump(good_pkts, frames);
        self.bump(total_bytes, bytes);
        self.bump(good_bytes, bytes);
    }

    /// How many times the latch register at `offset` was written
    pub fn latch_count(&self, offset: u32) -> u64 {
        self.inner.lock().latches.get(&offset).copied().unwrap_or(0)
    }
}

impl RegisterAccess for MemoryRegisters {
    fn read_register(&self, offset: u32) -> u32 {
        self.inner.lock().visible.get(&offset).copied().unwrap_or(0)
    }

    fn write_register(&self, offset: u32, value: u32) {
        let mut inner = self.inner.lock();
        if value == LATCH_VALUE && is_latch_register(offset) {
            *inner.latches.entry(offset).or_default() += 1;
            // Only the latched block becomes visible
            let block = offset - TICK..offset - TICK + CMAC_STRIDE;
            let snapshot: Vec<_> = inner
                .accumulators
                .iter()
                .filter(|(offset, _)| block.contains(*offset))
                .map(|(offset, value)| (*offset, *value))
                .collect();
            inner.visible.extend(snapshot);
        } else {
            inner.visible.insert(offset, value);
        }
    }
}

fn is_latch_register(offset: u32) -> bool {
    // Tick registers sit at the same spot of every block
    offset >= CMAC_BASE && (offset - CMAC_BASE) % CMAC_STRIDE == TICK
}
