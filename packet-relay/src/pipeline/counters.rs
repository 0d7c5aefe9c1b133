use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters of one forwarding context
///
/// Each group is written by exactly one worker and sits on its own cache line, so workers never
/// contend on counter updates. Readers may observe a group mid-update; every value is cumulative
/// and only ever grows.
#[derive(Default)]
pub struct RelayCounters {
    pub receive: CachePadded<ReceiveCounters>,
    pub transmit: CachePadded<TransmitCounters>,
    pub stats: CachePadded<StatsCounters>,
}

#[derive(Default)]
pub struct ReceiveCounters {
    pub bursts: AtomicU64,
    pub packets: AtomicU64,
    pub relayed: AtomicU64,
    pub probes_enqueued: AtomicU64,
    pub relay_overflow_drops: AtomicU64,
    pub probe_overflow_drops: AtomicU64,
}

#[derive(Default)]
pub struct TransmitCounters {
    pub bursts: AtomicU64,
    pub packets: AtomicU64,
    pub partial_drops: AtomicU64,
}

#[derive(Default)]
pub struct StatsCounters {
    pub probes_decoded: AtomicU64,
    pub malformed_probes: AtomicU64,
    pub reordered_hops: AtomicU64,
    pub publish_failures: AtomicU64,
}

pub(crate) fn add(counter: &AtomicU64, n: usize) {
    counter.fetch_add(n as u64, Ordering::Relaxed);
}

fn get(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

impl RelayCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let rx = &self.receive;
        let tx = &self.transmit;
        let stats = &self.stats;
        CounterSnapshot {
            rx_bursts: get(&rx.bursts),
            rx_packets: get(&rx.packets),
            relayed: get(&rx.relayed),
            probes_enqueued: get(&rx.probes_enqueued),
            relay_overflow_drops: get(&rx.relay_overflow_drops),
            probe_overflow_drops: get(&rx.probe_overflow_drops),
            tx_bursts: get(&tx.bursts),
            forwarded: get(&tx.packets),
            tx_partial_drops: get(&tx.partial_drops),
            probes_decoded: get(&stats.probes_decoded),
            malformed_probes: get(&stats.malformed_probes),
            reordered_hops: get(&stats.reordered_hops),
            publish_failures: get(&stats.publish_failures),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub rx_bursts: u64,
    pub rx_packets: u64,
    pub relayed: u64,
    pub probes_enqueued: u64,
    pub relay_overflow_drops: u64,
    pub probe_overflow_drops: u64,
    pub tx_bursts: u64,
    pub forwarded: u64,
    pub tx_partial_drops: u64,
    pub probes_decoded: u64,
    pub malformed_probes: u64,
    pub reordered_hops: u64,
    pub publish_failures: u64,
}

impl CounterSnapshot {
    /// Buffers the relay freed without forwarding them
    pub fn total_drops(&self) -> u64 {
        self.relay_overflow_drops
            + self.probe_overflow_drops
            + self.tx_partial_drops
            + self.malformed_probes
    }

    /// The counters reported in telemetry, in a stable order
    pub fn fields(&self) -> [(&'static str, u64); 9] {
        [
            ("forwarded", self.forwarded),
            ("relay_overflow_drops", self.relay_overflow_drops),
            ("probe_overflow_drops", self.probe_overflow_drops),
            ("tx_partial_drops", self.tx_partial_drops),
            ("probes_decoded", self.probes_decoded),
            ("malformed_probes", self.malformed_probes),
            ("reordered_hops", self.reordered_hops),
            ("rx_bursts", self.rx_bursts),
            ("tx_bursts", self.tx_bursts),
        ]
    }
}
