//! Synthetic traffic for the source ports of the relay
//!
//! Data frames carry random payloads behind an IPv4 ethertype. Every `probe_every` frames a
//! latency probe is injected instead, stamped as if it had crossed three hops with a random
//! latency each.

use crate::config::json::TrafficJson;
use fastrand::Rng;
use packet_relay::BufferPool;
use packet_relay::interface::memory::MemoryInterface;
use packet_relay::probe::{
    HOP_COUNT, SYNC_PERIOD_NS, TICK_PERIOD_NS, TimestampRecord, build_probe_frame,
};
use packet_relay::queue::{QueueId, QueueSet, RoundRobin};
use std::sync::Arc;
use std::time::{Duration, Instant};

const MIN_FRAME_LEN: usize = 60;

#[derive(Clone, Copy, Debug, Default)]
pub struct TrafficStats {
    pub data_frames: u64,
    pub probes: u64,
    /// Frames the receive queues had no room for
    pub rx_overflows: u64,
    /// Frames that could not be generated because every pool buffer was in use
    pub pool_exhausted: u64,
}

pub struct TrafficGenerator {
    rng: Rng,
    pool: BufferPool,
    interface: Arc<MemoryInterface>,
    queues: QueueSet,
    round_robin: RoundRobin,
    frame: Vec<u8>,
    burst: usize,
    probe_every: u64,
    hop_latency_ns: [u64; 2],
    generated: u64,
    probe_origin: Instant,
    stats: TrafficStats,
}

impl TrafficGenerator {
    pub fn new(
        seed: u64,
        pool: BufferPool,
        interface: Arc<MemoryInterface>,
        queues: QueueSet,
        traffic: &TrafficJson,
    ) -> Self {
        let mut frame = vec![0; traffic.frame_size.max(MIN_FRAME_LEN)];
        // Locally administered unicast addresses, IPv4 payload
        frame[..6].copy_from_slice(&[0x02, 0, 0, 0, 0, 0x02]);
        frame[6..12].copy_from_slice(&[0x02, 0, 0, 0, 0, 0x01]);
        frame[12..14].copy_from_slice(&[0x08, 0x00]);

        let [low, high] = traffic.hop_latency_ns;
        Self {
            rng: Rng::with_seed(seed),
            pool,
            interface,
            queues,
            round_robin: RoundRobin::default(),
            frame,
            burst: traffic.burst.max(1),
            probe_every: traffic.probe_every,
            hop_latency_ns: [low.min(high), low.max(high)],
            generated: 0,
            probe_origin: Instant::now(),
            stats: TrafficStats::default(),
        }
    }

    pub fn stats(&self) -> TrafficStats {
        self.stats
    }

    /// Generates one burst and injects it into the next source queue
    pub fn inject_burst(&mut self) {
        let mut buffers = Vec::with_capacity(self.burst);
        for _ in 0..self.burst {
            self.generated += 1;
            let is_probe = self.probe_every != 0 && self.generated % self.probe_every == 0;

            let buffer = if is_probe {
                let frame = build_probe_frame(&self.next_timestamps());
                self.pool.alloc_frame(&frame)
            } else {
                self.rng.fill(&mut self.frame[14..]);
                self.pool.alloc_frame(&self.frame)
            };

            match buffer {
                Some(buffer) => {
                    if is_probe {
                        self.stats.probes += 1;
                    } else {
                        self.stats.data_frames += 1;
                    }
                    buffers.push(buffer);
                }
                None => self.stats.pool_exhausted += 1,
            }
        }

        let requested = buffers.len();
        let queue = self.next_queue();
        let accepted = self.interface.inject_burst(queue, buffers);
        self.stats.rx_overflows += (requested - accepted) as u64;
    }

    /// Injects bursts at `packets_per_second` until `deadline` or until `stop` returns true
    pub fn run_until(
        &mut self,
        deadline: Instant,
        packets_per_second: u64,
        mut stop: impl FnMut() -> bool,
    ) {
        let pause = Duration::from_secs_f64(self.burst as f64 / packets_per_second.max(1) as f64);
        let mut next_burst = Instant::now();
        while Instant::now() < deadline && !stop() {
            self.inject_burst();
            next_burst += pause;
            let now = Instant::now();
            if next_burst > now {
                std::thread::sleep(next_burst - now);
            } else {
                // Running behind, don't try to catch up with a flood
                next_burst = now;
            }
        }
    }

    fn next_queue(&mut self) -> QueueId {
        self.round_robin.next_queue(&self.queues)
    }

    /// Timestamps of a probe that left the oldest hop now and reached the newest one later
    fn next_timestamps(&mut self) -> TimestampRecord {
        let [low, high] = self.hop_latency_ns;
        let mut at_ns = [0; HOP_COUNT];
        at_ns[HOP_COUNT - 1] = self.probe_origin.elapsed().as_nanos() as u64;
        for hop in (0..HOP_COUNT - 1).rev() {
            at_ns[hop] = at_ns[hop + 1] + self.rng.u64(low..=high);
        }

        TimestampRecord::new(
            at_ns.map(|ns| ns / SYNC_PERIOD_NS),
            at_ns.map(|ns| ns % SYNC_PERIOD_NS / TICK_PERIOD_NS),
        )
    }
}
