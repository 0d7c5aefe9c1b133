//! An interface backed by plain memory
//!
//! Frames are injected into receive queues by hand and whatever the relay transmits is either
//! retained for inspection or dropped on the spot (returning the buffer to its pool). Counters are
//! kept the way a driver would keep them, and can optionally be mirrored into a simulated hardware
//! counter block.

use crate::buffer::PacketBuffer;
use crate::hardware::CounterLayout;
use crate::hardware::memory::MemoryRegisters;
use crate::interface::{InterfaceCounters, InterfaceId, PacketInterface};
use crate::pcap_exporter::PcapExporter;
use crate::queue::QueueId;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

pub const DEFAULT_RX_DEPTH: usize = 1024;

/// A call to [`PacketInterface::transmit`], as seen by the interface
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransmitEvent {
    pub queue: QueueId,
    pub requested: usize,
    pub accepted: usize,
}

pub struct MemoryInterface {
    id: InterfaceId,
    rx_queues: Vec<Mutex<VecDeque<PacketBuffer>>>,
    rx_depth: usize,
    tx_queues: Vec<TxQueue>,
    retain_transmitted: bool,
    transmit_log: Mutex<Vec<TransmitEvent>>,
    counters: Counters,
    pcap_exporter: Option<Arc<PcapExporter>>,
    hardware: Option<(Arc<MemoryRegisters>, CounterLayout)>,
}

struct TxQueue {
    /// Maximum number of buffers accepted per transmit call
    limit: AtomicUsize,
    transmitted: Mutex<Vec<PacketBuffer>>,
}

#[derive(Default)]
struct Counters {
    rx_packets: AtomicU64,
    rx_bytes: AtomicU64,
    rx_errors: AtomicU64,
    tx_packets: AtomicU64,
    tx_bytes: AtomicU64,
    tx_errors: AtomicU64,
}

impl MemoryInterface {
    pub fn new(id: InterfaceId, rx_queue_count: u16, tx_queue_count: u16) -> Self {
        Self {
            id,
            rx_queues: (0..rx_queue_count)
                .map(|_| Mutex::new(VecDeque::new()))
                .collect(),
            rx_depth: DEFAULT_RX_DEPTH,
            tx_queues: (0..tx_queue_count)
                .map(|_| TxQueue {
                    limit: AtomicUsize::new(usize::MAX),
                    transmitted: Mutex::new(Vec::new()),
                })
                .collect(),
            retain_transmitted: true,
            transmit_log: Mutex::new(Vec::new()),
            counters: Counters::default(),
            pcap_exporter: None,
            hardware: None,
        }
    }

    /// Limits how many frames may wait in each receive queue before new arrivals are missed
    pub fn with_rx_depth(mut self, depth: usize) -> Self {
        self.rx_depth = depth;
        self
    }

    /// Drops transmitted frames instead of retaining them, for long-running simulations
    pub fn discard_transmitted(mut self) -> Self {
        self.retain_transmitted = false;
        self
    }

    pub fn with_pcap_exporter(mut self, exporter: Arc<PcapExporter>) -> Self {
        self.pcap_exporter = Some(exporter);
        self
    }

    /// Counts every frame crossing this interface in the given counter block as well
    pub fn with_hardware_mirror(
        mut self,
        registers: Arc<MemoryRegisters>,
        layout: CounterLayout,
    ) -> Self {
        self.hardware = Some((registers, layout));
        self
    }

    /// Caps the number of buffers a single transmit call accepts on `queue`
    pub fn set_tx_limit(&self, queue: QueueId, limit: Option<usize>) {
        if let Some(tx) = self.tx_queues.get(queue as usize) {
            tx.limit.store(limit.unwrap_or(usize::MAX), Ordering::Relaxed);
        }
    }

    /// Delivers a frame to a receive queue, as if it had just arrived from the wire
    ///
    /// Returns false if the queue does not exist or is full, in which case the frame is dropped
    /// and counted as a receive error.
    pub fn inject(&self, queue: QueueId, buffer: PacketBuffer) -> bool {
        self.inject_burst(queue, [buffer]) == 1
    }

    /// Delivers several frames at once, so that a single receive call can observe all of them
    pub fn inject_burst(
        &self,
        queue: QueueId,
        buffers: impl IntoIterator<Item = PacketBuffer>,
    ) -> usize {
        let Some(rx) = self.rx_queues.get(queue as usize) else {
            let missed = buffers.into_iter().count();
            self.counters
                .rx_errors
                .fetch_add(missed as u64, Ordering::Relaxed);
            return 0;
        };

        let mut accepted = 0;
        let mut accepted_bytes = 0;
        let mut missed = 0;
        let mut rx = rx.lock();
        for buffer in buffers {
            if rx.len() >= self.rx_depth {
                missed += 1;
                continue;
            }

            accepted += 1;
            accepted_bytes += buffer.len();
            rx.push_back(buffer);
        }
        drop(rx);

        self.counters
            .rx_packets
            .fetch_add(accepted as u64, Ordering::Relaxed);
        self.counters
            .rx_bytes
            .fetch_add(accepted_bytes as u64, Ordering::Relaxed);
        self.counters
            .rx_errors
            .fetch_add(missed as u64, Ordering::Relaxed);
        if let Some((registers, layout)) = &self.hardware {
            registers.count_frames(layout, true, accepted as u32, accepted_bytes as u32);
        }

        accepted
    }

    /// Frames waiting in a receive queue
    pub fn pending_rx(&self, queue: QueueId) -> usize {
        self.rx_queues
            .get(queue as usize)
            .map(|rx| rx.lock().len())
            .unwrap_or(0)
    }

    /// Takes the frames transmitted on `queue` so far, in transmission order
    pub fn take_transmitted(&self, queue: QueueId) -> Vec<PacketBuffer> {
        self.tx_queues
            .get(queue as usize)
            .map(|tx| std::mem::take(&mut *tx.transmitted.lock()))
            .unwrap_or_default()
    }

    /// Every transmit call observed so far (only recorded when transmitted frames are retained)
    pub fn transmit_log(&self) -> Vec<TransmitEvent> {
        self.transmit_log.lock().clone()
    }
}

impl PacketInterface for MemoryInterface {
    fn id(&self) -> &InterfaceId {
        &self.id
    }

    fn receive(&self, queue: QueueId, out: &mut Vec<PacketBuffer>, max: usize) -> usize {
        let Some(rx) = self.rx_queues.get(queue as usize) else {
            return 0;
        };

        let mut rx = rx.lock();
        let n = rx.len().min(max);
        out.extend(rx.drain(..n));
        n
    }

    fn transmit(&self, queue: QueueId, burst: &mut Vec<PacketBuffer>) -> usize {
        let Some(tx) = self.tx_queues.get(queue as usize) else {
            return 0;
        };

        let requested = burst.len();
        let accepted = requested.min(tx.limit.load(Ordering::Relaxed));
        let bytes: usize = burst[..accepted].iter().map(|b| b.len()).sum();

        if let Some(exporter) = &self.pcap_exporter {
            for buffer in &burst[..accepted] {
                exporter.track_frame(buffer.data());
            }
        }

        if self.retain_transmitted {
            tx.transmitted.lock().extend(burst.drain(..accepted));
            self.transmit_log.lock().push(TransmitEvent {
                queue,
                requested,
                accepted,
            });
        } else {
            burst.drain(..accepted);
        }

        self.counters
            .tx_packets
            .fetch_add(accepted as u64, Ordering::Relaxed);
        self.counters
            .tx_bytes
            .fetch_add(bytes as u64, Ordering::Relaxed);
        self.counters
            .tx_errors
            .fetch_add((requested - accepted) as u64, Ordering::Relaxed);
        if let Some((registers, layout)) = &self.hardware {
            registers.count_frames(layout, false, accepted as u32, bytes as u32);
        }

        accepted
    }

    fn counters(&self) -> InterfaceCounters {
        let c = &self.counters;
        InterfaceCounters {
            rx_packets: c.rx_packets.load(Ordering::Relaxed),
            rx_bytes: c.rx_bytes.load(Ordering::Relaxed),
            rx_errors: c.rx_errors.load(Ordering::Relaxed),
            tx_packets: c.tx_packets.load(Ordering::Relaxed),
            tx_bytes: c.tx_bytes.load(Ordering::Relaxed),
            tx_errors: c.tx_errors.load(Ordering::Relaxed),
        }
    }
}
