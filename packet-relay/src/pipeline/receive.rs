use crate::backoff::IdleBackoff;
use crate::buffer::PacketBuffer;
use crate::config::{ConfigError, RelayConfig, RxQueuePolicy};
use crate::context::{ContextId, StopFlag};
use crate::interface::PacketInterface;
use crate::pipeline::counters::{RelayCounters, add};
use crate::probe;
use crate::queue::{QueueId, QueueSet, RoundRobin};
use crate::ring::RingProducer;
use std::mem;
use std::sync::Arc;
use tracing::{info, warn};

enum QueueSelection {
    Fixed(QueueId),
    RoundRobin(RoundRobin),
}

pub struct ReceiveStage {
    context_id: ContextId,
    interface: Arc<dyn PacketInterface>,
    queues: QueueSet,
    selection: QueueSelection,
    burst_size: usize,
    relay: RingProducer<PacketBuffer>,
    stats: RingProducer<PacketBuffer>,
    counters: Arc<RelayCounters>,
    stop: StopFlag,
    backoff: IdleBackoff,
    burst: Vec<PacketBuffer>,
    data: Vec<PacketBuffer>,
    relay_overflow_reported: bool,
    stats_overflow_reported: bool,
}

impl ReceiveStage {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        context_id: ContextId,
        interface: Arc<dyn PacketInterface>,
        queues: QueueSet,
        config: &RelayConfig,
        relay: RingProducer<PacketBuffer>,
        stats: RingProducer<PacketBuffer>,
        counters: Arc<RelayCounters>,
        stop: StopFlag,
    ) -> Result<Self, ConfigError> {
        config.validate_source_queues(queues.len())?;
        let selection = match config.rx_queue_policy {
            RxQueuePolicy::Fixed(index) => {
                let queue = queues.get(index).ok_or(ConfigError::FixedQueueIndex {
                    index,
                    count: queues.len(),
                })?;
                QueueSelection::Fixed(queue)
            }
            RxQueuePolicy::RoundRobin => QueueSelection::RoundRobin(RoundRobin::new()),
        };

        Ok(Self {
            context_id,
            interface,
            queues,
            selection,
            burst_size: config.burst_size,
            relay,
            stats,
            counters,
            stop,
            backoff: IdleBackoff::new(config.backoff),
            burst: Vec::with_capacity(config.burst_size),
            data: Vec::with_capacity(config.burst_size),
            relay_overflow_reported: false,
            stats_overflow_reported: false,
        })
    }

    fn next_queue(&mut self) -> QueueId {
        match &mut self.selection {
            QueueSelection::Fixed(queue) => *queue,
            QueueSelection::RoundRobin(rr) => rr.next_queue(&self.queues),
        }
    }

    /// Receives one burst and hands every buffer on, returning how many were received
    ///
    /// Probes go to the stats ring one by one. Everything else goes to the relay ring as a single
    /// burst, which is dropped in its entirety if the ring cannot take all of it.
    pub fn poll_once(&mut self) -> usize {
        let queue = self.next_queue();
        let received = self
            .interface
            .receive(queue, &mut self.burst, self.burst_size);
        if received == 0 {
            return 0;
        }

        let rx = &self.counters.receive;
        add(&rx.bursts, 1);
        add(&rx.packets, received);

        let mut burst = mem::take(&mut self.burst);
        for buffer in burst.drain(..) {
            if probe::is_probe(buffer.data()) {
                self.enqueue_probe(buffer);
            } else {
                self.data.push(buffer);
            }
        }
        self.burst = burst;

        self.enqueue_data();
        received
    }

    fn enqueue_probe(&mut self, buffer: PacketBuffer) {
        match self.stats.enqueue(buffer) {
            Ok(()) => add(&self.counters.receive.probes_enqueued, 1),
            Err(_dropped) => {
                add(&self.counters.receive.probe_overflow_drops, 1);
                if !self.stats_overflow_reported {
                    self.stats_overflow_reported = true;
                    warn!(
                        context = self.context_id,
                        ring = %self.stats.name(),
                        "stats ring is full, dropping latency probes"
                    );
                }
            }
        }
    }

    fn enqueue_data(&mut self) {
        let len = self.data.len();
        if len == 0 {
            return;
        }

        match self.relay.enqueue_bulk(&mut self.data) {
            Ok(()) => add(&self.counters.receive.relayed, len),
            Err(full) => {
                add(&self.counters.receive.relay_overflow_drops, len);
                if !self.relay_overflow_reported {
                    self.relay_overflow_reported = true;
                    warn!(
                        context = self.context_id,
                        ring = %self.relay.name(),
                        requested = full.requested,
                        free = full.free,
                        "relay ring is full, dropping whole bursts"
                    );
                }

                // Frees every buffer of the rejected burst
                self.data.clear();
            }
        }
    }

    /// Polls until a stop is requested and hands the stage back, rings included
    pub fn run(mut self) -> Self {
        info!(
            context = self.context_id,
            interface = %self.interface.id(),
            queues = %self.queues,
            "receive stage started"
        );

        while !self.stop.is_stop_requested() {
            if self.poll_once() == 0 {
                self.backoff.idle();
            } else {
                self.backoff.reset();
            }
        }

        info!(context = self.context_id, "receive stage stopped");
        self
    }
}
