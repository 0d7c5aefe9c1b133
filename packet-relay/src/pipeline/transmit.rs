use crate::backoff::IdleBackoff;
use crate::buffer::PacketBuffer;
use crate::config::RelayConfig;
use crate::context::{ContextId, StopFlag};
use crate::interface::PacketInterface;
use crate::pipeline::counters::{RelayCounters, add};
use crate::queue::{QueueSet, RoundRobin};
use crate::ring::RingConsumer;
use std::sync::Arc;
use tracing::info;

pub struct TransmitStage {
    context_id: ContextId,
    interface: Arc<dyn PacketInterface>,
    queues: QueueSet,
    round_robin: RoundRobin,
    burst_size: usize,
    relay: RingConsumer<PacketBuffer>,
    counters: Arc<RelayCounters>,
    stop: StopFlag,
    backoff: IdleBackoff,
    burst: Vec<PacketBuffer>,
}

impl TransmitStage {
    pub fn new(
        context_id: ContextId,
        interface: Arc<dyn PacketInterface>,
        queues: QueueSet,
        config: &RelayConfig,
        relay: RingConsumer<PacketBuffer>,
        counters: Arc<RelayCounters>,
        stop: StopFlag,
    ) -> Self {
        Self {
            context_id,
            interface,
            queues,
            round_robin: RoundRobin::new(),
            burst_size: config.burst_size,
            relay,
            counters,
            stop,
            backoff: IdleBackoff::new(config.backoff),
            burst: Vec::with_capacity(config.burst_size),
        }
    }

    /// Buffers still waiting in the relay ring
    pub fn queued(&self) -> usize {
        self.relay.len()
    }

    /// Moves one burst from the relay ring to the next destination queue
    ///
    /// Returns the number of buffers dequeued. The destination queue only advances when there was
    /// something to send. Whatever the interface does not accept is freed.
    pub fn poll_once(&mut self) -> usize {
        let dequeued = self.relay.dequeue_burst(&mut self.burst, self.burst_size);
        if dequeued == 0 {
            return 0;
        }

        let queue = self.round_robin.next_queue(&self.queues);
        let sent = self.interface.transmit(queue, &mut self.burst);

        let tx = &self.counters.transmit;
        add(&tx.bursts, 1);
        add(&tx.packets, sent);
        if !self.burst.is_empty() {
            add(&tx.partial_drops, self.burst.len());
            self.burst.clear();
        }

        dequeued
    }

    /// Polls until a stop is requested and hands the stage back, ring included
    pub fn run(mut self) -> Self {
        info!(
            context = self.context_id,
            interface = %self.interface.id(),
            queues = %self.queues,
            "transmit stage started"
        );

        while !self.stop.is_stop_requested() {
            if self.poll_once() == 0 {
                self.backoff.idle();
            } else {
                self.backoff.reset();
            }
        }

        info!(context = self.context_id, "transmit stage stopped");
        self
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::buffer::BufferPool;
    use crate::interface::InterfaceId;
    use crate::interface::memory::MemoryInterface;
    use crate::queue::QueueId;
    use crate::ring::{RingProducer, ring};

    fn fixture(
        queues: Vec<QueueId>,
    ) -> (
        TransmitStage,
        RingProducer<PacketBuffer>,
        Arc<MemoryInterface>,
        Arc<RelayCounters>,
    ) {
        let interface = Arc::new(MemoryInterface::new(InterfaceId::new(1, "tx"), 0, 3));
        let (producer, consumer) = ring("relay".into(), 64).unwrap();
        let counters = Arc::new(RelayCounters::new());
        let stage = TransmitStage::new(
            0,
            interface.clone(),
            QueueSet::new(queues).unwrap(),
            &RelayConfig::default(),
            consumer,
            counters.clone(),
            StopFlag::new(),
        );
        (stage, producer, interface, counters)
    }

    fn enqueue(producer: &mut RingProducer<PacketBuffer>, pool: &BufferPool, n: usize) {
        let mut burst: Vec<_> = (0..n).map(|_| pool.alloc_frame(&[0; 64]).unwrap()).collect();
        producer.enqueue_bulk(&mut burst).unwrap();
    }

    #[test]
    fn test_round_robin_period() {
        let pool = BufferPool::with_capacity(64);
        let (mut stage, mut producer, interface, _) = fixture(vec![2, 0, 1]);

        for _ in 0..6 {
            enqueue(&mut producer, &pool, 1);
            assert_eq!(stage.poll_once(), 1);
        }

        let queues: Vec<_> = interface.transmit_log().iter().map(|e| e.queue).collect();
        assert_eq!(queues, vec![2, 0, 1, 2, 0, 1]);
    }

    #[test]
    fn test_empty_iterations_do_not_advance_queue() {
        let pool = BufferPool::with_capacity(8);
        let (mut stage, mut producer, interface, _) = fixture(vec![0, 1]);

        enqueue(&mut producer, &pool, 1);
        stage.poll_once();
        assert_eq!(stage.poll_once(), 0);
        assert_eq!(stage.poll_once(), 0);
        enqueue(&mut producer, &pool, 1);
        stage.poll_once();

        let queues: Vec<_> = interface.transmit_log().iter().map(|e| e.queue).collect();
        assert_eq!(queues, vec![0, 1]);
    }

    #[test]
    fn test_partial_transmit_frees_remainder() {
        let pool = BufferPool::with_capacity(32);
        let (mut stage, mut producer, interface, counters) = fixture(vec![0]);
        interface.set_tx_limit(0, Some(4));

        enqueue(&mut producer, &pool, 10);
        assert_eq!(stage.poll_once(), 10);

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.forwarded, 4);
        assert_eq!(snapshot.tx_partial_drops, 6);
        // Only the transmitted buffers are still alive, retained by the interface
        assert_eq!(pool.stats().in_use(), 4);
        drop(interface.take_transmitted(0));
        assert_eq!(pool.stats().in_use(), 0);
    }

    #[test]
    fn test_burst_size_caps_dequeue() {
        let pool = BufferPool::with_capacity(64);
        let (mut stage, mut producer, _, _) = fixture(vec![0]);
        enqueue(&mut producer, &pool, 40);
        assert_eq!(stage.poll_once(), 32);
        assert_eq!(stage.poll_once(), 8);
    }
}
