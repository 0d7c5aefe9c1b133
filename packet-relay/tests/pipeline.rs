use bon::builder;
use packet_relay::clock::MonotonicClock;
use packet_relay::config::RelayConfig;
use packet_relay::context::{ContextState, ForwardingContext, PortBinding};
use packet_relay::interface::memory::MemoryInterface;
use packet_relay::interface::{
    DeviceEventListener, InterfaceCounters, InterfaceId, PacketInterface,
};
use packet_relay::probe::{TimestampRecord, build_probe_frame};
use packet_relay::queue::{QueueId, QueueSet};
use packet_relay::ring::RingNamer;
use packet_relay::telemetry::sink::MemorySink;
use packet_relay::telemetry::{LATENCY_MEASUREMENT, PublishError, STATS_MEASUREMENT, TelemetrySink};
use packet_relay::{BufferPool, PacketBuffer, Relay};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(5);

/// Holds back whoever passes it while closed
#[derive(Default)]
struct Gate {
    state: Mutex<GateState>,
    changed: Condvar,
}

#[derive(Default)]
struct GateState {
    closed: bool,
    entered: bool,
}

impl Gate {
    fn close(&self) {
        self.state.lock().closed = true;
    }

    fn open(&self) {
        self.state.lock().closed = false;
        self.changed.notify_all();
    }

    fn pass(&self) {
        let mut state = self.state.lock();
        if !state.closed {
            return;
        }

        state.entered = true;
        self.changed.notify_all();
        while state.closed {
            self.changed.wait(&mut state);
        }
    }

    fn wait_until_entered(&self) {
        let mut state = self.state.lock();
        while !state.entered {
            let result = self.changed.wait_for(&mut state, TIMEOUT);
            assert!(!result.timed_out(), "timed out waiting at the gate");
        }
    }
}

/// A memory interface that counts the calls it gets and can hold transmit calls at a gate
struct ObservedInterface {
    inner: Arc<MemoryInterface>,
    receive_calls: AtomicU64,
    transmit_calls: AtomicU64,
    transmit_gate: Gate,
}

impl ObservedInterface {
    fn new(inner: Arc<MemoryInterface>) -> Self {
        Self {
            inner,
            receive_calls: AtomicU64::new(0),
            transmit_calls: AtomicU64::new(0),
            transmit_gate: Gate::default(),
        }
    }

    fn calls(&self) -> (u64, u64) {
        (
            self.receive_calls.load(Ordering::SeqCst),
            self.transmit_calls.load(Ordering::SeqCst),
        )
    }
}

impl PacketInterface for ObservedInterface {
    fn id(&self) -> &InterfaceId {
        self.inner.id()
    }

    fn receive(&self, queue: QueueId, out: &mut Vec<PacketBuffer>, max: usize) -> usize {
        self.receive_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.receive(queue, out, max)
    }

    fn transmit(&self, queue: QueueId, burst: &mut Vec<PacketBuffer>) -> usize {
        self.transmit_calls.fetch_add(1, Ordering::SeqCst);
        self.transmit_gate.pass();
        self.inner.transmit(queue, burst)
    }

    fn counters(&self) -> InterfaceCounters {
        self.inner.counters()
    }
}

/// A memory sink whose publish calls can be held at a gate
#[derive(Default)]
struct GatedSink {
    inner: MemorySink,
    gate: Gate,
}

impl TelemetrySink for GatedSink {
    fn publish(&self, record: &str) -> Result<(), PublishError> {
        self.gate.pass();
        self.inner.publish(record)
    }
}

struct Fixture {
    context: ForwardingContext,
    source: Arc<MemoryInterface>,
    destination: Arc<MemoryInterface>,
    source_port: Arc<ObservedInterface>,
    destination_port: Arc<ObservedInterface>,
    pool: BufferPool,
    sink: Arc<MemorySink>,
}

#[builder]
fn fixture(
    source_queues: Option<Vec<QueueId>>,
    destination_queues: Option<Vec<QueueId>>,
    config: Option<RelayConfig>,
    tx_limit: Option<usize>,
) -> Fixture {
    let source_queues = source_queues.unwrap_or(vec![0]);
    let destination_queues = destination_queues.unwrap_or(vec![0]);
    let config = config.unwrap_or_default();

    let source = Arc::new(MemoryInterface::new(InterfaceId::new(0, "0000:3b:00.0"), 3, 3));
    let destination = Arc::new(MemoryInterface::new(InterfaceId::new(1, "0000:3b:00.1"), 3, 3));
    for queue in &destination_queues {
        destination.set_tx_limit(*queue, tx_limit);
    }
    let source_port = Arc::new(ObservedInterface::new(source.clone()));
    let destination_port = Arc::new(ObservedInterface::new(destination.clone()));

    let context = ForwardingContext::new(
        0,
        PortBinding::new(source_port.clone(), QueueSet::new(source_queues).unwrap()),
        PortBinding::new(
            destination_port.clone(),
            QueueSet::new(destination_queues).unwrap(),
        ),
        &config,
        &mut RingNamer::new(),
    )
    .unwrap();

    Fixture {
        context,
        source,
        destination,
        source_port,
        destination_port,
        pool: BufferPool::with_capacity(1024),
        sink: Arc::new(MemorySink::new()),
    }
}

fn data_frame(sequence: u8) -> Vec<u8> {
    let mut frame = vec![0; 64];
    frame[12..14].copy_from_slice(&[0x08, 0x00]);
    frame[14] = sequence;
    frame
}

fn inject_data(
    source: &MemoryInterface,
    pool: &BufferPool,
    queue: QueueId,
    sequences: impl Iterator<Item = u8>,
) {
    let buffers: Vec<PacketBuffer> = sequences
        .map(|seq| pool.alloc_frame(&data_frame(seq)).unwrap())
        .collect();
    let count = buffers.len();
    assert_eq!(source.inject_burst(queue, buffers), count);
}

fn inject_timestamped(source: &MemoryInterface, pool: &BufferPool, count: usize) {
    let frame = build_probe_frame(&TimestampRecord::new([100, 98, 95], [40, 10, 5]));
    let frames: Vec<_> = (0..count)
        .map(|_| pool.alloc_frame(&frame).unwrap())
        .collect();
    assert_eq!(source.inject_burst(0, frames), count);
}

fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let start = Instant::now();
    while !condition() {
        assert!(start.elapsed() < TIMEOUT, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_three_bursts_alternate_destination_queues() {
    let f = fixture()
        .destination_queues(vec![0, 1])
        .call();
    let running = f
        .context
        .launch(f.sink.clone(), Arc::new(MonotonicClock::new()))
        .unwrap();

    for burst in 0..3u8 {
        inject_data(&f.source, &f.pool, 0, burst * 10..burst * 10 + 10);
        let expected = (burst as u64 + 1) * 10;
        wait_until("burst to be forwarded", || {
            running.counters().forwarded == expected
        });
    }

    let report = running.join().unwrap().destroy();
    assert_eq!(report.counters.forwarded, 30);
    assert_eq!(report.counters.total_drops(), 0);

    let log = f.destination.transmit_log();
    let queues: Vec<_> = log.iter().map(|e| e.queue).collect();
    assert_eq!(queues, vec![0, 1, 0]);
    assert!(log.iter().all(|e| e.requested == 10 && e.accepted == 10));

    // Frames arrive in order, exactly once
    let mut sequences: Vec<u8> = f
        .destination
        .take_transmitted(0)
        .iter()
        .map(|b| b.data()[14])
        .collect();
    assert_eq!(sequences, (0..10).chain(20..30).collect::<Vec<_>>());
    sequences = f
        .destination
        .take_transmitted(1)
        .iter()
        .map(|b| b.data()[14])
        .collect();
    assert_eq!(sequences, (10..20).collect::<Vec<_>>());
    assert_eq!(f.pool.stats().in_use(), 0);
}

#[test]
fn test_no_ring_operations_after_drain() {
    let f = fixture()
        .destination_queues(vec![0, 1, 2])
        .call();
    let running = f
        .context
        .launch(f.sink.clone(), Arc::new(MonotonicClock::new()))
        .unwrap();

    for round in 0..20u8 {
        inject_data(
            &f.source,
            &f.pool,
            0,
            (0..8).map(|i| round.wrapping_mul(8).wrapping_add(i)),
        );
    }
    running.request_stop();
    let (receives_at_stop, _) = f.source_port.calls();
    let (_, transmits_at_stop) = f.destination_port.calls();
    let counters_at_stop = running.counters();
    assert_eq!(running.state(), ContextState::StopRequested);

    let started = Instant::now();
    let drained = running.join().unwrap();
    assert!(started.elapsed() < TIMEOUT);
    assert_eq!(drained.state(), ContextState::Drained);

    // Each worker finishes at most the burst it was working on when the flag was raised
    let (receives, _) = f.source_port.calls();
    let (_, transmits) = f.destination_port.calls();
    assert!(receives - receives_at_stop <= 1);
    assert!(transmits - transmits_at_stop <= 1);
    let before = drained.counters();
    assert!(before.rx_bursts - counters_at_stop.rx_bursts <= 1);
    assert!(before.tx_bursts - counters_at_stop.tx_bursts <= 1);

    // Nobody touches the interfaces or the rings anymore
    let pending = f.source.pending_rx(0);
    inject_data(&f.source, &f.pool, 0, 0..8);
    thread::sleep(Duration::from_millis(20));
    assert_eq!(drained.counters(), before);
    assert_eq!(f.source.pending_rx(0), pending + 8);
    assert_eq!(f.source_port.calls().0, receives);
    assert_eq!(f.destination_port.calls().1, transmits);

    // Destroying the context frees whatever was still queued in its rings
    let report = drained.destroy();
    let retained: usize = (0..3).map(|q| f.destination.take_transmitted(q).len()).sum();
    assert_eq!(retained as u64, report.counters.forwarded);
    let still_waiting = f.source.pending_rx(0) as u64;
    assert_eq!(f.pool.stats().in_use(), still_waiting);
}

#[test]
fn test_destroy_reports_buffers_left_in_rings() {
    let config = RelayConfig {
        stats_period: Duration::from_secs(60),
        ..Default::default()
    };
    let f = fixture().config(config).call();
    let sink = Arc::new(GatedSink::default());
    f.destination_port.transmit_gate.close();
    sink.gate.close();

    let running = f
        .context
        .launch(sink.clone(), Arc::new(MonotonicClock::new()))
        .unwrap();

    // Hold the transmit worker inside its first transmit call
    inject_data(&f.source, &f.pool, 0, 0..5);
    f.destination_port.transmit_gate.wait_until_entered();

    // Hold the stats worker inside its first publish
    inject_timestamped(&f.source, &f.pool, 1);
    sink.gate.wait_until_entered();

    // The receive worker queues the timestamped frames before the data behind them
    inject_timestamped(&f.source, &f.pool, 3);
    inject_data(&f.source, &f.pool, 0, 5..25);
    wait_until("everything to be queued", || running.counters().relayed == 25);

    running.request_stop();
    f.destination_port.transmit_gate.open();
    sink.gate.open();
    let report = running.join().unwrap().destroy();

    assert_eq!(report.counters.forwarded, 5);
    assert_eq!(report.abandoned_in_relay_ring, 20);
    assert_eq!(report.abandoned_in_stats_ring, 3);
    assert_eq!(sink.inner.records_for(LATENCY_MEASUREMENT).len(), 1);

    // Only the forwarded frames, kept by the destination, are still allocated
    assert_eq!(f.pool.stats().in_use(), 5);
    assert_eq!(f.destination.take_transmitted(0).len(), 5);
    assert_eq!(f.pool.stats().in_use(), 0);
}

#[test]
fn test_probes_become_latency_records() {
    let config = RelayConfig {
        stats_period: Duration::from_millis(20),
        probe_poll_interval: Duration::from_millis(1),
        ..Default::default()
    };
    let f = fixture().config(config).call();
    let running = f
        .context
        .launch(f.sink.clone(), Arc::new(MonotonicClock::new()))
        .unwrap();

    inject_timestamped(&f.source, &f.pool, 3);
    inject_data(&f.source, &f.pool, 0, 0..5);

    wait_until("latency records", || {
        f.sink.records_for(LATENCY_MEASUREMENT).len() == 3
    });
    wait_until("a stats record", || {
        !f.sink.records_for(STATS_MEASUREMENT).is_empty()
    });

    let report = running.join().unwrap().destroy();
    for record in f.sink.records_for(LATENCY_MEASUREMENT) {
        assert_eq!(record, "Latency_stats(ctx-0),hop(0)=2120,hop(1)=3020\n");
    }

    let stats = &f.sink.records_for(STATS_MEASUREMENT)[0];
    assert!(stats.starts_with("Forwarder_stats(ctx-0),rx_port(0)=0000:3b:00.0,"));
    assert!(stats.contains(",DELTA_NS="));

    // Probes are consumed by the stats worker, never forwarded
    assert_eq!(report.counters.probes_decoded, 3);
    assert_eq!(report.counters.forwarded, 5);
    assert_eq!(f.destination.take_transmitted(0).len(), 5);
    assert_eq!(f.pool.stats().in_use(), 0);
}

#[test]
fn test_partial_transmit_frees_every_rejected_buffer() {
    let f = fixture().tx_limit(3).call();
    let running = f
        .context
        .launch(f.sink.clone(), Arc::new(MonotonicClock::new()))
        .unwrap();

    inject_data(&f.source, &f.pool, 0, 0..10);
    wait_until("the burst to be handled", || {
        let counters = running.counters();
        counters.forwarded + counters.tx_partial_drops == 10
    });

    let report = running.join().unwrap().destroy();
    assert_eq!(report.counters.forwarded, 3);
    assert_eq!(report.counters.tx_partial_drops, 7);
    assert_eq!(f.pool.stats().in_use(), 3);

    let sent = f.destination.take_transmitted(0);
    let sequences: Vec<_> = sent.iter().map(|b| b.data()[14]).collect();
    assert_eq!(sequences, vec![0, 1, 2]);
    drop(sent);

    let pool = f.pool.stats();
    assert_eq!(pool.in_use(), 0);
    assert_eq!(pool.allocated, 10);
    assert_eq!(pool.freed, 10);
    assert_eq!(f.destination.counters().tx_packets, 3);
}

#[test]
fn test_dropped_running_context_forwards_nothing() {
    let f = fixture().call();
    let running = f
        .context
        .launch(f.sink.clone(), Arc::new(MonotonicClock::new()))
        .unwrap();
    let handle = running.handle();

    drop(running);
    assert_eq!(handle.state(), ContextState::Destroyed);

    inject_data(&f.source, &f.pool, 0, 0..1);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(f.destination.counters().tx_packets, 0);
    assert_eq!(f.source.pending_rx(0), 1);
    assert_eq!(f.pool.stats().in_use(), 1);
}

#[test]
fn test_device_removal_stops_bound_context() {
    let source = Arc::new(MemoryInterface::new(InterfaceId::new(0, "a"), 1, 1));
    let destination = Arc::new(MemoryInterface::new(InterfaceId::new(1, "b"), 1, 1));
    let other = Arc::new(MemoryInterface::new(InterfaceId::new(2, "c"), 1, 1));

    let mut relay = Relay::new(RelayConfig::default()).unwrap();
    let bound = relay
        .add_context(
            0,
            PortBinding::new(source.clone(), QueueSet::single(0)),
            PortBinding::new(destination.clone(), QueueSet::single(0)),
        )
        .unwrap();
    let unrelated = relay
        .add_context(
            1,
            PortBinding::new(other.clone(), QueueSet::single(0)),
            PortBinding::new(other.clone(), QueueSet::single(0)),
        )
        .unwrap();

    let running = relay
        .start(Arc::new(MemorySink::new()), Arc::new(MonotonicClock::new()))
        .unwrap();
    running
        .device_events()
        .on_device_removed(destination.id());

    assert_eq!(bound.state(), ContextState::StopRequested);
    assert_eq!(unrelated.state(), ContextState::Running);

    let reports = running.shutdown().unwrap();
    assert_eq!(reports.len(), 2);
    assert_eq!(bound.state(), ContextState::Destroyed);
    assert_eq!(unrelated.state(), ContextState::Destroyed);
}
