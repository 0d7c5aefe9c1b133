//! Periodic counter sampling
//!
//! The stats worker of a context samples the software counters of both interfaces, latches and
//! reads their hardware counter blocks (if any), and publishes everything as one telemetry record
//! together with the relay's own drop counters. Between samples it drains the stats ring.
//!
//! Counters are reported as cumulative values. `DELTA_NS` is the length of the interval since the
//! previous sample, so consumers can derive rates by differencing two records.

pub mod latency;

use crate::RelayConfig;
use crate::clock::{CycleClock, delta_ns};
use crate::context::{ContextId, PortBinding, StopFlag};
use crate::hardware::{CounterBlock, HardwareCounters};
use crate::interface::{InterfaceCounters, InterfaceId, PacketInterface};
use crate::pipeline::counters::{CounterSnapshot, RelayCounters, add};
use crate::telemetry::{STATS_MEASUREMENT, TelemetryRecord, TelemetrySink};
use latency::LatencyExtractor;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortSample {
    pub interface: InterfaceId,
    pub counters: InterfaceCounters,
    pub hardware: Option<HardwareCounters>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CounterSample {
    pub source: PortSample,
    pub destination: PortSample,
    pub relay: CounterSnapshot,
    /// Nanoseconds elapsed since the previous sample
    pub delta_ns: u64,
}

impl CounterSample {
    pub fn to_record(&self, context_id: ContextId) -> String {
        let source = &self.source;
        let destination = &self.destination;
        let mut record = TelemetryRecord::new(STATS_MEASUREMENT, format_args!("ctx-{context_id}"))
            .field(
                format_args!("rx_port({})", source.interface.port),
                &source.interface.name,
            )
            .field(
                format_args!("tx_port({})", destination.interface.port),
                &destination.interface.name,
            );

        for (direction, port) in [("(R)", source), ("(T)", destination)] {
            let c = &port.counters;
            record = record
                .field(format_args!("{direction}rx_packets"), c.rx_packets)
                .field(format_args!("{direction}rx_Bytes"), c.rx_bytes)
                .field(format_args!("{direction}rx_fail_packets"), c.rx_errors)
                .field(format_args!("{direction}tx_packets"), c.tx_packets)
                .field(format_args!("{direction}tx_Bytes"), c.tx_bytes)
                .field(format_args!("{direction}tx_fail_packets"), c.tx_errors);
        }

        for (direction, port) in [("(R)", source), ("(T)", destination)] {
            let Some(hardware) = &port.hardware else {
                continue;
            };
            for (name, value) in hardware.fields() {
                record = record.field(format_args!("{direction}hw_{name}"), value);
            }
        }

        for (name, value) in self.relay.fields() {
            record = record.field(name, value);
        }

        record.field("DELTA_NS", self.delta_ns).finish()
    }
}

struct SampledPort {
    interface: Arc<dyn PacketInterface>,
    hardware: Option<CounterBlock>,
}

impl SampledPort {
    fn sample(&self, extended: bool) -> PortSample {
        PortSample {
            interface: self.interface.id().clone(),
            counters: self.interface.counters(),
            hardware: self
                .hardware
                .as_ref()
                .map(|block| block.latch_and_read(extended)),
        }
    }
}

pub struct StatsCollector {
    context_id: ContextId,
    source: SampledPort,
    destination: SampledPort,
    extended_hardware_counters: bool,
    sink: Arc<dyn TelemetrySink>,
    clock: Arc<dyn CycleClock>,
    previous_cycles: u64,
    counters: Arc<RelayCounters>,
    period: Duration,
    poll_interval: Duration,
    stop: StopFlag,
    extractor: LatencyExtractor,
}

impl StatsCollector {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        context_id: ContextId,
        source: &PortBinding,
        destination: &PortBinding,
        config: &RelayConfig,
        extractor: LatencyExtractor,
        sink: Arc<dyn TelemetrySink>,
        clock: Arc<dyn CycleClock>,
        counters: Arc<RelayCounters>,
        stop: StopFlag,
    ) -> Self {
        let previous_cycles = clock.now_cycles();
        Self {
            context_id,
            source: SampledPort {
                interface: source.interface.clone(),
                hardware: source.hardware.clone(),
            },
            destination: SampledPort {
                interface: destination.interface.clone(),
                hardware: destination.hardware.clone(),
            },
            extended_hardware_counters: config.extended_hardware_counters,
            sink,
            clock,
            previous_cycles,
            counters,
            period: config.stats_period,
            poll_interval: config.probe_poll_interval,
            stop,
            extractor,
        }
    }

    pub fn extractor(&mut self) -> &mut LatencyExtractor {
        &mut self.extractor
    }

    /// Samples every counter and advances the interval start to now
    pub fn sample_once(&mut self) -> CounterSample {
        let source = self.source.sample(self.extended_hardware_counters);
        let destination = self.destination.sample(self.extended_hardware_counters);
        let relay = self.counters.snapshot();

        let now = self.clock.now_cycles();
        let delta_ns = delta_ns(self.previous_cycles, now, self.clock.frequency_hz());
        self.previous_cycles = now;

        CounterSample {
            source,
            destination,
            relay,
            delta_ns,
        }
    }

    /// Samples every counter and publishes the result, ignoring publish failures
    pub fn publish_sample(&mut self) -> CounterSample {
        let sample = self.sample_once();
        if self
            .sink
            .publish(&sample.to_record(self.context_id))
            .is_err()
        {
            add(&self.counters.stats.publish_failures, 1);
        }

        sample
    }

    /// Samples on every period and drains probes in between, until a stop is requested
    pub fn run(mut self) -> Self {
        info!(
            context = self.context_id,
            period_ms = self.period.as_millis() as u64,
            "stats worker started"
        );

        let mut next_sample = Instant::now() + self.period;
        while !self.stop.is_stop_requested() {
            let drained = self.extractor.drain_once();

            if Instant::now() >= next_sample {
                self.publish_sample();
                next_sample = Instant::now() + self.period;
            }

            // A full burst means more probes are probably waiting
            if drained < self.extractor.burst_size() {
                let until_sample = next_sample.saturating_duration_since(Instant::now());
                thread::sleep(self.poll_interval.min(until_sample));
            }
        }

        info!(context = self.context_id, "stats worker stopped");
        self
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::clock::ManualClock;
    use crate::hardware::CounterLayout;
    use crate::hardware::memory::MemoryRegisters;
    use crate::interface::memory::MemoryInterface;
    use crate::queue::QueueSet;
    use crate::ring::ring;
    use crate::telemetry::sink::MemorySink;
    use crate::PacketBuffer;

    struct Fixture {
        collector: StatsCollector,
        source: Arc<MemoryInterface>,
        clock: Arc<ManualClock>,
        sink: Arc<MemorySink>,
    }

    fn fixture(with_hardware: bool, config: RelayConfig) -> Fixture {
        let registers = Arc::new(MemoryRegisters::new());
        let layout = CounterLayout::open_nic_cmac(0);
        let source = Arc::new(
            MemoryInterface::new(InterfaceId::new(0, "0000:3b:00.0"), 1, 1)
                .with_hardware_mirror(registers.clone(), layout.clone()),
        );
        let destination = Arc::new(MemoryInterface::new(InterfaceId::new(1, "0000:3b:00.1"), 1, 1));

        let mut source_binding = PortBinding::new(source.clone(), QueueSet::single(0));
        if with_hardware {
            source_binding = source_binding.with_hardware(CounterBlock::new(registers, layout));
        }
        let destination_binding = PortBinding::new(destination, QueueSet::single(0));

        let clock = Arc::new(ManualClock::new(2_000_000_000));
        let sink = Arc::new(MemorySink::new());
        let counters = Arc::new(RelayCounters::new());
        let (_producer, consumer) = ring::<PacketBuffer>("stats".into(), 8).unwrap();
        let extractor = LatencyExtractor::new(4, consumer, sink.clone(), counters.clone(), 32);

        let collector = StatsCollector::new(
            4,
            &source_binding,
            &destination_binding,
            &config,
            extractor,
            sink.clone(),
            clock.clone(),
            counters,
            StopFlag::new(),
        );

        Fixture {
            collector,
            source,
            clock,
            sink,
        }
    }

    #[test]
    fn test_delta_ns_covers_interval_since_previous_sample() {
        let mut f = fixture(false, RelayConfig::default());
        f.clock.advance(2_000_000_000);
        assert_eq!(f.collector.sample_once().delta_ns, 1_000_000_000);
        f.clock.advance(1_000_000_000);
        assert_eq!(f.collector.sample_once().delta_ns, 500_000_000);
        assert_eq!(f.collector.sample_once().delta_ns, 0);
    }

    #[test]
    fn test_record_layout() {
        let mut f = fixture(false, RelayConfig::default());
        f.source.inject(0, PacketBuffer::from_frame(&[0; 100]));
        f.clock.advance(6_000_000_000);

        f.collector.publish_sample();
        let records = f.sink.records();
        assert_eq!(records.len(), 1);
        let record = &records[0];

        assert!(record.starts_with(
            "Forwarder_stats(ctx-4),rx_port(0)=0000:3b:00.0,tx_port(1)=0000:3b:00.1,\
             (R)rx_packets=1,(R)rx_Bytes=100,(R)rx_fail_packets=0,"
        ));
        assert!(record.contains(",(T)tx_fail_packets=0,forwarded=0,"));
        assert!(record.ends_with(",DELTA_NS=3000000000\n"));
        assert!(!record.contains("hw_"));
    }

    #[test]
    fn test_hardware_counters_are_latched_and_reported() {
        let config = RelayConfig {
            extended_hardware_counters: true,
            ..Default::default()
        };
        let mut f = fixture(true, config);
        f.source.inject(0, PacketBuffer::from_frame(&[0; 64]));
        f.source.inject(0, PacketBuffer::from_frame(&[0; 64]));

        let sample = f.collector.publish_sample();
        let hardware = sample.source.hardware.unwrap();
        assert_eq!(hardware.rx_total_pkts, 2);
        assert_eq!(hardware.rx_total_good_bytes, 128);
        assert!(!hardware.extended.is_empty());
        assert!(sample.destination.hardware.is_none());

        let record = &f.sink.records()[0];
        assert!(record.contains(",(R)hw_rx_total_pkts=2,"));
        assert!(record.contains(",(R)hw_rx_pkt_64=0,"));
        assert!(!record.contains("(T)hw_"));
    }
}
