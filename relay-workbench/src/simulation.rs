use crate::config::cli::CliOpt;
use crate::config::json::{DeviceEventJson, DeviceEventKind, PortQueuesJson, WorkbenchJsonConfig};
use crate::traffic::TrafficGenerator;
use crate::util;
use anyhow::{Context, anyhow, bail};
use fastrand::Rng;
use packet_relay::clock::{CycleClock, MonotonicClock};
use packet_relay::hardware::memory::MemoryRegisters;
use packet_relay::hardware::{CounterBlock, CounterLayout};
use packet_relay::interface::memory::MemoryInterface;
use packet_relay::interface::{DeviceEventListener, InterfaceId, PacketInterface};
use packet_relay::pcap_exporter::{
    FileBasedPcapExporterFactory, NoOpPcapExporterFactory, PcapExporter, PcapExporterFactory,
};
use packet_relay::queue::QueueSet;
use packet_relay::relay::RelayEvents;
use packet_relay::telemetry::TelemetrySink;
use packet_relay::telemetry::sink::{NullSink, UdpSink, WriterSink};
use packet_relay::{BufferPool, ContextState, PortBinding, Relay, RelayConfig};
use std::collections::HashMap;
use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A simulated port: an in-memory interface plus everything observing it
struct Port {
    interface: Arc<MemoryInterface>,
    pcap_exporter: Arc<PcapExporter>,
    hardware: Option<CounterLayout>,
}

pub struct Simulation {
    options: CliOpt,
    config: WorkbenchJsonConfig,
}

impl Simulation {
    pub fn new(options: CliOpt, config: WorkbenchJsonConfig) -> Self {
        Self { options, config }
    }

    pub fn run(self) -> anyhow::Result<()> {
        println!("--- Params ---");
        let traffic_rng_seed = if self.options.non_deterministic {
            Rng::new().u64(..)
        } else {
            self.options.traffic_rng_seed
        };
        println!("* Traffic seed: {traffic_rng_seed}");
        println!("* Config path: {}", self.options.config.display());
        println!("* Duration: {} ms", self.options.duration_ms);

        let relay_config =
            RelayConfig::try_from(self.config.relay.clone()).context("invalid relay settings")?;
        let pool = BufferPool::with_capacity(self.config.traffic.pool_size);

        // Ports
        let pcap_exporter_factory: Box<dyn PcapExporterFactory> = match &self.options.capture_dir
        {
            Some(dir) => {
                fs::create_dir_all(dir)
                    .with_context(|| format!("failed to create {}", dir.display()))?;
                Box::new(FileBasedPcapExporterFactory::new(dir))
            }
            None => Box::new(NoOpPcapExporterFactory),
        };
        let registers = Arc::new(MemoryRegisters::new());
        let ports = self.build_ports(pcap_exporter_factory.as_ref(), &registers)?;

        // Relay
        let mut relay = Relay::new(relay_config)?;
        let mut generators = Vec::new();
        for (i, context) in self.config.contexts.iter().enumerate() {
            let source = port_binding(&ports, &context.source, &registers)?;
            let destination = port_binding(&ports, &context.destination, &registers)?;
            let handle = relay
                .add_context(context.id, source, destination)
                .with_context(|| format!("failed to create forwarding context {}", context.id))?;

            let generator = TrafficGenerator::new(
                traffic_rng_seed.wrapping_add(i as u64),
                pool.clone(),
                ports[&context.source.port].interface.clone(),
                QueueSet::try_from(&context.source)?,
                &self.config.traffic,
            );
            generators.push((context.source.port, generator, handle));
        }

        let running = relay.start(self.telemetry_sink()?, self.clock())?;
        println!("--- Running ---");
        let start = Instant::now();
        let deadline = start + Duration::from_millis(self.options.duration_ms);
        let packets_per_second = self.config.traffic.packets_per_second;

        let traffic_stats = thread::scope(|s| {
            let generators: Vec<_> = generators
                .into_iter()
                .map(|(port, mut generator, handle)| {
                    s.spawn(move || {
                        generator.run_until(deadline, packets_per_second, || {
                            handle.state() != ContextState::Running
                        });
                        (port, generator.stats())
                    })
                })
                .collect();

            deliver_device_events(
                &running.device_events(),
                &self.config.events,
                &ports,
                start,
                deadline,
            );

            generators
                .into_iter()
                .map(|g| g.join().map_err(|_| anyhow!("traffic generator panicked")))
                .collect::<anyhow::Result<Vec<_>>>()
        })?;

        let reports = running.shutdown()?;
        let elapsed = start.elapsed();
        for port in ports.values() {
            port.pcap_exporter.flush()?;
        }

        util::print_context_reports(&reports, elapsed);
        let mut interfaces: Vec<Arc<dyn PacketInterface>> = ports
            .values()
            .map(|p| p.interface.clone() as Arc<dyn PacketInterface>)
            .collect();
        interfaces.sort_unstable_by_key(|i| i.id().port);
        util::print_interface_counters(&interfaces);
        util::print_traffic_stats(&traffic_stats);
        util::print_pool_stats(pool.stats());

        Ok(())
    }

    fn build_ports(
        &self,
        pcap_exporter_factory: &dyn PcapExporterFactory,
        registers: &Arc<MemoryRegisters>,
    ) -> anyhow::Result<HashMap<u16, Port>> {
        let mut ports = HashMap::new();
        for declared in &self.config.interfaces {
            if ports.contains_key(&declared.port) {
                bail!("port {} is declared more than once", declared.port);
            }

            let pcap_exporter = Arc::new(
                pcap_exporter_factory.create_pcap_exporter_for_interface(&declared.name)?,
            );
            let mut interface = MemoryInterface::new(
                InterfaceId::new(declared.port, &declared.name),
                declared.rx_queues,
                declared.tx_queues,
            )
            .with_rx_depth(declared.rx_depth)
            .discard_transmitted()
            .with_pcap_exporter(pcap_exporter.clone());

            let hardware = declared.cmac.map(CounterLayout::open_nic_cmac);
            if let Some(layout) = &hardware {
                interface = interface.with_hardware_mirror(registers.clone(), layout.clone());
            }
            for queue in 0..declared.tx_queues {
                interface.set_tx_limit(queue, declared.tx_limit);
            }

            debug!(interface = %declared.name, port = declared.port, "simulated port ready");
            ports.insert(
                declared.port,
                Port {
                    interface: Arc::new(interface),
                    pcap_exporter,
                    hardware,
                },
            );
        }

        Ok(ports)
    }

    fn telemetry_sink(&self) -> anyhow::Result<Arc<dyn TelemetrySink>> {
        if self.options.no_telemetry {
            return Ok(Arc::new(NullSink));
        }

        match self.options.telemetry_udp {
            Some(address) => {
                let sink = UdpSink::connect(address)
                    .with_context(|| format!("failed to open telemetry socket to {address}"))?;
                Ok(Arc::new(sink))
            }
            None => Ok(Arc::new(WriterSink::stdout())),
        }
    }

    fn clock(&self) -> Arc<dyn CycleClock> {
        #[cfg(target_arch = "x86_64")]
        if self.options.tsc_clock {
            let clock = packet_relay::clock::TscClock::calibrate(Duration::from_millis(100));
            println!("* TSC frequency: {} Hz", clock.frequency_hz());
            return Arc::new(clock);
        }

        Arc::new(MonotonicClock::new())
    }
}

fn port_binding(
    ports: &HashMap<u16, Port>,
    queues_json: &PortQueuesJson,
    registers: &Arc<MemoryRegisters>,
) -> anyhow::Result<PortBinding> {
    let port = ports
        .get(&queues_json.port)
        .with_context(|| format!("unknown port {}", queues_json.port))?;
    let queues = QueueSet::try_from(queues_json)?;

    let mut binding = PortBinding::new(port.interface.clone(), queues);
    if let Some(layout) = &port.hardware {
        binding = binding.with_hardware(CounterBlock::new(registers.clone(), layout.clone()));
    }

    Ok(binding)
}

/// Raises the configured device events at their scheduled time, from the calling thread
fn deliver_device_events(
    listener: &RelayEvents,
    events: &[DeviceEventJson],
    ports: &HashMap<u16, Port>,
    start: Instant,
    deadline: Instant,
) {
    let mut events: Vec<_> = events.iter().collect();
    events.sort_by_key(|e| e.at_ms);

    for event in events {
        let at = start + Duration::from_millis(event.at_ms);
        if at >= deadline {
            warn!(
                kind = %event.kind,
                port = event.port,
                "device event scheduled after the end of the run, skipping"
            );
            continue;
        }
        let Some(port) = ports.get(&event.port) else {
            warn!(kind = %event.kind, port = event.port, "device event for unknown port, skipping");
            continue;
        };

        thread::sleep(at.saturating_duration_since(Instant::now()));
        let interface = port.interface.id();
        info!(kind = %event.kind, %interface, "raising device event");
        match event.kind {
            DeviceEventKind::Removed => listener.on_device_removed(interface),
            DeviceEventKind::Reset => listener.on_device_reset(interface),
        }
    }
}
