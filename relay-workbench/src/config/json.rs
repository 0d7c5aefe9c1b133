use packet_relay::backoff::BackoffPolicy;
use packet_relay::config::{
    ConfigError, DEFAULT_PROBE_POLL_INTERVAL, DEFAULT_RING_CAPACITY, DEFAULT_STATS_PERIOD,
    DEFAULT_STATS_RING_CAPACITY, RelayConfig, RxQueuePolicy,
};
use packet_relay::interface::memory::DEFAULT_RX_DEPTH;
use packet_relay::queue::{QueueId, QueueSet};
use packet_relay::{BURST_MAX, ContextId};
use serde::Deserialize;
use serde_with::{DisplayFromStr, serde_as};
use std::time::Duration;

#[derive(Deserialize, Clone)]
pub struct WorkbenchJsonConfig {
    #[serde(default)]
    pub relay: RelayJsonConfig,
    pub interfaces: Vec<InterfaceJson>,
    pub contexts: Vec<ContextJson>,
    #[serde(default)]
    pub traffic: TrafficJson,
    /// Device events to deliver while the relay is running
    #[serde(default)]
    pub events: Vec<DeviceEventJson>,
}

#[derive(Deserialize, Clone)]
#[serde(default)]
pub struct RelayJsonConfig {
    burst_size: usize,
    ring_capacity: usize,
    stats_ring_capacity: usize,
    stats_period_ms: u64,
    probe_poll_interval_ms: u64,
    rx_queue_policy: RxQueuePolicyJson,
    backoff: BackoffJson,
    extended_hardware_counters: bool,
}

impl Default for RelayJsonConfig {
    fn default() -> Self {
        Self {
            burst_size: BURST_MAX,
            ring_capacity: DEFAULT_RING_CAPACITY,
            stats_ring_capacity: DEFAULT_STATS_RING_CAPACITY,
            stats_period_ms: DEFAULT_STATS_PERIOD.as_millis() as u64,
            probe_poll_interval_ms: DEFAULT_PROBE_POLL_INTERVAL.as_millis() as u64,
            rx_queue_policy: RxQueuePolicyJson::Fixed { index: 0 },
            backoff: BackoffJson::Spin,
            extended_hardware_counters: false,
        }
    }
}

impl TryFrom<RelayJsonConfig> for RelayConfig {
    type Error = ConfigError;

    fn try_from(value: RelayJsonConfig) -> Result<Self, Self::Error> {
        let config = RelayConfig {
            burst_size: value.burst_size,
            ring_capacity: value.ring_capacity,
            stats_ring_capacity: value.stats_ring_capacity,
            stats_period: Duration::from_millis(value.stats_period_ms),
            probe_poll_interval: Duration::from_millis(value.probe_poll_interval_ms),
            rx_queue_policy: value.rx_queue_policy.into(),
            backoff: value.backoff.into(),
            extended_hardware_counters: value.extended_hardware_counters,
        };
        config.validate()?;
        Ok(config)
    }
}

#[derive(Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
enum RxQueuePolicyJson {
    Fixed { index: usize },
    RoundRobin,
}

impl From<RxQueuePolicyJson> for RxQueuePolicy {
    fn from(value: RxQueuePolicyJson) -> Self {
        match value {
            RxQueuePolicyJson::Fixed { index } => RxQueuePolicy::Fixed(index),
            RxQueuePolicyJson::RoundRobin => RxQueuePolicy::RoundRobin,
        }
    }
}

#[derive(Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
enum BackoffJson {
    Spin,
    SpinThenYield,
}

impl From<BackoffJson> for BackoffPolicy {
    fn from(value: BackoffJson) -> Self {
        match value {
            BackoffJson::Spin => BackoffPolicy::Spin,
            BackoffJson::SpinThenYield => BackoffPolicy::SpinThenYield,
        }
    }
}

#[derive(Deserialize, Clone)]
pub struct InterfaceJson {
    /// Usually the PCI address of the port
    pub name: String,
    pub port: u16,
    #[serde(default = "default_queue_count")]
    pub rx_queues: u16,
    #[serde(default = "default_queue_count")]
    pub tx_queues: u16,
    #[serde(default = "default_rx_depth")]
    pub rx_depth: usize,
    /// The most buffers a single transmit call accepts, to simulate a congested port
    #[serde(default)]
    pub tx_limit: Option<usize>,
    /// The index of the MAC block whose hardware counters mirror this port's traffic
    #[serde(default)]
    pub cmac: Option<u8>,
}

fn default_queue_count() -> u16 {
    1
}

fn default_rx_depth() -> usize {
    DEFAULT_RX_DEPTH
}

#[derive(Deserialize, Clone)]
pub struct ContextJson {
    pub id: ContextId,
    pub source: PortQueuesJson,
    pub destination: PortQueuesJson,
}

#[derive(Deserialize, Clone)]
pub struct PortQueuesJson {
    pub port: u16,
    pub queues: Vec<QueueId>,
}

impl TryFrom<&PortQueuesJson> for QueueSet {
    type Error = ConfigError;

    fn try_from(value: &PortQueuesJson) -> Result<Self, Self::Error> {
        QueueSet::new(value.queues.clone())
    }
}

#[derive(Deserialize, Clone)]
#[serde(default)]
pub struct TrafficJson {
    /// Frames injected per second on every context's source port
    pub packets_per_second: u64,
    /// Frames injected at once
    pub burst: usize,
    /// Every n-th frame is a latency probe (0 disables probes)
    pub probe_every: u64,
    /// The size of the data frames, in bytes
    pub frame_size: usize,
    /// The number of buffers in the shared pool
    pub pool_size: usize,
    /// The per-hop latency of generated probes is picked at random within this range, in
    /// nanoseconds
    pub hop_latency_ns: [u64; 2],
}

impl Default for TrafficJson {
    fn default() -> Self {
        Self {
            packets_per_second: 100_000,
            burst: 16,
            probe_every: 1_000,
            frame_size: 64,
            pool_size: 16_384,
            hop_latency_ns: [500, 5_000],
        }
    }
}

#[serde_as]
#[derive(Deserialize, Clone)]
pub struct DeviceEventJson {
    /// Time since the start of the run, in milliseconds
    pub at_ms: u64,
    pub port: u16,
    #[serde_as(as = "DisplayFromStr")]
    pub kind: DeviceEventKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceEventKind {
    Removed,
    Reset,
}

impl std::str::FromStr for DeviceEventKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "removed" => Ok(DeviceEventKind::Removed),
            "reset" => Ok(DeviceEventKind::Reset),
            _ => anyhow::bail!("unknown device event `{s}` (expected `removed` or `reset`)"),
        }
    }
}

impl std::fmt::Display for DeviceEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceEventKind::Removed => write!(f, "removed"),
            DeviceEventKind::Reset => write!(f, "reset"),
        }
    }
}
