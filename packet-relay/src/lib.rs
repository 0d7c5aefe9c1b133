//! Software packet relay
//!
//! Shuttles Ethernet frames between interface queues through a receive stage, a single-producer
//! single-consumer relay ring and a transmit stage, while a stats worker samples interface and
//! hardware counters and decodes latency probes carried in VLAN-tagged frames.

pub mod backoff;
pub mod buffer;
pub mod clock;
pub mod config;
pub mod context;
pub mod hardware;
pub mod interface;
pub mod pcap_exporter;
pub mod pipeline;
pub mod probe;
pub mod queue;
pub mod relay;
pub mod ring;
pub mod stats;
pub mod telemetry;

pub use buffer::{BufferPool, PacketBuffer};
pub use config::RelayConfig;
pub use context::{ContextId, ContextState, ForwardingContext, PortBinding, StopFlag};
pub use relay::{Relay, RunningRelay};

/// Upper bound on the number of buffers moved by a single stage iteration
pub const BURST_MAX: usize = 32;

/// Maximum number of queues a forwarding context may bind per direction
pub const MAX_QUEUES_PER_CONTEXT: usize = 3;
