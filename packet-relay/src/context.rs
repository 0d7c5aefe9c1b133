//! Forwarding contexts and their lifecycle
//!
//! A context binds a source interface and queue set to a destination interface and queue set. It
//! owns the relay ring, the stats ring and the stop flag shared by its three workers.
//!
//! The lifecycle is encoded in the types: a [`ForwardingContext`] is created, launched into a
//! [`RunningContext`], joined into a [`DrainedContext`] once every worker observed the stop flag,
//! and finally destroyed, which releases the rings and every buffer still queued in them. There
//! is no way back to an earlier state.

use crate::buffer::PacketBuffer;
use crate::clock::CycleClock;
use crate::config::{ConfigError, RelayConfig};
use crate::hardware::CounterBlock;
use crate::interface::{InterfaceId, PacketInterface};
use crate::pipeline::{CounterSnapshot, ReceiveStage, RelayCounters, TransmitStage};
use crate::queue::QueueSet;
use crate::ring::{RingConsumer, RingError, RingNamer, ring};
use crate::stats::StatsCollector;
use crate::stats::latency::LatencyExtractor;
use crate::telemetry::TelemetrySink;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::{info, warn};

pub type ContextId = u16;

#[derive(Error, Debug)]
pub enum ContextError {
    #[error("invalid configuration")]
    Config(#[from] ConfigError),
    #[error("failed to create ring")]
    Ring(#[from] RingError),
    #[error("failed to spawn the {worker} worker of context {context}")]
    Spawn {
        context: ContextId,
        worker: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("the {worker} worker of context {context} panicked")]
    WorkerPanicked {
        context: ContextId,
        worker: &'static str,
    },
    #[error("context {0} was registered twice")]
    DuplicateContext(ContextId),
}

/// Tells the workers of a context to finish their current burst and exit
///
/// Relaxed ordering suffices: a worker that misses the flag for one more iteration just performs
/// one more burst.
#[derive(Clone, Debug, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ContextState {
    Created = 0,
    Running = 1,
    StopRequested = 2,
    Drained = 3,
    Destroyed = 4,
}

impl ContextState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ContextState::Created,
            1 => ContextState::Running,
            2 => ContextState::StopRequested,
            3 => ContextState::Drained,
            _ => ContextState::Destroyed,
        }
    }
}

/// A cheap handle to observe and stop a context from anywhere
#[derive(Clone)]
pub struct ContextHandle {
    id: ContextId,
    source: InterfaceId,
    destination: InterfaceId,
    stop: StopFlag,
    state: Arc<AtomicU8>,
}

impl ContextHandle {
    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn source(&self) -> &InterfaceId {
        &self.source
    }

    pub fn destination(&self) -> &InterfaceId {
        &self.destination
    }

    /// Whether either end of the context is bound to `interface`
    pub fn is_bound_to(&self, interface: &InterfaceId) -> bool {
        self.source == *interface || self.destination == *interface
    }

    pub fn request_stop(&self) {
        self.stop.request_stop();
    }

    pub fn state(&self) -> ContextState {
        let state = ContextState::from_u8(self.state.load(Ordering::Acquire));
        if state == ContextState::Running && self.stop.is_stop_requested() {
            ContextState::StopRequested
        } else {
            state
        }
    }

    pub(crate) fn advance(&self, state: ContextState) {
        // Transitions only move forward
        self.state.fetch_max(state as u8, Ordering::AcqRel);
    }
}

/// One end of a forwarding context
#[derive(Clone)]
pub struct PortBinding {
    pub interface: Arc<dyn PacketInterface>,
    pub queues: QueueSet,
    pub hardware: Option<CounterBlock>,
}

impl PortBinding {
    pub fn new(interface: Arc<dyn PacketInterface>, queues: QueueSet) -> Self {
        Self {
            interface,
            queues,
            hardware: None,
        }
    }

    /// Also samples this counter block whenever the context samples its counters
    pub fn with_hardware(mut self, block: CounterBlock) -> Self {
        self.hardware = Some(block);
        self
    }
}

pub struct ForwardingContext {
    handle: ContextHandle,
    config: RelayConfig,
    source: PortBinding,
    destination: PortBinding,
    receive: ReceiveStage,
    transmit: TransmitStage,
    stats_ring: RingConsumer<PacketBuffer>,
    counters: Arc<RelayCounters>,
}

impl ForwardingContext {
    pub fn new(
        id: ContextId,
        source: PortBinding,
        destination: PortBinding,
        config: &RelayConfig,
        namer: &mut RingNamer,
    ) -> Result<Self, ContextError> {
        config.validate()?;

        let (relay_producer, relay_consumer) =
            ring(namer.next_name("relay_ring", id), config.ring_capacity)?;
        let (stats_producer, stats_consumer) =
            ring(namer.next_name("stats_ring", id), config.stats_ring_capacity)?;

        let stop = StopFlag::new();
        let counters = Arc::new(RelayCounters::new());
        let receive = ReceiveStage::new(
            id,
            source.interface.clone(),
            source.queues.clone(),
            config,
            relay_producer,
            stats_producer,
            counters.clone(),
            stop.clone(),
        )?;
        let transmit = TransmitStage::new(
            id,
            destination.interface.clone(),
            destination.queues.clone(),
            config,
            relay_consumer,
            counters.clone(),
            stop.clone(),
        );

        Ok(Self {
            handle: ContextHandle {
                id,
                source: source.interface.id().clone(),
                destination: destination.interface.id().clone(),
                stop,
                state: Arc::new(AtomicU8::new(ContextState::Created as u8)),
            },
            config: config.clone(),
            source,
            destination,
            receive,
            transmit,
            stats_ring: stats_consumer,
            counters,
        })
    }

    pub fn id(&self) -> ContextId {
        self.handle.id
    }

    pub fn handle(&self) -> ContextHandle {
        self.handle.clone()
    }

    pub fn stop_flag(&self) -> StopFlag {
        self.handle.stop.clone()
    }

    /// Spawns the receive, transmit and stats workers
    ///
    /// If a worker cannot be spawned, the ones already running are stopped and joined before the
    /// error is returned.
    pub fn launch(
        self,
        sink: Arc<dyn TelemetrySink>,
        clock: Arc<dyn CycleClock>,
    ) -> Result<RunningContext, ContextError> {
        let id = self.handle.id;
        let extractor = LatencyExtractor::new(
            id,
            self.stats_ring,
            sink.clone(),
            self.counters.clone(),
            self.config.burst_size,
        );
        let stats = StatsCollector::new(
            id,
            &self.source,
            &self.destination,
            &self.config,
            extractor,
            sink,
            clock,
            self.counters.clone(),
            self.handle.stop.clone(),
        );

        let spawn_error = |worker, source| ContextError::Spawn {
            context: id,
            worker,
            source,
        };

        let receive = self.receive;
        let receive = spawn_worker(format!("rx-{id}"), move || receive.run())
            .map_err(|e| spawn_error("receive", e))?;

        let transmit = self.transmit;
        let transmit = match spawn_worker(format!("tx-{id}"), move || transmit.run()) {
            Ok(handle) => handle,
            Err(e) => {
                self.handle.request_stop();
                join_quietly(id, "receive", receive);
                self.handle.advance(ContextState::Destroyed);
                return Err(spawn_error("transmit", e));
            }
        };

        let stats = match spawn_worker(format!("stats-{id}"), move || stats.run()) {
            Ok(handle) => handle,
            Err(e) => {
                self.handle.request_stop();
                join_quietly(id, "receive", receive);
                join_quietly(id, "transmit", transmit);
                self.handle.advance(ContextState::Destroyed);
                return Err(spawn_error("stats", e));
            }
        };

        self.handle.advance(ContextState::Running);
        info!(
            context = id,
            source = %self.handle.source,
            destination = %self.handle.destination,
            "forwarding context running"
        );

        Ok(RunningContext {
            handle: self.handle,
            counters: self.counters,
            workers: Some(Workers {
                receive,
                transmit,
                stats,
            }),
        })
    }

    /// Gives up on a context that will never be launched
    pub(crate) fn discard(self) {
        self.handle.advance(ContextState::Destroyed);
    }
}

fn spawn_worker<T: Send + 'static>(
    name: String,
    f: impl FnOnce() -> T + Send + 'static,
) -> io::Result<JoinHandle<T>> {
    thread::Builder::new().name(name).spawn(f)
}

/// Joins a worker that is being torn down, logging a panic instead of reporting it
fn join_quietly<T>(context: ContextId, worker: &'static str, handle: JoinHandle<T>) -> Option<T> {
    match handle.join() {
        Ok(stage) => Some(stage),
        Err(_) => {
            warn!(context, worker, "worker panicked during teardown");
            None
        }
    }
}

struct Workers {
    receive: JoinHandle<ReceiveStage>,
    transmit: JoinHandle<TransmitStage>,
    stats: JoinHandle<StatsCollector>,
}

/// A launched context
///
/// Dropping it without calling [`RunningContext::join`] still stops and joins every worker, and
/// releases the rings.
pub struct RunningContext {
    handle: ContextHandle,
    counters: Arc<RelayCounters>,
    // Only `join` and `drop` take the workers out
    workers: Option<Workers>,
}

impl RunningContext {
    pub fn id(&self) -> ContextId {
        self.handle.id
    }

    pub fn handle(&self) -> ContextHandle {
        self.handle.clone()
    }

    pub fn stop_flag(&self) -> StopFlag {
        self.handle.stop.clone()
    }

    pub fn state(&self) -> ContextState {
        self.handle.state()
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    pub fn request_stop(&self) {
        self.handle.request_stop();
    }

    /// Waits until every worker has observed the stop flag and returned
    ///
    /// Requests a stop first, so joining a context nobody stopped does not hang.
    pub fn join(mut self) -> Result<DrainedContext, ContextError> {
        let id = self.handle.id;
        self.handle.request_stop();

        let Some(workers) = self.workers.take() else {
            unreachable!("workers are only taken by join and drop, which both consume the context")
        };
        let receive = workers.receive.join();
        let transmit = workers.transmit.join();
        let stats = workers.stats.join();

        // Every worker has exited, even when one of them panicked
        self.handle.advance(ContextState::Drained);

        let panicked = |worker| ContextError::WorkerPanicked {
            context: id,
            worker,
        };
        let receive = receive.map_err(|_| panicked("receive"))?;
        let transmit = transmit.map_err(|_| panicked("transmit"))?;
        let stats = stats.map_err(|_| panicked("stats"))?;

        info!(context = id, "forwarding context drained");
        Ok(DrainedContext {
            handle: self.handle.clone(),
            counters: self.counters.clone(),
            receive,
            transmit,
            stats,
        })
    }
}

impl Drop for RunningContext {
    fn drop(&mut self) {
        let Some(workers) = self.workers.take() else {
            return;
        };

        let id = self.handle.id;
        warn!(context = id, "running context dropped without being joined, stopping it");
        self.handle.request_stop();
        join_quietly(id, "receive", workers.receive);
        join_quietly(id, "transmit", workers.transmit);
        join_quietly(id, "stats", workers.stats);

        // The stages, and the rings they own, went down with their workers
        self.handle.advance(ContextState::Destroyed);
    }
}

pub struct DrainedContext {
    handle: ContextHandle,
    counters: Arc<RelayCounters>,
    receive: ReceiveStage,
    transmit: TransmitStage,
    stats: StatsCollector,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContextReport {
    pub id: ContextId,
    pub source: InterfaceId,
    pub destination: InterfaceId,
    pub counters: CounterSnapshot,
    /// Data buffers left in the relay ring when the workers stopped
    pub abandoned_in_relay_ring: usize,
    /// Probes left in the stats ring when the workers stopped
    pub abandoned_in_stats_ring: usize,
}

impl DrainedContext {
    pub fn id(&self) -> ContextId {
        self.handle.id
    }

    pub fn state(&self) -> ContextState {
        self.handle.state()
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    /// Releases both rings, freeing whatever is still queued in them
    pub fn destroy(mut self) -> ContextReport {
        let report = ContextReport {
            id: self.handle.id,
            source: self.handle.source.clone(),
            destination: self.handle.destination.clone(),
            counters: self.counters.snapshot(),
            abandoned_in_relay_ring: self.transmit.queued(),
            abandoned_in_stats_ring: self.stats.extractor().queued(),
        };

        drop(self.receive);
        drop(self.transmit);
        drop(self.stats);
        self.handle.advance(ContextState::Destroyed);

        info!(
            context = report.id,
            forwarded = report.counters.forwarded,
            drops = report.counters.total_drops(),
            "forwarding context destroyed"
        );
        report
    }
}
