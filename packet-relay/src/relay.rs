use crate::clock::CycleClock;
use crate::config::{ConfigError, RelayConfig};
use crate::context::{
    ContextError, ContextHandle, ContextId, ContextReport, ForwardingContext, PortBinding,
    RunningContext,
};
use crate::interface::{DeviceEventListener, InterfaceId};
use crate::ring::RingNamer;
use crate::telemetry::TelemetrySink;
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

/// Owns every forwarding context of the process
pub struct Relay {
    config: RelayConfig,
    namer: RingNamer,
    contexts: Vec<ForwardingContext>,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            namer: RingNamer::new(),
            contexts: Vec::new(),
        })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn add_context(
        &mut self,
        id: ContextId,
        source: PortBinding,
        destination: PortBinding,
    ) -> Result<ContextHandle, ContextError> {
        if self.contexts.iter().any(|c| c.id() == id) {
            return Err(ContextError::DuplicateContext(id));
        }

        let context =
            ForwardingContext::new(id, source, destination, &self.config, &mut self.namer)?;
        let handle = context.handle();
        self.contexts.push(context);
        Ok(handle)
    }

    /// Launches every context, or none of them
    pub fn start(
        self,
        sink: Arc<dyn TelemetrySink>,
        clock: Arc<dyn CycleClock>,
    ) -> Result<RunningRelay, ContextError> {
        let handles: Vec<_> = self.contexts.iter().map(|c| c.handle()).collect();

        let mut running = Vec::with_capacity(self.contexts.len());
        let mut pending = self.contexts.into_iter();
        for context in pending.by_ref() {
            match context.launch(sink.clone(), clock.clone()) {
                Ok(context) => running.push(context),
                Err(e) => {
                    // The launch error is the one returned, anything else is only logged
                    for context in running {
                        match context.join() {
                            Ok(drained) => {
                                drained.destroy();
                            }
                            Err(join_error) => {
                                warn!(error = %join_error, "failed to roll back a launched context");
                            }
                        }
                    }
                    for context in pending {
                        context.discard();
                    }
                    return Err(e);
                }
            }
        }

        info!(contexts = running.len(), "relay started");
        Ok(RunningRelay {
            contexts: running,
            events: Arc::new(RelayEvents {
                handles,
                resets: AtomicU64::new(0),
            }),
        })
    }
}

pub struct RunningRelay {
    contexts: Vec<RunningContext>,
    events: Arc<RelayEvents>,
}

impl RunningRelay {
    /// The listener to register with the device layer
    pub fn device_events(&self) -> Arc<RelayEvents> {
        self.events.clone()
    }

    /// Stops every context, waits for its workers and releases its rings
    ///
    /// All contexts are asked to stop before any of them is joined, so they wind down together.
    /// Every context is joined even if some worker panicked; the first such failure is returned.
    pub fn shutdown(mut self) -> Result<Vec<ContextReport>, ContextError> {
        let contexts = mem::take(&mut self.contexts);
        for context in &contexts {
            context.request_stop();
        }

        let mut reports = Vec::with_capacity(contexts.len());
        let mut first_error = None;
        for context in contexts {
            match context.join() {
                Ok(drained) => reports.push(drained.destroy()),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        info!(contexts = reports.len(), "relay shut down");
        Ok(reports)
    }
}

impl Drop for RunningRelay {
    fn drop(&mut self) {
        // Every context winds down at once; each one joins its workers as it is dropped
        for context in &self.contexts {
            context.request_stop();
        }
    }
}

/// Reacts to device events on behalf of a running relay
pub struct RelayEvents {
    handles: Vec<ContextHandle>,
    resets: AtomicU64,
}

impl RelayEvents {
    /// Device resets observed so far
    pub fn resets(&self) -> u64 {
        self.resets.load(Ordering::Relaxed)
    }
}

impl DeviceEventListener for RelayEvents {
    fn on_device_removed(&self, interface: &InterfaceId) {
        for handle in self.handles.iter().filter(|h| h.is_bound_to(interface)) {
            warn!(
                context = handle.id(),
                %interface,
                "interface removed, stopping forwarding context"
            );
            handle.request_stop();
        }
    }

    fn on_device_reset(&self, interface: &InterfaceId) {
        self.resets.fetch_add(1, Ordering::Relaxed);
        let affected = self
            .handles
            .iter()
            .filter(|h| h.is_bound_to(interface))
            .count();
        warn!(%interface, affected, "interface reset");
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::clock::MonotonicClock;
    use crate::context::ContextState;
    use crate::interface::memory::MemoryInterface;
    use crate::queue::QueueSet;
    use crate::telemetry::sink::NullSink;

    fn binding(port: u16, name: &str) -> PortBinding {
        PortBinding::new(
            Arc::new(MemoryInterface::new(InterfaceId::new(port, name), 1, 1)),
            QueueSet::single(0),
        )
    }

    #[test]
    fn test_duplicate_context_is_rejected() {
        let mut relay = Relay::new(RelayConfig::default()).unwrap();
        relay.add_context(0, binding(0, "a"), binding(1, "b")).unwrap();
        assert!(matches!(
            relay.add_context(0, binding(2, "c"), binding(3, "d")),
            Err(ContextError::DuplicateContext(0))
        ));
    }

    #[test]
    fn test_dropping_a_running_relay_stops_every_context() {
        let mut relay = Relay::new(RelayConfig::default()).unwrap();
        let first = relay.add_context(0, binding(0, "a"), binding(1, "b")).unwrap();
        let second = relay.add_context(1, binding(2, "c"), binding(3, "d")).unwrap();
        let running = relay
            .start(Arc::new(NullSink), Arc::new(MonotonicClock::new()))
            .unwrap();
        assert_eq!(first.state(), ContextState::Running);

        drop(running);
        assert_eq!(first.state(), ContextState::Destroyed);
        assert_eq!(second.state(), ContextState::Destroyed);
    }

    #[test]
    fn test_removal_stops_only_bound_contexts() {
        let mut relay = Relay::new(RelayConfig::default()).unwrap();
        let first = relay.add_context(0, binding(0, "a"), binding(1, "b")).unwrap();
        let second = relay.add_context(1, binding(2, "c"), binding(3, "d")).unwrap();
        let running = relay
            .start(Arc::new(NullSink), Arc::new(MonotonicClock::new()))
            .unwrap();

        let events = running.device_events();
        events.on_device_reset(&InterfaceId::new(3, "d"));
        events.on_device_removed(&InterfaceId::new(1, "b"));
        assert_eq!(events.resets(), 1);
        assert_eq!(first.state(), ContextState::StopRequested);
        assert_eq!(second.state(), ContextState::Running);

        let reports = running.shutdown().unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(second.state(), ContextState::Destroyed);
    }
}
