use crate::buffer::PacketBuffer;
use crate::context::ContextId;
use crate::pipeline::counters::{RelayCounters, add};
use crate::probe::{LatencyReport, TimestampRecord};
use crate::ring::RingConsumer;
use crate::telemetry::{LATENCY_MEASUREMENT, TelemetryRecord, TelemetrySink};
use std::mem;
use std::sync::Arc;
use tracing::debug;

/// Turns the probes queued in a stats ring into latency telemetry
pub struct LatencyExtractor {
    tag: String,
    ring: RingConsumer<PacketBuffer>,
    sink: Arc<dyn TelemetrySink>,
    counters: Arc<RelayCounters>,
    burst_size: usize,
    burst: Vec<PacketBuffer>,
}

impl LatencyExtractor {
    pub fn new(
        context_id: ContextId,
        ring: RingConsumer<PacketBuffer>,
        sink: Arc<dyn TelemetrySink>,
        counters: Arc<RelayCounters>,
        burst_size: usize,
    ) -> Self {
        Self {
            tag: format!("ctx-{context_id}"),
            ring,
            sink,
            counters,
            burst_size,
            burst: Vec::with_capacity(burst_size),
        }
    }

    pub fn burst_size(&self) -> usize {
        self.burst_size
    }

    /// Probes still waiting in the stats ring
    pub fn queued(&self) -> usize {
        self.ring.len()
    }

    /// Decodes and publishes up to one burst of probes, returning how many were dequeued
    ///
    /// Every dequeued buffer is freed here, whether it decoded or not.
    pub fn drain_once(&mut self) -> usize {
        let dequeued = self.ring.dequeue_burst(&mut self.burst, self.burst_size);

        let mut burst = mem::take(&mut self.burst);
        for buffer in burst.drain(..) {
            match TimestampRecord::decode(buffer.data()) {
                Ok(record) => {
                    let report = record.latency_report();
                    add(&self.counters.stats.probes_decoded, 1);
                    add(
                        &self.counters.stats.reordered_hops,
                        report.reordered_hops as usize,
                    );
                    self.publish(&report);
                }
                Err(error) => {
                    add(&self.counters.stats.malformed_probes, 1);
                    debug!(tag = %self.tag, len = buffer.len(), %error, "dropping malformed probe");
                }
            }
        }
        self.burst = burst;

        dequeued
    }

    fn publish(&self, report: &LatencyReport) {
        let mut record = TelemetryRecord::new(LATENCY_MEASUREMENT, &self.tag);
        for (hop, latency) in report.latencies_ns.iter().enumerate() {
            record = record.field(format_args!("hop({hop})"), latency);
        }

        if self.sink.publish(&record.finish()).is_err() {
            add(&self.counters.stats.publish_failures, 1);
        }
    }
}
