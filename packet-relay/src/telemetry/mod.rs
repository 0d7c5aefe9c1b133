//! Telemetry records and the sinks they are published to
//!
//! Records are single text lines of the form `measurement(tag),key=value,...\n`. Publishing is
//! best-effort: callers count failures at most, they never retry or block on them.

pub mod sink;

use std::fmt::{Display, Write};
use thiserror::Error;

pub const STATS_MEASUREMENT: &str = "Forwarder_stats";
pub const LATENCY_MEASUREMENT: &str = "Latency_stats";

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("the sink is not ready to accept records")]
    WouldBlock,
    #[error("the sink has been closed")]
    Closed,
    #[error("failed to write to the sink")]
    Io(#[from] std::io::Error),
}

pub trait TelemetrySink: Send + Sync {
    fn publish(&self, record: &str) -> Result<(), PublishError>;
}

/// Incrementally builds one telemetry line
pub struct TelemetryRecord {
    line: String,
}

impl TelemetryRecord {
    pub fn new(measurement: &str, tag: impl Display) -> Self {
        let mut line = String::with_capacity(256);
        // Writing to a `String` cannot fail
        let _ = write!(line, "{measurement}({tag})");
        Self { line }
    }

    pub fn field(mut self, key: impl Display, value: impl Display) -> Self {
        let _ = write!(self.line, ",{key}={value}");
        self
    }

    pub fn finish(mut self) -> String {
        self.line.push('\n');
        self.line
    }
}
