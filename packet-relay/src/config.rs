use crate::BURST_MAX;
use crate::backoff::BackoffPolicy;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_RING_CAPACITY: usize = 8192;
pub const DEFAULT_STATS_RING_CAPACITY: usize = 1024;
pub const DEFAULT_STATS_PERIOD: Duration = Duration::from_millis(3000);
pub const DEFAULT_PROBE_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("burst size must be between 1 and {max}, but {size} was configured")]
    BurstSize { size: usize, max: usize },
    #[error("{ring} capacity must be a non-zero power of two, but {capacity} was configured")]
    RingCapacity { ring: &'static str, capacity: usize },
    #[error("a queue set must contain between 1 and {max} queues, but {count} were configured")]
    QueueCount { count: usize, max: usize },
    #[error("the fixed receive queue index {index} is out of range for {count} source queues")]
    FixedQueueIndex { index: usize, count: usize },
    #[error("the {what} must be longer than zero")]
    ZeroDuration { what: &'static str },
}

/// Which source queue the receive stage polls
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RxQueuePolicy {
    /// Always poll the queue at this index of the source queue set
    Fixed(usize),
    /// Advance to the next source queue on every poll
    RoundRobin,
}

impl Default for RxQueuePolicy {
    fn default() -> Self {
        RxQueuePolicy::Fixed(0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayConfig {
    /// Maximum number of buffers moved per stage iteration
    pub burst_size: usize,
    /// Capacity of each context's relay ring (data path)
    pub ring_capacity: usize,
    /// Capacity of each context's stats ring (probe path)
    pub stats_ring_capacity: usize,
    /// Interval between two counter samples
    pub stats_period: Duration,
    /// Interval between two drains of the stats ring
    pub probe_poll_interval: Duration,
    pub rx_queue_policy: RxQueuePolicy,
    pub backoff: BackoffPolicy,
    /// Whether hardware counter samples include the extended breakdown
    pub extended_hardware_counters: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            burst_size: BURST_MAX,
            ring_capacity: DEFAULT_RING_CAPACITY,
            stats_ring_capacity: DEFAULT_STATS_RING_CAPACITY,
            stats_period: DEFAULT_STATS_PERIOD,
            probe_poll_interval: DEFAULT_PROBE_POLL_INTERVAL,
            rx_queue_policy: RxQueuePolicy::default(),
            backoff: BackoffPolicy::default(),
            extended_hardware_counters: false,
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.burst_size == 0 || self.burst_size > BURST_MAX {
            return Err(ConfigError::BurstSize {
                size: self.burst_size,
                max: BURST_MAX,
            });
        }
        if !self.ring_capacity.is_power_of_two() {
            return Err(ConfigError::RingCapacity {
                ring: "relay ring",
                capacity: self.ring_capacity,
            });
        }
        if !self.stats_ring_capacity.is_power_of_two() {
            return Err(ConfigError::RingCapacity {
                ring: "stats ring",
                capacity: self.stats_ring_capacity,
            });
        }
        if self.stats_period.is_zero() {
            return Err(ConfigError::ZeroDuration {
                what: "stats period",
            });
        }
        if self.probe_poll_interval.is_zero() {
            return Err(ConfigError::ZeroDuration {
                what: "probe poll interval",
            });
        }

        Ok(())
    }

    /// Checks the receive policy against the number of source queues of a context
    pub fn validate_source_queues(&self, count: usize) -> Result<(), ConfigError> {
        match self.rx_queue_policy {
            RxQueuePolicy::Fixed(index) if index >= count => {
                Err(ConfigError::FixedQueueIndex { index, count })
            }
            _ => Ok(()),
        }
    }
}
