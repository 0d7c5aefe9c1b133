//! The boundary between the relay and the interfaces it moves frames between
//!
//! Bringing interfaces up, resetting them and recovering from hot-plug events is the device
//! layer's job. The relay only needs to receive bursts, transmit bursts and read counters.

pub mod memory;

use crate::buffer::PacketBuffer;
use crate::queue::QueueId;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct InterfaceId {
    /// Port number assigned by the device layer
    pub port: u16,
    /// Human readable name, usually the PCI address of the function
    pub name: Arc<str>,
}

impl InterfaceId {
    pub fn new(port: u16, name: &str) -> Self {
        Self {
            port,
            name: name.to_string().into_boxed_str().into(),
        }
    }
}

impl Display for InterfaceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (port {})", self.name, self.port)
    }
}

/// Cumulative software counters of an interface, as maintained by its driver
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InterfaceCounters {
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub rx_errors: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub tx_errors: u64,
}

pub trait PacketInterface: Send + Sync {
    fn id(&self) -> &InterfaceId;

    /// Appends up to `max` received buffers to `out` and returns how many were appended
    fn receive(&self, queue: QueueId, out: &mut Vec<PacketBuffer>, max: usize) -> usize;

    /// Transmits a prefix of `burst` and returns its length
    ///
    /// Accepted buffers are removed from the front of `burst`; whatever remains was not sent and
    /// still belongs to the caller.
    fn transmit(&self, queue: QueueId, burst: &mut Vec<PacketBuffer>) -> usize;

    fn counters(&self) -> InterfaceCounters;
}

/// Notifications the device layer raises about an interface
///
/// Implemented by whoever owns the forwarding contexts, so that the device layer never needs a
/// handle to the contexts themselves.
pub trait DeviceEventListener: Send + Sync {
    fn on_device_removed(&self, interface: &InterfaceId);
    fn on_device_reset(&self, interface: &InterfaceId);
}
