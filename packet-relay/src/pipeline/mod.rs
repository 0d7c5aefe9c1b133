//! The two halves of the data path
//!
//! The receive stage feeds the relay ring (data) and the stats ring (probes); the transmit stage
//! drains the relay ring. Each stage is owned by exactly one worker thread and owns its end of
//! every ring it touches.

pub mod counters;
pub mod receive;
pub mod transmit;

pub use counters::{CounterSnapshot, RelayCounters};
pub use receive::ReceiveStage;
pub use transmit::TransmitStage;
