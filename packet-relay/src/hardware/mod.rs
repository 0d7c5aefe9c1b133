//! Hardware counter blocks
//!
//! A counter block (one per MAC instance) exposes free-running 32-bit counters through device
//! registers. Reading them consistently requires a latch: writing to the tick register copies the
//! internal accumulators into the readable registers all at once, after which every register read
//! reflects the same instant. Latching never resets the counters.

pub mod memory;

use std::sync::Arc;

pub trait RegisterAccess: Send + Sync {
    fn read_register(&self, offset: u32) -> u32;
    fn write_register(&self, offset: u32, value: u32);
}

/// Value written to the tick register to latch the counters
pub const LATCH_VALUE: u32 = 0b1;

pub(crate) const CMAC_BASE: u32 = 0x8000;
pub(crate) const CMAC_STRIDE: u32 = 0x4000;

pub(crate) const TICK: u32 = 0x02B0;
const STAT_TX_TOTAL_PKTS: u32 = 0x0500;
const STAT_TX_TOTAL_GOOD_PKTS: u32 = 0x0508;
const STAT_TX_TOTAL_BYTES: u32 = 0x0510;
const STAT_TX_TOTAL_GOOD_BYTES: u32 = 0x0518;
const STAT_RX_TOTAL_PKTS: u32 = 0x0608;
const STAT_RX_TOTAL_GOOD_PKTS: u32 = 0x0610;
const STAT_RX_TOTAL_BYTES: u32 = 0x0618;
const STAT_RX_TOTAL_GOOD_BYTES: u32 = 0x0620;

/// Receive-side breakdown counters, relative to the block base
const EXTENDED_COUNTERS: [(&str, u32); 30] = [
    ("rx_pkt_64", 0x0628),
    ("rx_pkt_65_127", 0x0630),
    ("rx_pkt_128_255", 0x0638),
    ("rx_pkt_256_511", 0x0640),
    ("rx_pkt_512_1023", 0x0648),
    ("rx_pkt_1024_1518", 0x0650),
    ("rx_pkt_1519_1522", 0x0658),
    ("rx_pkt_1523_1548", 0x0660),
    ("rx_pkt_1549_2047", 0x0668),
    ("rx_pkt_2048_4095", 0x0670),
    ("rx_pkt_4096_8191", 0x0678),
    ("rx_pkt_8192_9215", 0x0680),
    ("rx_pkt_large", 0x0688),
    ("rx_pkt_small", 0x0690),
    ("rx_undersize", 0x0698),
    ("rx_fragment", 0x06A0),
    ("rx_oversize", 0x06A8),
    ("rx_toolong", 0x06B0),
    ("rx_jabber", 0x06B8),
    ("rx_bad_fcs", 0x06C0),
    ("rx_pkt_bad_fcs", 0x06C8),
    ("rx_stomped_fcs", 0x06D0),
    ("rx_unicast", 0x06D8),
    ("rx_multicast", 0x06E0),
    ("rx_broadcast", 0x06E8),
    ("rx_vlan", 0x06F0),
    ("rx_pause", 0x06F8),
    ("rx_user_pause", 0x0700),
    ("rx_in_range_err", 0x0708),
    ("rx_truncated", 0x0710),
];

/// Absolute register offsets of one counter block
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CounterLayout {
    pub latch: u32,
    pub tx_total_pkts: u32,
    pub tx_total_good_pkts: u32,
    pub tx_total_bytes: u32,
    pub tx_total_good_bytes: u32,
    pub rx_total_pkts: u32,
    pub rx_total_good_pkts: u32,
    pub rx_total_bytes: u32,
    pub rx_total_good_bytes: u32,
    pub extended: Vec<(&'static str, u32)>,
}

impl CounterLayout {
    /// Layout of the `index`-th 100G MAC of an Open NIC shell
    pub fn open_nic_cmac(index: u8) -> Self {
        let base = CMAC_BASE + CMAC_STRIDE * index as u32;
        Self {
            latch: base + TICK,
            tx_total_pkts: base + STAT_TX_TOTAL_PKTS,
            tx_total_good_pkts: base + STAT_TX_TOTAL_GOOD_PKTS,
            tx_total_bytes: base + STAT_TX_TOTAL_BYTES,
            tx_total_good_bytes: base + STAT_TX_TOTAL_GOOD_BYTES,
            rx_total_pkts: base + STAT_RX_TOTAL_PKTS,
            rx_total_good_pkts: base + STAT_RX_TOTAL_GOOD_PKTS,
            rx_total_bytes: base + STAT_RX_TOTAL_BYTES,
            rx_total_good_bytes: base + STAT_RX_TOTAL_GOOD_BYTES,
            extended: EXTENDED_COUNTERS
                .iter()
                .map(|(name, offset)| (*name, base + offset))
                .collect(),
        }
    }
}

/// One latched snapshot of a counter block
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HardwareCounters {
    pub tx_total_pkts: u32,
    pub tx_total_good_pkts: u32,
    pub tx_total_bytes: u32,
    pub tx_total_good_bytes: u32,
    pub rx_total_pkts: u32,
    pub rx_total_good_pkts: u32,
    pub rx_total_bytes: u32,
    pub rx_total_good_bytes: u32,
    /// Only present when the block was read with the extended breakdown enabled
    pub extended: Vec<(&'static str, u32)>,
}

impl HardwareCounters {
    /// Every counter as a `(name, value)` pair, base counters first
    pub fn fields(&self) -> impl Iterator<Item = (&'static str, u32)> + '_ {
        [
            ("tx_total_pkts", self.tx_total_pkts),
            ("tx_total_good_pkts", self.tx_total_good_pkts),
            ("tx_total_bytes", self.tx_total_bytes),
            ("tx_total_good_bytes", self.tx_total_good_bytes),
            ("rx_total_pkts", self.rx_total_pkts),
            ("rx_total_good_pkts", self.rx_total_good_pkts),
            ("rx_total_bytes", self.rx_total_bytes),
            ("rx_total_good_bytes", self.rx_total_good_bytes),
        ]
        .into_iter()
        .chain(self.extended.iter().copied())
    }
}

#[derive(Clone)]
pub struct CounterBlock {
    registers: Arc<dyn RegisterAccess>,
    layout: CounterLayout,
}

impl CounterBlock {
    pub fn new(registers: Arc<dyn RegisterAccess>, layout: CounterLayout) -> Self {
        Self { registers, layout }
    }

    /// Latches the block and reads every counter
    pub fn latch_and_read(&self, extended: bool) -> HardwareCounters {
        let regs = &self.registers;
        let layout = &self.layout;
        regs.write_register(layout.latch, LATCH_VALUE);

        HardwareCounters {
            tx_total_pkts: regs.read_register(layout.tx_total_pkts),
            tx_total_good_pkts: regs.read_register(layout.tx_total_good_pkts),
            tx_total_bytes: regs.read_register(layout.tx_total_bytes),
            tx_total_good_bytes: regs.read_register(layout.tx_total_good_bytes),
            rx_total_pkts: regs.read_register(layout.rx_total_pkts),
            rx_total_good_pkts: regs.read_register(layout.rx_total_good_pkts),
            rx_total_bytes: regs.read_register(layout.rx_total_bytes),
            rx_total_good_bytes: regs.read_register(layout.rx_total_good_bytes),
            extended: if extended {
                layout
                    .extended
                    .iter()
                    .map(|(name, offset)| (*name, regs.read_register(*offset)))
                    .collect()
            } else {
                Vec::new()
            },
        }
    }
}
