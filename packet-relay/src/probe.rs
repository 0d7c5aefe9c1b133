//! Latency probes
//!
//! A probe is an Ethernet frame tagged with a reserved VLAN id. Right after the VLAN header it
//! carries one timestamp pair per hop it crossed, each pair made of a slow sync counter and a fast
//! tick counter (both little-endian u64). Hop 0 is the most recent one.

use pnet_packet::Packet;
use pnet_packet::ethernet::{EtherTypes, EthernetPacket, MutableEthernetPacket};
use pnet_packet::vlan::{MutableVlanPacket, VlanPacket};
use thiserror::Error;

pub const PROBE_VLAN_ID: u16 = 0x0ABC;
pub const HOP_COUNT: usize = 3;
pub const SYNC_PERIOD_NS: u64 = 1000;
pub const TICK_PERIOD_NS: u64 = 4;

pub const ETHERNET_HEADER_LEN: usize = 14;
pub const VLAN_HEADER_LEN: usize = 4;
pub const TIMESTAMP_OFFSET: usize = ETHERNET_HEADER_LEN + VLAN_HEADER_LEN;
pub const TIMESTAMP_RECORD_LEN: usize = HOP_COUNT * 16;
pub const PROBE_FRAME_LEN: usize = TIMESTAMP_OFFSET + TIMESTAMP_RECORD_LEN;
pub const PROBE_FILLER: u8 = 0xFF;

const PROBE_DESTINATION: [u8; 6] = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];
const PROBE_SOURCE: [u8; 6] = [0x52, 0x54, 0x00, 0x65, 0x43, 0x21];

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeDecodeError {
    #[error("frame does not carry a VLAN header")]
    NotVlan,
    #[error("frame is tagged with VLAN {found:#06x} instead of the probe VLAN")]
    WrongVlanId { found: u16 },
    #[error("frame is {len} bytes long, but a probe needs at least {needed}")]
    Truncated { len: usize, needed: usize },
}

fn probe_vlan(frame: &[u8]) -> Result<u16, ProbeDecodeError> {
    let needed = ETHERNET_HEADER_LEN + VLAN_HEADER_LEN;
    let ethernet = EthernetPacket::new(frame).ok_or(ProbeDecodeError::Truncated {
        len: frame.len(),
        needed,
    })?;
    if ethernet.get_ethertype() != EtherTypes::Vlan {
        return Err(ProbeDecodeError::NotVlan);
    }

    let vlan = VlanPacket::new(ethernet.payload()).ok_or(ProbeDecodeError::Truncated {
        len: frame.len(),
        needed,
    })?;
    Ok(vlan.get_vlan_identifier())
}

/// Whether the frame is tagged as a latency probe
///
/// Only looks at the headers; a frame that passes may still be too short to decode.
pub fn is_probe(frame: &[u8]) -> bool {
    probe_vlan(frame) == Ok(PROBE_VLAN_ID)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HopTimestamp {
    pub sync: u64,
    pub tick: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimestampRecord {
    pub hops: [HopTimestamp; HOP_COUNT],
}

impl TimestampRecord {
    pub fn new(sync: [u64; HOP_COUNT], tick: [u64; HOP_COUNT]) -> Self {
        let mut hops = [HopTimestamp::default(); HOP_COUNT];
        for (i, hop) in hops.iter_mut().enumerate() {
            *hop = HopTimestamp {
                sync: sync[i],
                tick: tick[i],
            };
        }
        Self { hops }
    }

    /// Checks the probe tag and decodes the record that follows it
    pub fn decode(frame: &[u8]) -> Result<Self, ProbeDecodeError> {
        let vlan_id = probe_vlan(frame)?;
        if vlan_id != PROBE_VLAN_ID {
            return Err(ProbeDecodeError::WrongVlanId { found: vlan_id });
        }

        Self::decode_payload(&frame[TIMESTAMP_OFFSET..]).ok_or(ProbeDecodeError::Truncated {
            len: frame.len(),
            needed: PROBE_FRAME_LEN,
        })
    }

    /// Decodes a record from the bytes right after the VLAN header
    pub fn decode_payload(bytes: &[u8]) -> Option<Self> {
        let bytes = bytes.get(..TIMESTAMP_RECORD_LEN)?;
        let mut record = Self::default();
        for (hop, chunk) in record.hops.iter_mut().zip(bytes.chunks_exact(16)) {
            let (sync, tick) = chunk.split_at(8);
            hop.sync = u64::from_le_bytes(sync.try_into().ok()?);
            hop.tick = u64::from_le_bytes(tick.try_into().ok()?);
        }

        Some(record)
    }

    /// Writes the record into `out`, which must hold at least [`TIMESTAMP_RECORD_LEN`] bytes
    pub fn encode_into(&self, out: &mut [u8]) -> bool {
        let Some(out) = out.get_mut(..TIMESTAMP_RECORD_LEN) else {
            return false;
        };

        for (hop, chunk) in self.hops.iter().zip(out.chunks_exact_mut(16)) {
            chunk[..8].copy_from_slice(&hop.sync.to_le_bytes());
            chunk[8..].copy_from_slice(&hop.tick.to_le_bytes());
        }
        true
    }

    pub fn latency_report(&self) -> LatencyReport {
        let mut report = LatencyReport::default();
        for i in 0..HOP_COUNT - 1 {
            let (newer, older) = (self.hops[i], self.hops[i + 1]);
            report.latencies_ns[i] = newer
                .sync
                .wrapping_sub(older.sync)
                .wrapping_mul(SYNC_PERIOD_NS)
                .wrapping_add(newer.tick.wrapping_sub(older.tick).wrapping_mul(TICK_PERIOD_NS));

            let signed = (newer.sync as i128 - older.sync as i128) * SYNC_PERIOD_NS as i128
                + (newer.tick as i128 - older.tick as i128) * TICK_PERIOD_NS as i128;
            if signed < 0 {
                report.reordered_hops += 1;
            }
        }

        report
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LatencyReport {
    /// Latency between hop `i + 1` and hop `i`
    pub latencies_ns: [u64; HOP_COUNT - 1],
    /// Hop pairs whose timestamps go backwards (their latency wrapped around)
    pub reordered_hops: u64,
}

/// Builds a complete probe frame carrying `record`
pub fn build_probe_frame(record: &TimestampRecord) -> Vec<u8> {
    let mut frame = vec![PROBE_FILLER; PROBE_FRAME_LEN];
    frame[..6].copy_from_slice(&PROBE_DESTINATION);
    frame[6..12].copy_from_slice(&PROBE_SOURCE);
    // Best effort priority, not drop eligible
    frame[ETHERNET_HEADER_LEN..TIMESTAMP_OFFSET].fill(0);

    if let Some(mut ethernet) = MutableEthernetPacket::new(&mut frame) {
        ethernet.set_ethertype(EtherTypes::Vlan);
    }

    if let Some(mut vlan) =
        MutableVlanPacket::new(&mut frame[ETHERNET_HEADER_LEN..TIMESTAMP_OFFSET])
    {
        vlan.set_vlan_identifier(PROBE_VLAN_ID);
        vlan.set_ethertype(EtherTypes::Ipv4);
    }

    record.encode_into(&mut frame[TIMESTAMP_OFFSET..]);
    frame
}

#[cfg(test)]
mod test {
    use super::*;

    fn reference_record() -> TimestampRecord {
        TimestampRecord::new([100, 98, 95], [40, 10, 5])
    }

    #[test]
    fn test_latency_formula() {
        let report = reference_record().latency_report();
        assert_eq!(report.latencies_ns, [2120, 3020]);
        assert_eq!(report.reordered_hops, 0);
    }

    #[test]
    fn test_backwards_hops_wrap_and_are_flagged() {
        let record = TimestampRecord::new([95, 98, 90], [0, 0, 0]);
        let report = record.latency_report();
        assert_eq!(report.latencies_ns[0], 0u64.wrapping_sub(3000));
        assert_eq!(report.latencies_ns[1], 8000);
        assert_eq!(report.reordered_hops, 1);
    }

    #[test]
    fn test_built_probe_is_classified_and_decoded() {
        let frame = build_probe_frame(&reference_record());
        assert_eq!(frame.len(), PROBE_FRAME_LEN);
        assert_eq!(&frame[12..14], &[0x81, 0x00]);
        assert_eq!(&frame[14..16], &[0x0A, 0xBC]);
        assert!(is_probe(&frame));
        assert_eq!(TimestampRecord::decode(&frame), Ok(reference_record()));

        // Counters are little-endian
        assert_eq!(&frame[TIMESTAMP_OFFSET..TIMESTAMP_OFFSET + 8], &100u64.to_le_bytes());
    }

    #[test]
    fn test_non_probes_are_rejected() {
        // Untagged IPv4 frame
        let mut plain = vec![0u8; 60];
        plain[12..14].copy_from_slice(&[0x08, 0x00]);
        assert!(!is_probe(&plain));
        assert_eq!(TimestampRecord::decode(&plain), Err(ProbeDecodeError::NotVlan));

        // Tagged with another VLAN
        let mut other = build_probe_frame(&reference_record());
        other[14..16].copy_from_slice(&[0x00, 0x64]);
        assert!(!is_probe(&other));
        assert_eq!(
            TimestampRecord::decode(&other),
            Err(ProbeDecodeError::WrongVlanId { found: 0x64 })
        );

        // Tagged correctly but cut short
        let short = &build_probe_frame(&reference_record())[..40];
        assert!(is_probe(short));
        assert_eq!(
            TimestampRecord::decode(short),
            Err(ProbeDecodeError::Truncated {
                len: 40,
                needed: PROBE_FRAME_LEN
            })
        );

        assert!(!is_probe(&[0; 10]));
    }
}
