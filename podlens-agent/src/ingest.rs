//! Ingestion front ends
//!
//! Two shapes arrive from the capture side:
//! - a circular buffer of raw [`TcpRawData`] slots with head/tail cursors
//! - single decoded events read through a generic [`EventParams`] accessor
//!
//! Both produce `TcpRawData` values for the same aggregation logic. Byte
//! lengths are validated once at decode; nothing downstream re-derives
//! offsets.

use crate::error::{AgentError, Result};
use bytes::{Buf, Bytes};
use podlens_common::{packet_type, TcpDataInfo, TcpRawData, TcpTuple};
use std::mem;

pub const RAW_RECORD_SIZE: usize = mem::size_of::<TcpRawData>();
pub const DATA_INFO_SIZE: usize = mem::size_of::<TcpDataInfo>();

/// Size of the cursor header in a ring dump: head and tail as u64 LE
pub const RING_HEADER_SIZE: usize = 16;

/// Read-only view over a capture ring between two cursors
pub struct RingView<'a, T> {
    slots: &'a [T],
    head: usize,
    tail: usize,
}

impl<'a, T> RingView<'a, T> {
    pub fn new(slots: &'a [T], head: usize, tail: usize) -> Result<Self> {
        let capacity = slots.len();
        if capacity == 0 || head >= capacity || tail >= capacity {
            return Err(AgentError::RingCursor {
                head,
                tail,
                capacity,
            });
        }
        Ok(Self { slots, head, tail })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots between head and tail
    pub fn len(&self) -> usize {
        let capacity = self.capacity();
        (self.tail + capacity - self.head) % capacity
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn iter(&self) -> RingIter<'a, T> {
        RingIter {
            slots: self.slots,
            pos: self.head,
            tail: self.tail,
        }
    }
}

pub struct RingIter<'a, T> {
    slots: &'a [T],
    pos: usize,
    tail: usize,
}

impl<'a, T> Iterator for RingIter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos == self.tail {
            return None;
        }
        let item = &self.slots[self.pos];
        self.pos = (self.pos + 1) % self.slots.len();
        Some(item)
    }
}

/// Decode one raw per-packet record from capture bytes
pub fn decode_raw(bytes: &[u8]) -> Result<TcpRawData> {
    if bytes.len() != RAW_RECORD_SIZE {
        return Err(AgentError::Decode {
            expected: RAW_RECORD_SIZE,
            actual: bytes.len(),
        });
    }
    // SAFETY: length checked above and TcpRawData is repr(C) plain data
    Ok(unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const TcpRawData) })
}

/// Decode one pre-aggregated per-syscall-return record
pub fn decode_data_info(bytes: &[u8]) -> Result<TcpDataInfo> {
    if bytes.len() != DATA_INFO_SIZE {
        return Err(AgentError::Decode {
            expected: DATA_INFO_SIZE,
            actual: bytes.len(),
        });
    }
    // SAFETY: length checked above and TcpDataInfo is repr(C) plain data
    Ok(unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const TcpDataInfo) })
}

/// A ring snapshot as written by the capture side: cursor header then slots
#[derive(Debug, Clone)]
pub struct RingDump {
    pub head: usize,
    pub tail: usize,
    pub slots: Vec<TcpRawData>,
}

impl RingDump {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < RING_HEADER_SIZE {
            return Err(AgentError::Decode {
                expected: RING_HEADER_SIZE,
                actual: bytes.len(),
            });
        }
        let mut header = &bytes[..RING_HEADER_SIZE];
        let head = header.get_u64_le() as usize;
        let tail = header.get_u64_le() as usize;

        let body = &bytes[RING_HEADER_SIZE..];
        if body.len() % RAW_RECORD_SIZE != 0 {
            return Err(AgentError::Decode {
                expected: (body.len() / RAW_RECORD_SIZE + 1) * RAW_RECORD_SIZE,
                actual: body.len(),
            });
        }
        let slots = body
            .chunks_exact(RAW_RECORD_SIZE)
            .map(decode_raw)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { head, tail, slots })
    }

    pub fn view(&self) -> Result<RingView<'_, TcpRawData>> {
        RingView::new(&self.slots, self.head, self.tail)
    }
}

/// Generic accessor over a captured event's named parameters
pub trait EventParams {
    fn param(&self, name: &str) -> Option<&[u8]>;
}

/// Owned parameter list, as handed over by a tracing event source
#[derive(Debug, Clone, Default)]
pub struct ParamList {
    params: Vec<(String, Bytes)>,
}

impl ParamList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<Bytes>) -> Self {
        self.push(name, value);
        self
    }

    pub fn push(&mut self, name: &str, value: impl Into<Bytes>) {
        self.params.push((name.to_string(), value.into()));
    }
}

impl EventParams for ParamList {
    fn param(&self, name: &str) -> Option<&[u8]> {
        self.params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_ref())
    }
}

fn field<'p>(params: &'p impl EventParams, name: &'static str, len: usize) -> Result<&'p [u8]> {
    let raw = params.param(name).ok_or(AgentError::MissingParam(name))?;
    if raw.len() != len {
        return Err(AgentError::Decode {
            expected: len,
            actual: raw.len(),
        });
    }
    Ok(raw)
}

/// Build a segment from a single decoded event
///
/// Addresses and ports are read in network byte order as they appear on the
/// wire; the remaining fields are native little-endian. `packet_type` is
/// optional and defaults to unknown.
pub fn decode_segment(params: &impl EventParams) -> Result<TcpRawData> {
    let tuple = TcpTuple {
        saddr: field(params, "saddr", 4)?.get_u32(),
        daddr: field(params, "daddr", 4)?.get_u32(),
        sport: field(params, "sport", 2)?.get_u16(),
        dport: field(params, "dport", 2)?.get_u16(),
        ifindex: field(params, "ifindex", 4)?.get_u32_le(),
    };

    let packet_type = match params.param("packet_type") {
        Some(_) => field(params, "packet_type", 1)?.get_u8(),
        None => packet_type::UNKNOWN,
    };

    Ok(TcpRawData {
        timestamp: field(params, "timestamp", 8)?.get_u64_le(),
        tuple,
        seq: field(params, "seq", 4)?.get_u32_le(),
        ack_seq: field(params, "ack_seq", 4)?.get_u32_le(),
        flags: field(params, "flags", 1)?.get_u8(),
        packet_type,
        _padding: [0; 6],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use podlens_common::tcp_flags;
    use std::net::Ipv4Addr;

    fn raw_bytes(record: &TcpRawData) -> Vec<u8> {
        let ptr = record as *const TcpRawData as *const u8;
        unsafe { std::slice::from_raw_parts(ptr, RAW_RECORD_SIZE) }.to_vec()
    }

    fn segment(seq: u32) -> TcpRawData {
        TcpRawData {
            timestamp: 1_000 + seq as u64,
            seq,
            ..Default::default()
        }
    }

    #[test]
    fn test_ring_iterates_head_to_tail_with_wrap() {
        let slots: Vec<TcpRawData> = (0..4).map(segment).collect();
        let view = RingView::new(&slots, 2, 1).expect("valid cursors");

        let seqs: Vec<u32> = view.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![2, 3, 0]);
        assert_eq!(view.len(), 3);
    }

    #[test]
    fn test_ring_empty_when_head_equals_tail() {
        let slots: Vec<TcpRawData> = (0..4).map(segment).collect();
        let view = RingView::new(&slots, 3, 3).expect("valid cursors");
        assert!(view.is_empty());
        assert_eq!(view.iter().count(), 0);
    }

    #[test]
    fn test_ring_rejects_out_of_range_cursor() {
        let slots: Vec<TcpRawData> = (0..4).map(segment).collect();
        assert!(matches!(
            RingView::new(&slots, 0, 4),
            Err(AgentError::RingCursor { capacity: 4, .. })
        ));
        let empty: Vec<TcpRawData> = Vec::new();
        assert!(RingView::new(&empty, 0, 0).is_err());
    }

    #[test]
    fn test_decode_raw_validates_length() {
        let record = TcpRawData {
            timestamp: 42,
            seq: 7,
            flags: tcp_flags::SYN,
            ..Default::default()
        };
        let bytes = raw_bytes(&record);

        assert_eq!(decode_raw(&bytes).expect("decode"), record);
        assert!(matches!(
            decode_raw(&bytes[..39]),
            Err(AgentError::Decode {
                expected: 40,
                actual: 39
            })
        ));
    }

    #[test]
    fn test_ring_dump_parse() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1u64.to_le_bytes());
        bytes.extend_from_slice(&0u64.to_le_bytes());
        for seq in 0..3 {
            bytes.extend_from_slice(&raw_bytes(&segment(seq)));
        }

        let dump = RingDump::parse(&bytes).expect("parse");
        let seqs: Vec<u32> = dump.view().expect("view").iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![1, 2]);

        bytes.push(0);
        assert!(RingDump::parse(&bytes).is_err());
    }

    #[test]
    fn test_decode_segment_from_params() {
        let params = ParamList::new()
            .with("saddr", Ipv4Addr::new(10, 244, 1, 5).octets().to_vec())
            .with("daddr", Ipv4Addr::new(10, 96, 0, 10).octets().to_vec())
            .with("sport", 40000u16.to_be_bytes().to_vec())
            .with("dport", 80u16.to_be_bytes().to_vec())
            .with("ifindex", 9u32.to_le_bytes().to_vec())
            .with("flags", vec![tcp_flags::ACK])
            .with("seq", 100u32.to_le_bytes().to_vec())
            .with("ack_seq", 5u32.to_le_bytes().to_vec())
            .with("timestamp", 123_456u64.to_le_bytes().to_vec());

        let seg = decode_segment(&params).expect("decode");
        assert_eq!(seg.tuple.saddr, u32::from(Ipv4Addr::new(10, 244, 1, 5)));
        assert_eq!(seg.tuple.dport, 80);
        assert_eq!(seg.tuple.ifindex, 9);
        assert_eq!(seg.seq, 100);
        assert_eq!(seg.ack_seq, 5);
        assert_eq!(seg.timestamp, 123_456);
        assert_eq!(seg.packet_type, packet_type::UNKNOWN);
        assert!(seg.has_flag(tcp_flags::ACK));
    }

    #[test]
    fn test_decode_segment_reports_missing_and_short_params() {
        let missing = ParamList::new().with("saddr", vec![10, 0, 0, 1]);
        assert!(matches!(
            decode_segment(&missing),
            Err(AgentError::MissingParam("daddr"))
        ));

        let short = ParamList::new().with("saddr", vec![10, 0]);
        assert!(matches!(
            decode_segment(&short),
            Err(AgentError::Decode {
                expected: 4,
                actual: 2
            })
        ));
    }
}
