//! Decoded capture events, one JSON object per line
//!
//! ```json
//! {"kind":"focus_pod","src":"10.244.1.5","dst":"192.168.5.20","begin":0,"end":10000000000,"op":"update"}
//! {"kind":"segment","timestamp":1000,"saddr":"10.244.1.5","daddr":"10.96.0.10","sport":40000,"dport":80,"ifindex":9,"flags":["SYN"],"seq":100,"ack_seq":0}
//! {"kind":"syscall_enter","tid":42,"pid":7,"syscall_type":232,"timestamp":1000}
//! ```

use crate::error::{PodlensError, Result};
use podlens_agent::ingest::ParamList;
use podlens_agent::FocusOp;
use podlens_common::{packet_type, tcp_flags, TcpDataInfo, TcpTuple};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TcpFlag {
    Fin,
    Syn,
    Rst,
    Psh,
    Ack,
}

impl TcpFlag {
    fn bit(self) -> u8 {
        match self {
            TcpFlag::Fin => tcp_flags::FIN,
            TcpFlag::Syn => tcp_flags::SYN,
            TcpFlag::Rst => tcp_flags::RST,
            TcpFlag::Psh => tcp_flags::PSH,
            TcpFlag::Ack => tcp_flags::ACK,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureDirection {
    #[default]
    Unknown,
    Send,
    Receive,
}

impl CaptureDirection {
    fn packet_type(self) -> u8 {
        match self {
            CaptureDirection::Unknown => packet_type::UNKNOWN,
            CaptureDirection::Send => packet_type::SEND,
            CaptureDirection::Receive => packet_type::RECEIVE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FocusOpName {
    Update,
    Delete,
}

impl From<FocusOpName> for FocusOp {
    fn from(op: FocusOpName) -> Self {
        match op {
            FocusOpName::Update => FocusOp::Update,
            FocusOpName::Delete => FocusOp::Delete,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowFields {
    pub saddr: Ipv4Addr,
    pub daddr: Ipv4Addr,
    pub sport: u16,
    pub dport: u16,
    pub ifindex: u32,
}

impl FlowFields {
    fn tuple(&self) -> TcpTuple {
        TcpTuple {
            saddr: u32::from(self.saddr),
            daddr: u32::from(self.daddr),
            sport: self.sport,
            dport: self.dport,
            ifindex: self.ifindex,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CaptureEvent {
    Segment {
        timestamp: u64,
        #[serde(flatten)]
        flow: FlowFields,
        #[serde(default)]
        flags: Vec<TcpFlag>,
        #[serde(default)]
        seq: u32,
        #[serde(default)]
        ack_seq: u32,
        #[serde(default)]
        direction: CaptureDirection,
    },
    Reported {
        timestamp: u64,
        #[serde(flatten)]
        flow: FlowFields,
        packet_counts: u32,
        #[serde(default)]
        seq: u32,
        #[serde(default)]
        ack_seq: u32,
        #[serde(default)]
        direction: CaptureDirection,
    },
    FocusPod {
        src: Ipv4Addr,
        dst: Ipv4Addr,
        begin: u64,
        end: u64,
        op: FocusOpName,
    },
    SyscallEnter {
        tid: u32,
        pid: u32,
        syscall_type: u16,
        timestamp: u64,
    },
    SyscallExit {
        tid: u32,
        timestamp: u64,
    },
}

impl CaptureEvent {
    /// Parse one input line. Blank lines and `#` comments yield `None`.
    pub fn parse_line(line: &str, line_number: usize) -> Result<Option<Self>> {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            return Ok(None);
        }
        serde_json::from_str(trimmed)
            .map(Some)
            .map_err(|e| PodlensError::InvalidEvent {
                line: line_number,
                reason: e.to_string(),
            })
    }

    /// Event time, when the event carries one
    pub fn timestamp(&self) -> Option<u64> {
        match self {
            CaptureEvent::Segment { timestamp, .. }
            | CaptureEvent::Reported { timestamp, .. }
            | CaptureEvent::SyscallEnter { timestamp, .. }
            | CaptureEvent::SyscallExit { timestamp, .. } => Some(*timestamp),
            CaptureEvent::FocusPod { .. } => None,
        }
    }
}

/// Parameters of a segment event in the capture's wire layout: addresses
/// and ports in network order, the rest little-endian
pub fn segment_params(
    timestamp: u64,
    flow: &FlowFields,
    flags: &[TcpFlag],
    seq: u32,
    ack_seq: u32,
    direction: CaptureDirection,
) -> ParamList {
    let flags = flags.iter().fold(0, |acc, f| acc | f.bit());
    ParamList::new()
        .with("saddr", flow.saddr.octets().to_vec())
        .with("daddr", flow.daddr.octets().to_vec())
        .with("sport", flow.sport.to_be_bytes().to_vec())
        .with("dport", flow.dport.to_be_bytes().to_vec())
        .with("ifindex", flow.ifindex.to_le_bytes().to_vec())
        .with("flags", vec![flags])
        .with("seq", seq.to_le_bytes().to_vec())
        .with("ack_seq", ack_seq.to_le_bytes().to_vec())
        .with("timestamp", timestamp.to_le_bytes().to_vec())
        .with("packet_type", vec![direction.packet_type()])
}

pub fn reported_record(
    timestamp: u64,
    flow: &FlowFields,
    packet_counts: u32,
    seq: u32,
    ack_seq: u32,
    direction: CaptureDirection,
) -> TcpDataInfo {
    TcpDataInfo {
        timestamp,
        tuple: flow.tuple(),
        seq,
        ack_seq,
        packet_counts,
        packet_type: direction.packet_type(),
        _padding: [0; 3],
    }
}
