//! Shared types between the kernel capture side and userspace
//!
//! This crate defines the raw records the capture collaborator writes into
//! its ring buffers. They must be:
//! - `#[repr(C)]` for stable memory layout
//! - `no_std` compatible for eBPF
//! - Shared between kernel probes and the userspace analyzers

#![cfg_attr(not(feature = "userspace"), no_std)]

/// One direction of one TCP flow, as seen on one interface
///
/// Layout (16 bytes total, 4-byte aligned):
/// - saddr/daddr: IPv4 addresses in host byte order (`u32::from(Ipv4Addr)`)
/// - sport/dport: ports in host byte order
/// - ifindex: index of the interface the packet was captured on
///
/// The same logical flow is usually observed on several virtual interfaces
/// (veth, cni0, flannel.1, the physical NIC), so `ifindex` is part of the key.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
#[cfg_attr(feature = "userspace", derive(PartialEq, Eq, Hash))]
pub struct TcpTuple {
    pub saddr: u32,
    pub daddr: u32,
    pub sport: u16,
    pub dport: u16,
    pub ifindex: u32,
}

impl TcpTuple {
    /// The same flow seen from the other endpoint, on the same interface
    pub const fn reverse(&self) -> Self {
        Self {
            saddr: self.daddr,
            daddr: self.saddr,
            sport: self.dport,
            dport: self.sport,
            ifindex: self.ifindex,
        }
    }
}

/// Per-packet TCP segment record
///
/// Layout (40 bytes total, 8-byte aligned):
/// - timestamp: capture time in nanoseconds
/// - tuple: flow tuple of this segment
/// - seq/ack_seq: TCP sequence and acknowledgment numbers
/// - flags: raw TCP flag byte (see [`tcp_flags`])
/// - packet_type: capture direction relative to the interface (see [`packet_type`])
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
#[cfg_attr(feature = "userspace", derive(PartialEq, Eq))]
pub struct TcpRawData {
    pub timestamp: u64,
    pub tuple: TcpTuple,
    pub seq: u32,
    pub ack_seq: u32,
    pub flags: u8,
    pub packet_type: u8,
    pub _padding: [u8; 6],
}

impl TcpRawData {
    pub const fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

/// Pre-aggregated record emitted on a socket syscall return
///
/// `packet_counts` is the kernel's cumulative segment counter for the tuple
/// at the time of the syscall, not a delta.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
#[cfg_attr(feature = "userspace", derive(PartialEq, Eq))]
pub struct TcpDataInfo {
    pub timestamp: u64,
    pub tuple: TcpTuple,
    pub seq: u32,
    pub ack_seq: u32,
    pub packet_counts: u32,
    pub packet_type: u8,
    pub _padding: [u8; 3],
}

/// TCP flag bits as they appear in the 13th header byte
pub mod tcp_flags {
    pub const FIN: u8 = 1 << 0;
    pub const SYN: u8 = 1 << 1;
    pub const RST: u8 = 1 << 2;
    pub const PSH: u8 = 1 << 3;
    pub const ACK: u8 = 1 << 4;
}

/// Capture direction relative to the capturing interface
///
/// On the host side of a veth pair these are inverted with respect to the
/// container: a `RECEIVE` packet was sent by the container.
pub mod packet_type {
    pub const UNKNOWN: u8 = 0;
    pub const SEND: u8 = 1;
    pub const RECEIVE: u8 = 2;
}

/// Well-known ports the path tracker never indexes
pub mod ports {
    pub const DNS: u16 = 53;
}

#[cfg(feature = "userspace")]
const _: () = {
    assert!(
        core::mem::size_of::<TcpTuple>() == 16,
        "TcpTuple must be exactly 16 bytes"
    );
    assert!(
        core::mem::align_of::<TcpTuple>() == 4,
        "TcpTuple must be 4-byte aligned"
    );
};

#[cfg(feature = "userspace")]
const _: () = {
    assert!(
        core::mem::size_of::<TcpRawData>() == 40,
        "TcpRawData must be exactly 40 bytes"
    );
    assert!(
        core::mem::align_of::<TcpRawData>() == 8,
        "TcpRawData must be 8-byte aligned"
    );
};

#[cfg(feature = "userspace")]
const _: () = {
    assert!(
        core::mem::size_of::<TcpDataInfo>() == 40,
        "TcpDataInfo must be exactly 40 bytes"
    );
};
