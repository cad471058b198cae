//! Pod network path tracking
//!
//! Callers declare focus pod pairs, each with a time window. Traffic touching
//! a focus IP is indexed twice: by endpoint IP (peer, seq, timestamp) and by
//! sequence number (full tuple). A poll walks every focus pair, follows the
//! sequence numbers seen for either endpoint, emits the indexed segments that
//! fall inside the pair's window and consumes them.
//!
//! Each indexed segment is delivered at most once. A segment outside the
//! window of the pair being polled stays indexed for any other pair sharing
//! the endpoint, until it ages out.
//!
//! Both indexes age out on every poll regardless of matches, and a pair is
//! dropped once its window has ended.

use crate::error::AgentError;
use crate::interfaces::InterfaceTable;
use crate::metrics::Counters;
use crate::telemetry::{AttributeValue, TelemetryBuffer, TelemetryRecord};
use ahash::AHashMap;
use log::{debug, info};
use podlens_common::{ports, TcpRawData, TcpTuple};
use std::sync::Arc;

pub const RECORD_NAME: &str = "pod_net_track";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusOp {
    Update,
    Delete,
}

impl TryFrom<u8> for FocusOp {
    type Error = AgentError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FocusOp::Update),
            1 => Ok(FocusOp::Delete),
            other => Err(AgentError::UnknownFocusOp(other)),
        }
    }
}

/// Unordered pair of pod IPs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PodPair {
    low: u32,
    high: u32,
}

impl PodPair {
    pub fn new(a: u32, b: u32) -> Self {
        Self {
            low: a.min(b),
            high: a.max(b),
        }
    }

    pub fn endpoints(&self) -> [u32; 2] {
        [self.low, self.high]
    }

    fn is_self_pair(&self) -> bool {
        self.low == self.high
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FocusWindow {
    pub begin: u64,
    pub end: u64,
}

impl FocusWindow {
    fn contains(&self, timestamp: u64) -> bool {
        self.begin <= timestamp && timestamp <= self.end
    }
}

#[derive(Debug, Clone, Copy)]
struct PeerObservation {
    peer: u32,
    seq: u32,
    timestamp: u64,
}

#[derive(Debug, Clone, Copy)]
struct TrackedSegment {
    tuple: TcpTuple,
    seq: u32,
    timestamp: u64,
}

pub struct PodTracker {
    table: Arc<InterfaceTable>,
    focus_pairs: AHashMap<PodPair, FocusWindow>,
    focus_ips: AHashMap<u32, u32>,
    ip_to_seq: AHashMap<u32, Vec<PeerObservation>>,
    by_seq: AHashMap<u32, Vec<TrackedSegment>>,
    clear_cycle_ns: u64,
    counters: Counters,
}

impl PodTracker {
    pub fn new(table: Arc<InterfaceTable>, clear_cycle_ns: u64, counters: Counters) -> Self {
        Self {
            table,
            focus_pairs: AHashMap::new(),
            focus_ips: AHashMap::new(),
            ip_to_seq: AHashMap::new(),
            by_seq: AHashMap::new(),
            clear_cycle_ns,
            counters,
        }
    }

    /// Declare, refresh or withdraw a focus pod pair
    pub fn update_focus_pod(&mut self, src: u32, dst: u32, begin: u64, end: u64, op: FocusOp) {
        let pair = PodPair::new(src, dst);
        match op {
            FocusOp::Update => {
                let window = FocusWindow { begin, end };
                if self.focus_pairs.insert(pair, window).is_none() {
                    self.retain_ips(&pair);
                    info!("Tracking pod pair over [{}, {}]", begin, end);
                }
            }
            FocusOp::Delete => {
                if self.focus_pairs.remove(&pair).is_some() {
                    self.release_ips(&pair);
                    info!("Stopped tracking pod pair");
                }
            }
        }
    }

    fn retain_ips(&mut self, pair: &PodPair) {
        let endpoints = pair.endpoints();
        let ips = if pair.is_self_pair() {
            &endpoints[..1]
        } else {
            &endpoints[..]
        };
        for ip in ips {
            *self.focus_ips.entry(*ip).or_insert(0) += 1;
        }
    }

    fn release_ips(&mut self, pair: &PodPair) {
        let endpoints = pair.endpoints();
        let ips = if pair.is_self_pair() {
            &endpoints[..1]
        } else {
            &endpoints[..]
        };
        for ip in ips {
            if let Some(count) = self.focus_ips.get_mut(ip) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.focus_ips.remove(ip);
                }
            }
        }
    }

    pub fn is_focus_ip(&self, ip: u32) -> bool {
        self.focus_ips.contains_key(&ip)
    }

    pub fn focus_refcount(&self, ip: u32) -> u32 {
        self.focus_ips.get(&ip).copied().unwrap_or(0)
    }

    pub fn focus_window(&self, a: u32, b: u32) -> Option<FocusWindow> {
        self.focus_pairs.get(&PodPair::new(a, b)).copied()
    }

    pub fn focus_pairs(&self) -> usize {
        self.focus_pairs.len()
    }

    /// Peers indexed for `ip`, in observation order
    pub fn observed_peers(&self, ip: u32) -> Vec<u32> {
        self.ip_to_seq
            .get(&ip)
            .map(|observations| observations.iter().map(|o| o.peer).collect())
            .unwrap_or_default()
    }

    /// Segments currently held in the sequence index
    pub fn indexed_segments(&self) -> usize {
        self.by_seq.values().map(Vec::len).sum()
    }

    pub fn ingest(&mut self, segment: &TcpRawData) {
        let tuple = segment.tuple;
        if tuple.sport == ports::DNS || tuple.dport == ports::DNS {
            return;
        }
        if self.table.in_cni(tuple.saddr) && self.table.in_cni(tuple.daddr) {
            return;
        }
        if !self.is_focus_ip(tuple.saddr) && !self.is_focus_ip(tuple.daddr) {
            return;
        }
        self.counters.ingested.inc();

        self.ip_to_seq
            .entry(tuple.saddr)
            .or_default()
            .push(PeerObservation {
                peer: tuple.daddr,
                seq: segment.seq,
                timestamp: segment.timestamp,
            });
        self.ip_to_seq
            .entry(tuple.daddr)
            .or_default()
            .push(PeerObservation {
                peer: tuple.saddr,
                seq: segment.seq,
                timestamp: segment.timestamp,
            });
        self.by_seq
            .entry(segment.seq)
            .or_default()
            .push(TrackedSegment {
                tuple,
                seq: segment.seq,
                timestamp: segment.timestamp,
            });
    }

    /// Query every focus pair, then prune the indexes and expire pairs
    pub fn poll(&mut self, now: u64, out: &mut TelemetryBuffer) -> usize {
        let written = self.query(now, out);
        self.prune(now);
        self.expire_pairs(now);
        written
    }

    fn query(&mut self, now: u64, out: &mut TelemetryBuffer) -> usize {
        let pairs: Vec<(PodPair, FocusWindow)> =
            self.focus_pairs.iter().map(|(p, w)| (*p, *w)).collect();
        let mut written = 0;

        'pairs: for (pair, window) in pairs {
            for ip in pair.endpoints() {
                let seqs: Vec<u32> = match self.ip_to_seq.get(&ip) {
                    Some(observations) => observations.iter().map(|o| o.seq).collect(),
                    None => continue,
                };
                for seq in seqs {
                    let Some(bucket) = self.by_seq.get_mut(&seq) else {
                        continue;
                    };

                    // segments outside this pair's window stay for other pairs
                    let mut kept = Vec::new();
                    let mut left = 0;
                    for seg in bucket.drain(..) {
                        if window.contains(seg.timestamp) {
                            if left == 0 && out.push(segment_record(&seg, now)) {
                                written += 1;
                                continue;
                            }
                            left += 1;
                        }
                        kept.push(seg);
                    }

                    if kept.is_empty() {
                        self.by_seq.remove(&seq);
                    } else {
                        *bucket = kept;
                    }
                    if left > 0 {
                        self.counters.truncated.inc_by(left as u64);
                        debug!("Output full, {} tracked segments left for next poll", left);
                        break 'pairs;
                    }
                }
            }
        }

        self.counters.emitted.inc_by(written as u64);
        written
    }

    fn prune(&mut self, now: u64) {
        let horizon = self.clear_cycle_ns;
        self.ip_to_seq.retain(|_, observations| {
            observations.retain(|o| now.saturating_sub(o.timestamp) <= horizon);
            !observations.is_empty()
        });
        self.by_seq.retain(|_, segments| {
            segments.retain(|s| now.saturating_sub(s.timestamp) <= horizon);
            !segments.is_empty()
        });
    }

    fn expire_pairs(&mut self, now: u64) {
        let expired: Vec<PodPair> = self
            .focus_pairs
            .iter()
            .filter(|(_, window)| now > window.end)
            .map(|(pair, _)| *pair)
            .collect();
        for pair in expired {
            self.focus_pairs.remove(&pair);
            self.release_ips(&pair);
            debug!("Focus pod pair window ended at {}", now);
        }
    }
}

fn segment_record(seg: &TrackedSegment, now: u64) -> TelemetryRecord {
    TelemetryRecord::new(RECORD_NAME, now)
        .with("sip", AttributeValue::U32(seg.tuple.saddr))
        .with("dip", AttributeValue::U32(seg.tuple.daddr))
        .with("sport", AttributeValue::U16(seg.tuple.sport))
        .with("dport", AttributeValue::U16(seg.tuple.dport))
        .with("ifindex", AttributeValue::U32(seg.tuple.ifindex))
        .with("seq", AttributeValue::U32(seg.seq))
        .with("timestamp", AttributeValue::U64(seg.timestamp))
}
