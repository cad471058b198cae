//! Per-flow packet counts
//!
//! Two ingestion modes feed the same aggregate:
//! - per-packet segments (ring and single-event front ends) add one each
//! - per-syscall-return [`TcpDataInfo`] records carry the kernel's cumulative
//!   counter, so the window keeps the largest value reported
//!
//! A tuple's direction is resolved when its entry is created and never
//! revised within the window.

use crate::analyzer::Analyzer;
use crate::interfaces::{Direction, InterfaceTable};
use crate::metrics::Counters;
use crate::telemetry::{AttributeValue, TelemetryBuffer, TelemetryRecord};
use crate::window::FlushClock;
use ahash::AHashMap;
use log::debug;
use podlens_common::{TcpDataInfo, TcpRawData, TcpTuple};
use std::sync::Arc;

pub const RECORD_NAME: &str = "tcp_packet_counts";

#[derive(Debug, Clone, Copy)]
struct PacketTotal {
    total: u64,
    direction: Direction,
}

pub struct PacketCountAnalyzer {
    table: Arc<InterfaceTable>,
    totals: AHashMap<TcpTuple, PacketTotal>,
    clock: FlushClock,
    counters: Counters,
}

impl PacketCountAnalyzer {
    pub fn new(table: Arc<InterfaceTable>, flush_interval_ns: u64, counters: Counters) -> Self {
        Self {
            table,
            totals: AHashMap::new(),
            clock: FlushClock::new(flush_interval_ns),
            counters,
        }
    }

    /// Merge a pre-aggregated record, keeping the maximum reported counter
    pub fn ingest_reported(&mut self, info: &TcpDataInfo) {
        if !self.table.is_container(info.tuple.ifindex) {
            return;
        }
        self.clock.observe(info.timestamp);
        self.counters.ingested.inc();

        let reported = info.packet_counts as u64;
        let table = &self.table;
        self.totals
            .entry(info.tuple)
            .and_modify(|entry| entry.total = entry.total.max(reported))
            .or_insert_with(|| PacketTotal {
                total: reported,
                direction: table.direction(&info.tuple, info.packet_type),
            });
    }

    fn record(&self, tuple: &TcpTuple, entry: &PacketTotal) -> TelemetryRecord {
        TelemetryRecord::new(RECORD_NAME, self.clock.latest())
            .with("sip", AttributeValue::U32(tuple.saddr))
            .with("dip", AttributeValue::U32(tuple.daddr))
            .with("sport", AttributeValue::U16(tuple.sport))
            .with("dport", AttributeValue::U16(tuple.dport))
            .with("packet_counts", AttributeValue::U64(entry.total))
            .with("direction_type", AttributeValue::I32(entry.direction.as_i32()))
    }
}

impl Analyzer for PacketCountAnalyzer {
    fn name(&self) -> &'static str {
        "packet_count"
    }

    fn ingest(&mut self, segment: &TcpRawData) {
        if !self.table.is_container(segment.tuple.ifindex) {
            return;
        }
        self.clock.observe(segment.timestamp);
        self.counters.ingested.inc();

        let table = &self.table;
        self.totals
            .entry(segment.tuple)
            .and_modify(|entry| entry.total += 1)
            .or_insert_with(|| PacketTotal {
                total: 1,
                direction: table.direction(&segment.tuple, segment.packet_type),
            });
    }

    fn flush(&mut self, out: &mut TelemetryBuffer) -> usize {
        let mut emitted = Vec::new();
        for (tuple, entry) in &self.totals {
            if !out.push(self.record(tuple, entry)) {
                break;
            }
            emitted.push(*tuple);
        }
        for tuple in &emitted {
            self.totals.remove(tuple);
        }

        if !self.totals.is_empty() {
            self.counters.truncated.inc_by(self.totals.len() as u64);
            debug!(
                "Output full, {} packet counts left for next flush",
                self.totals.len()
            );
        }

        self.counters.emitted.inc_by(emitted.len() as u64);
        emitted.len()
    }

    fn pending(&self) -> usize {
        self.totals.len()
    }

    fn clock(&self) -> &FlushClock {
        &self.clock
    }

    fn clock_mut(&mut self) -> &mut FlushClock {
        &mut self.clock
    }
}
