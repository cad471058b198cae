//! Per-flow ACK delay
//!
//! Segments leaving towards a remote peer are queued under their own tuple.
//! When an ACK comes back into the local side, the queue under its reverse
//! tuple is drained while the head is covered by that ACK:
//!
//! ```text
//! head.seq <= ack.ack_seq && head.ack_seq <= ack.seq
//! ```
//!
//! which admits cumulative ACKs and retransmissions. The delay is measured
//! from the last covered segment.

use crate::analyzer::Analyzer;
use crate::interfaces::{Direction, InterfaceTable};
use crate::metrics::Counters;
use crate::telemetry::{AttributeValue, TelemetryBuffer, TelemetryRecord};
use crate::window::FlushClock;
use ahash::AHashMap;
use log::debug;
use podlens_common::{tcp_flags, TcpRawData, TcpTuple};
use std::collections::VecDeque;
use std::sync::Arc;

pub const RECORD_NAME: &str = "tcp_ack_delay";

#[derive(Debug, Clone, Copy)]
struct InFlightSegment {
    seq: u32,
    ack_seq: u32,
    timestamp: u64,
}

#[derive(Debug, Clone, Copy)]
struct AckDelayAggregate {
    count: u64,
    delay_sum: i64,
    start_time: u64,
    end_time: u64,
}

pub struct AckDelayAnalyzer {
    table: Arc<InterfaceTable>,
    queues: AHashMap<TcpTuple, VecDeque<InFlightSegment>>,
    aggregates: AHashMap<TcpTuple, AckDelayAggregate>,
    clock: FlushClock,
    counters: Counters,
}

impl AckDelayAnalyzer {
    pub fn new(table: Arc<InterfaceTable>, flush_interval_ns: u64, counters: Counters) -> Self {
        Self {
            table,
            queues: AHashMap::new(),
            aggregates: AHashMap::new(),
            clock: FlushClock::new(flush_interval_ns),
            counters,
        }
    }

    /// Segments waiting for an acknowledgment, across all flows
    pub fn queued(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    fn enqueue(&mut self, segment: &TcpRawData) {
        self.queues
            .entry(segment.tuple)
            .or_default()
            .push_back(InFlightSegment {
                seq: segment.seq,
                ack_seq: segment.ack_seq,
                timestamp: segment.timestamp,
            });
    }

    fn match_ack(&mut self, segment: &TcpRawData) {
        let key = segment.tuple.reverse();
        let Some(queue) = self.queues.get_mut(&key) else {
            self.counters.unmatched.inc();
            return;
        };

        let mut covered = None;
        while let Some(head) = queue.front() {
            if head.seq <= segment.ack_seq && head.ack_seq <= segment.seq {
                covered = queue.pop_front();
            } else {
                break;
            }
        }
        if queue.is_empty() {
            self.queues.remove(&key);
        }

        let Some(pre) = covered else {
            self.counters.unmatched.inc();
            return;
        };

        let now = segment.timestamp;
        let delay = now.saturating_sub(pre.timestamp) as i64;
        self.aggregates
            .entry(segment.tuple)
            .and_modify(|agg| {
                agg.count += 1;
                agg.delay_sum += delay;
                agg.end_time = now;
            })
            .or_insert(AckDelayAggregate {
                count: 1,
                delay_sum: delay,
                start_time: now,
                end_time: now,
            });
    }

    fn record(&self, tuple: &TcpTuple, agg: &AckDelayAggregate) -> TelemetryRecord {
        TelemetryRecord::new(RECORD_NAME, self.clock.latest())
            .with("sip", AttributeValue::U32(tuple.saddr))
            .with("dip", AttributeValue::U32(tuple.daddr))
            .with("sport", AttributeValue::U16(tuple.sport))
            .with("dport", AttributeValue::U16(tuple.dport))
            .with("data_counts", AttributeValue::U64(agg.count))
            .with("acktime_delta", AttributeValue::I64(agg.delay_sum))
            .with("start_time", AttributeValue::U64(agg.start_time))
            .with("end_time", AttributeValue::U64(agg.end_time))
    }
}

impl Analyzer for AckDelayAnalyzer {
    fn name(&self) -> &'static str {
        "ack_delay"
    }

    fn ingest(&mut self, segment: &TcpRawData) {
        if !self.table.is_container(segment.tuple.ifindex) {
            return;
        }
        if !segment.has_flag(tcp_flags::ACK) || segment.has_flag(tcp_flags::SYN) {
            return;
        }
        self.clock.observe(segment.timestamp);
        self.counters.ingested.inc();

        match self.table.direction(&segment.tuple, segment.packet_type) {
            Direction::Received => self.match_ack(segment),
            Direction::Sent => self.enqueue(segment),
        }
    }

    fn flush(&mut self, out: &mut TelemetryBuffer) -> usize {
        let mut emitted = Vec::new();
        for (tuple, agg) in &self.aggregates {
            if !out.push(self.record(tuple, agg)) {
                break;
            }
            emitted.push(*tuple);
        }
        for tuple in &emitted {
            self.aggregates.remove(tuple);
        }

        if !self.aggregates.is_empty() {
            self.counters.truncated.inc_by(self.aggregates.len() as u64);
            debug!(
                "Output full, {} ack delay aggregates left for next flush",
                self.aggregates.len()
            );
        }

        // unacknowledged segments do not carry over into the next window
        let dropped = self.queued();
        if dropped > 0 {
            debug!("Discarding {} unacknowledged segments", dropped);
        }
        self.queues.clear();

        self.counters.emitted.inc_by(emitted.len() as u64);
        emitted.len()
    }

    fn pending(&self) -> usize {
        self.aggregates.len()
    }

    fn clock(&self) -> &FlushClock {
        &self.clock
    }

    fn clock_mut(&mut self) -> &mut FlushClock {
        &mut self.clock
    }
}
