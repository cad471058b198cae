//! TCP three-way handshake RTT
//!
//! A pending entry is opened on the client's SYN, stamped on the server's
//! SYN+ACK (seen under the reverse tuple) and resolved on the client's final
//! ACK. Resolved handshakes fold into a per-tuple aggregate that is drained
//! once per event-time window.
//!
//! Only one side of the exchange is meaningful from the local vantage point:
//! a client measures the SYN to SYN+ACK leg, a server the SYN+ACK to ACK leg.
//! The other sum is reported as `-1`.

use crate::analyzer::Analyzer;
use crate::interfaces::{Direction, InterfaceTable};
use crate::metrics::Counters;
use crate::telemetry::{AttributeValue, TelemetryBuffer, TelemetryRecord};
use crate::window::FlushClock;
use ahash::AHashMap;
use log::debug;
use podlens_common::{tcp_flags, TcpRawData, TcpTuple};
use std::sync::Arc;

pub const RECORD_NAME: &str = "tcp_handshake_rtt";

const INVALID_RTT: i64 = -1;

#[derive(Debug, Clone, Copy)]
struct PendingHandshake {
    syn_time: u64,
    ack_time: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
struct HandshakeAggregate {
    count: u64,
    syn_rtt_sum: i64,
    ack_rtt_sum: i64,
    start_time: u64,
    end_time: u64,
    packet_type: u8,
}

pub struct HandshakeAnalyzer {
    table: Arc<InterfaceTable>,
    pending: AHashMap<TcpTuple, PendingHandshake>,
    aggregates: AHashMap<TcpTuple, HandshakeAggregate>,
    clock: FlushClock,
    counters: Counters,
}

impl HandshakeAnalyzer {
    pub fn new(table: Arc<InterfaceTable>, flush_interval_ns: u64, counters: Counters) -> Self {
        Self {
            table,
            pending: AHashMap::new(),
            aggregates: AHashMap::new(),
            clock: FlushClock::new(flush_interval_ns),
            counters,
        }
    }

    /// Handshakes still waiting for their final ACK
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    fn on_syn(&mut self, segment: &TcpRawData) {
        self.pending
            .entry(segment.tuple)
            .or_insert(PendingHandshake {
                syn_time: segment.timestamp,
                ack_time: None,
            });
    }

    fn on_syn_ack(&mut self, segment: &TcpRawData) {
        match self.pending.get_mut(&segment.tuple.reverse()) {
            Some(entry) => entry.ack_time = Some(segment.timestamp),
            None => {
                self.counters.unmatched.inc();
                debug!("SYN+ACK without a pending SYN on ifindex {}", segment.tuple.ifindex);
            }
        }
    }

    fn on_ack(&mut self, segment: &TcpRawData) {
        // Plain data ACKs miss here all the time; only a stamped entry resolves.
        let ack_time = match self.pending.get(&segment.tuple) {
            Some(PendingHandshake {
                ack_time: Some(ack_time),
                ..
            }) => *ack_time,
            _ => return,
        };
        let Some(entry) = self.pending.remove(&segment.tuple) else {
            return;
        };

        let now = segment.timestamp;
        let syn_rtt = ack_time.saturating_sub(entry.syn_time) as i64;
        let ack_rtt = now.saturating_sub(ack_time) as i64;

        self.aggregates
            .entry(segment.tuple)
            .and_modify(|agg| {
                agg.count += 1;
                agg.syn_rtt_sum += syn_rtt;
                agg.ack_rtt_sum += ack_rtt;
                agg.end_time = now;
            })
            .or_insert(HandshakeAggregate {
                count: 1,
                syn_rtt_sum: syn_rtt,
                ack_rtt_sum: ack_rtt,
                start_time: now,
                end_time: now,
                packet_type: segment.packet_type,
            });
    }

    fn record(&self, tuple: &TcpTuple, agg: &HandshakeAggregate) -> TelemetryRecord {
        let (syn_rtt, ack_rtt) = match self.table.direction(tuple, agg.packet_type) {
            // the final ACK left the local side: we are the client
            Direction::Sent => (agg.syn_rtt_sum, INVALID_RTT),
            Direction::Received => (INVALID_RTT, agg.ack_rtt_sum),
        };

        TelemetryRecord::new(RECORD_NAME, self.clock.latest())
            .with("sip", AttributeValue::U32(tuple.saddr))
            .with("dip", AttributeValue::U32(tuple.daddr))
            .with("sport", AttributeValue::U16(tuple.sport))
            .with("dport", AttributeValue::U16(tuple.dport))
            .with("data_counts", AttributeValue::U64(agg.count))
            .with("synrtt_delta", AttributeValue::I64(syn_rtt))
            .with("ackrtt_delta", AttributeValue::I64(ack_rtt))
            .with("start_time", AttributeValue::U64(agg.start_time))
            .with("end_time", AttributeValue::U64(agg.end_time))
    }

    fn evict_stale_pending(&mut self) {
        let now = self.clock.latest();
        let horizon = self.clock.interval_ns();
        let before = self.pending.len();
        self.pending
            .retain(|_, entry| now.saturating_sub(entry.syn_time) <= horizon);
        let evicted = before - self.pending.len();
        if evicted > 0 {
            self.counters.unmatched.inc_by(evicted as u64);
            debug!("Evicted {} incomplete handshakes", evicted);
        }
    }
}

impl Analyzer for HandshakeAnalyzer {
    fn name(&self) -> &'static str {
        "handshake"
    }

    fn ingest(&mut self, segment: &TcpRawData) {
        if !self.table.is_container(segment.tuple.ifindex) {
            return;
        }
        self.clock.observe(segment.timestamp);

        let syn = segment.has_flag(tcp_flags::SYN);
        let ack = segment.has_flag(tcp_flags::ACK);
        match (syn, ack) {
            (true, false) => self.on_syn(segment),
            (true, true) => self.on_syn_ack(segment),
            (false, true) => self.on_ack(segment),
            (false, false) => return,
        }
        self.counters.ingested.inc();
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
                "Output full, {} handshake aggregates left for next flush",
                self.aggregates.len()
            );
        }
        self.evict_stale_pending();

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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::tests::{client_tuple, seg};
    use crate::interfaces::tests::{ip, test_table, ETH, VETH};
    use crate::metrics::AnalyzerMetrics;
    use podlens_common::tcp_flags::{ACK, SYN};

    const SECOND: u64 = 1_000_000_000;

    fn analyzer() -> HandshakeAnalyzer {
        let metrics = AnalyzerMetrics::new().expect("metrics");
        HandshakeAnalyzer::new(Arc::new(test_table()), 5 * SECOND, metrics.counters("handshake"))
    }

    fn handshake(analyzer: &mut HandshakeAnalyzer, client: TcpTuple, t0: u64) {
        analyzer.ingest(&seg(client, SYN, 100, 0, t0));
        analyzer.ingest(&seg(client.reverse(), SYN | ACK, 900, 101, t0 + 500));
        analyzer.ingest(&seg(client, ACK, 101, 901, t0 + 600));
    }

    fn flush_all(analyzer: &mut HandshakeAnalyzer) -> Vec<TelemetryRecord> {
        let mut out = TelemetryBuffer::with_capacity(64);
        analyzer.flush(&mut out);
        out.drain().collect()
    }

    #[test]
    fn test_client_handshake_invalidates_ack_leg() {
        let mut analyzer = analyzer();
        handshake(&mut analyzer, client_tuple(), 1_000);
        assert_eq!(analyzer.in_flight(), 0);

        let records = flush_all(&mut analyzer);
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.name, RECORD_NAME);
        assert_eq!(r.get("data_counts"), Some(&AttributeValue::U64(1)));
        assert_eq!(r.get("synrtt_delta"), Some(&AttributeValue::I64(500)));
        assert_eq!(r.get("ackrtt_delta"), Some(&AttributeValue::I64(-1)));
        assert_eq!(r.get("start_time"), Some(&AttributeValue::U64(1_600)));
        assert_eq!(r.get("sport"), Some(&AttributeValue::U16(40000)));
    }

    #[test]
    fn test_server_handshake_invalidates_syn_leg() {
        let mut analyzer = analyzer();
        // remote client connecting in to the local pod
        let client = client_tuple().reverse();
        handshake(&mut analyzer, client, 2_000);

        let records = flush_all(&mut analyzer);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get("synrtt_delta"), Some(&AttributeValue::I64(-1)));
        assert_eq!(records[0].get("ackrtt_delta"), Some(&AttributeValue::I64(100)));
    }

    #[test]
    fn test_repeated_handshakes_accumulate() {
        let mut analyzer = analyzer();
        handshake(&mut analyzer, client_tuple(), 1_000);
        handshake(&mut analyzer, client_tuple(), 10_000);

        let records = flush_all(&mut analyzer);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get("data_counts"), Some(&AttributeValue::U64(2)));
        assert_eq!(records[0].get("synrtt_delta"), Some(&AttributeValue::I64(1_000)));
        assert_eq!(records[0].get("start_time"), Some(&AttributeValue::U64(1_600)));
        assert_eq!(records[0].get("end_time"), Some(&AttributeValue::U64(10_600)));
    }

    #[test]
    fn test_syn_ack_without_syn_is_dropped() {
        let mut analyzer = analyzer();
        let client = client_tuple();
        analyzer.ingest(&seg(client.reverse(), SYN | ACK, 900, 101, 1_000));
        analyzer.ingest(&seg(client, ACK, 101, 901, 1_100));

        assert_eq!(analyzer.pending(), 0);
        assert_eq!(analyzer.in_flight(), 0);
        assert_eq!(analyzer.counters.unmatched.get(), 1);
        assert!(flush_all(&mut analyzer).is_empty());
    }

    #[test]
    fn test_non_container_interface_ignored() {
        let mut analyzer = analyzer();
        let on_eth = TcpTuple {
            ifindex: ETH,
            ..client_tuple()
        };
        handshake(&mut analyzer, on_eth, 1_000);

        assert_eq!(analyzer.pending(), 0);
        assert_eq!(analyzer.counters.ingested.get(), 0);
    }

    #[test]
    fn test_flush_twice_is_empty_second_time() {
        let mut analyzer = analyzer();
        handshake(&mut analyzer, client_tuple(), 1_000);

        assert_eq!(flush_all(&mut analyzer).len(), 1);
        assert!(flush_all(&mut analyzer).is_empty());
        assert_eq!(analyzer.pending(), 0);
    }

    #[test]
    fn test_truncated_flush_keeps_remaining_entries() {
        let mut analyzer = analyzer();
        for port in 0..5u16 {
            let client = TcpTuple {
                sport: 40000 + port,
                ..client_tuple()
            };
            handshake(&mut analyzer, client, 1_000);
        }
        assert_eq!(analyzer.pending(), 5);

        let mut out = TelemetryBuffer::with_capacity(2);
        assert_eq!(analyzer.flush(&mut out), 2);
        assert_eq!(out.len(), 2);
        assert_eq!(analyzer.pending(), 3);

        let mut next = TelemetryBuffer::with_capacity(8);
        assert_eq!(analyzer.flush(&mut next), 3);
        assert_eq!(analyzer.pending(), 0);
    }

    #[test]
    fn test_poll_waits_for_event_time_window() {
        let mut analyzer = analyzer();
        handshake(&mut analyzer, client_tuple(), SECOND);

        let mut out = TelemetryBuffer::with_capacity(8);
        assert_eq!(analyzer.poll(&mut out), 0);

        // any later container event advances the clock past the window
        let other = TcpTuple {
            saddr: ip(10, 244, 1, 5),
            daddr: ip(10, 96, 0, 11),
            sport: 41000,
            dport: 443,
            ifindex: VETH,
        };
        analyzer.ingest(&seg(other, SYN, 1, 0, 7 * SECOND));
        assert_eq!(analyzer.poll(&mut out), 1);
        assert_eq!(out.records()[0].timestamp, 7 * SECOND);
        assert_eq!(analyzer.poll(&mut out), 0);
    }

    #[test]
    fn test_stale_pending_evicted_on_flush() {
        let mut analyzer = analyzer();
        analyzer.ingest(&seg(client_tuple(), SYN, 100, 0, SECOND));
        let other = TcpTuple {
            sport: 41000,
            ..client_tuple()
        };
        analyzer.ingest(&seg(other, SYN, 1, 0, 20 * SECOND));
        assert_eq!(analyzer.in_flight(), 2);

        flush_all(&mut analyzer);
        assert_eq!(analyzer.in_flight(), 1);
    }
}
