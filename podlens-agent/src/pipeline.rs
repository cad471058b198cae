//! Fan-out of one segment stream to every TCP analyzer
//!
//! The capture loop feeds segments in and polls on its own cadence; each
//! analyzer decides from event time whether its window has closed. All output
//! of one poll shares a single bounded buffer, so once it fills the remaining
//! analyzers keep their state for the next poll.

use crate::ack_delay::AckDelayAnalyzer;
use crate::analyzer::Analyzer;
use crate::config::AgentConfig;
use crate::error::Result;
use crate::handshake::HandshakeAnalyzer;
use crate::ingest::{decode_data_info, decode_segment, EventParams, RingView};
use crate::interfaces::InterfaceTable;
use crate::metrics::AnalyzerMetrics;
use crate::packet_count::PacketCountAnalyzer;
use crate::pod_track::{FocusOp, PodTracker};
use crate::telemetry::TelemetryBuffer;
use log::{debug, info, warn};
use podlens_common::{TcpDataInfo, TcpRawData};
use std::sync::Arc;

pub struct TcpPipeline {
    handshake: HandshakeAnalyzer,
    ack_delay: AckDelayAnalyzer,
    packet_count: PacketCountAnalyzer,
    pod_track: PodTracker,
    metrics: AnalyzerMetrics,
    events_processed: u64,
    latest_event_ns: u64,
}

impl TcpPipeline {
    pub fn new(config: &AgentConfig, table: Arc<InterfaceTable>) -> Result<Self> {
        let metrics = AnalyzerMetrics::new()?;
        let interval = config.flush_interval_ns();

        let pipeline = Self {
            handshake: HandshakeAnalyzer::new(
                Arc::clone(&table),
                interval,
                metrics.counters("handshake"),
            ),
            ack_delay: AckDelayAnalyzer::new(
                Arc::clone(&table),
                interval,
                metrics.counters("ack_delay"),
            ),
            packet_count: PacketCountAnalyzer::new(
                Arc::clone(&table),
                interval,
                metrics.counters("packet_count"),
            ),
            pod_track: PodTracker::new(
                table,
                config.clear_cycle_ns(),
                metrics.counters("pod_track"),
            ),
            metrics,
            events_processed: 0,
            latest_event_ns: 0,
        };

        info!(
            "TCP pipeline ready: flush every {} ms of event time, pod index retention {} ms",
            config.flush_interval_ms, config.pod_track.clear_cycle_ms
        );
        Ok(pipeline)
    }

    /// Feed one segment to every analyzer
    pub fn ingest(&mut self, segment: &TcpRawData) {
        self.events_processed += 1;
        self.latest_event_ns = segment.timestamp;

        self.handshake.ingest(segment);
        self.ack_delay.ingest(segment);
        self.packet_count.ingest(segment);
        self.pod_track.ingest(segment);
    }

    /// Consume every slot between the ring's cursors
    pub fn ingest_ring(&mut self, ring: &RingView<'_, TcpRawData>) -> usize {
        let mut consumed = 0;
        for segment in ring.iter() {
            self.ingest(segment);
            consumed += 1;
        }
        debug!("Consumed {} ring slots", consumed);
        consumed
    }

    /// Decode a single captured event and feed it like a ring slot
    pub fn ingest_event(&mut self, params: &impl EventParams) -> Result<()> {
        let segment = decode_segment(params).map_err(|e| {
            warn!("Dropping malformed segment event: {}", e);
            e
        })?;
        self.ingest(&segment);
        Ok(())
    }

    /// Feed a pre-aggregated per-syscall-return record
    pub fn ingest_reported(&mut self, info: &TcpDataInfo) {
        self.events_processed += 1;
        self.latest_event_ns = info.timestamp;
        self.packet_count.ingest_reported(info);
    }

    /// Feed a pre-aggregated record still in its raw capture layout
    pub fn ingest_reported_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let info = decode_data_info(bytes)?;
        self.ingest_reported(&info);
        Ok(())
    }

    pub fn update_focus_pod(&mut self, src: u32, dst: u32, begin: u64, end: u64, op: FocusOp) {
        self.pod_track.update_focus_pod(src, dst, begin, end, op);
    }

    /// Flush every analyzer whose window has closed, then run the pod
    /// tracker's query and eviction
    pub fn poll(&mut self, out: &mut TelemetryBuffer) -> usize {
        let mut written = 0;
        written += self.handshake.poll(out);
        written += self.ack_delay.poll(out);
        written += self.packet_count.poll(out);
        written += self.pod_track.poll(self.latest_event_ns, out);
        written
    }

    /// Flush everything regardless of window state, e.g. at end of stream
    pub fn flush_all(&mut self, out: &mut TelemetryBuffer) -> usize {
        let mut written = 0;
        for analyzer in self.analyzers_mut() {
            written += analyzer.flush(out);
            analyzer.clock_mut().reset();
        }
        written += self.pod_track.poll(self.latest_event_ns, out);
        written
    }

    fn analyzers_mut(&mut self) -> [&mut dyn Analyzer; 3] {
        [
            &mut self.handshake,
            &mut self.ack_delay,
            &mut self.packet_count,
        ]
    }

    /// Aggregate entries waiting across the windowed analyzers
    pub fn pending(&self) -> usize {
        self.handshake.pending() + self.ack_delay.pending() + self.packet_count.pending()
    }

    pub fn events_processed(&self) -> u64 {
        self.events_processed
    }

    pub fn latest_event_ns(&self) -> u64 {
        self.latest_event_ns
    }

    pub fn pod_tracker(&self) -> &PodTracker {
        &self.pod_track
    }

    pub fn metrics(&self) -> &AnalyzerMetrics {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::tests::{client_tuple, seg};
    use crate::error::AgentError;
    use crate::ingest::{ParamList, DATA_INFO_SIZE};
    use crate::interfaces::tests::{ip, test_table};
    use crate::telemetry::AttributeValue;
    use podlens_common::tcp_flags::{ACK, SYN};
    use podlens_common::TcpTuple;

    const SECOND: u64 = 1_000_000_000;

    fn pipeline() -> TcpPipeline {
        let config = AgentConfig::from_yaml_str(
            "
flush_interval_ms: 5000
syscall:
  latency_threshold_ms: 100
  timeout_ms: 1000
",
        )
        .expect("config");
        TcpPipeline::new(&config, Arc::new(test_table())).expect("pipeline")
    }

    fn handshake_and_reply(pipeline: &mut TcpPipeline, t0: u64) {
        let client = client_tuple();
        pipeline.ingest(&seg(client, SYN, 100, 0, t0));
        pipeline.ingest(&seg(client.reverse(), SYN | ACK, 900, 101, t0 + 10));
        pipeline.ingest(&seg(client, ACK, 101, 901, t0 + 20));
        pipeline.ingest(&seg(client.reverse(), ACK, 901, 101, t0 + 30));
    }

    #[test]
    fn test_fans_out_to_every_analyzer() {
        let mut pipeline = pipeline();
        handshake_and_reply(&mut pipeline, SECOND);
        assert_eq!(pipeline.events_processed(), 4);

        let mut out = TelemetryBuffer::with_capacity(32);
        assert_eq!(pipeline.poll(&mut out), 0);

        let written = pipeline.flush_all(&mut out);
        let names: Vec<&str> = out.records().iter().map(|r| r.name).collect();
        assert_eq!(written, out.len());
        assert!(names.contains(&"tcp_handshake_rtt"));
        assert!(names.contains(&"tcp_ack_delay"));
        assert!(names.contains(&"tcp_packet_counts"));
        assert_eq!(pipeline.pending(), 0);

        let text = pipeline.metrics().render().expect("render");
        assert!(text.contains("podlens_events_ingested_total{analyzer=\"packet_count\"} 4"));
    }

    #[test]
    fn test_poll_flushes_on_event_time() {
        let mut pipeline = pipeline();
        handshake_and_reply(&mut pipeline, SECOND);

        let later = TcpTuple {
            sport: 41000,
            ..client_tuple()
        };
        pipeline.ingest(&seg(later, SYN, 1, 0, 7 * SECOND));

        let mut out = TelemetryBuffer::with_capacity(32);
        assert!(pipeline.poll(&mut out) >= 3);
        assert!(out.records().iter().all(|r| r.timestamp == 7 * SECOND));
    }

    #[test]
    fn test_shared_buffer_bound_defers_later_analyzers() {
        let mut pipeline = pipeline();
        handshake_and_reply(&mut pipeline, SECOND);

        let mut out = TelemetryBuffer::with_capacity(1);
        assert_eq!(pipeline.flush_all(&mut out), 1);
        assert!(pipeline.pending() > 0);

        let mut next = TelemetryBuffer::with_capacity(32);
        pipeline.flush_all(&mut next);
        assert_eq!(pipeline.pending(), 0);
    }

    #[test]
    fn test_focus_pod_routed_to_tracker() {
        let mut pipeline = pipeline();
        let remote = ip(192, 168, 5, 20);
        pipeline.update_focus_pod(ip(10, 244, 1, 5), remote, 0, 10 * SECOND, FocusOp::Update);
        assert!(pipeline.pod_tracker().is_focus_ip(remote));

        let tuple = TcpTuple {
            daddr: remote,
            ..client_tuple()
        };
        pipeline.ingest(&seg(tuple, ACK, 5, 0, SECOND));

        let mut out = TelemetryBuffer::with_capacity(8);
        assert_eq!(pipeline.poll(&mut out), 1);
        assert_eq!(out.records()[0].name, "pod_net_track");
    }

    #[test]
    fn test_ring_front_end() {
        let mut pipeline = pipeline();
        let slots: Vec<TcpRawData> = (0..4)
            .map(|i| seg(client_tuple(), ACK, i, 0, SECOND + i as u64))
            .collect();
        let ring = RingView::new(&slots, 3, 2).expect("ring");

        assert_eq!(pipeline.ingest_ring(&ring), 3);
        assert_eq!(pipeline.latest_event_ns(), SECOND + 1);
    }

    fn segment_params(tuple: TcpTuple, flags: u8, seq: u32, ts: u64) -> ParamList {
        ParamList::new()
            .with("saddr", tuple.saddr.to_be_bytes().to_vec())
            .with("daddr", tuple.daddr.to_be_bytes().to_vec())
            .with("sport", tuple.sport.to_be_bytes().to_vec())
            .with("dport", tuple.dport.to_be_bytes().to_vec())
            .with("ifindex", tuple.ifindex.to_le_bytes().to_vec())
            .with("flags", vec![flags])
            .with("seq", seq.to_le_bytes().to_vec())
            .with("ack_seq", 0u32.to_le_bytes().to_vec())
            .with("timestamp", ts.to_le_bytes().to_vec())
    }

    #[test]
    fn test_single_event_front_end() {
        let mut pipeline = pipeline();
        for seq in 0..2 {
            pipeline
                .ingest_event(&segment_params(client_tuple(), ACK, seq, SECOND + seq as u64))
                .expect("event");
        }
        assert_eq!(pipeline.events_processed(), 2);
        assert_eq!(pipeline.latest_event_ns(), SECOND + 1);

        let mut out = TelemetryBuffer::with_capacity(8);
        pipeline.flush_all(&mut out);
        let counts = out
            .records()
            .iter()
            .find(|r| r.name == "tcp_packet_counts")
            .expect("packet counts");
        assert_eq!(counts.get("packet_counts"), Some(&AttributeValue::U64(2)));
    }

    #[test]
    fn test_single_event_missing_param_is_rejected() {
        let mut pipeline = pipeline();
        let params = ParamList::new().with("saddr", vec![10, 244, 1, 5]);
        assert!(matches!(
            pipeline.ingest_event(&params),
            Err(AgentError::MissingParam("daddr"))
        ));
        assert_eq!(pipeline.events_processed(), 0);
    }

    #[test]
    fn test_reported_bytes_front_end() {
        let mut pipeline = pipeline();
        let info = TcpDataInfo {
            timestamp: SECOND,
            tuple: client_tuple(),
            seq: 1,
            ack_seq: 0,
            packet_counts: 5,
            packet_type: 0,
            _padding: [0; 3],
        };
        let bytes = unsafe {
            std::slice::from_raw_parts(&info as *const TcpDataInfo as *const u8, DATA_INFO_SIZE)
        };
        pipeline.ingest_reported_bytes(bytes).expect("reported");
        assert!(matches!(
            pipeline.ingest_reported_bytes(&bytes[..DATA_INFO_SIZE - 1]),
            Err(AgentError::Decode { .. })
        ));
        assert_eq!(pipeline.events_processed(), 1);

        let mut out = TelemetryBuffer::with_capacity(8);
        pipeline.flush_all(&mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out.records()[0].get("packet_counts"), Some(&AttributeValue::U64(5)));
    }
}
