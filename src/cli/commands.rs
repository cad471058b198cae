use crate::capture::{reported_record, segment_params, CaptureEvent};
use crate::cli::Commands;
use crate::Result;
use podlens_agent::ingest::RingDump;
use podlens_agent::interfaces::InterfaceKind;
use podlens_agent::window::FlushClock;
use podlens_agent::{
    AgentConfig, InterfaceTable, SlowSyscallTracker, TcpPipeline, TelemetryBuffer,
};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{debug, info, warn};

pub async fn handle_command(command: Commands) -> Result<()> {
    match command {
        Commands::Replay {
            config,
            input,
            stats,
        } => handle_replay(&config, input, stats).await,
        Commands::ReplayRing {
            config,
            input,
            stats,
        } => handle_replay_ring(&config, &input, stats).await,
        Commands::CheckConfig { config } => handle_check_config(&config),
    }
}

/// Totals of one replay
#[derive(Debug, Clone, Default)]
pub struct ReplaySummary {
    pub events: u64,
    pub records: u64,
    /// Prometheus text exposition of the analyzer counters
    pub metrics: String,
}

/// Drives the analyzers from decoded capture events and writes every
/// emitted record to `writer` as one JSON line
pub struct Replayer<W: Write> {
    pipeline: TcpPipeline,
    syscalls: SlowSyscallTracker,
    sweep_clock: FlushClock,
    out: TelemetryBuffer,
    writer: W,
    events: u64,
    records: u64,
}

impl<W: Write> Replayer<W> {
    pub fn new(config: &AgentConfig, writer: W) -> Result<Self> {
        let table = Arc::new(InterfaceTable::build(&config.interfaces)?);
        Ok(Self {
            pipeline: TcpPipeline::new(config, table)?,
            syscalls: SlowSyscallTracker::from_config(config),
            sweep_clock: FlushClock::new(config.flush_interval_ns()),
            out: TelemetryBuffer::with_capacity(config.output_capacity),
            writer,
            events: 0,
            records: 0,
        })
    }

    pub fn apply(&mut self, event: CaptureEvent) -> Result<()> {
        self.events += 1;
        if let Some(ts) = event.timestamp() {
            self.sweep_clock.observe(ts);
        }

        match event {
            CaptureEvent::Segment {
                timestamp,
                flow,
                flags,
                seq,
                ack_seq,
                direction,
            } => {
                let params = segment_params(timestamp, &flow, &flags, seq, ack_seq, direction);
                self.pipeline.ingest_event(&params)?;
            }
            CaptureEvent::Reported {
                timestamp,
                flow,
                packet_counts,
                seq,
                ack_seq,
                direction,
            } => {
                let info = reported_record(timestamp, &flow, packet_counts, seq, ack_seq, direction);
                self.pipeline.ingest_reported(&info);
            }
            CaptureEvent::FocusPod {
                src,
                dst,
                begin,
                end,
                op,
            } => {
                self.pipeline
                    .update_focus_pod(u32::from(src), u32::from(dst), begin, end, op.into());
            }
            CaptureEvent::SyscallEnter {
                tid,
                pid,
                syscall_type,
                timestamp,
            } => self.syscalls.on_enter(tid, pid, syscall_type, timestamp),
            CaptureEvent::SyscallExit { tid, timestamp } => {
                if let Some(record) = self.syscalls.on_exit(tid, timestamp) {
                    // the entry is already erased, so make room rather than drop
                    if self.out.is_full() {
                        self.emit()?;
                    }
                    if !self.out.push(record) {
                        warn!("Output full, dropping slow syscall record for tid {}", tid);
                    }
                }
            }
        }

        self.pipeline.poll(&mut self.out);
        if self.sweep_clock.due() {
            self.syscalls
                .sweep_into(self.sweep_clock.latest(), &mut self.out);
            self.sweep_clock.reset();
        }
        self.emit()
    }

    /// Consume every slot of a ring dump, then poll once
    pub fn apply_ring(&mut self, dump: &RingDump) -> Result<()> {
        let view = dump.view()?;
        let consumed = self.pipeline.ingest_ring(&view);
        self.events += consumed as u64;
        self.pipeline.poll(&mut self.out);
        self.emit()
    }

    /// Flush all remaining state and sweep once at the last event time
    pub fn finish(mut self) -> Result<ReplaySummary> {
        loop {
            let written = self.pipeline.flush_all(&mut self.out);
            self.emit()?;
            if written == 0 || self.pipeline.pending() == 0 {
                break;
            }
        }

        let now = self.sweep_clock.latest();
        while self.syscalls.sweep_into(now, &mut self.out) > 0 {
            self.emit()?;
        }
        if !self.syscalls.is_empty() {
            debug!("{} syscalls still in flight at end of stream", self.syscalls.len());
        }
        self.writer.flush()?;

        Ok(ReplaySummary {
            events: self.events,
            records: self.records,
            metrics: self.pipeline.metrics().render()?,
        })
    }

    fn emit(&mut self) -> Result<()> {
        for record in self.out.drain() {
            serde_json::to_writer(&mut self.writer, &record)?;
            self.writer.write_all(b"\n")?;
            self.records += 1;
        }
        Ok(())
    }
}

/// Replay a JSON-lines stream until EOF or Ctrl+C
pub async fn replay_stream<R, W>(config: &AgentConfig, reader: R, writer: W) -> Result<ReplaySummary>
where
    R: AsyncBufRead + Unpin,
    W: Write,
{
    let mut replayer = Replayer::new(config, writer)?;
    let mut lines = reader.lines();
    let mut line_number = 0;

    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Shutdown signal received, flushing");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                line_number += 1;
                if let Some(event) = CaptureEvent::parse_line(&line, line_number)? {
                    replayer.apply(event)?;
                }
            }
        }
    }

    replayer.finish()
}

fn load_config(path: &Path) -> Result<AgentConfig> {
    let config = AgentConfig::from_file(path)?;
    info!("Loaded configuration from {}", path.display());
    Ok(config)
}

fn report(summary: &ReplaySummary, stats: bool) {
    info!(
        "Replay finished: {} events in, {} records out",
        summary.events, summary.records
    );
    if stats {
        eprint!("{}", summary.metrics);
    }
}

async fn handle_replay(config: &Path, input: Option<PathBuf>, stats: bool) -> Result<()> {
    let config = load_config(config)?;
    let writer = BufWriter::new(io::stdout());

    let summary = match input {
        Some(path) => {
            info!("Replaying {}", path.display());
            let file = tokio::fs::File::open(&path).await?;
            replay_stream(&config, BufReader::new(file), writer).await?
        }
        None => {
            info!("Replaying from stdin");
            replay_stream(&config, BufReader::new(tokio::io::stdin()), writer).await?
        }
    };

    report(&summary, stats);
    Ok(())
}

async fn handle_replay_ring(config: &Path, input: &Path, stats: bool) -> Result<()> {
    let config = load_config(config)?;
    let bytes = tokio::fs::read(input).await?;
    let dump = RingDump::parse(&bytes)?;
    info!(
        "Ring dump {}: {} slots, head={}, tail={}",
        input.display(),
        dump.slots.len(),
        dump.head,
        dump.tail
    );

    let mut replayer = Replayer::new(&config, BufWriter::new(io::stdout()))?;
    replayer.apply_ring(&dump)?;
    let summary = replayer.finish()?;

    report(&summary, stats);
    Ok(())
}

fn handle_check_config(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    let table = InterfaceTable::build(&config.interfaces)?;

    println!("Configuration OK: {}", path.display());
    println!(
        "  flush interval: {} ms, output capacity: {}",
        config.flush_interval_ms, config.output_capacity
    );
    println!(
        "  syscall threshold: {} ms, timeout: {} ms",
        config.syscall.latency_threshold_ms, config.syscall.timeout_ms
    );
    println!("  pod index retention: {} ms", config.pod_track.clear_cycle_ms);
    for device in &config.interfaces.devices {
        let kind = InterfaceKind::from_name(&device.name)
            .map(|k| format!("{:?}", k))
            .unwrap_or_else(|| "unclassified".to_string());
        println!(
            "  {:<12} ifindex {:<4} {:<14} {} addresses",
            device.name,
            device.ifindex,
            kind,
            device.addrs.len()
        );
    }
    if let Some(cni) = table.cni_subnet() {
        println!("  cni subnet: {} on ifindex {}", cni.network, cni.ifindex);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use podlens_agent::TelemetryRecord;

    const MS: u64 = 1_000_000;

    fn config() -> AgentConfig {
        AgentConfig::from_yaml_str(
            "
output_capacity: 1
syscall:
  latency_threshold_ms: 100
  timeout_ms: 1000
",
        )
        .expect("config")
    }

    #[test]
    fn test_slow_syscall_kept_when_output_full() {
        let mut output = Vec::new();
        let mut replayer = Replayer::new(&config(), &mut output).expect("replayer");
        replayer.apply(CaptureEvent::SyscallEnter {
            tid: 42,
            pid: 7,
            syscall_type: 0,
            timestamp: MS,
        })
        .expect("enter");
        assert!(replayer.out.push(TelemetryRecord::new("pending", MS)));
        assert!(replayer.out.is_full());

        replayer
            .apply(CaptureEvent::SyscallExit {
                tid: 42,
                timestamp: 200 * MS,
            })
            .expect("exit");
        let summary = replayer.finish().expect("finish");
        assert_eq!(summary.records, 2);

        let text = String::from_utf8(output).expect("utf8");
        let names: Vec<&str> = text
            .lines()
            .map(|l| if l.contains("slow_syscall") { "slow_syscall" } else { "other" })
            .collect();
        assert_eq!(names, vec!["other", "slow_syscall"]);
    }
}
