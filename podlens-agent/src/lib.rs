//! Stream aggregation core for podlens
//!
//! Responsibilities:
//! - Classify node interfaces for admission and direction decisions
//! - Match TCP handshakes and measure their RTT
//! - Measure per-flow ACK delay
//! - Count packets per flow
//! - Track packets between focus pod pairs
//! - Flag slow and timed-out syscalls per thread
//!
//! Every analyzer drains into a caller-owned, bounded [`TelemetryBuffer`].

pub mod ack_delay;
pub mod analyzer;
pub mod config;
pub mod error;
pub mod handshake;
pub mod ingest;
pub mod interfaces;
pub mod metrics;
pub mod packet_count;
pub mod pipeline;
pub mod pod_track;
pub mod slow_syscall;
pub mod telemetry;
pub mod window;

pub use analyzer::Analyzer;
pub use config::AgentConfig;
pub use error::{AgentError, Result};
pub use interfaces::{Direction, InterfaceSource, InterfaceTable};
pub use pipeline::TcpPipeline;
pub use pod_track::FocusOp;
pub use slow_syscall::SlowSyscallTracker;
pub use telemetry::{TelemetryBuffer, TelemetryRecord};
