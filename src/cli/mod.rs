pub mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "podlens")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "TCP handshake, ACK delay, packet count, pod path and slow syscall telemetry", long_about = None)]
pub struct Cli {
    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Replay a JSON-lines capture stream through the analyzers")]
    Replay {
        #[arg(short, long, help = "Analyzer configuration (YAML)")]
        config: PathBuf,

        #[arg(short, long, help = "Capture stream to read; stdin when omitted")]
        input: Option<PathBuf>,

        #[arg(long, help = "Print analyzer counters to stderr on exit")]
        stats: bool,
    },
    #[command(about = "Replay a raw ring buffer dump through the TCP analyzers")]
    ReplayRing {
        #[arg(short, long, help = "Analyzer configuration (YAML)")]
        config: PathBuf,

        #[arg(short, long, help = "Ring dump: head and tail as u64 LE, then raw slots")]
        input: PathBuf,

        #[arg(long, help = "Print analyzer counters to stderr on exit")]
        stats: bool,
    },
    #[command(about = "Validate a configuration file and show the interface table")]
    CheckConfig {
        #[arg(short, long, help = "Analyzer configuration (YAML)")]
        config: PathBuf,
    },
}
