//! Analyzer configuration
//!
//! Loaded from YAML. Only the flush cadence, the output capacity and the
//! path-tracker retention carry defaults; syscall thresholds must be given.

use crate::error::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

const NANOS_PER_MILLI: u64 = 1_000_000;

fn default_flush_interval_ms() -> u64 {
    5_000
}

fn default_output_capacity() -> usize {
    1024
}

fn default_clear_cycle_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Aggregation window of the TCP analyzers, in event time
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Maximum number of records emitted per poll
    #[serde(default = "default_output_capacity")]
    pub output_capacity: usize,

    #[serde(default)]
    pub pod_track: PodTrackConfig,

    pub syscall: SyscallConfig,

    #[serde(default)]
    pub interfaces: InterfaceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodTrackConfig {
    /// Index entries older than this are pruned on every poll
    #[serde(default = "default_clear_cycle_ms")]
    pub clear_cycle_ms: u64,
}

impl Default for PodTrackConfig {
    fn default() -> Self {
        Self {
            clear_cycle_ms: default_clear_cycle_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyscallConfig {
    /// A completed syscall at least this slow is reported
    pub latency_threshold_ms: u64,
    /// An in-flight syscall at least this old is evicted and reported
    pub timeout_ms: u64,
}

/// Static interface declaration, used in place of live enumeration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InterfaceConfig {
    #[serde(default)]
    pub devices: Vec<InterfaceDecl>,
    /// Overlay network in CIDR notation, e.g. `10.244.0.0/16`
    #[serde(default)]
    pub cni_subnet: Option<String>,
    #[serde(default)]
    pub cni_ifindex: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceDecl {
    pub name: String,
    pub ifindex: u32,
    #[serde(default)]
    pub addrs: Vec<Ipv4Addr>,
}

impl AgentConfig {
    /// Load and validate a YAML configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        let config: AgentConfig = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.flush_interval_ms == 0 {
            return Err(AgentError::ConfigError(
                "flush_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.output_capacity == 0 {
            return Err(AgentError::ConfigError(
                "output_capacity must be greater than zero".to_string(),
            ));
        }
        if self.pod_track.clear_cycle_ms == 0 {
            return Err(AgentError::ConfigError(
                "pod_track.clear_cycle_ms must be greater than zero".to_string(),
            ));
        }
        if self.syscall.timeout_ms < self.syscall.latency_threshold_ms {
            return Err(AgentError::ConfigError(format!(
                "syscall.timeout_ms ({}) must not be below syscall.latency_threshold_ms ({})",
                self.syscall.timeout_ms, self.syscall.latency_threshold_ms
            )));
        }
        Ok(())
    }

    pub fn flush_interval_ns(&self) -> u64 {
        self.flush_interval_ms.saturating_mul(NANOS_PER_MILLI)
    }

    pub fn clear_cycle_ns(&self) -> u64 {
        self.pod_track.clear_cycle_ms.saturating_mul(NANOS_PER_MILLI)
    }

    pub fn syscall_latency_threshold_ns(&self) -> u64 {
        self.syscall
            .latency_threshold_ms
            .saturating_mul(NANOS_PER_MILLI)
    }

    pub fn syscall_timeout_ns(&self) -> u64 {
        self.syscall.timeout_ms.saturating_mul(NANOS_PER_MILLI)
    }
}
