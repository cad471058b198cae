//! Analyzer loss and throughput counters
//!
//! One registry per pipeline, labelled by analyzer name. Unmatched
//! correlations and truncated flushes are expected loss; they are counted
//! here instead of being surfaced as errors.

use crate::error::Result;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct AnalyzerMetrics {
    registry: Registry,
    ingested: IntCounterVec,
    unmatched: IntCounterVec,
    emitted: IntCounterVec,
    truncated: IntCounterVec,
}

/// Counter handles bound to one analyzer label
#[derive(Clone)]
pub struct Counters {
    pub ingested: IntCounter,
    pub unmatched: IntCounter,
    pub emitted: IntCounter,
    pub truncated: IntCounter,
}

fn counter_vec(name: &str, help: &str) -> Result<IntCounterVec> {
    Ok(IntCounterVec::new(Opts::new(name, help), &["analyzer"])?)
}

impl AnalyzerMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let ingested = counter_vec(
            "podlens_events_ingested_total",
            "Events admitted by an analyzer",
        )?;
        let unmatched = counter_vec(
            "podlens_events_unmatched_total",
            "Events dropped for lack of a matching counterpart",
        )?;
        let emitted = counter_vec(
            "podlens_records_emitted_total",
            "Telemetry records written to the output buffer",
        )?;
        let truncated = counter_vec(
            "podlens_records_truncated_total",
            "Pending records left for the next cycle because the output buffer was full",
        )?;

        registry.register(Box::new(ingested.clone()))?;
        registry.register(Box::new(unmatched.clone()))?;
        registry.register(Box::new(emitted.clone()))?;
        registry.register(Box::new(truncated.clone()))?;

        Ok(Self {
            registry,
            ingested,
            unmatched,
            emitted,
            truncated,
        })
    }

    pub fn counters(&self, analyzer: &str) -> Counters {
        Counters {
            ingested: self.ingested.with_label_values(&[analyzer]),
            unmatched: self.unmatched.with_label_values(&[analyzer]),
            emitted: self.emitted.with_label_values(&[analyzer]),
            truncated: self.truncated.with_label_values(&[analyzer]),
        }
    }

    /// Prometheus text exposition of every counter
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
