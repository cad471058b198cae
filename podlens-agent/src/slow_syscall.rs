//! Per-thread syscall latency and timeout tracking
//!
//! The capture path records syscall enter/exit while a separate context
//! sweeps for threads stuck past the hard timeout, so the map sits behind a
//! lock that every operation takes. The lock is never handed out.

use crate::config::AgentConfig;
use crate::telemetry::{AttributeValue, TelemetryBuffer, TelemetryRecord};
use ahash::AHashMap;
use log::debug;
use parking_lot::Mutex;

pub const SLOW_RECORD_NAME: &str = "slow_syscall";
pub const TIMEOUT_RECORD_NAME: &str = "syscall_timeout";

/// An in-flight syscall
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyscallEntry {
    /// Enter time in nanoseconds
    pub timestamp: u64,
    pub syscall_type: u16,
    pub pid: u32,
}

/// A syscall evicted by the sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedOutSyscall {
    pub tid: u32,
    pub entry: SyscallEntry,
    pub elapsed: u64,
}

impl TimedOutSyscall {
    pub fn to_record(&self, now: u64) -> TelemetryRecord {
        TelemetryRecord::new(TIMEOUT_RECORD_NAME, now)
            .with("tid", AttributeValue::U32(self.tid))
            .with("pid", AttributeValue::U32(self.entry.pid))
            .with("syscall_type", AttributeValue::U16(self.entry.syscall_type))
            .with("start_time", AttributeValue::U64(self.entry.timestamp))
            .with("elapsed", AttributeValue::U64(self.elapsed))
    }
}

pub struct SlowSyscallTracker {
    entries: Mutex<AHashMap<u32, SyscallEntry>>,
    latency_threshold_ns: u64,
    timeout_ns: u64,
}

impl SlowSyscallTracker {
    pub fn new(latency_threshold_ns: u64, timeout_ns: u64) -> Self {
        Self {
            entries: Mutex::new(AHashMap::new()),
            latency_threshold_ns,
            timeout_ns,
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(
            config.syscall_latency_threshold_ns(),
            config.syscall_timeout_ns(),
        )
    }

    pub fn exists(&self, tid: u32) -> bool {
        self.entries.lock().contains_key(&tid)
    }

    /// Entry for `tid`, created empty if absent
    ///
    /// Check [`exists`](Self::exists) first when creating an entry is not
    /// wanted.
    pub fn get(&self, tid: u32) -> SyscallEntry {
        *self.entries.lock().entry(tid).or_default()
    }

    pub fn insert(&self, tid: u32, entry: SyscallEntry) {
        self.entries.lock().insert(tid, entry);
    }

    pub fn erase(&self, tid: u32) -> Option<SyscallEntry> {
        self.entries.lock().remove(&tid)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn on_enter(&self, tid: u32, pid: u32, syscall_type: u16, timestamp: u64) {
        self.insert(
            tid,
            SyscallEntry {
                timestamp,
                syscall_type,
                pid,
            },
        );
    }

    /// Close the in-flight syscall of `tid`
    ///
    /// Returns a record when the call took at least the latency threshold.
    /// An exit with no matching enter, or one already swept, yields nothing.
    pub fn on_exit(&self, tid: u32, timestamp: u64) -> Option<TelemetryRecord> {
        let entry = self.erase(tid)?;
        let latency = timestamp.saturating_sub(entry.timestamp);
        if latency < self.latency_threshold_ns {
            return None;
        }
        debug!(
            "Slow syscall {} on tid {}: {} ns",
            entry.syscall_type, tid, latency
        );
        Some(
            TelemetryRecord::new(SLOW_RECORD_NAME, timestamp)
                .with("tid", AttributeValue::U32(tid))
                .with("pid", AttributeValue::U32(entry.pid))
                .with("syscall_type", AttributeValue::U16(entry.syscall_type))
                .with("latency", AttributeValue::U64(latency))
                .with("start_time", AttributeValue::U64(entry.timestamp)),
        )
    }

    /// Evict every entry at least `timeout` old
    ///
    /// The lock is held across the whole walk. Expired keys are collected
    /// first and removed afterwards.
    pub fn sweep(&self, now: u64) -> Vec<TimedOutSyscall> {
        self.sweep_limited(now, usize::MAX)
    }

    /// Evict as many timed-out entries as fit in `out`, oldest first
    ///
    /// Entries that do not fit stay tracked for the next sweep.
    pub fn sweep_into(&self, now: u64, out: &mut TelemetryBuffer) -> usize {
        let evicted = self.sweep_limited(now, out.remaining());
        for timed_out in &evicted {
            out.push(timed_out.to_record(now));
        }
        evicted.len()
    }

    fn sweep_limited(&self, now: u64, limit: usize) -> Vec<TimedOutSyscall> {
        let mut entries = self.entries.lock();

        let mut expired: Vec<TimedOutSyscall> = entries
            .iter()
            .filter_map(|(tid, entry)| {
                let elapsed = now.saturating_sub(entry.timestamp);
                (elapsed >= self.timeout_ns).then_some(TimedOutSyscall {
                    tid: *tid,
                    entry: *entry,
                    elapsed,
                })
            })
            .collect();
        if expired.len() > limit {
            expired.sort_by_key(|t| (t.entry.timestamp, t.tid));
            debug!(
                "Output full, {} timed-out syscalls left for next sweep",
                expired.len() - limit
            );
            expired.truncate(limit);
        }

        for timed_out in &expired {
            entries.remove(&timed_out.tid);
        }
        expired
    }
}
