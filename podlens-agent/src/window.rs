//! Event-time flush cadence
//!
//! The TCP analyzers flush on the timestamps of the events they ingest rather
//! than on wall-clock sampling, so a recorded stream replays identically.

#[derive(Debug, Clone)]
pub struct FlushClock {
    interval_ns: u64,
    last_flush_ns: Option<u64>,
    latest_event_ns: u64,
}

impl FlushClock {
    pub fn new(interval_ns: u64) -> Self {
        Self {
            interval_ns,
            last_flush_ns: None,
            latest_event_ns: 0,
        }
    }

    /// Advance the clock to an event timestamp
    ///
    /// The first observed event starts the window. Timestamps that run
    /// backwards are recorded as they come; `due` saturates.
    pub fn observe(&mut self, timestamp_ns: u64) {
        if self.last_flush_ns.is_none() {
            self.last_flush_ns = Some(timestamp_ns);
        }
        self.latest_event_ns = timestamp_ns;
    }

    pub fn due(&self) -> bool {
        match self.last_flush_ns {
            Some(last) => self.latest_event_ns.saturating_sub(last) >= self.interval_ns,
            None => false,
        }
    }

    /// Restart the window at the most recent event
    pub fn reset(&mut self) {
        self.last_flush_ns = Some(self.latest_event_ns);
    }

    pub fn latest(&self) -> u64 {
        self.latest_event_ns
    }

    pub fn interval_ns(&self) -> u64 {
        self.interval_ns
    }
}
