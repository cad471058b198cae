//! Common shape of the windowed TCP analyzers
//!
//! Each analyzer owns its keyed state, ingests segments on the capture path
//! and drains into a caller-owned buffer when its event-time window closes.
//! Analyzers are single-threaded; callers sharing one across threads wrap it
//! in their own lock.

use crate::telemetry::TelemetryBuffer;
use crate::window::FlushClock;
use podlens_common::TcpRawData;

pub trait Analyzer {
    fn name(&self) -> &'static str;

    /// Feed one segment. Segments not captured on a container interface are
    /// ignored.
    fn ingest(&mut self, segment: &TcpRawData);

    /// Drain aggregate state into `out`, returning the number of records
    /// written. Entries that do not fit stay for the next flush.
    fn flush(&mut self, out: &mut TelemetryBuffer) -> usize;

    /// Aggregate entries waiting for a flush
    fn pending(&self) -> usize;

    fn clock(&self) -> &FlushClock;

    fn clock_mut(&mut self) -> &mut FlushClock;

    /// Flush if the event-time window has closed
    fn poll(&mut self, out: &mut TelemetryBuffer) -> usize {
        if !self.clock().due() {
            return 0;
        }
        let written = self.flush(out);
        self.clock_mut().reset();
        written
    }
}
