//! Per-worker round-trip statistics.

use hdrhistogram::{CreationError, Histogram};
use std::time::Duration;

/// Significant figures kept by RTT histograms.
const SIGFIG: u8 = 3;

/// Largest RTT tracked exactly (60s); longer samples saturate to it.
const MAX_TRACKABLE_NANOS: u64 = 60_000_000_000;

/// Create a histogram of RTT samples in nanoseconds.
pub fn latency_histogram() -> Result<Histogram<u64>, CreationError> {
    Histogram::new_with_bounds(1, MAX_TRACKABLE_NANOS, SIGFIG)
}

/// Statistics owned and mutated by exactly one worker.
#[derive(Debug, Clone)]
pub struct WorkerStats {
    pub total_rtt: Duration,
    pub total_messages: u64,
    /// Completed round trips per second of accumulated RTT.
    pub request_rate: f64,
    /// Responses whose bytes differed from the request.
    pub mismatched_responses: u64,
    pub latencies: Histogram<u64>,
}

impl WorkerStats {
    pub fn new() -> Result<Self, CreationError> {
        Ok(Self {
            total_rtt: Duration::ZERO,
            total_messages: 0,
            request_rate: 0.0,
            mismatched_responses: 0,
            latencies: latency_histogram()?,
        })
    }

    /// Account for one completed round trip.
    pub fn record(&mut self, rtt: Duration) {
        self.total_rtt += rtt;
        self.total_messages += 1;
        self.latencies
            .saturating_record(u64::try_from(rtt.as_nanos()).unwrap_or(u64::MAX));
    }

    /// Derive the request rate from what has been recorded so far.
    pub fn finish(&mut self) {
        self.request_rate = request_rate(self.total_messages, self.total_rtt);
    }
}

/// `messages / elapsed` in messages per second, or zero when nothing was
/// measured.
pub fn request_rate(messages: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if messages == 0 || secs == 0.0 {
        return 0.0;
    }
    messages as f64 / secs
}
