//! Fan-out/fan-in coordinator for the load-generating client.
//!
//! Spawns one thread per worker, each owning a private statistics record,
//! joins every thread, then combines the records into a [`ClientSummary`].

use crate::config::ClientConfig;
use crate::runtime::stats::{latency_histogram, WorkerStats};
use crate::runtime::worker::Worker;
use hdrhistogram::{CreationError, Histogram};
use std::fmt;
use std::io;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, warn};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to create latency histogram: {0}")]
    Histogram(#[from] CreationError),
    #[error("failed to spawn worker {worker}: {source}")]
    Spawn { worker: usize, source: io::Error },
}

/// Statistics combined across every worker.
#[derive(Debug, Clone)]
pub struct ClientSummary {
    /// Workers whose statistics were collected.
    pub workers: usize,
    pub total_rtt: Duration,
    pub total_messages: u64,
    /// Sum of per-worker request rates.
    pub total_rate: f64,
    pub mismatched_responses: u64,
    pub latencies: Histogram<u64>,
}

impl ClientSummary {
    /// Combine per-worker records.
    pub fn from_workers<I>(workers: I) -> Result<Self, CreationError>
    where
        I: IntoIterator<Item = WorkerStats>,
    {
        let mut summary = ClientSummary {
            workers: 0,
            total_rtt: Duration::ZERO,
            total_messages: 0,
            total_rate: 0.0,
            mismatched_responses: 0,
            latencies: latency_histogram()?,
        };

        for stats in workers {
            summary.workers += 1;
            summary.total_rtt += stats.total_rtt;
            summary.total_messages += stats.total_messages;
            summary.total_rate += stats.request_rate;
            summary.mismatched_responses += stats.mismatched_responses;
            if let Err(e) = summary.latencies.add(&stats.latencies) {
                warn!(error = ?e, "Dropped worker latency samples");
            }
        }

        Ok(summary)
    }

    /// Mean RTT across every completed round trip, or `None` when no round
    /// trip completed.
    pub fn average_rtt(&self) -> Option<Duration> {
        if self.total_messages == 0 {
            return None;
        }
        let nanos = self.total_rtt.as_nanos() / u128::from(self.total_messages);
        Some(Duration::from_nanos(
            u64::try_from(nanos).unwrap_or(u64::MAX),
        ))
    }
}

impl fmt::Display for ClientSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.average_rtt() {
            Some(avg) => writeln!(f, "Average RTT: {} us", avg.as_micros())?,
            None => writeln!(f, "Average RTT: no data")?,
        }
        write!(f, "Total Request Rate: {:.6} messages/s", self.total_rate)?;

        if self.total_messages > 0 {
            let us = |nanos: u64| nanos / 1_000;
            write!(
                f,
                "\nRTT (us): min={} p50={} p95={} p99={} max={}",
                us(self.latencies.min()),
                us(self.latencies.value_at_percentile(50.0)),
                us(self.latencies.value_at_percentile(95.0)),
                us(self.latencies.value_at_percentile(99.0)),
                us(self.latencies.max()),
            )?;
        }
        if self.mismatched_responses > 0 {
            write!(f, "\nMismatched responses: {}", self.mismatched_responses)?;
        }
        Ok(())
    }
}

/// Body run on a worker thread, returning that worker's statistics.
type WorkerBody = Box<dyn FnOnce() -> WorkerStats + Send + 'static>;

/// Spawn `config.threads` workers, wait for all of them, and aggregate.
pub fn run_client(config: &ClientConfig) -> Result<ClientSummary, ClientError> {
    run_client_with(config, |name, body| thread::Builder::new().name(name).spawn(body))
}

/// Like [`run_client`], starting each worker thread through `spawn`.
///
/// If a spawn fails, the workers already started are joined before the
/// error is returned.
fn run_client_with<S>(config: &ClientConfig, mut spawn: S) -> Result<ClientSummary, ClientError>
where
    S: FnMut(String, WorkerBody) -> io::Result<JoinHandle<WorkerStats>>,
{
    let mut handles = Vec::with_capacity(config.threads);

    for worker_id in 0..config.threads {
        let mut stats = WorkerStats::new()?;
        let worker = Worker {
            id: worker_id,
            addr: config.addr,
            requests: config.requests,
            max_events: config.max_events,
        };

        let body: WorkerBody = Box::new(move || {
            if let Err(e) = worker.run(&mut stats) {
                warn!(worker = worker_id, error = %e, "Worker aborted");
            }
            stats
        });

        match spawn(format!("worker-{worker_id}"), body) {
            Ok(handle) => handles.push(handle),
            Err(source) => {
                error!(worker = worker_id, error = %source, "Failed to spawn worker");
                join_workers(handles);
                return Err(ClientError::Spawn {
                    worker: worker_id,
                    source,
                });
            }
        }
    }

    let collected = join_workers(handles);
    Ok(ClientSummary::from_workers(collected)?)
}

/// Wait for every worker, keeping the statistics of those that did not
/// panic.
fn join_workers(handles: Vec<JoinHandle<WorkerStats>>) -> Vec<WorkerStats> {
    let mut collected = Vec::with_capacity(handles.len());
    for (worker_id, handle) in handles.into_iter().enumerate() {
        match handle.join() {
            Ok(stats) => collected.push(stats),
            Err(_) => error!(worker = worker_id, "Worker panicked"),
        }
    }
    collected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::{client_config, closed_addr, spawn_server};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn stats(rtt_us: u64, messages: u64) -> WorkerStats {
        let mut s = WorkerStats::new().unwrap();
        for _ in 0..messages {
            s.record(Duration::from_micros(rtt_us));
        }
        s.finish();
        s
    }

    #[test]
    fn test_summary_sums_workers() {
        let summary =
            ClientSummary::from_workers(vec![stats(100, 4), stats(300, 4), stats(50, 0)]).unwrap();

        assert_eq!(summary.workers, 3);
        assert_eq!(summary.total_messages, 8);
        assert_eq!(summary.total_rtt, Duration::from_micros(1600));
        assert_eq!(summary.average_rtt(), Some(Duration::from_micros(200)));
        // 4 / 400us + 4 / 1200us + 0
        assert!((summary.total_rate - (10_000.0 + 10_000.0 / 3.0)).abs() < 1e-6);
        assert_eq!(summary.latencies.len(), 8);
    }

    #[test]
    fn test_summary_no_data() {
        let summary = ClientSummary::from_workers(vec![stats(0, 0), stats(0, 0)]).unwrap();
        assert_eq!(summary.total_messages, 0);
        assert_eq!(summary.average_rtt(), None);
        assert_eq!(summary.total_rate, 0.0);

        let rendered = summary.to_string();
        assert!(rendered.contains("Average RTT: no data"));
        assert!(rendered.contains("Total Request Rate: 0.000000 messages/s"));
        assert!(!rendered.contains("p50"));
    }

    #[test]
    fn test_summary_display() {
        // 256us sits on a histogram bucket boundary, so every percentile
        // reports it exactly.
        let summary = ClientSummary::from_workers(vec![stats(256, 2)]).unwrap();
        let rendered = summary.to_string();
        assert!(rendered.starts_with("Average RTT: 256 us\n"));
        assert!(rendered.contains("messages/s"));
        assert!(
            rendered.contains("RTT (us): min=256 p50=256 p95=256 p99=256 max=256"),
            "{rendered}"
        );
    }

    #[test]
    fn test_summary_merges_percentiles() {
        let summary =
            ClientSummary::from_workers(vec![stats(128, 1), stats(384, 1)]).unwrap();
        let rendered = summary.to_string();
        assert!(rendered.contains("min=128 "), "{rendered}");
        assert!(rendered.contains("max=384"), "{rendered}");
    }

    #[test]
    fn test_four_workers_against_one_server() {
        let (addr, handle, join) = spawn_server();

        let summary = run_client(&client_config(addr, 4, 100)).unwrap();
        assert_eq!(summary.workers, 4);
        assert_eq!(summary.total_messages, 400);
        assert!(summary.average_rtt().is_some());
        assert!(summary.total_rate > 0.0);
        assert_eq!(summary.mismatched_responses, 0);

        handle.shutdown().unwrap();
        join.join().unwrap().unwrap();
    }

    #[test]
    fn test_no_server_reports_no_data() {
        let summary = run_client(&client_config(closed_addr(), 2, 10)).unwrap();
        assert_eq!(summary.workers, 2);
        assert_eq!(summary.total_messages, 0);
        assert_eq!(summary.average_rtt(), None);
        assert!(summary.to_string().contains("no data"));
    }

    #[test]
    fn test_spawn_failure_joins_started_workers() {
        let finished = Arc::new(AtomicUsize::new(0));
        let mut calls = 0;

        let spawner = {
            let finished = finished.clone();
            move |name: String, body: WorkerBody| {
                calls += 1;
                if calls == 3 {
                    return Err(io::Error::new(io::ErrorKind::WouldBlock, "no threads left"));
                }
                let finished = finished.clone();
                thread::Builder::new().name(name).spawn(move || {
                    // Finish late so only a join observes the count.
                    thread::sleep(Duration::from_millis(50));
                    let stats = body();
                    finished.fetch_add(1, Ordering::SeqCst);
                    stats
                })
            }
        };

        let result = run_client_with(&client_config(closed_addr(), 4, 10), spawner);

        match result {
            Err(ClientError::Spawn { worker, source }) => {
                assert_eq!(worker, 2);
                assert_eq!(source.kind(), io::ErrorKind::WouldBlock);
            }
            other => panic!("expected spawn failure, got {other:?}"),
        }
        assert_eq!(finished.load(Ordering::SeqCst), 2);
    }
}
