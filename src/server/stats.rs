//! Server-wide counters, mirrored into the `metrics` facade

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam::utils::CachePadded;
use serde::Serialize;

#[derive(Default)]
struct Counters {
    frames_ingested: AtomicU64,
    frames_evicted: AtomicU64,
    ingest_failures: AtomicU64,
    frames_sent: AtomicU64,
    bytes_sent: AtomicU64,
    connections_accepted: AtomicU64,
    connections_rejected: AtomicU64,
}

#[derive(Default)]
pub(crate) struct StatsRecorder {
    counters: CachePadded<Counters>,
}

impl StatsRecorder {
    pub fn record_ingested(&self, evicted: usize) {
        self.counters.frames_ingested.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("framecast_frames_ingested").increment(1);
        if evicted > 0 {
            self.counters
                .frames_evicted
                .fetch_add(evicted as u64, Ordering::Relaxed);
            metrics::counter!("framecast_frames_evicted").increment(evicted as u64);
        }
    }

    pub fn record_ingest_failure(&self) {
        self.counters.ingest_failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("framecast_ingest_failures").increment(1);
    }

    pub fn record_sent(&self, bytes: usize, elapsed: Duration) {
        self.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_sent
            .fetch_add(bytes as u64, Ordering::Relaxed);
        metrics::counter!("framecast_frames_sent").increment(1);
        metrics::counter!("framecast_bytes_sent").increment(bytes as u64);
        metrics::histogram!("framecast_send_time_us").record(elapsed.as_micros() as f64);
    }

    pub fn record_accepted(&self) {
        self.counters
            .connections_accepted
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.counters
            .connections_rejected
            .fetch_add(1, Ordering::Relaxed);
        metrics::counter!("framecast_connections_rejected").increment(1);
    }

    pub fn record_connected_clients(&self, count: usize) {
        metrics::gauge!("framecast_connected_clients").set(count as f64);
    }

    pub fn snapshot(&self, connected_clients: usize, buffered_frames: usize) -> ServerStats {
        let c = &self.counters;
        ServerStats {
            frames_ingested: c.frames_ingested.load(Ordering::Relaxed),
            frames_evicted: c.frames_evicted.load(Ordering::Relaxed),
            ingest_failures: c.ingest_failures.load(Ordering::Relaxed),
            frames_sent: c.frames_sent.load(Ordering::Relaxed),
            bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
            connections_accepted: c.connections_accepted.load(Ordering::Relaxed),
            connections_rejected: c.connections_rejected.load(Ordering::Relaxed),
            connected_clients,
            buffered_frames,
        }
    }
}

/// Point-in-time view of server activity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServerStats {
    pub frames_ingested: u64,
    /// Frames dropped from the shared or per-client queues to admit newer ones
    pub frames_evicted: u64,
    pub ingest_failures: u64,
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub connections_accepted: u64,
    pub connections_rejected: u64,
    pub connected_clients: usize,
    pub buffered_frames: usize,
}

impl ServerStats {
    /// Rates per second between two snapshots taken `elapsed` apart
    pub fn rates_since(&self, earlier: &ServerStats, elapsed: Duration) -> (f64, f64) {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return (0.0, 0.0);
        }
        let ingest = self.frames_ingested.saturating_sub(earlier.frames_ingested) as f64 / secs;
        let sent = self.frames_sent.saturating_sub(earlier.frames_sent) as f64 / secs;
        (ingest, sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_events() {
        let stats = StatsRecorder::default();
        stats.record_ingested(0);
        stats.record_ingested(2);
        stats.record_ingest_failure();
        stats.record_sent(148, Duration::from_micros(30));
        stats.record_accepted();
        stats.record_rejected();

        let snap = stats.snapshot(1, 4);
        assert_eq!(snap.frames_ingested, 2);
        assert_eq!(snap.frames_evicted, 2);
        assert_eq!(snap.ingest_failures, 1);
        assert_eq!(snap.frames_sent, 1);
        assert_eq!(snap.bytes_sent, 148);
        assert_eq!(snap.connections_accepted, 1);
        assert_eq!(snap.connections_rejected, 1);
        assert_eq!((snap.connected_clients, snap.buffered_frames), (1, 4));
    }

    #[test]
    fn rates_over_interval() {
        let earlier = ServerStats {
            frames_ingested: 10,
            frames_sent: 5,
            ..ServerStats::default()
        };
        let later = ServerStats {
            frames_ingested: 40,
            frames_sent: 20,
            ..ServerStats::default()
        };
        let (ingest, sent) = later.rates_since(&earlier, Duration::from_secs(2));
        assert_eq!(ingest, 15.0);
        assert_eq!(sent, 7.5);
        assert_eq!(later.rates_since(&earlier, Duration::ZERO), (0.0, 0.0));
    }
}
