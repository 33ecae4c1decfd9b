//! Binding metrics - counters kept on the host side of the engine boundary
//!
//! The engine keeps its own packet counters ([`crate::engine::ContextStats`]).
//! These complement them with what only the binding sees:
//! - datagrams pumped into the engine and whether it recognised them
//! - datagrams and bytes flowing through the callback bridge
//! - dial outcomes and dial latency

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Atomic counters shared by a context, its sockets and its driver
pub(crate) struct BindingMetrics {
    datagrams_pumped: AtomicU64,
    datagrams_unrecognised: AtomicU64,
    datagrams_emitted: AtomicU64,
    bytes_emitted: AtomicU64,
    bytes_written: AtomicU64,
    bytes_delivered: AtomicU64,

    dials_started: AtomicU64,
    dials_established: AtomicU64,
    dials_failed: AtomicU64,
    dials_timed_out: AtomicU64,
    connections_accepted: AtomicU64,

    dial_latency: RwLock<LatencyTracker>,
    start_time: Instant,
}

/// Dial latency samples
struct LatencyTracker {
    samples: VecDeque<u64>, // Microseconds
    max_samples: usize,
    sum: u64,
}

impl LatencyTracker {
    fn new(max_samples: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(max_samples),
            max_samples,
            sum: 0,
        }
    }

    fn record(&mut self, latency_us: u64) {
        if self.samples.len() >= self.max_samples {
            if let Some(old) = self.samples.pop_front() {
                self.sum = self.sum.saturating_sub(old);
            }
        }
        self.samples.push_back(latency_us);
        self.sum += latency_us;
    }

    fn average(&self) -> u64 {
        if self.samples.is_empty() {
            0
        } else {
            self.sum / self.samples.len() as u64
        }
    }

    fn percentile(&self, p: f64) -> u64 {
        if self.samples.is_empty() {
            return 0;
        }
        let mut sorted: Vec<_> = self.samples.iter().copied().collect();
        sorted.sort_unstable();
        let idx = ((sorted.len() as f64 - 1.0) * p / 100.0) as usize;
        sorted[idx]
    }
}

impl Default for BindingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl BindingMetrics {
    pub(crate) fn new() -> Self {
        Self {
            datagrams_pumped: AtomicU64::new(0),
            datagrams_unrecognised: AtomicU64::new(0),
            datagrams_emitted: AtomicU64::new(0),
            bytes_emitted: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            bytes_delivered: AtomicU64::new(0),
            dials_started: AtomicU64::new(0),
            dials_established: AtomicU64::new(0),
            dials_failed: AtomicU64::new(0),
            dials_timed_out: AtomicU64::new(0),
            connections_accepted: AtomicU64::new(0),
            dial_latency: RwLock::new(LatencyTracker::new(1024)),
            start_time: Instant::now(),
        }
    }

    pub(crate) fn record_pumped(&self, consumed: bool) {
        self.datagrams_pumped.fetch_add(1, Ordering::Relaxed);
        if !consumed {
            self.datagrams_unrecognised.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_datagram_emitted(&self, bytes: usize) {
        self.datagrams_emitted.fetch_add(1, Ordering::Relaxed);
        self.bytes_emitted.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_bytes_written(&self, bytes: usize) {
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_bytes_delivered(&self, bytes: usize) {
        self.bytes_delivered.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_dial_started(&self) {
        self.dials_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dial_established(&self, latency: Duration) {
        self.dials_established.fetch_add(1, Ordering::Relaxed);
        self.dial_latency.write().record(latency.as_micros() as u64);
    }

    pub(crate) fn record_dial_failed(&self) {
        self.dials_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dial_timed_out(&self) {
        self.dials_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of every counter
    pub(crate) fn snapshot(&self, open_sockets: usize) -> BindingStats {
        let latency = self.dial_latency.read();
        BindingStats {
            datagrams_pumped: self.datagrams_pumped.load(Ordering::Relaxed),
            datagrams_unrecognised: self.datagrams_unrecognised.load(Ordering::Relaxed),
            datagrams_emitted: self.datagrams_emitted.load(Ordering::Relaxed),
            bytes_emitted: self.bytes_emitted.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            bytes_delivered: self.bytes_delivered.load(Ordering::Relaxed),
            dials_started: self.dials_started.load(Ordering::Relaxed),
            dials_established: self.dials_established.load(Ordering::Relaxed),
            dials_failed: self.dials_failed.load(Ordering::Relaxed),
            dials_timed_out: self.dials_timed_out.load(Ordering::Relaxed),
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            open_sockets,
            avg_dial_latency_us: latency.average(),
            p99_dial_latency_us: latency.percentile(99.0),
            uptime_secs: self.start_time.elapsed().as_secs_f64(),
        }
    }
}

/// Point-in-time binding statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindingStats {
    /// Datagrams handed to the engine
    pub datagrams_pumped: u64,
    /// Pumped datagrams the engine did not recognise
    pub datagrams_unrecognised: u64,
    /// Datagrams the engine asked to send
    pub datagrams_emitted: u64,
    /// Bytes in emitted datagrams
    pub bytes_emitted: u64,
    /// Payload bytes the engine accepted from writers
    pub bytes_written: u64,
    /// Payload bytes the engine delivered to readers
    pub bytes_delivered: u64,
    /// Dials issued
    pub dials_started: u64,
    /// Dials that reached the established state
    pub dials_established: u64,
    /// Dials that ended in an error
    pub dials_failed: u64,
    /// Dials that saw no signal in time
    pub dials_timed_out: u64,
    /// Incoming connections handed to a listener
    pub connections_accepted: u64,
    /// Sockets with a live signal
    pub open_sockets: usize,
    /// Mean dial latency
    pub avg_dial_latency_us: u64,
    /// 99th percentile dial latency
    pub p99_dial_latency_us: u64,
    /// Seconds since the context was created
    pub uptime_secs: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pump_counters() {
        let metrics = BindingMetrics::new();
        metrics.record_pumped(true);
        metrics.record_pumped(false);
        metrics.record_pumped(false);

        let stats = metrics.snapshot(0);
        assert_eq!(stats.datagrams_pumped, 3);
        assert_eq!(stats.datagrams_unrecognised, 2);
    }

    #[test]
    fn test_dial_latency() {
        let metrics = BindingMetrics::new();
        for ms in [10, 20, 30] {
            metrics.record_dial_started();
            metrics.record_dial_established(Duration::from_millis(ms));
        }

        let stats = metrics.snapshot(3);
        assert_eq!(stats.dials_started, 3);
        assert_eq!(stats.dials_established, 3);
        assert_eq!(stats.avg_dial_latency_us, 20_000);
        assert_eq!(stats.p99_dial_latency_us, 20_000);
        assert_eq!(stats.open_sockets, 3);
    }

    #[test]
    fn test_latency_window_evicts_oldest() {
        let mut tracker = LatencyTracker::new(2);
        tracker.record(100);
        tracker.record(200);
        tracker.record(300);
        assert_eq!(tracker.average(), 250);
        assert_eq!(tracker.percentile(100.0), 300);
    }
}
