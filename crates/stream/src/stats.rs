//! Throughput accounting
//!
//! Counters are cumulative across start/stop cycles; only the start
//! timestamp is refreshed when a new stream begins.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tracing::info;

/// Cumulative byte/transfer counters plus the stream-start timestamp.
#[derive(Debug, Default)]
pub struct Throughput {
    bytes: AtomicU64,
    transfers: AtomicU64,
    started: Mutex<Option<Instant>>,
}

impl Throughput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one forwarded transfer of `len` bytes.
    pub fn record(&self, len: usize) {
        self.bytes.fetch_add(len as u64, Ordering::Relaxed);
        self.transfers.fetch_add(1, Ordering::Relaxed);
    }

    /// Mark the start of a stream. Counters keep their totals.
    pub fn mark_start(&self) {
        let mut started = self.started.lock().unwrap_or_else(|e| e.into_inner());
        *started = Some(Instant::now());
    }

    /// Cumulative bytes forwarded to the sink.
    pub fn total_bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Cumulative transfers forwarded to the sink.
    pub fn total_transfers(&self) -> u64 {
        self.transfers.load(Ordering::Relaxed)
    }

    /// Log the running totals and return the cumulative byte count.
    ///
    /// Returns 0 without logging if no stream was ever started.
    pub fn summarize(&self) -> u64 {
        let started = {
            let guard = self.started.lock().unwrap_or_else(|e| e.into_inner());
            *guard
        };
        let Some(started) = started else {
            return 0;
        };

        let bytes = self.total_bytes();
        let transfers = self.total_transfers();
        let elapsed_ms = started.elapsed().as_millis().max(1) as u64;
        info!(
            "{} transfers (total {} bytes) in {} ms => {} bytes/sec",
            transfers,
            bytes,
            elapsed_ms,
            bytes.saturating_mul(1000) / elapsed_ms
        );
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = Throughput::new();
        stats.record(1920);
        stats.record(960);
        assert_eq!(stats.total_bytes(), 2880);
        assert_eq!(stats.total_transfers(), 2);
    }

    #[test]
    fn test_summarize_without_start_is_zero() {
        let stats = Throughput::new();
        stats.record(100);
        assert_eq!(stats.summarize(), 0);
    }

    #[test]
    fn test_counters_survive_restart() {
        let stats = Throughput::new();
        stats.mark_start();
        stats.record(500);
        stats.mark_start();
        stats.record(500);
        assert_eq!(stats.summarize(), 1000);
    }
}
