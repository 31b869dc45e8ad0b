//! Observability and Metrics
//!
//! Process-wide counters for the wire layer: frames, packets, bytes and
//! failures. Every counter is an atomic, so recording never blocks the hot path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Global metrics collector for wire operations
#[derive(Debug)]
pub struct Metrics {
    /// Total sessions opened
    pub connections_total: AtomicU64,
    /// Sessions currently open
    pub connections_active: AtomicU64,
    /// Frames compressed, checksummed and encrypted
    pub frames_sealed: AtomicU64,
    /// Frames decrypted with a passing checksum
    pub frames_opened: AtomicU64,
    /// Packets written through an envelope
    pub packets_encoded: AtomicU64,
    /// Packets read through an envelope
    pub packets_decoded: AtomicU64,
    /// Ciphertext bytes produced
    pub bytes_sent: AtomicU64,
    /// Ciphertext bytes accepted
    pub bytes_received: AtomicU64,
    /// Checksum mismatches
    pub integrity_failures: AtomicU64,
    /// Verified frames that failed to inflate
    pub corrupt_payloads: AtomicU64,
    /// Envelope decode failures other than the two above
    pub decode_errors: AtomicU64,
    /// (De)compression jobs moved to the blocking pool
    pub offloaded_jobs: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            frames_sealed: AtomicU64::new(0),
            frames_opened: AtomicU64::new(0),
            packets_encoded: AtomicU64::new(0),
            packets_decoded: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            integrity_failures: AtomicU64::new(0),
            corrupt_payloads: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            offloaded_jobs: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn connection_established(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record a sealed frame of `byte_count` ciphertext bytes
    pub fn frame_sealed(&self, byte_count: u64) {
        self.frames_sealed.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record a verified frame of `byte_count` ciphertext bytes
    pub fn frame_opened(&self, byte_count: u64) {
        self.frames_opened.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn packet_encoded(&self) {
        self.packets_encoded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packet_decoded(&self) {
        self.packets_decoded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn integrity_failure(&self) {
        self.integrity_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn corrupt_payload(&self) {
        self.corrupt_payloads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn offloaded(&self) {
        self.offloaded_jobs.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            frames_sealed: self.frames_sealed.load(Ordering::Relaxed),
            frames_opened: self.frames_opened.load(Ordering::Relaxed),
            packets_encoded: self.packets_encoded.load(Ordering::Relaxed),
            packets_decoded: self.packets_decoded.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            integrity_failures: self.integrity_failures.load(Ordering::Relaxed),
            corrupt_payloads: self.corrupt_payloads.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            offloaded_jobs: self.offloaded_jobs.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_total = snapshot.connections_total,
            connections_active = snapshot.connections_active,
            frames_sealed = snapshot.frames_sealed,
            frames_opened = snapshot.frames_opened,
            packets_encoded = snapshot.packets_encoded,
            packets_decoded = snapshot.packets_decoded,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            integrity_failures = snapshot.integrity_failures,
            corrupt_payloads = snapshot.corrupt_payloads,
            decode_errors = snapshot.decode_errors,
            offloaded_jobs = snapshot.offloaded_jobs,
            uptime_seconds = snapshot.uptime_seconds,
            "Wire metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub frames_sealed: u64,
    pub frames_opened: u64,
    pub packets_encoded: u64,
    pub packets_decoded: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub integrity_failures: u64,
    pub corrupt_payloads: u64,
    pub decode_errors: u64,
    pub offloaded_jobs: u64,
    pub uptime_seconds: u64,
}

static METRICS: once_cell::sync::Lazy<Metrics> = once_cell::sync::Lazy::new(Metrics::new);

/// Get the global metrics instance
pub fn global_metrics() -> &'static Metrics {
    &METRICS
}

/// Times one operation and logs its duration on drop
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        debug!(
            operation = self.operation,
            duration_us = self.start.elapsed().as_micros() as u64,
            "Operation completed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = Metrics::new();
        metrics.connection_established();
        metrics.frame_sealed(10);
        metrics.frame_sealed(5);
        metrics.frame_opened(7);
        metrics.integrity_failure();
        metrics.connection_closed();

        let snap = metrics.snapshot();
        assert_eq!(snap.connections_total, 1);
        assert_eq!(snap.connections_active, 0);
        assert_eq!(snap.frames_sealed, 2);
        assert_eq!(snap.bytes_sent, 15);
        assert_eq!(snap.frames_opened, 1);
        assert_eq!(snap.bytes_received, 7);
        assert_eq!(snap.integrity_failures, 1);
        metrics.log_metrics();
    }
}
