//! Observability and Metrics
//!
//! Counters for connection, bind, pool and dispatch activity. A [`Metrics`]
//! instance is owned by each runtime and shared by its components.
//!
//! Uses atomic counters for thread-safe metrics collection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Metrics collector for runtime operations
#[derive(Debug)]
pub struct Metrics {
    /// Total connections established (client and server side)
    pub connections_total: AtomicU64,
    /// Currently open connections
    pub connections_active: AtomicU64,
    /// Bind packets sent by clients
    pub binds_sent: AtomicU64,
    /// Binds accepted by the server
    pub binds_accepted: AtomicU64,
    /// Binds rejected (bind_nack or rejecting bind_ack)
    pub binds_rejected: AtomicU64,
    /// Connections reused from an association's idle pool
    pub pool_hits: AtomicU64,
    /// Acquisitions that had to open and bind a new connection
    pub pool_misses: AtomicU64,
    /// Fragments written
    pub fragments_sent: AtomicU64,
    /// Fragments read
    pub fragments_received: AtomicU64,
    /// Packets written
    pub packets_sent: AtomicU64,
    /// Packets reassembled
    pub packets_received: AtomicU64,
    /// Total bytes sent
    pub bytes_sent: AtomicU64,
    /// Total bytes received
    pub bytes_received: AtomicU64,
    /// Requests handed to an operation handler
    pub calls_dispatched: AtomicU64,
    /// Fault packets sent
    pub faults_sent: AtomicU64,
    /// Requests dropped without a response
    pub packets_dropped: AtomicU64,
    /// Protocol errors
    pub protocol_errors: AtomicU64,
    /// Failed negotiations or packet verifications
    pub auth_failures: AtomicU64,
    /// Worker tasks started
    pub workers_spawned: AtomicU64,
    /// Worker tasks retired after idling
    pub workers_retired: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            binds_sent: AtomicU64::new(0),
            binds_accepted: AtomicU64::new(0),
            binds_rejected: AtomicU64::new(0),
            pool_hits: AtomicU64::new(0),
            pool_misses: AtomicU64::new(0),
            fragments_sent: AtomicU64::new(0),
            fragments_received: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            calls_dispatched: AtomicU64::new(0),
            faults_sent: AtomicU64::new(0),
            packets_dropped: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            auth_failures: AtomicU64::new(0),
            workers_spawned: AtomicU64::new(0),
            workers_retired: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a new connection and return its sequence number
    pub fn connection_established(&self) -> u64 {
        self.connections_active.fetch_add(1, Ordering::Relaxed);
        self.connections_total.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Record a connection closed
    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn bind_sent(&self) {
        self.binds_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bind_accepted(&self) {
        self.binds_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bind_rejected(&self) {
        self.binds_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pool_hit(&self) {
        self.pool_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pool_miss(&self) {
        self.pool_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a fragment written
    pub fn fragment_sent(&self, byte_count: u64) {
        self.fragments_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record a fragment read
    pub fn fragment_received(&self, byte_count: u64) {
        self.fragments_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn packet_sent(&self) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packet_received(&self) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn call_dispatched(&self) {
        self.calls_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fault_sent(&self) {
        self.faults_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packet_dropped(&self) {
        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a protocol error
    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn auth_failure(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn worker_spawned(&self) {
        self.workers_spawned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn worker_retired(&self) {
        self.workers_retired.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            binds_sent: self.binds_sent.load(Ordering::Relaxed),
            binds_accepted: self.binds_accepted.load(Ordering::Relaxed),
            binds_rejected: self.binds_rejected.load(Ordering::Relaxed),
            pool_hits: self.pool_hits.load(Ordering::Relaxed),
            pool_misses: self.pool_misses.load(Ordering::Relaxed),
            fragments_sent: self.fragments_sent.load(Ordering::Relaxed),
            fragments_received: self.fragments_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            calls_dispatched: self.calls_dispatched.load(Ordering::Relaxed),
            faults_sent: self.faults_sent.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            workers_spawned: self.workers_spawned.load(Ordering::Relaxed),
            workers_retired: self.workers_retired.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_total = snapshot.connections_total,
            connections_active = snapshot.connections_active,
            binds_sent = snapshot.binds_sent,
            binds_accepted = snapshot.binds_accepted,
            binds_rejected = snapshot.binds_rejected,
            pool_hits = snapshot.pool_hits,
            pool_misses = snapshot.pool_misses,
            fragments_sent = snapshot.fragments_sent,
            fragments_received = snapshot.fragments_received,
            packets_sent = snapshot.packets_sent,
            packets_received = snapshot.packets_received,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            calls_dispatched = snapshot.calls_dispatched,
            faults_sent = snapshot.faults_sent,
            packets_dropped = snapshot.packets_dropped,
            protocol_errors = snapshot.protocol_errors,
            auth_failures = snapshot.auth_failures,
            workers_spawned = snapshot.workers_spawned,
            workers_retired = snapshot.workers_retired,
            uptime_seconds = snapshot.uptime_seconds,
            "Runtime metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub binds_sent: u64,
    pub binds_accepted: u64,
    pub binds_rejected: u64,
    pub pool_hits: u64,
    pub pool_misses: u64,
    pub fragments_sent: u64,
    pub fragments_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub calls_dispatched: u64,
    pub faults_sent: u64,
    pub packets_dropped: u64,
    pub protocol_errors: u64,
    pub auth_failures: u64,
    pub workers_spawned: u64,
    pub workers_retired: u64,
    pub uptime_seconds: u64,
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    /// Start timing an operation
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        debug!(
            operation = self.operation,
            duration_us = duration.as_micros() as u64,
            "Operation completed"
        );
    }
}
