//! Observability and Metrics
//!
//! Per-session counters for connections, handshakes and traffic on both
//! channels. Each `Session` owns one `Metrics`; there is no process-wide
//! instance, so independent sessions in one process report independently.
//!
//! Uses atomic counters so the reader, writer and datagram tasks can record
//! without touching the registry lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Metrics collector for one session
#[derive(Debug)]
pub struct Metrics {
    /// Reliable links opened, accepted or connected, registered or not
    pub connections_total: AtomicU64,
    /// Reliable links currently open
    pub connections_active: AtomicU64,
    /// Total handshake attempts (one per `connect` / accepted socket)
    pub handshakes_total: AtomicU64,
    /// Handshakes that ended with a confirmed id
    pub handshakes_success: AtomicU64,
    /// Handshakes that failed or were abandoned
    pub handshakes_failed: AtomicU64,
    /// Candidate ids rejected because they were already taken
    pub id_renegotiations: AtomicU64,
    /// Frames written to reliable connections
    pub messages_sent: AtomicU64,
    /// Frames decoded from reliable connections
    pub messages_received: AtomicU64,
    /// Bytes written to reliable connections
    pub bytes_sent: AtomicU64,
    /// Bytes read from reliable connections
    pub bytes_received: AtomicU64,
    /// Application datagrams handed to the unreliable socket
    pub datagrams_sent: AtomicU64,
    /// Datagrams read from the unreliable socket
    pub datagrams_received: AtomicU64,
    /// Bytes of application datagrams handed to the unreliable socket
    pub datagram_bytes_sent: AtomicU64,
    /// Bytes read from the unreliable socket
    pub datagram_bytes_received: AtomicU64,
    /// Datagrams dropped (unresolved sender, malformed, or send buffer full)
    pub datagrams_dropped: AtomicU64,
    /// Messages discarded by first-occurrence deduplication
    pub duplicates_suppressed: AtomicU64,
    /// Messages dropped for lack of a handler
    pub unknown_actions: AtomicU64,
    /// Hole-punching keep-alives sent
    pub hole_punches_sent: AtomicU64,
    /// Observed NAT re-bindings
    pub rebindings: AtomicU64,
    /// Connection errors
    pub connection_errors: AtomicU64,
    /// Protocol errors
    pub protocol_errors: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            handshakes_total: AtomicU64::new(0),
            handshakes_success: AtomicU64::new(0),
            handshakes_failed: AtomicU64::new(0),
            id_renegotiations: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            datagrams_sent: AtomicU64::new(0),
            datagrams_received: AtomicU64::new(0),
            datagram_bytes_sent: AtomicU64::new(0),
            datagram_bytes_received: AtomicU64::new(0),
            datagrams_dropped: AtomicU64::new(0),
            duplicates_suppressed: AtomicU64::new(0),
            unknown_actions: AtomicU64::new(0),
            hole_punches_sent: AtomicU64::new(0),
            rebindings: AtomicU64::new(0),
            connection_errors: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a reliable link being opened
    pub fn connection_established(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a reliable link closing
    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn handshake_attempt(&self) {
        self.handshakes_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handshake_success(&self) {
        self.handshakes_success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handshake_failed(&self) {
        self.handshakes_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn id_renegotiated(&self) {
        self.id_renegotiations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a frame queued on a reliable connection
    pub fn message_sent(&self, byte_count: u64) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record a batch read from a reliable connection
    pub fn messages_received(&self, count: u64, byte_count: u64) {
        self.messages_received.fetch_add(count, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn datagram_sent(&self, byte_count: u64) {
        self.datagrams_sent.fetch_add(1, Ordering::Relaxed);
        self.datagram_bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn datagram_received(&self, byte_count: u64) {
        self.datagrams_received.fetch_add(1, Ordering::Relaxed);
        self.datagram_bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn datagram_dropped(&self) {
        self.datagrams_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn duplicates_suppressed(&self, count: u64) {
        self.duplicates_suppressed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn unknown_action(&self) {
        self.unknown_actions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hole_punch_sent(&self) {
        self.hole_punches_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rebinding(&self) {
        self.rebindings.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            handshakes_total: self.handshakes_total.load(Ordering::Relaxed),
            handshakes_success: self.handshakes_success.load(Ordering::Relaxed),
            handshakes_failed: self.handshakes_failed.load(Ordering::Relaxed),
            id_renegotiations: self.id_renegotiations.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            datagrams_sent: self.datagrams_sent.load(Ordering::Relaxed),
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
            datagram_bytes_sent: self.datagram_bytes_sent.load(Ordering::Relaxed),
            datagram_bytes_received: self.datagram_bytes_received.load(Ordering::Relaxed),
            datagrams_dropped: self.datagrams_dropped.load(Ordering::Relaxed),
            duplicates_suppressed: self.duplicates_suppressed.load(Ordering::Relaxed),
            unknown_actions: self.unknown_actions.load(Ordering::Relaxed),
            hole_punches_sent: self.hole_punches_sent.load(Ordering::Relaxed),
            rebindings: self.rebindings.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_total = snapshot.connections_total,
            connections_active = snapshot.connections_active,
            handshakes_total = snapshot.handshakes_total,
            handshakes_success = snapshot.handshakes_success,
            handshakes_failed = snapshot.handshakes_failed,
            id_renegotiations = snapshot.id_renegotiations,
            messages_sent = snapshot.messages_sent,
            messages_received = snapshot.messages_received,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            datagrams_sent = snapshot.datagrams_sent,
            datagrams_received = snapshot.datagrams_received,
            datagram_bytes_sent = snapshot.datagram_bytes_sent,
            datagram_bytes_received = snapshot.datagram_bytes_received,
            datagrams_dropped = snapshot.datagrams_dropped,
            duplicates_suppressed = snapshot.duplicates_suppressed,
            unknown_actions = snapshot.unknown_actions,
            hole_punches_sent = snapshot.hole_punches_sent,
            rebindings = snapshot.rebindings,
            connection_errors = snapshot.connection_errors,
            protocol_errors = snapshot.protocol_errors,
            uptime_seconds = snapshot.uptime_seconds,
            "Session metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub handshakes_total: u64,
    pub handshakes_success: u64,
    pub handshakes_failed: u64,
    pub id_renegotiations: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub datagrams_sent: u64,
    pub datagrams_received: u64,
    pub datagram_bytes_sent: u64,
    pub datagram_bytes_received: u64,
    pub datagrams_dropped: u64,
    pub duplicates_suppressed: u64,
    pub unknown_actions: u64,
    pub hole_punches_sent: u64,
    pub rebindings: u64,
    pub connection_errors: u64,
    pub protocol_errors: u64,
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
            duration_ms = duration.as_millis(),
            "Operation completed"
        );
    }
}
