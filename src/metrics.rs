use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for the streaming bridge
///
/// Thread-safe atomic counters; updated from async tasks and blocking workers alike.
#[derive(Default)]
pub struct BridgeMetrics {
    /// Transports successfully established (direct or tunneled)
    pub connections: AtomicU64,

    /// Establish attempts that failed at any stage
    pub connection_failures: AtomicU64,

    /// Fresh connections made because the server hung up before responding
    pub reconnects: AtomicU64,

    /// Fragments handed to a consumer
    pub fragments: AtomicU64,

    /// Total payload bytes handed to a consumer
    pub bytes: AtomicU64,

    /// Sends that hit an already closed channel
    pub dropped_sends: AtomicU64,

    /// Terminal errors reported through a channel
    pub terminal_errors: AtomicU64,
}

impl BridgeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_connection(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_failure(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fragment(&self, len: usize) {
        self.fragments.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(len as u64, Ordering::Relaxed);
    }

    pub fn record_dropped_send(&self) {
        self.dropped_sends.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_terminal_error(&self) {
        self.terminal_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Average fragment size in bytes
    pub fn avg_fragment_size(&self) -> u64 {
        let bytes = self.bytes.load(Ordering::Relaxed);
        let count = self.fragments.load(Ordering::Relaxed);
        if count > 0 { bytes / count } else { 0 }
    }

    /// Get snapshot of current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections: self.connections.load(Ordering::Relaxed),
            connection_failures: self.connection_failures.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            fragments: self.fragments.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            dropped_sends: self.dropped_sends.load(Ordering::Relaxed),
            terminal_errors: self.terminal_errors.load(Ordering::Relaxed),
        }
    }

    /// Reset all metrics (useful for testing)
    pub fn reset(&self) {
        self.connections.store(0, Ordering::Relaxed);
        self.connection_failures.store(0, Ordering::Relaxed);
        self.reconnects.store(0, Ordering::Relaxed);
        self.fragments.store(0, Ordering::Relaxed);
        self.bytes.store(0, Ordering::Relaxed);
        self.dropped_sends.store(0, Ordering::Relaxed);
        self.terminal_errors.store(0, Ordering::Relaxed);
    }
}

/// Immutable snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections: u64,
    pub connection_failures: u64,
    pub reconnects: u64,
    pub fragments: u64,
    pub bytes: u64,
    pub dropped_sends: u64,
    pub terminal_errors: u64,
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Bridge Metrics: {} connections ({} failed, {} reconnects), {} fragments / {} bytes, {} dropped sends, {} errors",
            self.connections,
            self.connection_failures,
            self.reconnects,
            self.fragments,
            self.bytes,
            self.dropped_sends,
            self.terminal_errors
        )
    }
}

lazy_static::lazy_static! {
    /// Global metrics instance
    pub static ref BRIDGE_METRICS: BridgeMetrics = BridgeMetrics::new();
}
