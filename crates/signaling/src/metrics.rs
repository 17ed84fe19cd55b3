//! Relay counters
//!
//! Lock-free counters for monitoring relay health, exposed by the service's
//! info endpoint.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Relay metrics collector
#[derive(Default)]
pub struct RelayMetrics {
    /// Connections accepted since startup
    connections_accepted: AtomicU64,

    /// Connections closed since startup
    connections_closed: AtomicU64,

    /// Currently open connections
    active_connections: AtomicU64,

    /// Inbound messages parsed successfully
    messages_received: AtomicU64,

    /// Inbound messages rejected as malformed
    malformed_messages: AtomicU64,

    /// Outbound messages queued to peers
    messages_relayed: AtomicU64,

    /// Per-recipient enqueue failures
    send_failures: AtomicU64,

    /// Joins refused because the room was full
    joins_rejected: AtomicU64,

    /// Stale connections superseded by a reconnect
    reconnect_evictions: AtomicU64,

    /// Connections terminated by the liveness monitor
    timeouts: AtomicU64,

    /// Empty rooms removed by the cleanup sweep
    rooms_removed: AtomicU64,

    /// Startup timestamp (unix seconds)
    startup_time: AtomicU64,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self {
            startup_time: AtomicU64::new(chrono::Utc::now().timestamp().max(0) as u64),
            ..Default::default()
        }
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
        // Saturate so a stray double-close cannot wrap the gauge
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn malformed_message(&self) {
        self.malformed_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_relayed(&self) {
        self.messages_relayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn send_failed(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn join_rejected(&self) {
        self.joins_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconnect_evicted(&self, count: u64) {
        self.reconnect_evictions.fetch_add(count, Ordering::Relaxed);
    }

    pub fn connection_timed_out(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rooms_removed(&self, count: u64) {
        self.rooms_removed.fetch_add(count, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> RelayMetricsSnapshot {
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        RelayMetricsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            malformed_messages: self.malformed_messages.load(Ordering::Relaxed),
            messages_relayed: self.messages_relayed.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            joins_rejected: self.joins_rejected.load(Ordering::Relaxed),
            reconnect_evictions: self.reconnect_evictions.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            rooms_removed: self.rooms_removed.load(Ordering::Relaxed),
            uptime_secs: now.saturating_sub(self.startup_time.load(Ordering::Relaxed)),
        }
    }
}

/// Snapshot of relay metrics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayMetricsSnapshot {
    pub connections_accepted: u64,
    pub connections_closed: u64,
    pub active_connections: u64,
    pub messages_received: u64,
    pub malformed_messages: u64,
    pub messages_relayed: u64,
    pub send_failures: u64,
    pub joins_rejected: u64,
    pub reconnect_evictions: u64,
    pub timeouts: u64,
    pub rooms_removed: u64,
    pub uptime_secs: u64,
}

impl RelayMetricsSnapshot {
    /// Share of relayed messages that could not be queued
    pub fn send_failure_rate(&self) -> f64 {
        let attempts = self.messages_relayed + self.send_failures;
        if attempts == 0 {
            0.0
        } else {
            self.send_failures as f64 / attempts as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let snapshot = RelayMetrics::new().snapshot();
        assert_eq!(snapshot.connections_accepted, 0);
        assert_eq!(snapshot.active_connections, 0);
        assert_eq!(snapshot.send_failure_rate(), 0.0);
    }

    #[test]
    fn test_connection_tracking() {
        let metrics = RelayMetrics::new();
        metrics.connection_opened();
        metrics.connection_opened();
        metrics.connection_closed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections_accepted, 2);
        assert_eq!(snapshot.connections_closed, 1);
        assert_eq!(snapshot.active_connections, 1);
    }

    #[test]
    fn test_active_gauge_never_wraps() {
        let metrics = RelayMetrics::new();
        metrics.connection_closed();
        assert_eq!(metrics.snapshot().active_connections, 0);
    }

    #[test]
    fn test_send_failure_rate() {
        let metrics = RelayMetrics::new();
        for _ in 0..3 {
            metrics.message_relayed();
        }
        metrics.send_failed();
        assert!((metrics.snapshot().send_failure_rate() - 0.25).abs() < f64::EPSILON);
    }
}
