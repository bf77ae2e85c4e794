//! Gateway metrics for observability
//!
//! Provides runtime counters for monitoring tunnel health and traffic.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Gateway-wide metrics
#[derive(Debug, Default)]
pub struct GatewayMetrics {
    // Tunnel metrics
    /// Currently open viewer tunnels
    pub active_tunnels: AtomicU64,
    /// Total tunnels opened since gateway start
    pub total_tunnels: AtomicU64,
    /// Tunnels refused at connect time (bad parameters, dead engine)
    pub tunnels_refused: AtomicU64,

    // Traffic metrics
    /// Display messages forwarded to viewers
    pub messages_to_viewers: AtomicU64,
    /// Instructions received from viewers
    pub instructions_from_viewers: AtomicU64,

    /// Gateway start time (for uptime calculation)
    start_time: Option<Instant>,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    // Tunnel tracking
    pub fn tunnel_opened(&self) {
        self.active_tunnels.fetch_add(1, Ordering::Relaxed);
        self.total_tunnels.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tunnel_closed(&self) {
        self.active_tunnels.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn tunnel_refused(&self) {
        self.tunnels_refused.fetch_add(1, Ordering::Relaxed);
    }

    // Traffic tracking
    pub fn message_forwarded(&self) {
        self.messages_to_viewers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn instruction_received(&self) {
        self.instructions_from_viewers.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Create a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            tunnels: TunnelMetrics {
                active: self.active_tunnels.load(Ordering::Relaxed),
                total: self.total_tunnels.load(Ordering::Relaxed),
                refused: self.tunnels_refused.load(Ordering::Relaxed),
            },
            traffic: TrafficMetrics {
                messages_to_viewers: self.messages_to_viewers.load(Ordering::Relaxed),
                instructions_from_viewers: self.instructions_from_viewers.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub tunnels: TunnelMetrics,
    pub traffic: TrafficMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelMetrics {
    pub active: u64,
    pub total: u64,
    pub refused: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficMetrics {
    pub messages_to_viewers: u64,
    pub instructions_from_viewers: u64,
}

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
    pub started_at: String,
    pub uptime_secs: u64,
    pub tunnels: TunnelHealth,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelHealth {
    pub active: u64,
    pub total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tunnel_tracking() {
        let metrics = GatewayMetrics::new();

        metrics.tunnel_opened();
        metrics.tunnel_opened();
        assert_eq!(metrics.active_tunnels.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.total_tunnels.load(Ordering::Relaxed), 2);

        metrics.tunnel_closed();
        assert_eq!(metrics.active_tunnels.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.total_tunnels.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_refusal_tracking() {
        let metrics = GatewayMetrics::new();

        metrics.tunnel_refused();
        assert_eq!(metrics.tunnels_refused.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.total_tunnels.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_snapshot() {
        let metrics = GatewayMetrics::new();
        metrics.tunnel_opened();
        metrics.message_forwarded();
        metrics.message_forwarded();
        metrics.instruction_received();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.tunnels.active, 1);
        assert_eq!(snapshot.traffic.messages_to_viewers, 2);
        assert_eq!(snapshot.traffic.instructions_from_viewers, 1);
    }
}
