//! Lightweight Prometheus-compatible metrics for the peer engine.
//!
//! Uses atomic counters for lock-free instrumentation. Renders metrics in
//! Prometheus text exposition format so a host application can expose them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Counters maintained by one [`AsyncPeer`](crate::peer::AsyncPeer).
#[derive(Debug)]
pub struct PeerMetrics {
    /// Currently tagged peer links (gauge)
    pub active_links: AtomicU64,
    /// Packed messages handed to the transport (counter)
    pub packets_sent: AtomicU64,
    /// Messages unpacked and dispatched (counter)
    pub packets_received: AtomicU64,
    /// Inbound messages that failed to unpack (counter)
    pub unpack_errors: AtomicU64,
    /// Commands parked while their link was being established (counter)
    pub commands_buffered: AtomicU64,
    /// Link handshakes completed (counter)
    pub handshakes_total: AtomicU64,
    /// Errors reported through the session (counter)
    pub async_errors: AtomicU64,
    /// Engine creation time (for uptime calculation)
    pub start_time: Instant,
}

impl PeerMetrics {
    pub fn new() -> Self {
        Self {
            active_links: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            unpack_errors: AtomicU64::new(0),
            commands_buffered: AtomicU64::new(0),
            handshakes_total: AtomicU64::new(0),
            async_errors: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn decr(counter: &AtomicU64) {
        let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    /// Render metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let uptime = self.start_time.elapsed().as_secs();
        format!(
            "# HELP peer_active_links Current number of tagged peer links\n\
             # TYPE peer_active_links gauge\n\
             peer_active_links {}\n\
             # HELP peer_packets_sent_total Packed messages handed to the transport\n\
             # TYPE peer_packets_sent_total counter\n\
             peer_packets_sent_total {}\n\
             # HELP peer_packets_received_total Messages unpacked and dispatched\n\
             # TYPE peer_packets_received_total counter\n\
             peer_packets_received_total {}\n\
             # HELP peer_unpack_errors_total Inbound messages that failed to unpack\n\
             # TYPE peer_unpack_errors_total counter\n\
             peer_unpack_errors_total {}\n\
             # HELP peer_commands_buffered_total Commands parked awaiting a link\n\
             # TYPE peer_commands_buffered_total counter\n\
             peer_commands_buffered_total {}\n\
             # HELP peer_handshakes_total Link handshakes completed\n\
             # TYPE peer_handshakes_total counter\n\
             peer_handshakes_total {}\n\
             # HELP peer_async_errors_total Errors reported to the session\n\
             # TYPE peer_async_errors_total counter\n\
             peer_async_errors_total {}\n\
             # HELP peer_uptime_seconds Engine uptime in seconds\n\
             # TYPE peer_uptime_seconds gauge\n\
             peer_uptime_seconds {}\n",
            self.active_links.load(Ordering::Relaxed),
            self.packets_sent.load(Ordering::Relaxed),
            self.packets_received.load(Ordering::Relaxed),
            self.unpack_errors.load(Ordering::Relaxed),
            self.commands_buffered.load(Ordering::Relaxed),
            self.handshakes_total.load(Ordering::Relaxed),
            self.async_errors.load(Ordering::Relaxed),
            uptime,
        )
    }
}

impl Default for PeerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_render_format() {
        let m = PeerMetrics::new();
        m.packets_sent.fetch_add(5, Ordering::Relaxed);
        m.commands_buffered.fetch_add(2, Ordering::Relaxed);
        let output = m.render();
        assert!(output.contains("peer_packets_sent_total 5"));
        assert!(output.contains("peer_commands_buffered_total 2"));
        assert!(output.contains("peer_active_links 0"));
        assert!(output.contains("# TYPE peer_uptime_seconds gauge"));
    }

    #[test]
    fn test_gauge_never_underflows() {
        let m = PeerMetrics::new();
        PeerMetrics::decr(&m.active_links);
        assert_eq!(m.active_links.load(Ordering::Relaxed), 0);

        PeerMetrics::incr(&m.active_links);
        PeerMetrics::incr(&m.active_links);
        PeerMetrics::decr(&m.active_links);
        assert_eq!(m.active_links.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_metrics_render_prometheus_format() {
        let output = PeerMetrics::new().render();
        for name in [
            "peer_packets_sent_total",
            "peer_packets_received_total",
            "peer_unpack_errors_total",
            "peer_commands_buffered_total",
            "peer_handshakes_total",
            "peer_async_errors_total",
        ] {
            assert!(output.contains(&format!("# HELP {}", name)));
            assert!(output.contains(&format!("# TYPE {} counter", name)));
        }
    }
}
