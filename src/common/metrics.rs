//! Node metrics rendered in Prometheus text format
//!
//! Counters cover routing decisions, aggregation failures, leadership
//! transitions and received broadcasts. Queue depth and member counts are
//! passed in as gauges at render time. One registry is owned per node.

use std::sync::atomic::{AtomicU64, Ordering};

/// Outcome of a routing decision, used as a metric label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    Local,
    Redirect,
    Forward,
    Aggregate,
    Unknown,
    Unavailable,
}

impl RouteKind {
    fn label(self) -> &'static str {
        match self {
            RouteKind::Local => "local",
            RouteKind::Redirect => "redirect",
            RouteKind::Forward => "forward",
            RouteKind::Aggregate => "aggregate",
            RouteKind::Unknown => "unknown",
            RouteKind::Unavailable => "unavailable",
        }
    }

    const ALL: [RouteKind; 6] = [
        RouteKind::Local,
        RouteKind::Redirect,
        RouteKind::Forward,
        RouteKind::Aggregate,
        RouteKind::Unknown,
        RouteKind::Unavailable,
    ];
}

#[derive(Debug, Default)]
pub struct Metrics {
    routes: [AtomicU64; 6],
    aggregate_failures: AtomicU64,
    ws_sessions: AtomicU64,
    leader_transitions: AtomicU64,
    broadcasts_received: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_route(&self, kind: RouteKind) {
        let idx = RouteKind::ALL
            .iter()
            .position(|k| *k == kind)
            .unwrap_or_default();
        self.routes[idx].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_aggregate_failure(&self) {
        self.aggregate_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ws_session(&self) {
        self.ws_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_leader_transition(&self) {
        self.leader_transitions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_broadcast_received(&self) {
        self.broadcasts_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn routes(&self, kind: RouteKind) -> u64 {
        RouteKind::ALL
            .iter()
            .position(|k| *k == kind)
            .map(|idx| self.routes[idx].load(Ordering::Relaxed))
            .unwrap_or_default()
    }

    /// Render counters plus the supplied gauges as Prometheus text.
    pub fn to_prometheus(&self, gauges: &[(&str, u64)]) -> String {
        let mut out = String::new();
        out += "# TYPE fleetcoord_routes_total counter\n";
        for kind in RouteKind::ALL {
            out += &format!(
                "fleetcoord_routes_total{{kind=\"{}\"}} {}\n",
                kind.label(),
                self.routes(kind)
            );
        }
        let counters = [
            (
                "fleetcoord_aggregate_failures_total",
                &self.aggregate_failures,
            ),
            ("fleetcoord_ws_sessions_total", &self.ws_sessions),
            ("fleetcoord_leader_transitions_total", &self.leader_transitions),
            (
                "fleetcoord_broadcasts_received_total",
                &self.broadcasts_received,
            ),
        ];
        for (name, value) in counters {
            out += &format!("# TYPE {} counter\n", name);
            out += &format!("{} {}\n", name, value.load(Ordering::Relaxed));
        }
        for (name, value) in gauges {
            out += &format!("# TYPE {} gauge\n", name);
            out += &format!("{} {}\n", name, value);
        }
        out
    }
}
