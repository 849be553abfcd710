#![forbid(unsafe_code)]

// Server metrics - lock-free AtomicU64 counters and a Prometheus-compatible histogram

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

/// Upper bounds of the latency buckets, in microseconds, with their `le` labels.
const BUCKETS: [(u64, &str); 8] = [
    (500, "0.0005"),
    (1_000, "0.001"),
    (5_000, "0.005"),
    (10_000, "0.01"),
    (50_000, "0.05"),
    (100_000, "0.1"),
    (500_000, "0.5"),
    (1_000_000, "1"),
];

/// Cumulative histogram with fixed buckets.
pub struct Histogram {
    buckets: [AtomicU64; BUCKETS.len()],
    count: AtomicU64,
    sum_us: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, duration: Duration) {
        let us = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        self.sum_us.fetch_add(us, Relaxed);
        self.count.fetch_add(1, Relaxed);
        for (bucket, (bound, _)) in self.buckets.iter().zip(BUCKETS.iter()) {
            if us <= *bound {
                bucket.fetch_add(1, Relaxed);
            }
        }
    }

    fn render(&self, name: &str, help: &str, out: &mut String) {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} histogram");
        for (bucket, (_, label)) in self.buckets.iter().zip(BUCKETS.iter()) {
            let _ = writeln!(out, "{name}_bucket{{le=\"{label}\"}} {}", bucket.load(Relaxed));
        }
        let count = self.count.load(Relaxed);
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {count}");
        let sum_us = self.sum_us.load(Relaxed);
        let _ = writeln!(out, "{name}_sum {}.{:06}", sum_us / 1_000_000, sum_us % 1_000_000);
        let _ = writeln!(out, "{name}_count {count}");
    }
}

macro_rules! counters {
    ($($field:ident => $inc:ident, $help:literal;)*) => {
        #[derive(Default)]
        struct Counters {
            $($field: AtomicU64,)*
        }

        impl ServerMetrics {
            $(
                pub fn $inc(&self) {
                    self.inner.counters.$field.fetch_add(1, Relaxed);
                }
            )*

            fn render_counters(&self, out: &mut String) {
                $(
                    render_metric(
                        out,
                        concat!("conclave_", stringify!($field)),
                        $help,
                        "counter",
                        self.inner.counters.$field.load(Relaxed),
                    );
                )*
            }
        }
    };
}

counters! {
    connections_total => inc_connections_total, "Total WebSocket connections";
    messages_received_total => inc_messages_received, "Total messages received from clients";
    messages_sent_total => inc_messages_sent, "Total messages delivered to client channels";
    errors_total => inc_errors, "Total requests answered with an error";
    rooms_created_total => inc_rooms_created, "Total rooms created";
    rooms_closed_total => inc_rooms_closed, "Total rooms destroyed";
    grace_started_total => inc_grace_started, "Owner disconnects that started a grace period";
    grace_reclaimed_total => inc_grace_reclaimed, "Grace periods cancelled by a rejoin";
    grace_expired_total => inc_grace_expired, "Grace periods that destroyed their room";
    join_requests_total => inc_join_requests, "Total admission requests";
    approvals_total => inc_approvals, "Total admissions approved";
    denials_total => inc_denials, "Total admissions denied";
    producers_created_total => inc_producers_created, "Total producers registered";
    consumers_created_total => inc_consumers_created, "Total consumers created";
    chat_relayed_total => inc_chat_relayed, "Chat messages relayed to a room";
    chat_dropped_total => inc_chat_dropped, "Chat messages dropped because the sender is muted";
}

/// Server-wide metrics using lock-free atomics.
#[derive(Clone)]
pub struct ServerMetrics {
    inner: Arc<Inner>,
}

struct Inner {
    counters: Counters,
    connections_active: AtomicU64,
    message_handling: Histogram,
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                counters: Counters::default(),
                connections_active: AtomicU64::new(0),
                message_handling: Histogram::new(),
            }),
        }
    }

    /// Increments connections_active and returns a guard that decrements it on drop.
    pub fn connection_active_guard(&self) -> ConnectionGuard {
        self.inner.connections_active.fetch_add(1, Relaxed);
        ConnectionGuard {
            inner: self.inner.clone(),
        }
    }

    pub fn connections_active(&self) -> u64 {
        self.inner.connections_active.load(Relaxed)
    }

    pub fn observe_message_handling(&self, duration: Duration) {
        self.inner.message_handling.observe(duration);
    }

    /// Render all metrics in Prometheus text exposition format.
    /// Room and participant gauges come from the room registry at scrape time.
    pub fn render_prometheus(&self, rooms_active: usize, participants_active: usize) -> String {
        let mut out = String::with_capacity(4096);

        self.render_counters(&mut out);

        render_metric(&mut out, "conclave_connections_active", "Currently open WebSocket connections", "gauge", self.connections_active());
        render_metric(&mut out, "conclave_rooms_active", "Currently live rooms", "gauge", rooms_active as u64);
        render_metric(&mut out, "conclave_participants_active", "Currently admitted participants", "gauge", participants_active as u64);

        self.inner.message_handling.render(
            "conclave_message_handling_seconds",
            "Signaling request handling latency in seconds",
            &mut out,
        );

        out
    }
}

/// Decrements `connections_active` on drop, even if the connection task panics.
pub struct ConnectionGuard {
    inner: Arc<Inner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.connections_active.fetch_sub(1, Relaxed);
    }
}

fn render_metric(out: &mut String, name: &str, help: &str, kind: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
    let _ = writeln!(out, "{name} {value}");
}
