//! Prometheus-compatible metrics endpoint
//!
//! Exposes sync server metrics in Prometheus text format, or JSON.
//! Default endpoint: http://localhost:9090/metrics

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::game::input_buffer::InputDisposition;

const TICK_HISTORY: usize = 1000;

/// Metrics registry shared by every room and connection
#[derive(Debug)]
pub struct Metrics {
    // Gauges
    pub rooms_active: AtomicU64,
    pub entities: AtomicU64,
    pub connections_active: AtomicU64,

    // Tick timing (microseconds)
    pub tick_time_us: AtomicU64,
    pub tick_time_p95_us: AtomicU64,
    pub tick_time_p99_us: AtomicU64,
    pub tick_time_max_us: AtomicU64,
    pub tick_count: AtomicU64,

    // Input pipeline
    pub inputs_accepted: AtomicU64,
    pub inputs_stale: AtomicU64,
    pub inputs_throttled: AtomicU64,
    pub inputs_rejected: AtomicU64,

    // Snapshots
    pub snapshots_full: AtomicU64,
    pub snapshots_delta: AtomicU64,
    pub frames_dropped: AtomicU64,

    // Network
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,

    pub divergence_reports: AtomicU64,

    start_time: Instant,

    // Rolling tick times for percentiles
    tick_history: RwLock<VecDeque<u64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            rooms_active: AtomicU64::new(0),
            entities: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            tick_time_us: AtomicU64::new(0),
            tick_time_p95_us: AtomicU64::new(0),
            tick_time_p99_us: AtomicU64::new(0),
            tick_time_max_us: AtomicU64::new(0),
            tick_count: AtomicU64::new(0),
            inputs_accepted: AtomicU64::new(0),
            inputs_stale: AtomicU64::new(0),
            inputs_throttled: AtomicU64::new(0),
            inputs_rejected: AtomicU64::new(0),
            snapshots_full: AtomicU64::new(0),
            snapshots_delta: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            divergence_reports: AtomicU64::new(0),
            start_time: Instant::now(),
            tick_history: RwLock::new(VecDeque::with_capacity(TICK_HISTORY)),
        }
    }

    /// Record a tick time and update percentiles
    pub fn record_tick_time(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.tick_time_us.store(us, Ordering::Relaxed);
        self.tick_count.fetch_add(1, Ordering::Relaxed);

        let mut history = self.tick_history.write();
        history.push_back(us);
        while history.len() > TICK_HISTORY {
            history.pop_front();
        }

        if history.len() >= 10 {
            let mut sorted: Vec<u64> = history.iter().copied().collect();
            sorted.sort_unstable();

            let p95_idx = (sorted.len() as f32 * 0.95) as usize;
            let p99_idx = (sorted.len() as f32 * 0.99) as usize;

            self.tick_time_p95_us.store(sorted[p95_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.tick_time_p99_us.store(sorted[p99_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.tick_time_max_us.store(sorted.last().copied().unwrap_or(0), Ordering::Relaxed);
        }
    }

    /// Count one input disposition. Duplicates are folded into stale.
    pub fn record_input(&self, disposition: &InputDisposition) {
        let counter = match disposition {
            InputDisposition::Accepted => &self.inputs_accepted,
            InputDisposition::Stale | InputDisposition::Duplicate => &self.inputs_stale,
            InputDisposition::Throttled => &self.inputs_throttled,
            InputDisposition::Rejected(_) => &self.inputs_rejected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sent(&self, bytes: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Move a shared gauge by the change in one contributor's value
    pub fn shift_gauge(gauge: &AtomicU64, from: u64, to: u64) {
        if to >= from {
            gauge.fetch_add(to - from, Ordering::Relaxed);
        } else {
            let delta = from - to;
            let _ = gauge.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(delta))
            });
        }
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-format metrics output
    pub fn to_prometheus(&self) -> String {
        let mut output = String::with_capacity(4096);

        macro_rules! metric {
            ($name:expr, $help:expr, $type:expr, $value:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $name, $help, $name, $type, $name, $value
                ));
            };
        }

        metric!("outpost_sync_rooms_active", "Rooms with a running tick loop", "gauge",
            self.rooms_active.load(Ordering::Relaxed));
        metric!("outpost_sync_entities", "Entities across all rooms", "gauge",
            self.entities.load(Ordering::Relaxed));
        metric!("outpost_sync_connections_active", "Open client connections", "gauge",
            self.connections_active.load(Ordering::Relaxed));

        metric!("outpost_sync_tick_time_microseconds", "Last tick time in microseconds", "gauge",
            self.tick_time_us.load(Ordering::Relaxed));
        metric!("outpost_sync_tick_time_p95_microseconds", "95th percentile tick time", "gauge",
            self.tick_time_p95_us.load(Ordering::Relaxed));
        metric!("outpost_sync_tick_time_p99_microseconds", "99th percentile tick time", "gauge",
            self.tick_time_p99_us.load(Ordering::Relaxed));
        metric!("outpost_sync_tick_time_max_microseconds", "Maximum tick time", "gauge",
            self.tick_time_max_us.load(Ordering::Relaxed));
        metric!("outpost_sync_tick_count", "Total ticks processed", "counter",
            self.tick_count.load(Ordering::Relaxed));

        metric!("outpost_sync_inputs_accepted_total", "Input commands accepted", "counter",
            self.inputs_accepted.load(Ordering::Relaxed));
        metric!("outpost_sync_inputs_stale_total", "Stale or duplicate input commands", "counter",
            self.inputs_stale.load(Ordering::Relaxed));
        metric!("outpost_sync_inputs_throttled_total", "Throttled input commands", "counter",
            self.inputs_throttled.load(Ordering::Relaxed));
        metric!("outpost_sync_inputs_rejected_total", "Rejected input commands", "counter",
            self.inputs_rejected.load(Ordering::Relaxed));

        metric!("outpost_sync_snapshots_full_total", "Full snapshots sent", "counter",
            self.snapshots_full.load(Ordering::Relaxed));
        metric!("outpost_sync_snapshots_delta_total", "Delta snapshots sent", "counter",
            self.snapshots_delta.load(Ordering::Relaxed));
        metric!("outpost_sync_frames_dropped_total", "Outbound frames dropped on full queues", "counter",
            self.frames_dropped.load(Ordering::Relaxed));

        metric!("outpost_sync_messages_sent_total", "Total messages sent", "counter",
            self.messages_sent.load(Ordering::Relaxed));
        metric!("outpost_sync_messages_received_total", "Total messages received", "counter",
            self.messages_received.load(Ordering::Relaxed));
        metric!("outpost_sync_bytes_sent_total", "Total bytes sent", "counter",
            self.bytes_sent.load(Ordering::Relaxed));
        metric!("outpost_sync_bytes_received_total", "Total bytes received", "counter",
            self.bytes_received.load(Ordering::Relaxed));

        metric!("outpost_sync_divergence_reports_total", "Client predictions diverging past the report threshold", "counter",
            self.divergence_reports.load(Ordering::Relaxed));
        metric!("outpost_sync_uptime_seconds", "Server uptime in seconds", "counter",
            self.uptime_seconds());

        output
    }

    /// Generate JSON format metrics
    pub fn to_json(&self) -> String {
        let load = |v: &AtomicU64| v.load(Ordering::Relaxed);
        serde_json::json!({
            "gauges": {
                "rooms": load(&self.rooms_active),
                "entities": load(&self.entities),
                "connections": load(&self.connections_active),
            },
            "tick": {
                "time_us": load(&self.tick_time_us),
                "p95_us": load(&self.tick_time_p95_us),
                "p99_us": load(&self.tick_time_p99_us),
                "max_us": load(&self.tick_time_max_us),
                "count": load(&self.tick_count),
            },
            "inputs": {
                "accepted": load(&self.inputs_accepted),
                "stale": load(&self.inputs_stale),
                "throttled": load(&self.inputs_throttled),
                "rejected": load(&self.inputs_rejected),
            },
            "snapshots": {
                "full": load(&self.snapshots_full),
                "delta": load(&self.snapshots_delta),
                "frames_dropped": load(&self.frames_dropped),
            },
            "network": {
                "messages_sent": load(&self.messages_sent),
                "messages_received": load(&self.messages_received),
                "bytes_sent": load(&self.bytes_sent),
                "bytes_received": load(&self.bytes_received),
            },
            "divergence_reports": load(&self.divergence_reports),
            "uptime_seconds": self.uptime_seconds(),
        })
        .to_string()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the metrics HTTP server
pub async fn start_metrics_server(metrics: Arc<Metrics>, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        let (mut socket, peer) = listener.accept().await?;
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 1024];

            match socket.read(&mut buffer).await {
                Ok(n) if n > 0 => {
                    let request = String::from_utf8_lossy(&buffer[..n]);
                    let response = respond(&metrics, &request);
                    if let Err(e) = socket.write_all(response.as_bytes()).await {
                        debug!("Failed to write metrics response to {}: {}", peer, e);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("Failed to read from metrics socket {}: {}", peer, e);
                }
            }
        });
    }
}

fn respond(metrics: &Metrics, request: &str) -> String {
    let path = request
        .lines()
        .next()
        .and_then(|line| line.strip_prefix("GET "))
        .and_then(|rest| rest.split_whitespace().next());

    let (content_type, body) = match path {
        Some("/metrics/json") | Some("/json") => ("application/json", metrics.to_json()),
        Some("/metrics") => ("text/plain; version=0.0.4", metrics.to_prometheus()),
        Some("/health") | Some("/") => ("text/plain", "OK".to_string()),
        _ => {
            return "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                .to_string()
        }
    };
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        content_type,
        body.len(),
        body
    )
}
