//! Metrics collection and export

use std::time::Duration;

use prometheus::{Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder};

/// Allocation and relay metrics shared by every listener of one server
pub struct TurnMetrics {
    active_allocations: Gauge,
    total_allocations: Counter,
    expired_allocations: Counter,
    allocation_duration: Histogram,
    bytes_relayed: Counter,
    packets_relayed: Counter,
    datagrams_received: Counter,
    handler_errors: Counter,
    registry: Registry,
}

impl TurnMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let active_allocations = Gauge::with_opts(Opts::new(
            "zrc_turn_active_allocations",
            "Number of active allocations",
        ))?;
        registry.register(Box::new(active_allocations.clone()))?;

        let total_allocations = Counter::with_opts(Opts::new(
            "zrc_turn_allocations_total",
            "Total number of allocations created",
        ))?;
        registry.register(Box::new(total_allocations.clone()))?;

        let expired_allocations = Counter::with_opts(Opts::new(
            "zrc_turn_allocations_expired_total",
            "Total number of allocations removed by lifetime expiry",
        ))?;
        registry.register(Box::new(expired_allocations.clone()))?;

        let allocation_duration = Histogram::with_opts(HistogramOpts::new(
            "zrc_turn_allocation_duration_seconds",
            "Allocation duration in seconds",
        ))?;
        registry.register(Box::new(allocation_duration.clone()))?;

        let bytes_relayed = Counter::with_opts(Opts::new(
            "zrc_turn_bytes_relayed_total",
            "Total bytes relayed from relay sockets to clients",
        ))?;
        registry.register(Box::new(bytes_relayed.clone()))?;

        let packets_relayed = Counter::with_opts(Opts::new(
            "zrc_turn_packets_relayed_total",
            "Total packets relayed from relay sockets to clients",
        ))?;
        registry.register(Box::new(packets_relayed.clone()))?;

        let datagrams_received = Counter::with_opts(Opts::new(
            "zrc_turn_datagrams_received_total",
            "Total datagrams read by listener dispatch loops",
        ))?;
        registry.register(Box::new(datagrams_received.clone()))?;

        let handler_errors = Counter::with_opts(Opts::new(
            "zrc_turn_handler_errors_total",
            "Total datagrams rejected by the request handler",
        ))?;
        registry.register(Box::new(handler_errors.clone()))?;

        Ok(Self {
            active_allocations,
            total_allocations,
            expired_allocations,
            allocation_duration,
            bytes_relayed,
            packets_relayed,
            datagrams_received,
            handler_errors,
            registry,
        })
    }

    pub fn record_allocation_created(&self) {
        self.total_allocations.inc();
        self.active_allocations.inc();
    }

    pub fn record_allocation_terminated(&self, duration: Duration) {
        self.active_allocations.dec();
        self.allocation_duration.observe(duration.as_secs_f64());
    }

    pub fn record_allocation_expired(&self) {
        self.expired_allocations.inc();
    }

    pub fn record_relay(&self, bytes: usize) {
        self.bytes_relayed.inc_by(bytes as f64);
        self.packets_relayed.inc();
    }

    pub fn record_datagram(&self) {
        self.datagrams_received.inc();
    }

    pub fn record_handler_error(&self) {
        self.handler_errors.inc();
    }

    /// Export Prometheus format
    pub fn export(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).to_string())
    }

    pub fn active_allocations(&self) -> f64 {
        self.active_allocations.get()
    }

    pub fn total_allocations(&self) -> f64 {
        self.total_allocations.get()
    }

    pub fn expired_allocations(&self) -> f64 {
        self.expired_allocations.get()
    }

    pub fn bytes_relayed(&self) -> f64 {
        self.bytes_relayed.get()
    }

    pub fn packets_relayed(&self) -> f64 {
        self.packets_relayed.get()
    }

    pub fn datagrams_received(&self) -> f64 {
        self.datagrams_received.get()
    }

    pub fn handler_errors(&self) -> f64 {
        self.handler_errors.get()
    }
}
