use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};

/// Latency buckets in seconds, from fast LAN probes up to the 5 minute
/// timeout ceiling.
const LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// All metric families exported by the engine, registered against a caller
/// supplied registry. The metric names and label sets are a public contract.
pub struct Metrics {
    registry: Registry,
    /// `hallmonitor_monitor_up{monitor,type,group}` — 1 up, 0 down.
    pub monitor_up: IntGaugeVec,
    pub http_response_time: HistogramVec,
    pub dns_response_time: HistogramVec,
    pub dns_response_code: IntCounterVec,
    pub tcp_response_time: HistogramVec,
    pub ping_response_time: HistogramVec,
    /// `hallmonitor_check_errors_total{monitor,type,group,error_type}`.
    pub check_errors: IntCounterVec,
    /// Probes currently executing in the worker pool.
    pub running_checks: IntGauge,
    /// Persistent writes discarded because the writer queue was full.
    pub dropped_writes: IntCounter,
}

impl Metrics {
    pub fn new(registry: Registry) -> Result<Metrics, prometheus::Error> {
        let monitor_up = IntGaugeVec::new(
            Opts::new("hallmonitor_monitor_up", "Monitor status (1 up, 0 down)"),
            &["monitor", "type", "group"],
        )?;
        let http_response_time = HistogramVec::new(
            HistogramOpts::new(
                "hallmonitor_http_response_time_seconds",
                "HTTP probe duration in seconds",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["monitor", "group"],
        )?;
        let dns_response_time = HistogramVec::new(
            HistogramOpts::new(
                "hallmonitor_dns_response_time_seconds",
                "DNS probe duration in seconds",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["monitor", "group", "query_type", "server"],
        )?;
        let dns_response_code = IntCounterVec::new(
            Opts::new(
                "hallmonitor_dns_response_code",
                "DNS responses by response code",
            ),
            &["monitor", "group", "query_type", "code"],
        )?;
        let tcp_response_time = HistogramVec::new(
            HistogramOpts::new(
                "hallmonitor_tcp_response_time_seconds",
                "TCP connect duration in seconds",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["monitor", "group", "port"],
        )?;
        let ping_response_time = HistogramVec::new(
            HistogramOpts::new(
                "hallmonitor_ping_response_time_seconds",
                "ICMP round-trip time in seconds",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["monitor", "group"],
        )?;
        let check_errors = IntCounterVec::new(
            Opts::new(
                "hallmonitor_check_errors_total",
                "Probe errors by error category",
            ),
            &["monitor", "type", "group", "error_type"],
        )?;
        let running_checks = IntGauge::new(
            "hallmonitor_running_checks",
            "Probes currently executing in the worker pool",
        )?;
        let dropped_writes = IntCounter::new(
            "hallmonitor_store_dropped_writes_total",
            "Persistent writes dropped due to writer queue overflow",
        )?;

        registry.register(Box::new(monitor_up.clone()))?;
        registry.register(Box::new(http_response_time.clone()))?;
        registry.register(Box::new(dns_response_time.clone()))?;
        registry.register(Box::new(dns_response_code.clone()))?;
        registry.register(Box::new(tcp_response_time.clone()))?;
        registry.register(Box::new(ping_response_time.clone()))?;
        registry.register(Box::new(check_errors.clone()))?;
        registry.register(Box::new(running_checks.clone()))?;
        registry.register(Box::new(dropped_writes.clone()))?;

        Ok(Metrics {
            registry,
            monitor_up,
            http_response_time,
            dns_response_time,
            dns_response_code,
            tcp_response_time,
            ping_response_time,
            check_errors,
            running_checks,
            dropped_writes,
        })
    }

    /// Additionally export process-level metrics (Linux only).
    #[cfg(target_os = "linux")]
    pub fn register_process_collector(&self) -> Result<(), prometheus::Error> {
        self.registry.register(Box::new(
            prometheus::process_collector::ProcessCollector::for_self(),
        ))
    }

    #[cfg(not(target_os = "linux"))]
    pub fn register_process_collector(&self) -> Result<(), prometheus::Error> {
        Ok(())
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buf = Vec::new();
        if let Err(err) = encoder.encode(&families, &mut buf) {
            tracing::error!(error = %err, "failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}
