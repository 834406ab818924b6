//! Controller metrics
//!
//! One registry for every controller in the process, rendered in the
//! Prometheus text format by `gather_controller_metrics`.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

lazy_static! {
    /// Controller metrics registry
    pub static ref CONTROLLER_METRICS_REGISTRY: Registry = Registry::new();

    /// Reconciliation duration per controller
    static ref RECONCILIATION_DURATION: HistogramVec = {
        let opts = HistogramOpts::new(
            "sidelink_reconciliation_duration_seconds",
            "Reconciliation duration in seconds",
        );
        let histogram = HistogramVec::new(opts, &["controller", "namespace"])
            .expect("Failed to create histogram");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(histogram.clone()))
            .expect("Failed to register histogram");
        histogram
    };

    /// Reconciliations total per controller and result
    static ref RECONCILIATIONS_TOTAL: IntCounterVec = {
        let opts = Opts::new(
            "sidelink_reconciliations_total",
            "Total number of reconciliations",
        );
        let counter = IntCounterVec::new(opts, &["controller", "namespace", "result"])
            .expect("Failed to create counter");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };

    /// Table ids currently held by pods
    static ref TABLE_IDS_ALLOCATED: IntGauge = {
        let gauge = IntGauge::new(
            "sidelink_table_ids_allocated",
            "Number of policy routing table ids currently assigned",
        )
        .expect("Failed to create gauge");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(gauge.clone()))
            .expect("Failed to register gauge");
        gauge
    };

    /// EndpointSlice writes (apply or delete)
    static ref ENDPOINTSLICE_WRITES_TOTAL: IntCounterVec = {
        let opts = Opts::new(
            "sidelink_endpointslice_writes_total",
            "Total number of EndpointSlice writes",
        );
        let counter = IntCounterVec::new(opts, &["operation"])
            .expect("Failed to create counter");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };

    /// Routing daemon restarts
    static ref DAEMON_RESTARTS_TOTAL: IntCounter = {
        let counter = IntCounter::new(
            "sidelink_routing_daemon_restarts_total",
            "Total number of routing daemon restarts",
        )
        .expect("Failed to create counter");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };

    /// Full resyncs pushed to the routing daemon
    static ref DAEMON_RESYNCS_TOTAL: IntCounterVec = {
        let opts = Opts::new(
            "sidelink_routing_daemon_resyncs_total",
            "Total number of full resyncs pushed to the routing daemon",
        );
        let counter = IntCounterVec::new(opts, &["result"])
            .expect("Failed to create counter");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };
}

/// Record one reconciliation of `controller`
pub fn record_reconciliation(controller: &str, namespace: &str, duration_secs: f64, result: &str) {
    RECONCILIATION_DURATION
        .with_label_values(&[controller, namespace])
        .observe(duration_secs);

    RECONCILIATIONS_TOTAL
        .with_label_values(&[controller, namespace, result])
        .inc();
}

pub fn set_table_ids_allocated(count: usize) {
    TABLE_IDS_ALLOCATED.set(count as i64);
}

pub fn record_endpointslice_write(operation: &str) {
    ENDPOINTSLICE_WRITES_TOTAL
        .with_label_values(&[operation])
        .inc();
}

pub fn record_daemon_restart() {
    DAEMON_RESTARTS_TOTAL.inc();
}

pub fn record_daemon_resync(result: &str) {
    DAEMON_RESYNCS_TOTAL.with_label_values(&[result]).inc();
}

/// Gather controller metrics
pub fn gather_controller_metrics() -> Result<String, String> {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = CONTROLLER_METRICS_REGISTRY.gather();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("Failed to convert to UTF-8: {}", e))
}
