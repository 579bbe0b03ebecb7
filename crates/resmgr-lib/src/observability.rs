//! Observability infrastructure for the resource manager
//!
//! Provides:
//! - Prometheus metrics (relayed calls, event subscribers, watch reconnects,
//!   configuration and adjustment outcomes)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    HistogramVec, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Default histogram buckets for relayed call latencies (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<ResmgrMetricsInner> = OnceLock::new();

struct ResmgrMetricsInner {
    relayed_calls: IntCounterVec,
    relay_latency_seconds: HistogramVec,
    event_subscribers: IntGauge,
    evicted_subscribers: IntCounter,
    upstream_event_failures: IntCounter,
    watch_reconnects: IntCounterVec,
    config_applies: IntCounterVec,
    config_failures: IntCounterVec,
    adjustment_validation_errors: IntCounter,
}

impl ResmgrMetricsInner {
    fn new() -> Self {
        Self {
            relayed_calls: register_int_counter_vec!(
                "resmgr_relayed_calls_total",
                "Runtime calls forwarded through the relay",
                &["method", "outcome"]
            )
            .expect("Failed to register relayed_calls"),

            relay_latency_seconds: register_histogram_vec!(
                "resmgr_relay_latency_seconds",
                "Round trip time of runtime calls forwarded through the relay",
                &["method"],
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register relay_latency_seconds"),

            event_subscribers: register_int_gauge!(
                "resmgr_event_subscribers",
                "Number of live container event subscribers"
            )
            .expect("Failed to register event_subscribers"),

            evicted_subscribers: register_int_counter!(
                "resmgr_event_subscribers_evicted_total",
                "Event subscribers evicted for not draining their queue"
            )
            .expect("Failed to register evicted_subscribers"),

            upstream_event_failures: register_int_counter!(
                "resmgr_upstream_event_failures_total",
                "Upstream container event stream failures"
            )
            .expect("Failed to register upstream_event_failures"),

            watch_reconnects: register_int_counter_vec!(
                "resmgr_watch_reconnects_total",
                "Watch (re)open attempts that failed",
                &["kind"]
            )
            .expect("Failed to register watch_reconnects"),

            config_applies: register_int_counter_vec!(
                "resmgr_config_applies_total",
                "Configurations successfully activated",
                &["source"]
            )
            .expect("Failed to register config_applies"),

            config_failures: register_int_counter_vec!(
                "resmgr_config_failures_total",
                "Configurations that failed to activate",
                &["source"]
            )
            .expect("Failed to register config_failures"),

            adjustment_validation_errors: register_int_counter!(
                "resmgr_adjustment_validation_errors_total",
                "Adjustment specs rejected by validation"
            )
            .expect("Failed to register adjustment_validation_errors"),
        }
    }
}

/// Resource manager metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct ResmgrMetrics {
    _private: (),
}

impl Default for ResmgrMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ResmgrMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ResmgrMetrics")
    }
}

impl ResmgrMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ResmgrMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ResmgrMetricsInner {
        GLOBAL_METRICS.get_or_init(ResmgrMetricsInner::new)
    }

    /// Record a forwarded runtime call
    pub fn observe_relayed_call(&self, method: &str, success: bool, duration_secs: f64) {
        let outcome = if success { "ok" } else { "error" };
        let inner = self.inner();
        inner
            .relayed_calls
            .with_label_values(&[method, outcome])
            .inc();
        inner
            .relay_latency_seconds
            .with_label_values(&[method])
            .observe(duration_secs);
    }

    pub fn set_event_subscribers(&self, count: usize) {
        self.inner().event_subscribers.set(count as i64);
    }

    pub fn inc_evicted_subscribers(&self) {
        self.inner().evicted_subscribers.inc();
    }

    pub fn inc_upstream_event_failures(&self) {
        self.inner().upstream_event_failures.inc();
    }

    pub fn inc_watch_reconnects(&self, kind: &str) {
        self.inner().watch_reconnects.with_label_values(&[kind]).inc();
    }

    /// Record the outcome of activating a configuration from `source`
    pub fn record_config_apply(&self, source: &str, success: bool) {
        if success {
            self.inner().config_applies.with_label_values(&[source]).inc();
        } else {
            self.inner().config_failures.with_label_values(&[source]).inc();
        }
    }

    pub fn inc_adjustment_validation_errors(&self, count: usize) {
        self.inner()
            .adjustment_validation_errors
            .inc_by(count as u64);
    }
}

/// Structured logger for resource manager events
///
/// Provides consistent JSON-formatted logging for lifecycle and
/// configuration events.
#[derive(Clone, Debug)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    /// Log resource manager startup
    pub fn log_startup(&self, version: &str, policy: &str) {
        info!(
            event = "resmgr_started",
            node = %self.node_name,
            version = %version,
            policy = %policy,
            "Resource manager started"
        );
    }

    /// Log resource manager shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "resmgr_shutdown",
            node = %self.node_name,
            reason = %reason,
            "Resource manager shutting down"
        );
    }

    /// Log the outcome of a configuration update
    pub fn log_config_update(&self, source: &str, success: bool, error: Option<&str>) {
        if success {
            info!(
                event = "config_applied",
                node = %self.node_name,
                source = %source,
                "Configuration activated"
            );
        } else {
            warn!(
                event = "config_rejected",
                node = %self.node_name,
                source = %source,
                error = error.unwrap_or_default(),
                "Configuration rejected, keeping previous configuration"
            );
        }
    }

    /// Log the outcome of an adjustment update
    pub fn log_adjustment(&self, specs: usize, errors: usize) {
        if errors == 0 {
            info!(
                event = "adjustment_applied",
                node = %self.node_name,
                specs = specs,
                "Adjustments updated"
            );
        } else {
            warn!(
                event = "adjustment_rejected",
                node = %self.node_name,
                specs = specs,
                errors = errors,
                "Adjustment update failed"
            );
        }
    }

    /// Log a policy switch against cached state
    pub fn log_policy_switch(&self, cached: &str, active: &str) {
        warn!(
            event = "policy_switched",
            node = %self.node_name,
            cached_policy = %cached,
            active_policy = %active,
            "Switching policy, resetting cached policy state"
        );
    }

    /// Log eviction of a slow event subscriber
    pub fn log_subscriber_evicted(&self, subscriber: u64, timeout_ms: u64) {
        warn!(
            event = "subscriber_evicted",
            node = %self.node_name,
            subscriber = subscriber,
            timeout_ms = timeout_ms,
            "Evicted slow container event subscriber"
        );
    }
}
