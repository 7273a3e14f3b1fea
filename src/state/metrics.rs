use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;

pub struct Metrics {
    registry: Registry,

    // Plugin metrics
    pub plugin_invocations_total: IntCounterVec,
    pub plugin_faults_total: IntCounterVec,
    pub plugin_timeouts_total: IntCounter,
    pub plugin_invocation_duration: Histogram,

    // Chain metrics
    pub chain_decisions_total: IntCounterVec,
    pub chain_exhausted_total: IntCounter,
    pub chain_rewrite_passes_total: IntCounter,

    // Routing metrics
    pub routing_faults_total: IntCounterVec,
    pub fan_out_queries_total: IntCounter,
    pub fan_out_shards_total: IntCounter,
    pub intercepts_total: IntCounter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let plugin_invocations_total = IntCounterVec::new(
            Opts::new(
                "pg_router_plugin_invocations_total",
                "Total number of routing plugin invocations",
            ),
            &["plugin"],
        )
        .expect("metric creation failed");
        let plugin_faults_total = IntCounterVec::new(
            Opts::new(
                "pg_router_plugin_faults_total",
                "Total number of routing plugin faults",
            ),
            &["plugin", "kind"],
        )
        .expect("metric creation failed");
        let plugin_timeouts_total = IntCounter::new(
            "pg_router_plugin_timeouts_total",
            "Total number of routing plugin timeouts",
        )
        .expect("metric creation failed");
        let plugin_invocation_duration = Histogram::with_opts(HistogramOpts::new(
            "pg_router_plugin_invocation_duration_seconds",
            "Routing plugin invocation duration in seconds",
        ))
        .expect("metric creation failed");

        let chain_decisions_total = IntCounterVec::new(
            Opts::new(
                "pg_router_chain_decisions_total",
                "Terminal chain decisions by kind",
            ),
            &["decision"],
        )
        .expect("metric creation failed");
        let chain_exhausted_total = IntCounter::new(
            "pg_router_chain_exhausted_total",
            "Chains where no plugin made a decision",
        )
        .expect("metric creation failed");
        let chain_rewrite_passes_total = IntCounter::new(
            "pg_router_chain_rewrite_passes_total",
            "Chain restarts caused by rewritten queries",
        )
        .expect("metric creation failed");

        let routing_faults_total = IntCounterVec::new(
            Opts::new(
                "pg_router_routing_faults_total",
                "Queries rejected by the router",
            ),
            &["kind"],
        )
        .expect("metric creation failed");
        let fan_out_queries_total = IntCounter::new(
            "pg_router_fan_out_queries_total",
            "Queries sent to all shards",
        )
        .expect("metric creation failed");
        let fan_out_shards_total = IntCounter::new(
            "pg_router_fan_out_shards_total",
            "Shard executions started by fan-out queries",
        )
        .expect("metric creation failed");
        let intercepts_total = IntCounter::new(
            "pg_router_intercepts_total",
            "Queries answered with plugin-synthesized rows",
        )
        .expect("metric creation failed");

        // Register all metrics
        registry
            .register(Box::new(plugin_invocations_total.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(plugin_faults_total.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(plugin_timeouts_total.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(plugin_invocation_duration.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(chain_decisions_total.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(chain_exhausted_total.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(chain_rewrite_passes_total.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(routing_faults_total.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(fan_out_queries_total.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(fan_out_shards_total.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(intercepts_total.clone()))
            .expect("metric registration failed");

        Self {
            registry,
            plugin_invocations_total,
            plugin_faults_total,
            plugin_timeouts_total,
            plugin_invocation_duration,
            chain_decisions_total,
            chain_exhausted_total,
            chain_rewrite_passes_total,
            routing_faults_total,
            fan_out_queries_total,
            fan_out_shards_total,
            intercepts_total,
        }
    }

    pub fn record_plugin_invocation(&self, plugin_name: &str, duration: Duration) {
        self.plugin_invocations_total
            .with_label_values(&[plugin_name])
            .inc();
        self.plugin_invocation_duration
            .observe(duration.as_secs_f64());
    }

    pub fn record_plugin_fault(&self, plugin_name: &str, kind: &str) {
        self.plugin_faults_total
            .with_label_values(&[plugin_name, kind])
            .inc();
    }

    pub fn record_plugin_timeout(&self) {
        self.plugin_timeouts_total.inc();
    }

    pub fn record_decision(&self, decision: &str) {
        self.chain_decisions_total
            .with_label_values(&[decision])
            .inc();
    }

    pub fn record_exhausted(&self) {
        self.chain_exhausted_total.inc();
    }

    pub fn record_rewrite_pass(&self) {
        self.chain_rewrite_passes_total.inc();
    }

    pub fn record_routing_fault(&self, kind: &str) {
        self.routing_faults_total.with_label_values(&[kind]).inc();
    }

    pub fn record_fan_out(&self, shards: usize) {
        self.fan_out_queries_total.inc();
        self.fan_out_shards_total.inc_by(shards as u64);
    }

    pub fn record_intercept(&self) {
        self.intercepts_total.inc();
    }

    pub fn gather_metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// Prometheus text exposition of every registered metric.
    pub fn gather_text(&self) -> String {
        let mut buffer = Vec::new();
        if TextEncoder::new()
            .encode(&self.gather_metrics(), &mut buffer)
            .is_err()
        {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plugin_metrics() {
        let metrics = Metrics::new();
        metrics.record_plugin_invocation("sharding", Duration::from_millis(2));
        metrics.record_plugin_fault("sharding", "timeout");
        metrics.record_decision("forward");
        metrics.record_fan_out(4);

        assert_eq!(
            metrics
                .plugin_invocations_total
                .with_label_values(&["sharding"])
                .get(),
            1
        );
        assert_eq!(metrics.fan_out_shards_total.get(), 4);

        let text = metrics.gather_text();
        assert!(text.contains("pg_router_plugin_faults_total"));
        assert!(text.contains("decision=\"forward\""));
    }
}
