//! Prometheus metrics served on `/metrics`

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

const NAMESPACE: &str = "node_config";

#[derive(Debug, Clone)]
pub struct Metrics {
    registry: Registry,
    reconciles: IntCounterVec,
    reconcile_errors: IntCounterVec,
    eviction_failures: IntCounter,
    drains_completed: IntCounter,
    draining: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let reconciles = IntCounterVec::new(
            Opts::new("reconciles_total", "Reconcile passes by loop and outcome").namespace(NAMESPACE),
            &["loop", "outcome"],
        )?;
        let reconcile_errors = IntCounterVec::new(
            Opts::new("reconcile_errors_total", "Failed reconcile passes by loop").namespace(NAMESPACE),
            &["loop"],
        )?;
        let eviction_failures = IntCounter::with_opts(
            Opts::new("eviction_failures_total", "Failed pod eviction attempts").namespace(NAMESPACE),
        )?;
        let drains_completed = IntCounter::with_opts(
            Opts::new("drains_completed_total", "Drains that reached DrainComplete").namespace(NAMESPACE),
        )?;
        let draining = IntGauge::with_opts(
            Opts::new("draining", "1 while this node is being drained").namespace(NAMESPACE),
        )?;

        registry.register(Box::new(reconciles.clone()))?;
        registry.register(Box::new(reconcile_errors.clone()))?;
        registry.register(Box::new(eviction_failures.clone()))?;
        registry.register(Box::new(drains_completed.clone()))?;
        registry.register(Box::new(draining.clone()))?;

        Ok(Self {
            registry,
            reconciles,
            reconcile_errors,
            eviction_failures,
            drains_completed,
            draining,
        })
    }

    pub fn record_reconcile(&self, loop_name: &str, outcome: &str) {
        self.reconciles.with_label_values(&[loop_name, outcome]).inc();
    }

    pub fn record_reconcile_error(&self, loop_name: &str) {
        self.reconcile_errors.with_label_values(&[loop_name]).inc();
    }

    pub fn record_eviction_failure(&self) {
        self.eviction_failures.inc();
    }

    pub fn set_draining(&self, draining: bool) {
        self.draining.set(i64::from(draining));
    }

    pub fn record_drain_completed(&self) {
        self.drains_completed.inc();
    }

    /// Text exposition of every registered metric
    pub fn render(&self) -> Result<String, prometheus::Error> {
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_recorded_values() {
        let metrics = Metrics::new().unwrap();
        metrics.record_reconcile("reconciler", "Converged");
        metrics.record_eviction_failure();
        metrics.set_draining(true);

        let text = metrics.render().unwrap();
        assert!(text.contains(r#"node_config_reconciles_total{loop="reconciler",outcome="Converged"} 1"#));
        assert!(text.contains("node_config_eviction_failures_total 1"));
        assert!(text.contains("node_config_draining 1"));
    }
}
