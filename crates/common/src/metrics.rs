use std::sync::{Arc, OnceLock};

use prometheus::{CounterVec, Encoder, GaugeVec, Opts, Registry, TextEncoder};

#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    plans_built: CounterVec,
    planner_not_applicable: CounterVec,
    job_contexts_opened: CounterVec,
    job_contexts_finished: CounterVec,
    job_contexts_active: GaugeVec,
    sub_contexts_registered: CounterVec,
    sub_context_duplicates: CounterVec,
    sub_context_close_failures: CounterVec,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    /// `kind` is the root plan variant, e.g. `NestedLoop` or `NoOp`.
    pub fn inc_plans_built(&self, planner: &str, kind: &str) {
        self.inner
            .plans_built
            .with_label_values(&[planner, kind])
            .inc();
    }

    pub fn inc_planner_not_applicable(&self, planner: &str) {
        self.inner
            .planner_not_applicable
            .with_label_values(&[planner])
            .inc();
    }

    pub fn inc_job_contexts_opened(&self, node_id: &str) {
        self.inner
            .job_contexts_opened
            .with_label_values(&[node_id])
            .inc();
        self.inner
            .job_contexts_active
            .with_label_values(&[node_id])
            .inc();
    }

    /// `outcome` is `closed` or `killed`.
    pub fn inc_job_contexts_finished(&self, node_id: &str, outcome: &str) {
        self.inner
            .job_contexts_finished
            .with_label_values(&[node_id, outcome])
            .inc();
        self.inner
            .job_contexts_active
            .with_label_values(&[node_id])
            .dec();
    }

    pub fn inc_sub_contexts_registered(&self, node_id: &str) {
        self.inner
            .sub_contexts_registered
            .with_label_values(&[node_id])
            .inc();
    }

    pub fn inc_sub_context_duplicates(&self, node_id: &str) {
        self.inner
            .sub_context_duplicates
            .with_label_values(&[node_id])
            .inc();
    }

    pub fn inc_sub_context_close_failures(&self, node_id: &str) {
        self.inner
            .sub_context_close_failures
            .with_label_values(&[node_id])
            .inc();
    }

    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let plans_built = counter_vec(
            &registry,
            "nlq_plans_built_total",
            "Physical plans produced per planner and root plan kind",
            &["planner", "kind"],
        );
        let planner_not_applicable = counter_vec(
            &registry,
            "nlq_planner_not_applicable_total",
            "Planner invocations that deferred to another strategy",
            &["planner"],
        );

        let job_contexts_opened = counter_vec(
            &registry,
            "nlq_job_contexts_opened_total",
            "Job collect contexts created",
            &["node_id"],
        );
        let job_contexts_finished = counter_vec(
            &registry,
            "nlq_job_contexts_finished_total",
            "Job collect contexts torn down",
            &["node_id", "outcome"],
        );
        let job_contexts_active = gauge_vec(
            &registry,
            "nlq_job_contexts_active",
            "Job collect contexts currently open",
            &["node_id"],
        );

        let sub_contexts_registered = counter_vec(
            &registry,
            "nlq_sub_contexts_registered_total",
            "Sub-contexts registered with job collect contexts",
            &["node_id"],
        );
        let sub_context_duplicates = counter_vec(
            &registry,
            "nlq_sub_context_duplicates_total",
            "Rejected duplicate sub-context registrations",
            &["node_id"],
        );
        let sub_context_close_failures = counter_vec(
            &registry,
            "nlq_sub_context_close_failures_total",
            "Sub-contexts whose close failed during teardown",
            &["node_id"],
        );

        Self {
            registry,
            plans_built,
            planner_not_applicable,
            job_contexts_opened,
            job_contexts_finished,
            job_contexts_active,
            sub_contexts_registered,
            sub_context_duplicates,
            sub_context_close_failures,
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let c = CounterVec::new(Opts::new(name, help), labels).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> GaugeVec {
    let g = GaugeVec::new(Opts::new(name, help), labels).expect("gauge vec");
    registry
        .register(Box::new(g.clone()))
        .expect("register gauge");
    g
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}

#[cfg(test)]
mod tests {
    use super::MetricsRegistry;

    #[test]
    fn renders_planner_and_context_families() {
        let m = MetricsRegistry::new();
        m.inc_plans_built("cross_join", "NestedLoop");
        m.inc_planner_not_applicable("cross_join");
        m.inc_job_contexts_opened("n1");
        m.inc_sub_contexts_registered("n1");
        m.inc_sub_context_duplicates("n1");
        m.inc_sub_context_close_failures("n1");
        m.inc_job_contexts_finished("n1", "killed");
        let text = m.render_prometheus();

        assert!(text.contains("nlq_plans_built_total"));
        assert!(text.contains("NestedLoop"));
        assert!(text.contains("nlq_planner_not_applicable_total"));
        assert!(text.contains("nlq_job_contexts_opened_total"));
        assert!(text.contains("nlq_job_contexts_finished_total"));
        assert!(text.contains("killed"));
        assert!(text.contains("nlq_job_contexts_active"));
        assert!(text.contains("nlq_sub_contexts_registered_total"));
        assert!(text.contains("nlq_sub_context_duplicates_total"));
        assert!(text.contains("nlq_sub_context_close_failures_total"));
    }
}
