use std::sync::Arc;

use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

/// Prometheus registry shared by the scheduler, dispatcher and executors.
///
/// Cloning is cheap; every clone records into the same registry. The
/// bootstrap constructs one instance and passes it to constructors.
#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    scheduler_queued_jobs: GaugeVec,
    scheduler_running_jobs: GaugeVec,
    scheduler_blocked_threads: GaugeVec,
    scheduler_worker_faults: CounterVec,
    scheduler_rescheduled_jobs: CounterVec,
    dispatch_messages_sent: CounterVec,
    dispatch_bytes_sent: CounterVec,
    dispatch_blocked_seconds: HistogramVec,
    join_build_entries: CounterVec,
    batch_blocks: CounterVec,
    batch_time_seconds: HistogramVec,
    batch_restarts: CounterVec,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    pub fn set_scheduler_queued_jobs(&self, pool: &str, queued: u64) {
        self.inner
            .scheduler_queued_jobs
            .with_label_values(&[pool])
            .set(queued as f64);
    }

    pub fn set_scheduler_running_jobs(&self, pool: &str, running: u64) {
        self.inner
            .scheduler_running_jobs
            .with_label_values(&[pool])
            .set(running as f64);
    }

    pub fn set_scheduler_blocked_threads(&self, pool: &str, blocked: u64) {
        self.inner
            .scheduler_blocked_threads
            .with_label_values(&[pool])
            .set(blocked as f64);
    }

    pub fn inc_scheduler_worker_faults(&self, pool: &str) {
        self.inner
            .scheduler_worker_faults
            .with_label_values(&[pool])
            .inc();
    }

    pub fn inc_scheduler_rescheduled_jobs(&self, pool: &str) {
        self.inner
            .scheduler_rescheduled_jobs
            .with_label_values(&[pool])
            .inc();
    }

    pub fn record_dispatch_send(&self, unique_id: u32, messages: u64, bytes: u64) {
        let labels = [&unique_id.to_string()[..]];
        self.inner
            .dispatch_messages_sent
            .with_label_values(&labels)
            .inc_by(messages as f64);
        self.inner
            .dispatch_bytes_sent
            .with_label_values(&labels)
            .inc_by(bytes as f64);
    }

    pub fn observe_dispatch_blocked(&self, unique_id: u32, secs: f64) {
        self.inner
            .dispatch_blocked_seconds
            .with_label_values(&[&unique_id.to_string()])
            .observe(secs.max(0.0));
    }

    pub fn record_join_build(&self, unique_id: u32, joiner: u32, entries: u64) {
        self.inner
            .join_build_entries
            .with_label_values(&[&unique_id.to_string(), &joiner.to_string()])
            .inc_by(entries as f64);
    }

    pub fn record_batch_block(&self, unique_id: u32, outcome: &str, secs: f64) {
        let uid = unique_id.to_string();
        self.inner
            .batch_blocks
            .with_label_values(&[&uid, outcome])
            .inc();
        self.inner
            .batch_time_seconds
            .with_label_values(&[&uid])
            .observe(secs.max(0.0));
    }

    pub fn inc_batch_restarts(&self, unique_id: u32) {
        self.inner
            .batch_restarts
            .with_label_values(&[&unique_id.to_string()])
            .inc();
    }

    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let scheduler_queued_jobs = gauge_vec(
            &registry,
            "colex_scheduler_queued_jobs",
            "Jobs waiting in the fair scheduler",
            &["pool"],
        );
        let scheduler_running_jobs = gauge_vec(
            &registry,
            "colex_scheduler_running_jobs",
            "Jobs currently executing",
            &["pool"],
        );
        let scheduler_blocked_threads = gauge_vec(
            &registry,
            "colex_scheduler_blocked_threads",
            "Worker threads blocked on a full send queue",
            &["pool"],
        );
        let scheduler_worker_faults = counter_vec(
            &registry,
            "colex_scheduler_worker_faults_total",
            "Worker threads that exited on a job failure",
            &["pool"],
        );
        let scheduler_rescheduled_jobs = counter_vec(
            &registry,
            "colex_scheduler_rescheduled_jobs_total",
            "Jobs that asked to be rescheduled",
            &["pool"],
        );

        let dispatch_messages_sent = counter_vec(
            &registry,
            "colex_dispatch_messages_sent_total",
            "Result messages written to consumer connections",
            &["unique_id"],
        );
        let dispatch_bytes_sent = counter_vec(
            &registry,
            "colex_dispatch_bytes_sent_total",
            "Result bytes written to consumer connections",
            &["unique_id"],
        );
        let dispatch_blocked_seconds = histogram_vec(
            &registry,
            "colex_dispatch_blocked_seconds",
            "Time producers spent blocked on the send queue caps",
            &["unique_id"],
        );

        let join_build_entries = counter_vec(
            &registry,
            "colex_join_build_entries_total",
            "Entries inserted into join tables",
            &["unique_id", "joiner"],
        );

        let batch_blocks = counter_vec(
            &registry,
            "colex_batch_blocks_total",
            "Blocks processed by batch executors",
            &["unique_id", "outcome"],
        );
        let batch_time_seconds = histogram_vec(
            &registry,
            "colex_batch_time_seconds",
            "Time spent executing one block",
            &["unique_id"],
        );
        let batch_restarts = counter_vec(
            &registry,
            "colex_batch_restarts_total",
            "Batch runs restarted after stale metadata",
            &["unique_id"],
        );

        Self {
            registry,
            scheduler_queued_jobs,
            scheduler_running_jobs,
            scheduler_blocked_threads,
            scheduler_worker_faults,
            scheduler_rescheduled_jobs,
            dispatch_messages_sent,
            dispatch_bytes_sent,
            dispatch_blocked_seconds,
            join_build_entries,
            batch_blocks,
            batch_time_seconds,
            batch_restarts,
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

fn histogram_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    let h = HistogramVec::new(HistogramOpts::new(name, help), labels).expect("histogram vec");
    registry
        .register(Box::new(h.clone()))
        .expect("register histogram");
    h
}
