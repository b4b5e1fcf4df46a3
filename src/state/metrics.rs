use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;
use std::time::Instant;

pub struct Metrics {
    registry: Registry,

    // Request metrics
    pub total_requests: IntCounter,
    pub failed_requests: IntCounter,
    pub request_duration: Histogram,

    // Round-trip metrics
    pub rounds_total: IntCounter,
    pub incomplete_results_total: IntCounter,
    pub terminal_results_total: IntCounter,
    pub replayed_results_total: IntCounter,
    pub rejected_tokens_total: IntCounterVec,
    pub unexpected_responses_total: IntCounter,

    // Task metrics
    pub tasks_created_total: IntCounter,
    pub tasks_expired_total: IntCounter,
    pub tasks_failed_total: IntCounter,
    pub tasks_awaiting_input: IntGauge,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let total_requests = IntCounter::new("mcp_mrtr_requests_total", "Total JSON-RPC requests")
            .expect("metric creation failed");
        let failed_requests = IntCounter::new(
            "mcp_mrtr_requests_failed",
            "JSON-RPC requests answered with an error",
        )
        .expect("metric creation failed");
        let request_duration = Histogram::with_opts(HistogramOpts::new(
            "mcp_mrtr_request_duration_seconds",
            "Request duration in seconds",
        ))
        .expect("metric creation failed");

        let rounds_total = IntCounter::new(
            "mcp_mrtr_rounds_total",
            "Tool call rounds processed by the ephemeral engine",
        )
        .expect("metric creation failed");
        let incomplete_results_total = IntCounter::new(
            "mcp_mrtr_incomplete_results_total",
            "Incomplete results returned to clients",
        )
        .expect("metric creation failed");
        let terminal_results_total = IntCounter::new(
            "mcp_mrtr_terminal_results_total",
            "Terminal tool results returned to clients",
        )
        .expect("metric creation failed");
        let replayed_results_total = IntCounter::new(
            "mcp_mrtr_replayed_results_total",
            "Terminal results served from the replay cache",
        )
        .expect("metric creation failed");
        let rejected_tokens_total = IntCounterVec::new(
            Opts::new(
                "mcp_mrtr_rejected_tokens_total",
                "Continuation tokens treated as absent",
            ),
            &["reason"],
        )
        .expect("metric creation failed");
        let unexpected_responses_total = IntCounter::new(
            "mcp_mrtr_unexpected_responses_total",
            "Input responses dropped because no request expected them",
        )
        .expect("metric creation failed");

        let tasks_created_total =
            IntCounter::new("mcp_mrtr_tasks_created_total", "Tasks created")
                .expect("metric creation failed");
        let tasks_expired_total = IntCounter::new(
            "mcp_mrtr_tasks_expired_total",
            "Tasks failed because their TTL elapsed",
        )
        .expect("metric creation failed");
        let tasks_failed_total = IntCounter::new("mcp_mrtr_tasks_failed_total", "Tasks failed")
            .expect("metric creation failed");
        let tasks_awaiting_input = IntGauge::new(
            "mcp_mrtr_tasks_awaiting_input",
            "Tasks currently in input_required",
        )
        .expect("metric creation failed");

        registry
            .register(Box::new(total_requests.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(failed_requests.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(request_duration.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(rounds_total.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(incomplete_results_total.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(terminal_results_total.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(replayed_results_total.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(rejected_tokens_total.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(unexpected_responses_total.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(tasks_created_total.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(tasks_expired_total.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(tasks_failed_total.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(tasks_awaiting_input.clone()))
            .expect("metric registration failed");

        Self {
            registry,
            total_requests,
            failed_requests,
            request_duration,
            rounds_total,
            incomplete_results_total,
            terminal_results_total,
            replayed_results_total,
            rejected_tokens_total,
            unexpected_responses_total,
            tasks_created_total,
            tasks_expired_total,
            tasks_failed_total,
            tasks_awaiting_input,
        }
    }

    pub fn record_request(&self) {
        self.total_requests.inc();
    }

    pub fn record_failed_request(&self) {
        self.failed_requests.inc();
    }

    pub fn record_request_duration(&self, duration: std::time::Duration) {
        self.request_duration.observe(duration.as_secs_f64());
    }

    pub fn record_round(&self) {
        self.rounds_total.inc();
    }

    pub fn record_incomplete(&self) {
        self.incomplete_results_total.inc();
    }

    pub fn record_terminal(&self) {
        self.terminal_results_total.inc();
    }

    pub fn record_replay(&self) {
        self.replayed_results_total.inc();
    }

    pub fn record_rejected_token(&self, reason: &str) {
        self.rejected_tokens_total.with_label_values(&[reason]).inc();
    }

    pub fn record_unexpected_responses(&self, count: usize) {
        self.unexpected_responses_total.inc_by(count as u64);
    }

    pub fn record_task_created(&self) {
        self.tasks_created_total.inc();
    }

    pub fn record_task_expired(&self) {
        self.tasks_expired_total.inc();
    }

    pub fn record_task_failed(&self) {
        self.tasks_failed_total.inc();
    }

    pub fn task_awaiting_input(&self) {
        self.tasks_awaiting_input.inc();
    }

    pub fn task_input_resolved(&self) {
        self.tasks_awaiting_input.dec();
    }

    pub fn gather_metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// Text exposition format.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.gather_metrics(), &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

pub struct RequestTimer {
    start: Instant,
    metrics: Arc<Metrics>,
}

impl RequestTimer {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        metrics.record_request();
        Self {
            start: Instant::now(),
            metrics,
        }
    }

    pub fn finish(self) {
        let duration = self.start.elapsed();
        self.metrics.record_request_duration(duration);
    }

    pub fn fail(self) {
        let duration = self.start.elapsed();
        self.metrics.record_request_duration(duration);
        self.metrics.record_failed_request();
    }
}
