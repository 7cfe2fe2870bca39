//! Prometheus metrics of runner allocations.
//!
//! ## Metrics
//! - `slurmci_allocations_completed_total{node, tier}` - Counter
//! - `slurmci_allocated_jobs{node, tier}` - Gauge, `node` is `pending` until Slurm places the job
//! - `slurmci_job_duration_seconds{node, tier}` - Histogram
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;

/// Node label of allocations that were not placed yet.
pub const PENDING_NODE: &str = "pending";

/// Label used when the node or tier of a finished allocation is not known.
const UNKNOWN_LABEL: &str = "unknown";

const LABELS: [&str; 2] = ["node", "tier"];

const DURATION_BUCKETS: [f64; 10] = [
    30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0, 7200.0, 14400.0, 28800.0,
];

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    completed: IntCounterVec,
    allocated: IntGaugeVec,
    duration: HistogramVec,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();
        let completed = IntCounterVec::new(
            Opts::new(
                "slurmci_allocations_completed_total",
                "Number of Slurm allocations that reached a terminal state",
            ),
            &LABELS,
        )?;
        let allocated = IntGaugeVec::new(
            Opts::new(
                "slurmci_allocated_jobs",
                "Number of CI jobs with a submitted Slurm allocation",
            ),
            &LABELS,
        )?;
        let duration = HistogramVec::new(
            HistogramOpts::new(
                "slurmci_job_duration_seconds",
                "Wall-clock duration of finished Slurm allocations",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
            &LABELS,
        )?;

        registry
            .register(Box::new(completed.clone()))
            .context("Cannot register completion counter")?;
        registry
            .register(Box::new(allocated.clone()))
            .context("Cannot register allocation gauge")?;
        registry
            .register(Box::new(duration.clone()))
            .context("Cannot register duration histogram")?;

        Ok(Self {
            registry,
            completed,
            allocated,
            duration,
        })
    }

    pub fn on_allocation_submitted(&self, tier: Option<&str>) {
        self.allocated
            .with_label_values(&[PENDING_NODE, tier.unwrap_or(UNKNOWN_LABEL)])
            .inc();
    }

    pub fn on_node_assigned(&self, tier: Option<&str>, node: &str) {
        let tier = tier.unwrap_or(UNKNOWN_LABEL);
        self.allocated
            .with_label_values(&[PENDING_NODE, tier])
            .dec();
        self.allocated.with_label_values(&[node, tier]).inc();
    }

    pub fn on_allocation_finished(
        &self,
        tier: Option<&str>,
        node: Option<&str>,
        duration: Option<Duration>,
    ) {
        let tier = tier.unwrap_or(UNKNOWN_LABEL);
        self.allocated
            .with_label_values(&[node.unwrap_or(PENDING_NODE), tier])
            .dec();

        let node = node.unwrap_or(UNKNOWN_LABEL);
        self.completed.with_label_values(&[node, tier]).inc();
        if let Some(duration) = duration {
            self.duration
                .with_label_values(&[node, tier])
                .observe(duration.as_secs_f64());
        }
    }

    /// Renders all metrics in the Prometheus text format.
    pub fn encode(&self) -> anyhow::Result<String> {
        let families = self.registry.gather();
        let mut buffer = vec![];
        TextEncoder::new()
            .encode(&families, &mut buffer)
            .context("Cannot encode metrics")?;
        Ok(String::from_utf8(buffer)?)
    }
}

async fn metrics_handler(State(metrics): State<Metrics>) -> Response {
    match metrics.encode() {
        Ok(body) => ([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response(),
        Err(error) => {
            log::error!("Cannot render metrics: {error:?}");
            (StatusCode::INTERNAL_SERVER_ERROR, error.to_string()).into_response()
        }
    }
}

pub fn metrics_router(metrics: Metrics) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
}

/// Serves `GET /metrics` until the process ends.
pub async fn serve_metrics(metrics: Metrics, listener: TcpListener) -> anyhow::Result<()> {
    log::info!(
        "Serving metrics at http://{}/metrics",
        listener.local_addr()?
    );
    axum::serve(listener, metrics_router(metrics))
        .await
        .context("Metrics server failed")
}
