use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Process-wide metrics registry. Operators scrape `/metrics` (wired up by
/// the caller) to get dead-letter depth and outcome breakdowns without
/// standing up a dashboard product — that stays a collaborator concern.
pub struct Metrics {
    pub registry: Registry,
    pub outcomes: IntCounterVec,
    pub dead_letter_depth: IntGaugeVec,
}

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new();

        let outcomes = IntCounterVec::new(
            Opts::new(
                "ap_intake_invoice_outcomes_total",
                "Count of invoices by terminal status",
            ),
            &["status"],
        )
        .expect("metric names are valid");
        registry
            .register(Box::new(outcomes.clone()))
            .expect("first registration of outcomes counter");

        let dead_letter_depth = IntGaugeVec::new(
            Opts::new(
                "ap_intake_dead_letter_depth",
                "Approximate depth of each dead-letter queue",
            ),
            &["queue"],
        )
        .expect("metric names are valid");
        registry
            .register(Box::new(dead_letter_depth.clone()))
            .expect("first registration of dead-letter gauge");

        Metrics {
            registry,
            outcomes,
            dead_letter_depth,
        }
    }
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

pub fn record_outcome(status: &str) {
    metrics().outcomes.with_label_values(&[status]).inc();
}

pub fn set_dead_letter_depth(queue: &str, depth: i64) {
    metrics()
        .dead_letter_depth
        .with_label_values(&[queue])
        .set(depth);
}

/// `GET /metrics`, scraped by Prometheus.
pub async fn serve_metrics() -> Response {
    let encoder = TextEncoder::new();
    let families = metrics().registry.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        tracing::error!(error = %e, "failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
        .into_response()
}
