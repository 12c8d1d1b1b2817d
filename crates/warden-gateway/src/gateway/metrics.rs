//! Gateway metrics on a private Prometheus registry.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `warden_authentication_success_total` | Counter | |
//! | `warden_authentication_failure_total` | Counter | |
//! | `warden_errors_total` | Counter | `op`, `type` |
//! | `warden_active_clients` | Gauge | |
//! | `warden_authentication_duration_seconds` | Histogram | |
//!
//! Recording never fails and never alters control flow.

use crate::gateway::types::{GatewayError, GatewayErrorKind, GatewayResult};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::core::Collector;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Histogram buckets for credential validation time, in seconds.
pub const AUTHENTICATION_BUCKETS: &[f64] =
    &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

fn registration(e: prometheus::Error) -> GatewayError {
    GatewayError::new(GatewayErrorKind::Internal, "failed to register metric")
        .with_detail(e.to_string())
}

#[derive(Clone)]
pub struct GatewayMetrics {
    registry: Registry,
    auth_success: IntCounter,
    auth_failure: IntCounter,
    /// Errors by operation and error kind.
    errors: IntCounterVec,
    active_clients: IntGauge,
    auth_duration: Histogram,
}

/// Point-in-time copy of every metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub authentication_success: u64,
    pub authentication_failure: u64,
    /// Sum over every `op`/`type` pair.
    pub errors: u64,
    pub active_clients: u64,
    pub authentication_duration_sum: f64,
    pub authentication_duration_count: u64,
}

impl GatewayMetrics {
    /// Create the metrics and register them with a fresh registry.
    pub fn new() -> GatewayResult<Self> {
        let registry = Registry::new();

        let auth_success = IntCounter::with_opts(Opts::new(
            "warden_authentication_success_total",
            "Number of successful client authentications",
        ))
        .map_err(registration)?;
        registry
            .register(Box::new(auth_success.clone()))
            .map_err(registration)?;

        let auth_failure = IntCounter::with_opts(Opts::new(
            "warden_authentication_failure_total",
            "Number of authentications rejected by the identity provider",
        ))
        .map_err(registration)?;
        registry
            .register(Box::new(auth_failure.clone()))
            .map_err(registration)?;

        let errors = IntCounterVec::new(
            Opts::new("warden_errors_total", "Number of internal and agent errors"),
            &["op", "type"],
        )
        .map_err(registration)?;
        registry
            .register(Box::new(errors.clone()))
            .map_err(registration)?;

        let active_clients = IntGauge::with_opts(Opts::new(
            "warden_active_clients",
            "Number of connected clients",
        ))
        .map_err(registration)?;
        registry
            .register(Box::new(active_clients.clone()))
            .map_err(registration)?;

        let auth_duration = Histogram::with_opts(
            HistogramOpts::new(
                "warden_authentication_duration_seconds",
                "Time spent validating client credentials with the identity provider",
            )
            .buckets(AUTHENTICATION_BUCKETS.to_vec()),
        )
        .map_err(registration)?;
        registry
            .register(Box::new(auth_duration.clone()))
            .map_err(registration)?;

        Ok(Self {
            registry,
            auth_success,
            auth_failure,
            errors,
            active_clients,
            auth_duration,
        })
    }

    pub fn auth_succeeded(&self, elapsed: Duration) {
        self.auth_success.inc();
        self.auth_duration.observe(elapsed.as_secs_f64());
    }

    pub fn auth_failed(&self) {
        self.auth_failure.inc();
    }

    /// Count one error of `kind` raised while running `op`.
    pub fn error(&self, op: &str, kind: GatewayErrorKind) {
        let kind = format!("{:?}", kind);
        self.errors.with_label_values(&[op, &kind]).inc();
    }

    pub fn error_count(&self, op: &str, kind: GatewayErrorKind) -> u64 {
        let kind = format!("{:?}", kind);
        self.errors.with_label_values(&[op, &kind]).get()
    }

    /// Track the registry size after a commit or teardown.
    pub fn set_active_clients(&self, n: usize) {
        self.active_clients.set(n as i64);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let errors = self
            .errors
            .collect()
            .iter()
            .flat_map(|family| family.get_metric())
            .map(|m| m.get_counter().get_value() as u64)
            .sum();
        MetricsSnapshot {
            authentication_success: self.auth_success.get(),
            authentication_failure: self.auth_failure.get(),
            errors,
            active_clients: self.active_clients.get().max(0) as u64,
            authentication_duration_sum: self.auth_duration.get_sample_sum(),
            authentication_duration_count: self.auth_duration.get_sample_count(),
        }
    }

    /// Encode every registered family in the text exposition format.
    pub fn render(&self) -> GatewayResult<String> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&families, &mut buffer).map_err(|e| {
            GatewayError::new(GatewayErrorKind::Internal, "failed to encode metrics")
                .with_detail(e.to_string())
        })?;
        String::from_utf8(buffer).map_err(|e| {
            GatewayError::new(GatewayErrorKind::Internal, "failed to encode metrics")
                .with_detail(e.to_string())
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// `GET /metrics` router for the metrics listener.
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/metrics", get(serve_metrics))
            .with_state(self)
    }
}

async fn serve_metrics(State(metrics): State<Arc<GatewayMetrics>>) -> impl IntoResponse {
    match metrics.render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, TextEncoder::new().format_type().to_string())],
            body,
        ),
        Err(e) => {
            warn!(error = %e, "metrics scrape failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/plain".to_string())],
                e.to_string(),
            )
        }
    }
}
