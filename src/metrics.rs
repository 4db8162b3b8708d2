//! # Observability surface.
//!
//! One [`AgentMetrics`] struct owns every metric family the agent emits,
//! registered against a [`prometheus::Registry`] created once at startup
//! and passed down as a handle. Nothing in the crate touches a global
//! registry, so tests can register freely.
//!
//! Families, labeled by `(pod, function)` and `(pod, function, reason)`
//! where applicable:
//!
//! | metric | kind |
//! |---|---|
//! | `funcvisor_manager_active_instances` | gauge |
//! | `funcvisor_manager_total_instances` | gauge |
//! | `funcvisor_manager_instance_creations_total` | counter |
//! | `funcvisor_manager_instance_deletions_total` | counter |
//! | `funcvisor_manager_max_instances_reached_total` | counter |
//! | `funcvisor_consumer_messages_fetched_total` | counter |
//! | `funcvisor_consumer_messages_processed_total` | counter |
//! | `funcvisor_consumer_messages_failed_total` | counter |
//! | `funcvisor_consumer_poll_empty_total` | counter |
//! | `funcvisor_task_execution_duration_seconds` | histogram |
//! | `funcvisor_task_payload_size_bytes` | histogram |
//!
//! [`serve_metrics`] exposes the registry's text exposition format on a
//! read-only HTTP endpoint until the supplied token fires.

use std::net::SocketAddr;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

const NAMESPACE: &str = "funcvisor";

/// All metric families emitted by the agent.
pub struct AgentMetrics {
    pub active_instances: IntGaugeVec,
    pub total_instances: IntGaugeVec,
    pub instance_creations: IntCounterVec,
    pub instance_deletions: IntCounterVec,
    pub max_instances_reached: IntCounterVec,
    pub messages_fetched: IntCounterVec,
    pub messages_processed: IntCounterVec,
    pub messages_failed: IntCounterVec,
    pub poll_empty: IntCounterVec,
    pub execution_duration: HistogramVec,
    pub payload_size: HistogramVec,
}

impl AgentMetrics {
    /// Builds the families and registers them with `registry`.
    ///
    /// Register once per process; a second registration against the same
    /// registry fails with a duplicate-collector error.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let active_instances = IntGaugeVec::new(
            Opts::new("active_instances", "Number of active function instances")
                .namespace(NAMESPACE)
                .subsystem("manager"),
            &["pod", "function"],
        )?;
        let total_instances = IntGaugeVec::new(
            Opts::new("total_instances", "Number of pooled function instances")
                .namespace(NAMESPACE)
                .subsystem("manager"),
            &["pod"],
        )?;
        let instance_creations = IntCounterVec::new(
            Opts::new("instance_creations_total", "Total number of instance creations")
                .namespace(NAMESPACE)
                .subsystem("manager"),
            &["pod", "function"],
        )?;
        let instance_deletions = IntCounterVec::new(
            Opts::new("instance_deletions_total", "Total number of instance deletions")
                .namespace(NAMESPACE)
                .subsystem("manager"),
            &["pod", "function"],
        )?;
        let max_instances_reached = IntCounterVec::new(
            Opts::new(
                "max_instances_reached_total",
                "Total number of times the max-instances cap was hit",
            )
            .namespace(NAMESPACE)
            .subsystem("manager"),
            &["pod"],
        )?;
        let messages_fetched = IntCounterVec::new(
            Opts::new(
                "messages_fetched_total",
                "Total number of messages fetched from queues",
            )
            .namespace(NAMESPACE)
            .subsystem("consumer"),
            &["pod", "consumer_type", "function"],
        )?;
        let messages_processed = IntCounterVec::new(
            Opts::new(
                "messages_processed_total",
                "Total number of messages successfully processed",
            )
            .namespace(NAMESPACE)
            .subsystem("consumer"),
            &["pod", "function"],
        )?;
        let messages_failed = IntCounterVec::new(
            Opts::new(
                "messages_failed_total",
                "Total number of messages that failed processing",
            )
            .namespace(NAMESPACE)
            .subsystem("consumer"),
            &["pod", "function", "reason"],
        )?;
        let poll_empty = IntCounterVec::new(
            Opts::new("poll_empty_total", "Total number of empty polls")
                .namespace(NAMESPACE)
                .subsystem("consumer"),
            &["pod", "consumer_type", "function"],
        )?;
        let execution_duration = HistogramVec::new(
            HistogramOpts::new(
                "execution_duration_seconds",
                "Task execution duration in seconds",
            )
            .namespace(NAMESPACE)
            .subsystem("task"),
            &["pod", "function"],
        )?;
        let payload_size = HistogramVec::new(
            HistogramOpts::new("payload_size_bytes", "Task payload size in bytes")
                .namespace(NAMESPACE)
                .subsystem("task")
                .buckets(vec![256.0, 1024.0, 4096.0, 16384.0, 65536.0, 262144.0]),
            &["pod", "function"],
        )?;

        registry.register(Box::new(active_instances.clone()))?;
        registry.register(Box::new(total_instances.clone()))?;
        registry.register(Box::new(instance_creations.clone()))?;
        registry.register(Box::new(instance_deletions.clone()))?;
        registry.register(Box::new(max_instances_reached.clone()))?;
        registry.register(Box::new(messages_fetched.clone()))?;
        registry.register(Box::new(messages_processed.clone()))?;
        registry.register(Box::new(messages_failed.clone()))?;
        registry.register(Box::new(poll_empty.clone()))?;
        registry.register(Box::new(execution_duration.clone()))?;
        registry.register(Box::new(payload_size.clone()))?;

        Ok(Self {
            active_instances,
            total_instances,
            instance_creations,
            instance_deletions,
            max_instances_reached,
            messages_fetched,
            messages_processed,
            messages_failed,
            poll_empty,
            execution_duration,
            payload_size,
        })
    }
}

/// Serves `GET /metrics` on `addr` until `token` fires.
pub async fn serve_metrics(
    addr: SocketAddr,
    registry: Registry,
    token: CancellationToken,
) -> std::io::Result<()> {
    let app = Router::new()
        .route("/metrics", get(render_metrics))
        .with_state(registry);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(address = %addr, "metrics endpoint listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
}

async fn render_metrics(State(registry): State<Registry>) -> Response {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }
    (
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_once_succeeds() {
        let registry = Registry::new();
        let metrics = AgentMetrics::register(&registry).unwrap();
        metrics
            .messages_processed
            .with_label_values(&["pod-a", "functions/foo"])
            .inc();

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&registry.gather(), &mut buffer)
            .unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.contains("funcvisor_consumer_messages_processed_total"));
    }

    #[test]
    fn double_registration_is_rejected() {
        let registry = Registry::new();
        AgentMetrics::register(&registry).unwrap();
        assert!(AgentMetrics::register(&registry).is_err());
    }
}
