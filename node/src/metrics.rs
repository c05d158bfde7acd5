//! # Prometheus Metrics
//!
//! Operational metrics for the node, scraped at `/metrics`.
//!
//! All metrics live in a dedicated [`prometheus::Registry`] so they do not
//! collide with any default global registry consumers.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

use tessera_protocol::network::{CatchupOutcome, NodeState};

#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    /// Peers that completed the hello handshake.
    pub connected_peers: IntGauge,
    /// Peers in the peer map, connected or not.
    pub known_peers: IntGauge,
    /// Height of the local chain head.
    pub block_height: IntGauge,
    /// Lifecycle state as its ordinal (Booting = 0 ... Stopped = 5).
    pub node_state: IntGauge,
    pub catchup_runs_total: IntCounter,
    pub catchup_failures_total: IntCounter,
    pub catchup_blocks_applied_total: IntCounter,
}

fn gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let metric = IntGauge::new(name, help).expect("metric creation");
    registry
        .register(Box::new(metric.clone()))
        .expect("metric registration");
    metric
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let metric = IntCounter::new(name, help).expect("metric creation");
    registry
        .register(Box::new(metric.clone()))
        .expect("metric registration");
    metric
}

impl NodeMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> Self {
        let registry = Registry::new_custom(Some("tessera".into()), None)
            .expect("failed to create prometheus registry");

        Self {
            connected_peers: gauge(&registry, "connected_peers", "Peers with a completed hello"),
            known_peers: gauge(&registry, "known_peers", "Peers in the peer map"),
            block_height: gauge(&registry, "block_height", "Height of the local chain head"),
            node_state: gauge(&registry, "node_state", "Lifecycle state ordinal"),
            catchup_runs_total: counter(&registry, "catchup_runs_total", "Catchup passes started"),
            catchup_failures_total: counter(
                &registry,
                "catchup_failures_total",
                "Catchup passes that ended in an error",
            ),
            catchup_blocks_applied_total: counter(
                &registry,
                "catchup_blocks_applied_total",
                "Blocks applied by catchup",
            ),
            registry,
        }
    }

    pub fn set_state(&self, state: NodeState) {
        let ordinal = match state {
            NodeState::Booting => 0,
            NodeState::Connecting => 1,
            NodeState::CatchingUp => 2,
            NodeState::Running => 3,
            NodeState::ShuttingDown => 4,
            NodeState::Stopped => 5,
        };
        self.node_state.set(ordinal);
    }

    pub fn record_catchup(&self, result: Result<&CatchupOutcome, ()>) {
        self.catchup_runs_total.inc();
        match result {
            Ok(CatchupOutcome::CaughtUp { blocks_applied, .. }) => {
                self.catchup_blocks_applied_total.inc_by(*blocks_applied as u64);
            }
            Ok(_) => {}
            Err(()) => self.catchup_failures_total.inc(),
        }
    }

    /// Encodes all registered metrics into the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

pub type SharedMetrics = Arc<NodeMetrics>;

/// Axum handler that renders `/metrics` in Prometheus text format.
pub async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<SharedMetrics>,
) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}
