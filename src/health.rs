//! Operator health probes and Prometheus metrics endpoint.
//!
//! - `/healthz` - liveness, the process responds
//! - `/readyz` - readiness, the controllers are running
//! - `/metrics` - Prometheus metrics, including the per-cluster gauges

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::info;

use crate::metrics::ClusterGauges;

/// Shared state for the health server
pub struct HealthState {
    ready: RwLock<bool>,
    registry: Registry,
    gauges: Arc<ClusterGauges>,
}

impl HealthState {
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let gauges = ClusterGauges::register(&mut registry);

        Self {
            ready: RwLock::new(false),
            registry,
            gauges,
        }
    }

    pub fn gauges(&self) -> Arc<ClusterGauges> {
        self.gauges.clone()
    }

    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }

    fn encode(&self) -> String {
        let mut buffer = String::new();
        if let Err(err) = encode(&mut buffer, &self.registry) {
            tracing::error!(error = %err, "encode metrics");
            return String::new();
        }
        buffer
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

async fn metrics(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        state.encode(),
    )
}

pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve probes on `probe_address` and metrics on `metrics_address`.
///
/// Both routers share one state so `/metrics` works on either port.
pub async fn run_health_server(
    state: Arc<HealthState>,
    metrics_address: String,
    probe_address: String,
) -> std::io::Result<()> {
    let metrics_app = create_router(state.clone());
    let probe_app = create_router(state);

    let metrics_listener = TcpListener::bind(&metrics_address).await?;
    let probe_listener = TcpListener::bind(&probe_address).await?;
    info!(%metrics_address, %probe_address, "health server listening");

    tokio::select! {
        result = axum::serve(metrics_listener, metrics_app) => result,
        result = axum::serve(probe_listener, probe_app) => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{EtcdCluster, EtcdClusterSpec, EtcdClusterStatus};
    use crate::metrics::ObserverRegistry;

    #[tokio::test]
    async fn ready_flag() {
        let state = HealthState::new();
        assert!(!state.is_ready().await);

        state.set_ready(true).await;
        assert!(state.is_ready().await);
    }

    #[test]
    fn metrics_include_cluster_gauges() {
        let state = HealthState::new();
        let registry = ObserverRegistry::new(state.gauges());

        let mut cluster = EtcdCluster::new(
            "main",
            serde_json::from_str::<EtcdClusterSpec>(r#"{"replicas": 3}"#).unwrap(),
        );
        cluster.metadata.namespace = Some("etcd-system".to_string());
        cluster.status = Some(EtcdClusterStatus {
            available_replicas: 3,
            ..Default::default()
        });

        registry.get_or_register(&cluster).update(&cluster);

        let encoded = state.encode();
        assert!(encoded.contains("etcd_cluster_desired_replicas"));
        assert!(encoded.contains("etcd_cluster_available_replicas"));
    }
}
