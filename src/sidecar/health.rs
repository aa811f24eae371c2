//! Sidecar health endpoint.
//!
//! `/healthz` reports whether the member configuration has been rendered:
//! 200 once the config file exists, 404 before that, 500 on stat errors. The
//! member deployment uses it as the sidecar startup probe.

use std::path::PathBuf;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use super::Result;

async fn healthz(State(config_file): State<PathBuf>) -> impl IntoResponse {
    match std::fs::metadata(&config_file) {
        Ok(_) => (StatusCode::OK, "ok"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            (StatusCode::NOT_FOUND, "config file does not exist yet")
        }
        Err(err) => {
            error!(error = %err, "stat config file");
            (StatusCode::INTERNAL_SERVER_ERROR, "stat config file")
        }
    }
}

pub fn router(config_file: PathBuf) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .with_state(config_file)
}

/// Serve until the shutdown flag flips, then drain gracefully
pub async fn serve(
    address: String,
    config_file: PathBuf,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = TcpListener::bind(&address).await?;
    info!(%address, "health server listening");

    axum::serve(listener, router(config_file))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn healthz_reports_config_file_presence() {
        let dir = std::env::temp_dir().join(format!("sidecar-health-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let config_file = dir.join("etcd.json");

        let app = router(config_file.clone());
        let resp = app
            .clone()
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        std::fs::write(&config_file, b"{}").unwrap();
        let resp = app
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
