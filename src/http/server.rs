//! HTTP server implementation.
//!
//! The server answers admission checks for a fronting proxy: every path not
//! listed below is classified, counted and either admitted with `200 OK` or
//! rejected with `429`. Envoy's HTTP external authorization filter forwards
//! the original request path, which makes this a drop-in check service.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tracing::{error, info};

use super::middleware::admission_middleware;
use crate::admission::Admission;
use crate::error::{AdmissionError, Result};

/// HTTP server for the admission service.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The admission controller instance
    admission: Arc<Admission>,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(addr: SocketAddr, admission: Arc<Admission>) -> Self {
        Self { addr, admission }
    }

    /// Build the router with the admission middleware installed.
    ///
    /// `/health` is registered after the middleware so probes are never limited.
    pub fn router(admission: Arc<Admission>) -> Router {
        Router::new()
            .route("/admin/upstreams", get(upstreams_handler))
            .fallback(admitted_handler)
            .layer(axum::middleware::from_fn_with_state(
                admission.clone(),
                admission_middleware,
            ))
            .route("/health", get(health_handler))
            .with_state(admission)
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        let local_addr = listener.local_addr()?;

        info!(addr = %local_addr, "Starting HTTP server for admission checks");

        let app = Self::router(self.admission);
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                AdmissionError::Io(e)
            })
    }
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn upstreams_handler(State(admission): State<Arc<Admission>>) -> impl IntoResponse {
    Json(admission.throttler().registry().snapshot())
}

async fn admitted_handler(uri: Uri) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "admitted",
            "path": uri.path(),
        })),
    )
}
