// src/server/metrics_server.rs

//! A small HTTP exporter serving the process-wide Prometheus registry.

use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;
use prometheus::{Encoder, TextEncoder};
use tokio::sync::broadcast;
use tracing::{error, info};

async fn metrics_handler() -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buf = Vec::new();
    encoder
        .encode(&families, &mut buf)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    String::from_utf8(buf).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

pub async fn run_metrics_server(port: u16, mut shutdown_rx: broadcast::Receiver<()>) {
    let app = Router::new().route("/metrics", get(metrics_handler));
    let listener = match tokio::net::TcpListener::bind(("0.0.0.0", port)).await {
        Ok(l) => l,
        Err(e) => {
            error!(port, error = %e, "cannot bind metrics port");
            return;
        }
    };
    info!(port, "metrics server listening");
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = shutdown_rx.recv().await;
    });
    if let Err(e) = server.await {
        error!(error = %e, "metrics server failed");
    }
    info!("metrics server stopped");
}
