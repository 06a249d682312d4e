use std::io;
use std::net::SocketAddr;

use axum::{extract::State, routing::get, Router};
use tokio::net::TcpListener;

use crate::metrics::MetricsRegistry;

pub async fn run_metrics_exporter(addr: SocketAddr, metrics: MetricsRegistry) -> io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve_metrics_listener(listener, metrics).await
}

pub async fn serve_metrics_listener(listener: TcpListener, metrics: MetricsRegistry) -> io::Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics);
    axum::serve(listener, app).await.map_err(io::Error::other)
}

async fn metrics_handler(State(metrics): State<MetricsRegistry>) -> String {
    metrics.render_prometheus()
}
