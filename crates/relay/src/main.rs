//! Relay service entry point.

use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use broker::{InfoMap, Node};
use metrics_exporter_prometheus::PrometheusBuilder;
use relay::{create_router, AppState};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting relay service");

    let listen_port: u16 = env::var("LISTEN_PORT")
        .unwrap_or_else(|_| "8082".to_string())
        .parse()
        .expect("LISTEN_PORT must be a number");
    let metrics_port: u16 = env::var("METRICS_PORT")
        .unwrap_or_else(|_| "9093".to_string())
        .parse()
        .expect("METRICS_PORT must be a number");
    let ping_interval_secs: u64 = env::var("PING_INTERVAL_SECS")
        .unwrap_or_else(|_| "30".to_string())
        .parse()
        .expect("PING_INTERVAL_SECS must be a number");
    let allow_local_dot_subjects = env::var("ALLOW_LOCAL_DOT_SUBJECTS")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    info!("Configuration:");
    info!("  LISTEN_PORT: {}", listen_port);
    info!("  METRICS_PORT: {}", metrics_port);
    info!("  PING_INTERVAL_SECS: {}", ping_interval_secs);
    info!("  ALLOW_LOCAL_DOT_SUBJECTS: {}", allow_local_dot_subjects);

    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], metrics_port))
        .install()
        .expect("Failed to start Prometheus exporter");
    info!("Prometheus metrics server started on port {}", metrics_port);

    let mut node_info = InfoMap::new();
    node_info.insert("server".to_string(), "relay".into());
    node_info.insert("version".to_string(), env!("CARGO_PKG_VERSION").into());

    let node = Node::builder(node_info)
        .allow_local_dot_subjects(allow_local_dot_subjects)
        .build();

    let state = Arc::new(AppState {
        node: node.clone(),
        ping_interval: Duration::from_secs(ping_interval_secs),
    });
    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], listen_port));
    let listener = TcpListener::bind(addr).await?;
    info!("Relay listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    node.close();
    info!("Relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}
