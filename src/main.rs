//! Server bootstrap
//!
//! Loads configuration from the environment, verifies the ffmpeg toolchain,
//! wires the streaming engine into the HTTP router, and owns the engine
//! lifecycle through graceful shutdown.

use anyhow::Context;
use media_catalog::FsCatalog;
use std::net::SocketAddr;
use std::sync::Arc;
use stream_engine::{hls_router, StreamConfig, StreamingEngine};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = StreamConfig::from_env();

    // Both failures here are fatal: without the toolchain or a writable HLS
    // root the server cannot serve a single segment.
    config
        .tools
        .verify()
        .await
        .context("ffmpeg toolchain unavailable")?;
    tokio::fs::create_dir_all(&config.hls_root)
        .await
        .with_context(|| format!("cannot create HLS root {}", config.hls_root.display()))?;

    let media_root = std::env::var("MEDIA_ROOT").unwrap_or_else(|_| "media".to_string());
    let catalog = Arc::new(FsCatalog::new(&media_root));
    info!(
        media_root = %media_root,
        hls_root = %config.hls_root.display(),
        encoder = ?config.encoder,
        "Starting VOD server"
    );

    let engine = StreamingEngine::new(config, catalog);

    let app = hls_router(engine.clone())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = std::env::var("BIND_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:3000".to_string())
        .parse()
        .context("invalid BIND_ADDR")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;
    info!(%addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // The HTTP surface is down; now reap every in-flight encoder.
    engine.shutdown().await;
    info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
}
