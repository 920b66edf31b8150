use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use copad_server::{ServerConfig, ServerState, server};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!(
                    "{}={},tower_http=info",
                    env!("CARGO_CRATE_NAME"),
                    config.log_level
                )
                .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let state = Arc::new(
        ServerState::new(config)
            .await
            .context("failed to initialize server state")?,
    );

    info!("Starting server on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("unable to bind to host")?;
    axum::serve(
        listener,
        server(Arc::clone(&state)).layer(TraceLayer::new_for_http()),
    )
    .with_graceful_shutdown(async { tokio::signal::ctrl_c().await.expect("Listen to ctrlc") })
    .await?;

    info!("Server has shut down");
    // Edits inside the idle window have not reached the store yet.
    state.persist_all().await;
    Ok(())
}
