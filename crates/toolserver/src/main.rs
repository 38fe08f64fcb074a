use anyhow::Context;
use std::net::SocketAddr;

use dashcam_toolserver::{build_router, detect_ffmpeg, AppState, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::from_env()?;

    let ffmpeg = detect_ffmpeg(&config.ffmpeg_bin);
    if !ffmpeg {
        tracing::warn!(
            bin = %config.ffmpeg_bin,
            "ffmpeg not found; thumbnails will fall back to placeholders"
        );
    }

    let addr = SocketAddr::new(config.host, config.port);
    let state = AppState::new(config, ffmpeg)
        .context("failed to initialise toolserver state")?;
    tracing::info!(
        data_dir = %state.config.data_dir.display(),
        inference = state.inference.url(),
        "state ready"
    );

    let app = build_router(state);

    tracing::info!("toolserver listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;
    axum::serve(listener, app).await.context("toolserver failed")?;
    Ok(())
}
