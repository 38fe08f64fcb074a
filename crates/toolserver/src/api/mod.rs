//! HTTP surface. Every success body carries `"ok": true`; failures go
//! through [`crate::error::AppError`].

mod annotate;
mod frames;
mod uploads;
mod videos;

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, State},
    routing::get,
    Json, Router,
};
use futures::TryStreamExt;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(uploads::router())
        .merge(videos::router())
        .merge(annotate::router())
        .merge(frames::router())
        .layer(DefaultBodyLimit::disable())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct Envelope<T> {
    ok: bool,
    #[serde(flatten)]
    body: T,
}

/// Wraps a struct-shaped body in the success envelope.
fn ok<T: Serialize>(body: T) -> Json<Envelope<T>> {
    Json(Envelope { ok: true, body })
}

/// Streams a request body as `AsyncRead` without buffering it.
fn body_reader(body: Body) -> impl AsyncRead + Unpin + Send {
    StreamReader::new(body.into_data_stream().map_err(std::io::Error::other))
}

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    service: &'static str,
    data_dir: String,
    ffmpeg: bool,
    db_path: String,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        service: "dashcam-toolserver",
        data_dir: state.config.data_dir.display().to_string(),
        ffmpeg: state.ffmpeg,
        db_path: state.catalog.db_path().display().to_string(),
    })
}
