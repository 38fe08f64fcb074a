use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderValue},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};

use super::{ok, Envelope};
use crate::{
    annotate::AnnotationSnapshot,
    error::{AppError, AppResult},
    naming::validate_name,
    state::AppState,
};

const DEFAULT_PAGE: usize = 50;

pub(super) fn router() -> Router<AppState> {
    Router::new()
        .route("/api/annotate/stream", post(proxy))
        .route(
            "/api/annotations/{video}",
            post(start).get(snapshot).delete(abort),
        )
        .route("/api/annotations/{video}/seek", post(seek))
        .route("/api/annotations/{video}/resync", post(resync))
}

#[derive(Deserialize)]
struct FileQuery {
    #[serde(default)]
    file: String,
}

/// Relays the inference service's NDJSON response as it arrives.
async fn proxy(State(state): State<AppState>, Query(query): Query<FileQuery>) -> AppResult<Response> {
    if query.file.trim().is_empty() {
        return Err(AppError::BadRequest("file is required".to_string()));
    }
    let name = validate_name(&query.file)?;
    let path = state.config.uploads_dir().join(name);
    if !tokio::fs::try_exists(&path).await? {
        return Err(AppError::NotFound(format!("video {name} not found")));
    }

    let upstream = state.inference.send(&path, name).await?;
    tracing::info!(video = name, url = state.inference.url(), "relaying annotation stream");
    Ok((
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("application/x-ndjson")),
            (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
            (
                header::HeaderName::from_static("x-accel-buffering"),
                HeaderValue::from_static("no"),
            ),
        ],
        Body::from_stream(upstream.bytes_stream()),
    )
        .into_response())
}

async fn start(State(state): State<AppState>, Path(video): Path<String>) -> AppResult<Json<Envelope<AnnotationSnapshot>>> {
    Ok(ok(state.annotations.start(&video).await?))
}

#[derive(Deserialize)]
struct PageQuery {
    #[serde(default)]
    offset: usize,
    #[serde(default)]
    limit: Option<usize>,
}

async fn snapshot(
    State(state): State<AppState>,
    Path(video): Path<String>,
    Query(page): Query<PageQuery>,
) -> AppResult<Json<Envelope<AnnotationSnapshot>>> {
    let limit = page.limit.unwrap_or(DEFAULT_PAGE);
    Ok(ok(state.annotations.snapshot(&video, page.offset, limit).await?))
}

#[derive(Deserialize)]
struct SeekRequest {
    index: u64,
}

async fn seek(
    State(state): State<AppState>,
    Path(video): Path<String>,
    Json(req): Json<SeekRequest>,
) -> AppResult<Json<Envelope<AnnotationSnapshot>>> {
    Ok(ok(state.annotations.seek(&video, req.index).await?))
}

async fn resync(State(state): State<AppState>, Path(video): Path<String>) -> AppResult<Json<Envelope<AnnotationSnapshot>>> {
    Ok(ok(state.annotations.resync(&video).await?))
}

#[derive(Serialize)]
struct Aborted {
    aborted: bool,
}

/// Idempotent; a video without a run answers `aborted: false`.
async fn abort(State(state): State<AppState>, Path(video): Path<String>) -> AppResult<Json<Envelope<Aborted>>> {
    let aborted = state.annotations.abort(&video).await?;
    if aborted {
        tracing::info!(video = %video, "annotation run aborted");
    }
    Ok(ok(Aborted { aborted }))
}
