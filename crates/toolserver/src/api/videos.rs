use axum::{
    body::Body,
    extract::{Path as UrlPath, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{
    collections::HashMap,
    io::SeekFrom,
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

use super::{ok, Envelope};
use crate::{
    catalog::VideoRecord,
    error::{AppError, AppResult},
    naming::validate_name,
    state::AppState,
    thumbs::{ThumbnailRef, ThumbnailState},
};

const VIDEO_EXTS: [&str; 5] = ["mp4", "mov", "mkv", "webm", "avi"];

/// 1×1 transparent GIF served while a thumbnail does not exist.
const PLACEHOLDER_GIF: [u8; 43] = [
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0xf0, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x21, 0xf9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2c, 0x00, 0x00, 0x00, 0x00,
    0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x02, 0x44, 0x01, 0x00, 0x3b,
];

pub(super) fn router() -> Router<AppState> {
    Router::new()
        .route("/api/videos", get(list).delete(remove).patch(rename))
        .route("/api/videos/raw/{name}", get(raw))
        .route("/api/videos/thumb/upload", post(upload_thumb))
        .route("/api/videos/thumb/{name}", get(thumb))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VideoEntry {
    id: String,
    title: String,
    size_bytes: i64,
    uploaded_at_ms: i64,
    frame_count: i64,
    thumbnail_url: String,
    thumbnail: ThumbnailState,
}

#[derive(Serialize)]
struct VideoList {
    videos: Vec<VideoEntry>,
}

#[derive(Deserialize, Default)]
struct ListQuery {
    #[serde(default)]
    light: Option<String>,
}

async fn list(State(state): State<AppState>, Query(query): Query<ListQuery>) -> AppResult<Json<Envelope<VideoList>>> {
    let light = matches!(query.light.as_deref(), Some("1" | "true"));
    let videos = collect_videos(&state, light).await?;
    Ok(ok(VideoList { videos }))
}

/// Merges catalog rows with what is actually on disk. Files copied in by hand
/// are recorded; rows whose file is gone are left out.
async fn collect_videos(state: &AppState, light: bool) -> AppResult<Vec<VideoEntry>> {
    let mut known: HashMap<String, VideoRecord> = state
        .catalog
        .list()
        .await?
        .into_iter()
        .map(|record| (record.id.clone(), record))
        .collect();

    let mut records = Vec::new();
    for (name, size, mtime_ms) in scan_videos(&state.config.uploads_dir()).await? {
        let record = match known.remove(&name) {
            Some(record) => record,
            None => {
                let record = VideoRecord {
                    id: name,
                    size_bytes: size as i64,
                    uploaded_at_ms: mtime_ms,
                    thumbnail: None,
                    frame_count: 0,
                };
                if let Err(err) = state.catalog.record_artifact(record.clone()).await {
                    tracing::warn!(video = %record.id, error = %err, "failed to record discovered video");
                }
                record
            }
        };
        records.push(record);
    }
    records.sort_by(|a, b| b.uploaded_at_ms.cmp(&a.uploaded_at_ms).then_with(|| a.id.cmp(&b.id)));

    let thumbs = join_all(records.iter().map(|record| async move {
        if light {
            state.thumbs.existing(&record.id).await
        } else {
            state.thumbs.ensure(&record.id).await
        }
    }))
    .await;

    let mut entries = Vec::with_capacity(records.len());
    for (record, thumb) in records.into_iter().zip(thumbs) {
        let thumbnail = match &thumb {
            Some(_) => ThumbnailState::Ready,
            None if light => {
                state.thumbs.spawn_ensure(&record.id);
                ThumbnailState::Generating
            }
            None => ThumbnailState::Missing,
        };
        let thumb = thumb.unwrap_or_else(|| ThumbnailRef::for_video(&record.id));
        if thumbnail == ThumbnailState::Ready && record.thumbnail.as_deref() != Some(thumb.name.as_str()) {
            if let Err(err) = state.catalog.set_thumbnail(&record.id, Some(thumb.name.clone())).await {
                tracing::warn!(video = %record.id, error = %err, "failed to record thumbnail");
            }
        }
        entries.push(VideoEntry {
            title: record.id.clone(),
            thumbnail_url: thumb.url(),
            id: record.id,
            size_bytes: record.size_bytes,
            uploaded_at_ms: record.uploaded_at_ms,
            frame_count: record.frame_count,
            thumbnail,
        });
    }
    Ok(entries)
}

async fn scan_videos(dir: &Path) -> std::io::Result<Vec<(String, u64, i64)>> {
    let mut out = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(err) => return Err(err),
    };
    while let Some(entry) = entries.next_entry().await? {
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if name.starts_with('.') || !is_video(&name) {
            continue;
        }
        let meta = entry.metadata().await?;
        if !meta.is_file() {
            continue;
        }
        out.push((name, meta.len(), mtime_ms(meta.modified().ok())));
    }
    Ok(out)
}

fn is_video(name: &str) -> bool {
    extension_of(name).is_some_and(|ext| VIDEO_EXTS.contains(&ext.as_str()))
}

fn extension_of(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
}

fn mtime_ms(modified: Option<SystemTime>) -> i64 {
    modified
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[derive(Deserialize)]
struct FileQuery {
    #[serde(default)]
    file: String,
}

async fn remove(State(state): State<AppState>, Query(query): Query<FileQuery>) -> AppResult<Json<Envelope<VideoList>>> {
    let name = validate_name(&query.file)?;
    let path = state.config.uploads_dir().join(name);
    match tokio::fs::remove_file(&path).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(AppError::NotFound(format!("video {name} not found")));
        }
        Err(err) => return Err(err.into()),
    }

    state.annotations.forget(name).await;
    state.thumbs.forget(name).await;
    state.catalog.remove(name).await?;
    state.catalog.note(Some(name), "artifact_deleted", json!({})).await;
    tracing::info!(video = name, "video deleted");

    let videos = collect_videos(&state, true).await?;
    Ok(ok(VideoList { videos }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RenameRequest {
    #[serde(default)]
    file: String,
    #[serde(default)]
    new_name: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Renamed {
    videos: Vec<VideoEntry>,
    renamed_to: String,
}

/// The new name's own extension is dropped; the video keeps its original one.
fn renamed_target(old: &str, new_name: &str) -> String {
    let base = match new_name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => new_name,
    };
    match Path::new(old).extension() {
        Some(ext) => format!("{base}.{}", ext.to_string_lossy()),
        None => base.to_string(),
    }
}

async fn rename(State(state): State<AppState>, Json(req): Json<RenameRequest>) -> AppResult<Json<Envelope<Renamed>>> {
    let old = validate_name(&req.file)?;
    let new_name = req.new_name.trim();
    if new_name.is_empty() {
        return Err(AppError::BadRequest("newName is required".to_string()));
    }
    let target = renamed_target(old, new_name);
    validate_name(&target)?;

    let uploads = state.config.uploads_dir();
    let src = uploads.join(old);
    if !tokio::fs::try_exists(&src).await? {
        return Err(AppError::NotFound(format!("video {old} not found")));
    }

    if target != old {
        let dest = uploads.join(&target);
        if tokio::fs::try_exists(&dest).await? {
            return Err(AppError::Conflict(format!("{target} already exists")));
        }
        tokio::fs::rename(&src, &dest).await?;
        state.annotations.forget(old).await;
        state.thumbs.rename(old, &target).await;
        state.catalog.rename(old, &target).await?;
        state
            .catalog
            .note(Some(&target), "artifact_renamed", json!({ "from": old }))
            .await;
        tracing::info!(from = old, to = %target, "video renamed");
    }

    let videos = collect_videos(&state, true).await?;
    Ok(ok(Renamed {
        videos,
        renamed_to: target,
    }))
}

fn content_type_for(name: &str) -> &'static str {
    match extension_of(name).as_deref() {
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        Some("mov") => "video/quicktime",
        Some("mkv") => "video/x-matroska",
        Some("avi") => "video/x-msvideo",
        _ => "application/octet-stream",
    }
}

/// Resolves a single `bytes=` range against a file of `len` bytes. Supports
/// open-ended (`a-`) and suffix (`-n`) forms; an end past the file is clamped.
fn parse_range(value: &str, len: u64) -> Option<(u64, u64)> {
    let ranges = value.trim().strip_prefix("bytes=")?;
    let (start, end) = ranges.split_once('-')?;
    let (start, end) = (start.trim(), end.trim());
    if len == 0 {
        return None;
    }

    let (start, end) = match (start.is_empty(), end.is_empty()) {
        (true, true) => return None,
        (true, false) => {
            let suffix: u64 = end.parse().ok()?;
            if suffix == 0 {
                return None;
            }
            (len.saturating_sub(suffix), len - 1)
        }
        (false, _) => {
            let start: u64 = start.parse().ok()?;
            let end = if end.is_empty() { len - 1 } else { end.parse::<u64>().ok()?.min(len - 1) };
            (start, end)
        }
    };
    (start <= end && start < len).then_some((start, end))
}

async fn raw(State(state): State<AppState>, UrlPath(name): UrlPath<String>, headers: HeaderMap) -> AppResult<Response> {
    let name = validate_name(&name)?;
    let path = state.config.uploads_dir().join(name);
    let mut file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(AppError::NotFound(format!("video {name} not found")));
        }
        Err(err) => return Err(err.into()),
    };
    let meta = file.metadata().await?;
    if !meta.is_file() {
        return Err(AppError::NotFound(format!("video {name} not found")));
    }
    let len = meta.len();
    let content_type = content_type_for(name);

    let Some(range) = headers.get(header::RANGE) else {
        return Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, content_type)
            .header(header::CONTENT_LENGTH, len)
            .header(header::ACCEPT_RANGES, "bytes")
            .body(Body::from_stream(ReaderStream::new(file)))
            .map_err(|e| AppError::Internal(e.into()));
    };

    let Some((start, end)) = range.to_str().ok().and_then(|v| parse_range(v, len)) else {
        return Response::builder()
            .status(StatusCode::RANGE_NOT_SATISFIABLE)
            .header(header::CONTENT_RANGE, format!("bytes */{len}"))
            .body(Body::empty())
            .map_err(|e| AppError::Internal(e.into()));
    };

    file.seek(SeekFrom::Start(start)).await?;
    let chunk = end - start + 1;
    Response::builder()
        .status(StatusCode::PARTIAL_CONTENT)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_RANGE, format!("bytes {start}-{end}/{len}"))
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_LENGTH, chunk)
        .header(header::CACHE_CONTROL, "no-store")
        .body(Body::from_stream(ReaderStream::new(file.take(chunk))))
        .map_err(|e| AppError::Internal(e.into()))
}

fn placeholder() -> Response {
    (
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("image/gif")),
            (header::CACHE_CONTROL, HeaderValue::from_static("public, max-age=60")),
            (
                header::HeaderName::from_static("x-thumb-placeholder"),
                HeaderValue::from_static("1"),
            ),
        ],
        PLACEHOLDER_GIF.to_vec(),
    )
        .into_response()
}

/// Serves a thumbnail, generating it on first request. Anything that goes
/// wrong degrades to the placeholder.
async fn thumb(State(state): State<AppState>, UrlPath(name): UrlPath<String>, headers: HeaderMap) -> Response {
    let Some(video) = validate_name(&name).ok().and_then(ThumbnailRef::video_of) else {
        return placeholder();
    };
    let Some(thumb) = state.thumbs.ensure(video).await else {
        return placeholder();
    };

    let path = state.thumbs.path_of(&thumb);
    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(_) => return placeholder(),
    };
    let meta = match file.metadata().await {
        Ok(meta) if meta.is_file() => meta,
        _ => return placeholder(),
    };

    let etag = format!("\"{}-{}\"", meta.len(), mtime_ms(meta.modified().ok()));
    let Ok(etag_value) = HeaderValue::from_str(&etag) else {
        return placeholder();
    };
    if headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.split(',').any(|tag| tag.trim() == etag))
    {
        return (StatusCode::NOT_MODIFIED, [(header::ETAG, etag_value)]).into_response();
    }

    (
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("image/jpeg")),
            (
                header::CACHE_CONTROL,
                HeaderValue::from_static("public, max-age=3600, immutable"),
            ),
            (header::ETAG, etag_value),
            (header::CONTENT_LENGTH, HeaderValue::from(meta.len())),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThumbUpload {
    #[serde(default)]
    filename: String,
    #[serde(default)]
    image_base64: String,
    #[serde(default)]
    overwrite: bool,
}

#[derive(Serialize)]
struct ThumbStored {
    existed: bool,
    url: String,
}

async fn upload_thumb(State(state): State<AppState>, Json(req): Json<ThumbUpload>) -> AppResult<Json<Envelope<ThumbStored>>> {
    if req.image_base64.trim().is_empty() {
        return Err(AppError::BadRequest("imageBase64 is required".to_string()));
    }
    let (thumb, existed) = state
        .thumbs
        .store_uploaded(&req.filename, &req.image_base64, req.overwrite)
        .await?;
    if let Err(err) = state.catalog.set_thumbnail(&req.filename, Some(thumb.name.clone())).await {
        tracing::warn!(video = %req.filename, error = %err, "failed to record thumbnail");
    }

    let version = tokio::fs::metadata(state.thumbs.path_of(&thumb))
        .await
        .map(|meta| mtime_ms(meta.modified().ok()))
        .unwrap_or(0);
    Ok(ok(ThumbStored {
        existed,
        url: format!("{}?v={version}", thumb.url()),
    }))
}
