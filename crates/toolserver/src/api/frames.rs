use axum::{
    extract::{Query, State},
    http::{header, HeaderValue},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{ok, Envelope};
use crate::{
    error::{AppError, AppResult},
    frames::{CountsDocument, FrameMutation, FrameRef, FrameSetSummary, SaveFrame, SaveOutcome},
    state::AppState,
};

pub(super) fn router() -> Router<AppState> {
    Router::new()
        .route("/api/frames/save", post(save))
        .route("/api/frames/list", get(list))
        .route("/api/frames/counts", get(counts))
        .route("/api/frames/raw", get(raw))
        .route("/api/frames/del", post(del))
        .route("/api/frames/sets", get(sets).delete(delete_set))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaveRequest {
    #[serde(default, alias = "videoId")]
    video: String,
    #[serde(default)]
    frames: Vec<SaveFrame>,
}

async fn save(State(state): State<AppState>, Json(req): Json<SaveRequest>) -> AppResult<Json<Envelope<SaveOutcome>>> {
    if req.video.is_empty() {
        return Err(AppError::BadRequest("video is required".to_string()));
    }
    let outcome = state.frames.save(&req.video, &req.frames).await?;
    if let Err(err) = state
        .catalog
        .set_frame_count(&req.video, outcome.frame_count as i64)
        .await
    {
        tracing::warn!(video = %req.video, error = %err, "failed to record frame count");
    }
    state
        .catalog
        .note(
            Some(&req.video),
            "frames_saved",
            json!({ "frameCount": outcome.frame_count, "via": "api" }),
        )
        .await;
    Ok(ok(outcome))
}

#[derive(Deserialize)]
struct VideoQuery {
    #[serde(default)]
    video: String,
}

#[derive(Serialize)]
struct FileList {
    files: Vec<String>,
}

async fn list(State(state): State<AppState>, Query(query): Query<VideoQuery>) -> AppResult<Json<Envelope<FileList>>> {
    Ok(ok(FileList {
        files: state.frames.list(&query.video).await?,
    }))
}

async fn counts(State(state): State<AppState>, Query(query): Query<VideoQuery>) -> AppResult<Json<Envelope<CountsDocument>>> {
    Ok(ok(state.frames.counts(&query.video).await?))
}

#[derive(Deserialize)]
struct RawQuery {
    #[serde(default)]
    video: String,
    #[serde(default)]
    file: String,
}

fn image_type(file: &str) -> &'static str {
    let ext = file.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase());
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        _ => "image/jpeg",
    }
}

async fn raw(State(state): State<AppState>, Query(query): Query<RawQuery>) -> AppResult<Response> {
    let bytes = state.frames.read(&query.video, &query.file).await?;
    Ok((
        [
            (header::CONTENT_TYPE, HeaderValue::from_static(image_type(&query.file))),
            (header::CACHE_CONTROL, HeaderValue::from_static("no-store")),
        ],
        bytes,
    )
        .into_response())
}

#[derive(Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum DelAction {
    List,
    #[default]
    Delete,
    Restore,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DelRequest {
    #[serde(default)]
    video_id: String,
    #[serde(default)]
    action: DelAction,
    #[serde(default)]
    file: Option<String>,
    #[serde(default)]
    frame_number: Option<usize>,
}

#[derive(Serialize)]
#[serde(tag = "action", rename_all_fields = "camelCase")]
enum DelResponse {
    #[serde(rename = "list")]
    Listing {
        active_count: usize,
        deleted_count: usize,
        active: Vec<String>,
        deleted: Vec<String>,
    },
    #[serde(rename = "delete")]
    Deleted {
        deleted: String,
        remaining_count: usize,
        remaining: Vec<String>,
    },
    #[serde(rename = "restore")]
    Restored {
        restored: String,
        remaining_count: usize,
        remaining: Vec<String>,
    },
}

/// Soft-delete control surface: list active and deleted frames, move one
/// frame into `_deleted/`, or move it back.
async fn del(State(state): State<AppState>, Json(req): Json<DelRequest>) -> AppResult<Json<Envelope<DelResponse>>> {
    if req.video_id.is_empty() {
        return Err(AppError::BadRequest("videoId is required".to_string()));
    }
    let video = req.video_id.as_str();

    let response = match req.action {
        DelAction::List => {
            let active = state.frames.list(video).await?;
            let deleted = state.frames.list_deleted(video).await?;
            DelResponse::Listing {
                active_count: active.len(),
                deleted_count: deleted.len(),
                active,
                deleted,
            }
        }
        DelAction::Restore => {
            let Some(file) = req.file.as_deref().filter(|f| !f.is_empty()) else {
                return Err(AppError::BadRequest("file is required to restore".to_string()));
            };
            let FrameMutation { file, remaining } = state.frames.restore(video, file).await?;
            DelResponse::Restored {
                restored: file,
                remaining_count: remaining.len(),
                remaining,
            }
        }
        DelAction::Delete => {
            let target = match (req.file.filter(|f| !f.is_empty()), req.frame_number) {
                (Some(file), _) => FrameRef::File(file),
                (None, Some(position)) => FrameRef::Position(position),
                (None, None) => {
                    return Err(AppError::BadRequest("provide file or frameNumber".to_string()));
                }
            };
            let FrameMutation { file, remaining } = state.frames.delete(video, target).await?;
            DelResponse::Deleted {
                deleted: file,
                remaining_count: remaining.len(),
                remaining,
            }
        }
    };
    Ok(ok(response))
}

#[derive(Serialize)]
struct SetList {
    sets: Vec<FrameSetSummary>,
}

async fn sets(State(state): State<AppState>) -> AppResult<Json<Envelope<SetList>>> {
    Ok(ok(SetList {
        sets: state.frames.sets().await?,
    }))
}

#[derive(Serialize)]
struct SetDeleted {
    deleted: String,
    existed: bool,
    sets: Vec<FrameSetSummary>,
}

async fn delete_set(State(state): State<AppState>, Query(query): Query<VideoQuery>) -> AppResult<Json<Envelope<SetDeleted>>> {
    let existed = state.frames.delete_set(&query.video).await?;
    if existed {
        if let Err(err) = state.catalog.set_frame_count(&query.video, 0).await {
            tracing::warn!(video = %query.video, error = %err, "failed to reset frame count");
        }
    }
    Ok(ok(SetDeleted {
        deleted: query.video,
        existed,
        sets: state.frames.sets().await?,
    }))
}
