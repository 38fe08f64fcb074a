use axum::{
    body::Body,
    extract::{Multipart, Path, Query, State},
    routing::{get, post, put},
    Json, Router,
};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::PathBuf};
use tokio_util::io::StreamReader;

use super::{body_reader, ok, Envelope};
use crate::{
    error::{AppError, AppResult},
    state::AppState,
    upload::{chunk_count, Finalized, PartOutcome, SessionInit, SessionView, StoredArtifact},
};

pub(super) fn router() -> Router<AppState> {
    Router::new()
        .route("/api/uploads", post(init))
        .route("/api/uploads/{id}", get(status))
        .route("/api/uploads/{id}/parts/{index}", put(put_part))
        .route("/api/uploads/{id}/finalize", post(finalize))
        .route("/api/upload", post(legacy_multipart))
        .route("/api/upload/raw", put(legacy_raw))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitRequest {
    #[serde(default)]
    filename: String,
    #[serde(default)]
    total_chunks: serde_json::Value,
    #[serde(default)]
    total_size: Option<u64>,
    #[serde(default)]
    part_size: Option<u64>,
}

async fn init(State(state): State<AppState>, Json(req): Json<InitRequest>) -> AppResult<Json<Envelope<SessionInit>>> {
    if req.filename.trim().is_empty() {
        return Err(AppError::BadRequest("filename is required".to_string()));
    }
    let total = chunk_count(&req.total_chunks)?;
    let session = state
        .uploads
        .init(&req.filename, total, req.total_size, req.part_size)
        .await?;
    Ok(ok(session))
}

async fn status(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<Json<Envelope<SessionView>>> {
    Ok(ok(state.uploads.status(&id)?))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PartResponse {
    index: u64,
    #[serde(flatten)]
    outcome: PartOutcome,
    complete: bool,
}

async fn put_part(
    State(state): State<AppState>,
    Path((id, index)): Path<(String, u64)>,
    body: Body,
) -> AppResult<Json<Envelope<PartResponse>>> {
    let outcome = state.uploads.accept_part(&id, index, body_reader(body)).await?;
    Ok(ok(PartResponse {
        index,
        outcome,
        complete: state.uploads.all_parts_received(&id),
    }))
}

async fn finalize(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<Json<Envelope<Finalized>>> {
    let done = finish_session(&state, &id, "chunked").await?;
    Ok(ok(done))
}

/// Finalizes a session. The artifact bookkeeping runs inside the finalize
/// flight, so it happens once however many callers race.
async fn finish_session(state: &AppState, id: &str, via: &'static str) -> AppResult<Finalized> {
    let owner = state.clone();
    let done = state
        .uploads
        .finalize_then(id, move |done| async move {
            owner.artifact_created(&done.final_name, done.size, via).await;
        })
        .await?;
    Ok(done)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FilesResponse {
    success: bool,
    files: Vec<StoredArtifact>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChunkReceived {
    success: bool,
    chunk_received: bool,
    file_id: String,
    chunk_index: u64,
    total_chunks: u32,
}

#[derive(Serialize)]
#[serde(untagged)]
enum LegacyResponse {
    Files(FilesResponse),
    Chunk(ChunkReceived),
}

const CHUNK_FIELDS: [&str; 4] = ["fileId", "chunkIndex", "totalChunks", "originalFilename"];

/// The single-request upload. A form carrying `fileId`, `chunkIndex`,
/// `totalChunks` and `originalFilename` is one chunk of a client-driven
/// session; any other form stores each of its file fields as an artifact.
async fn legacy_multipart(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> AppResult<Json<Envelope<LegacyResponse>>> {
    let mut fields: HashMap<String, String> = HashMap::new();
    let mut spooled: Vec<(String, PathBuf)> = Vec::new();

    let outcome: AppResult<LegacyResponse> = async {
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| AppError::BadRequest(e.body_text()))?
        {
            let name = field.name().unwrap_or_default().to_string();
            match field.file_name().map(str::to_string) {
                Some(file_name) => {
                    if !name.to_lowercase().contains("file") {
                        continue;
                    }
                    let reader = StreamReader::new(Box::pin(field.map_err(std::io::Error::other)));
                    let (temp, _) = state.uploads.store().spool(reader).await?;
                    spooled.push((file_name, temp));
                }
                None => {
                    let value = field.text().await.map_err(|e| AppError::BadRequest(e.body_text()))?;
                    fields.insert(name, value);
                }
            }
        }

        if CHUNK_FIELDS.iter().all(|k| fields.contains_key(*k)) {
            legacy_chunk(&state, &fields, &spooled).await
        } else {
            legacy_files(&state, &spooled).await
        }
    }
    .await;

    for (_, temp) in &spooled {
        let _ = tokio::fs::remove_file(temp).await;
    }
    outcome.map(ok)
}

async fn legacy_chunk(
    state: &AppState,
    fields: &HashMap<String, String>,
    spooled: &[(String, PathBuf)],
) -> AppResult<LegacyResponse> {
    let field = |k: &str| fields.get(k).map(String::as_str).unwrap_or_default();
    let Some((_, temp)) = spooled.first() else {
        return Err(AppError::BadRequest("Invalid chunk payload".to_string()));
    };
    let index: u64 = field("chunkIndex")
        .trim()
        .parse()
        .map_err(|_| AppError::BadRequest("Bad chunk indices".to_string()))?;
    let total = chunk_count(&serde_json::Value::String(field("totalChunks").to_string()))?;
    let file_id = field("fileId");

    let session = state
        .uploads
        .open_legacy(file_id, field("originalFilename"), total)
        .await?;
    let part = tokio::fs::File::open(temp).await?;
    state.uploads.accept_part(file_id, index, part).await?;

    if !state.uploads.all_parts_received(file_id) {
        return Ok(LegacyResponse::Chunk(ChunkReceived {
            success: true,
            chunk_received: true,
            file_id: file_id.to_string(),
            chunk_index: index,
            total_chunks: session.total_chunks,
        }));
    }

    let done = finish_session(state, file_id, "legacy-chunked").await?;
    Ok(LegacyResponse::Files(FilesResponse {
        success: true,
        files: vec![StoredArtifact {
            original: field("originalFilename").to_string(),
            stored: done.final_name,
            size: done.size,
        }],
    }))
}

async fn legacy_files(state: &AppState, spooled: &[(String, PathBuf)]) -> AppResult<LegacyResponse> {
    if spooled.is_empty() {
        return Err(AppError::BadRequest("no file fields in upload".to_string()));
    }
    let mut files = Vec::with_capacity(spooled.len());
    for (original, temp) in spooled {
        let stored = state.uploads.store().adopt(original, temp).await?;
        state.artifact_created(&stored.stored, stored.size, "multipart").await;
        files.push(stored);
    }
    Ok(LegacyResponse::Files(FilesResponse { success: true, files }))
}

#[derive(Deserialize)]
struct RawQuery {
    #[serde(default)]
    filename: String,
}

async fn legacy_raw(
    State(state): State<AppState>,
    Query(query): Query<RawQuery>,
    body: Body,
) -> AppResult<Json<Envelope<FilesResponse>>> {
    if query.filename.trim().is_empty() {
        return Err(AppError::BadRequest("filename is required".to_string()));
    }
    let stored = state
        .uploads
        .store()
        .store_stream(&query.filename, body_reader(body))
        .await?;
    state.artifact_created(&stored.stored, stored.size, "raw").await;
    Ok(ok(FilesResponse {
        success: true,
        files: vec![stored],
    }))
}
