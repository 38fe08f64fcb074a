use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::{
    annotate::AnnotateError, catalog::CatalogError, frames::FrameStoreError, naming::InvalidName,
    thumbs::ThumbError, upload::UploadError,
};

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    /// Partial data or a name clash; the caller can fix it and retry.
    Conflict(String),
    Upstream(String),
    Internal(anyhow::Error),
}

pub type AppResult<T> = Result<T, AppError>;

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(value)
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Internal(value.into())
    }
}

impl From<InvalidName> for AppError {
    fn from(value: InvalidName) -> Self {
        Self::BadRequest(value.to_string())
    }
}

impl From<UploadError> for AppError {
    fn from(value: UploadError) -> Self {
        match value {
            UploadError::InvalidTotalChunks
            | UploadError::InvalidName(_)
            | UploadError::OutOfRange { .. }
            | UploadError::PartTooLarge { .. }
            | UploadError::ChunkCountMismatch { .. } => Self::BadRequest(value.to_string()),
            UploadError::InvalidSession(_) => Self::NotFound(value.to_string()),
            UploadError::MissingPart(_)
            | UploadError::SizeMismatch { .. }
            | UploadError::SessionClosed(_)
            | UploadError::NameExhausted(_) => Self::Conflict(value.to_string()),
            UploadError::Aborted | UploadError::Io(_) => Self::Internal(value.into()),
        }
    }
}

impl From<FrameStoreError> for AppError {
    fn from(value: FrameStoreError) -> Self {
        match value {
            FrameStoreError::InvalidName(_)
            | FrameStoreError::PositionOutOfRange { .. } => Self::BadRequest(value.to_string()),
            FrameStoreError::VideoNotFound(_)
            | FrameStoreError::FrameNotFound(_)
            | FrameStoreError::NoDeletedStore(_) => Self::NotFound(value.to_string()),
            FrameStoreError::AlreadyActive(_) => Self::Conflict(value.to_string()),
            FrameStoreError::CorruptCounts { .. } | FrameStoreError::Io(_) => Self::Internal(value.into()),
        }
    }
}

impl From<ThumbError> for AppError {
    fn from(value: ThumbError) -> Self {
        match value {
            ThumbError::InvalidName(_) | ThumbError::InvalidImage => Self::BadRequest(value.to_string()),
            ThumbError::Io(_) => Self::Internal(value.into()),
        }
    }
}

impl From<AnnotateError> for AppError {
    fn from(value: AnnotateError) -> Self {
        match value {
            AnnotateError::InvalidName(_) | AnnotateError::SeekOutOfRange { .. } => {
                Self::BadRequest(value.to_string())
            }
            AnnotateError::VideoNotFound(_) | AnnotateError::NoRun(_) => Self::NotFound(value.to_string()),
            AnnotateError::Upstream(_) | AnnotateError::Stream(_) => Self::Upstream(value.to_string()),
            AnnotateError::Io(_) => Self::Internal(value.into()),
        }
    }
}

impl From<CatalogError> for AppError {
    fn from(value: CatalogError) -> Self {
        Self::Internal(value.into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::Conflict(msg) => (StatusCode::CONFLICT, msg),
            Self::Upstream(msg) => {
                tracing::warn!(error = %msg, "upstream failure");
                (StatusCode::BAD_GATEWAY, "upstream error".to_string())
            }
            Self::Internal(err) => {
                tracing::error!(error = ?err, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(serde_json::json!({ "ok": false, "error": message }))).into_response()
    }
}
