//! Persisted annotated frame sets.
//!
//! Each video gets `<root>/<video>/frame-NNNNN.jpg` files, a `counts.json`
//! sidecar and a `_deleted/` directory that holds soft-deleted frames with
//! their bytes untouched.

use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashSet},
    path::{Path, PathBuf},
};

use uuid::Uuid;

use crate::{
    model::{FrameRecord, Instance, VehicleCount},
    naming::{natural_cmp, validate_name, InvalidName},
};

const COUNTS_FILE: &str = "counts.json";
const DELETED_DIR: &str = "_deleted";
const FRAME_EXTS: [&str; 4] = ["jpg", "jpeg", "png", "webp"];

#[derive(Debug, thiserror::Error)]
pub enum FrameStoreError {
    #[error(transparent)]
    InvalidName(#[from] InvalidName),
    #[error("no saved frames for video {0}")]
    VideoNotFound(String),
    #[error("frame {0} not found")]
    FrameNotFound(String),
    #[error("frame position {position} out of range ({len} frames)")]
    PositionOutOfRange { position: usize, len: usize },
    #[error("video {0} has no deleted frames")]
    NoDeletedStore(String),
    #[error("frame {0} is already active")]
    AlreadyActive(String),
    #[error("counts document for {video} is corrupt: {reason}")]
    CorruptCounts { video: String, reason: String },
    #[error("frame store i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

/// A frame as submitted for saving. Frames without an index or a decodable
/// image are skipped.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveFrame {
    #[serde(default)]
    pub index: Option<u64>,
    #[serde(default)]
    pub base64: String,
    #[serde(default)]
    pub vehicle_counts: Vec<VehicleCount>,
    #[serde(default)]
    pub instances: Vec<Instance>,
}

impl From<FrameRecord> for SaveFrame {
    fn from(frame: FrameRecord) -> Self {
        Self {
            index: Some(frame.index),
            base64: frame.image_base64,
            vehicle_counts: frame.vehicle_counts,
            instances: frame.instances,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameCounts {
    pub index: u64,
    #[serde(default)]
    pub vehicle_counts: Vec<VehicleCount>,
    #[serde(default)]
    pub instances: Vec<Instance>,
    #[serde(default)]
    pub total_vehicles: u64,
}

/// The `counts.json` sidecar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountsDocument {
    #[serde(default)]
    pub video: String,
    #[serde(default)]
    pub frame_count: usize,
    #[serde(default)]
    pub aggregate: BTreeMap<String, u64>,
    #[serde(default)]
    pub frames: Vec<FrameCounts>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveOutcome {
    pub files: Vec<String>,
    pub frame_count: usize,
    pub counts_file: &'static str,
    pub removed_scratch: Vec<String>,
    /// Indices dropped because their image did not decode.
    pub skipped: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameRef {
    File(String),
    Position(usize),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameMutation {
    pub file: String,
    pub remaining: Vec<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FrameSetSummary {
    pub id: String,
    pub first_frame_file: Option<String>,
    pub total_frames: usize,
}

pub fn frame_file_name(index: u64) -> String {
    format!("frame-{index:05}.jpg")
}

/// Per-class sums over every frame's counts.
pub fn aggregate<'a>(frames: impl IntoIterator<Item = &'a FrameCounts>) -> BTreeMap<String, u64> {
    let mut totals = BTreeMap::new();
    for frame in frames {
        for count in &frame.vehicle_counts {
            *totals.entry(count.name.clone()).or_insert(0) += count.count;
        }
    }
    totals
}

#[derive(Debug, Clone)]
pub struct FrameStore {
    root: PathBuf,
    scratch_root: PathBuf,
}

impl FrameStore {
    pub fn new(root: PathBuf, scratch_root: PathBuf) -> Self {
        Self { root, scratch_root }
    }

    fn video_dir(&self, video: &str) -> Result<PathBuf, FrameStoreError> {
        Ok(self.root.join(validate_name(video)?))
    }

    pub async fn save(&self, video: &str, frames: &[SaveFrame]) -> Result<SaveOutcome, FrameStoreError> {
        let dir = self.video_dir(video)?;

        let mut seen = HashSet::new();
        let mut decoded = Vec::new();
        let mut skipped = Vec::new();
        for frame in frames {
            let Some(index) = frame.index else { continue };
            if frame.base64.is_empty() || seen.contains(&index) {
                continue;
            }
            match base64::engine::general_purpose::STANDARD.decode(frame.base64.trim()) {
                Ok(bytes) => {
                    seen.insert(index);
                    decoded.push((index, bytes, frame));
                }
                Err(err) => {
                    tracing::warn!(video, index, error = %err, "skipping frame with undecodable image");
                    skipped.push(index);
                }
            }
        }

        tokio::fs::create_dir_all(&dir).await?;

        let mut files = Vec::with_capacity(decoded.len());
        let mut manifest = Vec::with_capacity(decoded.len());
        for (index, bytes, frame) in decoded {
            let name = frame_file_name(index);
            let path = dir.join(&name);
            if !tokio::fs::try_exists(&path).await? {
                write_if_absent(&path, &bytes).await?;
            }
            files.push(name);
            manifest.push(FrameCounts {
                index,
                vehicle_counts: frame.vehicle_counts.clone(),
                instances: frame.instances.clone(),
                total_vehicles: frame.vehicle_counts.iter().map(|c| c.count).sum(),
            });
        }
        files.sort_by(|a, b| natural_cmp(a, b));
        manifest.sort_by_key(|f| f.index);

        let document = CountsDocument {
            video: video.to_string(),
            frame_count: files.len(),
            aggregate: aggregate(&manifest),
            frames: manifest,
            updated_at: Some(Utc::now()),
        };
        let json = serde_json::to_vec_pretty(&document).map_err(std::io::Error::other)?;
        write_atomically(&dir.join(COUNTS_FILE), &json).await?;

        let removed_scratch = self.clean_scratch(video).await;
        tracing::info!(video, frames = files.len(), skipped = skipped.len(), "frame set saved");
        Ok(SaveOutcome {
            frame_count: files.len(),
            files,
            counts_file: COUNTS_FILE,
            removed_scratch,
            skipped,
        })
    }

    /// Removes the streaming cache directories for `video`; failures are only logged.
    async fn clean_scratch(&self, video: &str) -> Vec<String> {
        let stem = Path::new(video)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(video)
            .to_string();
        let mut removed = Vec::new();

        let mut entries = match tokio::fs::read_dir(&self.scratch_root).await {
            Ok(entries) => entries,
            Err(_) => return removed,
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            let matches = name == video || name == stem || name.starts_with(&format!("{stem}_"));
            if !matches || !entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            match tokio::fs::remove_dir_all(entry.path()).await {
                Ok(()) => removed.push(name),
                Err(err) => tracing::debug!(dir = %name, error = %err, "scratch cleanup failed"),
            }
        }
        removed
    }

    /// Active frame files in natural order; empty when nothing was saved.
    pub async fn list(&self, video: &str) -> Result<Vec<String>, FrameStoreError> {
        let dir = self.video_dir(video)?;
        list_frame_files(&dir).await
    }

    pub async fn list_deleted(&self, video: &str) -> Result<Vec<String>, FrameStoreError> {
        let dir = self.video_dir(video)?;
        list_frame_files(&dir.join(DELETED_DIR)).await
    }

    /// The saved counts, or an empty document when none was written yet.
    pub async fn counts(&self, video: &str) -> Result<CountsDocument, FrameStoreError> {
        let path = self.video_dir(video)?.join(COUNTS_FILE);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(CountsDocument {
                    video: video.to_string(),
                    frame_count: 0,
                    aggregate: BTreeMap::new(),
                    frames: Vec::new(),
                    updated_at: None,
                })
            }
            Err(err) => return Err(err.into()),
        };
        let mut document: CountsDocument =
            serde_json::from_slice(&raw).map_err(|e| FrameStoreError::CorruptCounts {
                video: video.to_string(),
                reason: e.to_string(),
            })?;
        if document.video.is_empty() {
            document.video = video.to_string();
        }
        Ok(document)
    }

    /// Soft delete: moves the frame into `_deleted/`, bytes preserved.
    ///
    /// The counts sidecar is left as is until the next save.
    pub async fn delete(&self, video: &str, target: FrameRef) -> Result<FrameMutation, FrameStoreError> {
        let dir = self.existing_video_dir(video).await?;
        let files = list_frame_files(&dir).await?;

        let file = match target {
            FrameRef::File(name) => {
                validate_name(&name)?;
                if !files.contains(&name) {
                    return Err(FrameStoreError::FrameNotFound(name));
                }
                name
            }
            FrameRef::Position(position) => files
                .get(position)
                .cloned()
                .ok_or(FrameStoreError::PositionOutOfRange {
                    position,
                    len: files.len(),
                })?,
        };

        let deleted_dir = dir.join(DELETED_DIR);
        tokio::fs::create_dir_all(&deleted_dir).await?;
        match tokio::fs::rename(dir.join(&file), deleted_dir.join(&file)).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(FrameStoreError::FrameNotFound(file))
            }
            Err(err) => return Err(err.into()),
        }

        tracing::info!(video, file = %file, "frame soft-deleted");
        Ok(FrameMutation {
            file,
            remaining: list_frame_files(&dir).await?,
        })
    }

    pub async fn restore(&self, video: &str, file: &str) -> Result<FrameMutation, FrameStoreError> {
        let dir = self.existing_video_dir(video).await?;
        validate_name(file)?;

        let deleted_dir = dir.join(DELETED_DIR);
        if !is_dir(&deleted_dir).await {
            return Err(FrameStoreError::NoDeletedStore(video.to_string()));
        }
        let from = deleted_dir.join(file);
        let to = dir.join(file);
        if !tokio::fs::try_exists(&from).await? {
            return Err(FrameStoreError::FrameNotFound(file.to_string()));
        }
        if tokio::fs::try_exists(&to).await? {
            return Err(FrameStoreError::AlreadyActive(file.to_string()));
        }
        tokio::fs::rename(&from, &to).await?;

        tracing::info!(video, file, "frame restored");
        Ok(FrameMutation {
            file: file.to_string(),
            remaining: list_frame_files(&dir).await?,
        })
    }

    /// Irreversibly removes the whole set, soft-deleted frames included.
    /// Returns whether anything was there.
    pub async fn delete_set(&self, video: &str) -> Result<bool, FrameStoreError> {
        let dir = self.video_dir(video)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                tracing::info!(video, "frame set deleted");
                Ok(true)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn sets(&self) -> Result<Vec<FrameSetSummary>, FrameStoreError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut sets = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let id = entry.file_name().to_string_lossy().into_owned();
            if id.starts_with('.') || !entry.file_type().await?.is_dir() {
                continue;
            }
            let files = list_frame_files(&entry.path()).await?;
            sets.push(FrameSetSummary {
                id,
                first_frame_file: files.first().cloned(),
                total_frames: files.len(),
            });
        }
        sets.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(sets)
    }

    pub async fn read(&self, video: &str, file: &str) -> Result<Vec<u8>, FrameStoreError> {
        let path = self.video_dir(video)?.join(validate_name(file)?);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(FrameStoreError::FrameNotFound(file.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn existing_video_dir(&self, video: &str) -> Result<PathBuf, FrameStoreError> {
        let dir = self.video_dir(video)?;
        if !is_dir(&dir).await {
            return Err(FrameStoreError::VideoNotFound(video.to_string()));
        }
        Ok(dir)
    }
}

async fn list_frame_files(dir: &Path) -> Result<Vec<String>, FrameStoreError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let is_frame = Path::new(&name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| FRAME_EXTS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if is_frame {
            files.push(name);
        }
    }
    files.sort_by(|a, b| natural_cmp(a, b));
    Ok(files)
}

/// A sibling of `path` no other writer will pick.
fn temp_sibling(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(".{}.tmp", Uuid::new_v4()));
    PathBuf::from(tmp)
}

async fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = temp_sibling(path);
    tokio::fs::write(&tmp, bytes).await?;
    if let Err(err) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(err);
    }
    Ok(())
}

/// Publishes `bytes` at `path` unless a file is already there. The link
/// fails instead of replacing, so a racing writer's file is kept.
async fn write_if_absent(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = temp_sibling(path);
    tokio::fs::write(&tmp, bytes).await?;
    let linked = tokio::fs::hard_link(&tmp, path).await;
    let _ = tokio::fs::remove_file(&tmp).await;
    match linked {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(err) => Err(err),
    }
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}
