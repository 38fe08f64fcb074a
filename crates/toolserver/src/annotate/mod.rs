//! Annotation runs: stream a stored video through the inference service,
//! commit detected frames in batches, and persist the set once complete.
//!
//! One run exists per video. Starting again aborts the previous run.

pub mod batch;
pub mod client;
pub mod run;
pub mod wire;

use dashmap::DashMap;
use serde_json::json;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

pub use batch::{BatchPolicy, SyncMode};
pub use client::{ByteStream, DetectionSource, InferenceClient};
pub use run::{AnnotationSnapshot, Phase};

use crate::{
    catalog::Catalog,
    frames::{FrameStore, SaveFrame},
    naming::{validate_name, InvalidName},
};
use run::{consume, Run, StreamEnd};

#[derive(Debug, Clone, thiserror::Error)]
pub enum AnnotateError {
    #[error(transparent)]
    InvalidName(#[from] InvalidName),
    #[error("video {0} not found")]
    VideoNotFound(String),
    #[error("no annotation run for {0}")]
    NoRun(String),
    #[error("frame {index} is not committed yet ({committed} committed)")]
    SeekOutOfRange { index: u64, committed: u64 },
    #[error("inference service error: {0}")]
    Upstream(String),
    #[error("annotation stream failed: {0}")]
    Stream(String),
    #[error("annotation i/o failed: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for AnnotateError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

#[derive(Clone)]
pub struct AnnotationService {
    inner: Arc<AnnotateInner>,
}

struct AnnotateInner {
    uploads_dir: PathBuf,
    source: Arc<dyn DetectionSource>,
    frames: FrameStore,
    catalog: Catalog,
    policy: BatchPolicy,
    runs: DashMap<String, Arc<Run>>,
}

impl std::fmt::Debug for AnnotationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnnotationService")
            .field("uploads_dir", &self.inner.uploads_dir)
            .field("policy", &self.inner.policy)
            .field("runs", &self.inner.runs.len())
            .finish()
    }
}

impl AnnotationService {
    pub fn new(
        uploads_dir: PathBuf,
        source: Arc<dyn DetectionSource>,
        frames: FrameStore,
        catalog: Catalog,
        policy: BatchPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(AnnotateInner {
                uploads_dir,
                source,
                frames,
                catalog,
                policy,
                runs: DashMap::new(),
            }),
        }
    }

    fn run(&self, video: &str) -> Result<Arc<Run>, AnnotateError> {
        let video = validate_name(video)?;
        self.inner
            .runs
            .get(video)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| AnnotateError::NoRun(video.to_string()))
    }

    pub async fn start(&self, video: &str) -> Result<AnnotationSnapshot, AnnotateError> {
        let video = validate_name(video)?.to_string();
        let path = self.inner.uploads_dir.join(&video);
        if !is_file(&path).await {
            return Err(AnnotateError::VideoNotFound(video));
        }

        let run = Arc::new(Run::default());
        if let Some(previous) = self.inner.runs.insert(video.clone(), run.clone()) {
            tracing::info!(video = %video, "restarting annotation run");
            abort_run(&previous).await;
        }

        let snapshot = run.state.read().await.snapshot(&video, 0, 0);
        let this = self.clone();
        tokio::spawn(async move { this.drive(video, path, run).await });
        Ok(snapshot)
    }

    async fn drive(self, video: String, path: PathBuf, run: Arc<Run>) {
        let opened = tokio::select! {
            biased;
            _ = run.cancel.cancelled() => None,
            opened = self.inner.source.open(&path, &video) => Some(opened),
        };
        let end = match opened {
            None => StreamEnd::Cancelled,
            Some(Err(err)) => StreamEnd::Failed(err),
            Some(Ok(stream)) => consume(stream, &run, self.inner.policy).await,
        };

        let completed = {
            let mut state = run.state.write().await;
            if run.cancel.is_cancelled() {
                if state.phase == Phase::Streaming {
                    state.phase = Phase::Idle;
                }
                false
            } else {
                match end {
                    StreamEnd::Finished => state.finish(),
                    StreamEnd::Cancelled => {
                        state.phase = Phase::Idle;
                        false
                    }
                    StreamEnd::Failed(err) => {
                        tracing::warn!(video = %video, error = %err, committed = state.committed(), "annotation run failed");
                        state.fail(err.to_string());
                        false
                    }
                }
            }
        };

        if completed {
            self.persist(&video, &run).await;
        }
    }

    async fn persist(&self, video: &str, run: &Run) {
        let frames: Vec<SaveFrame> = run
            .state
            .read()
            .await
            .frames
            .iter()
            .cloned()
            .map(SaveFrame::from)
            .collect();

        match self.inner.frames.save(video, &frames).await {
            Ok(outcome) => {
                run.state.write().await.persisted = true;
                if let Err(err) = self
                    .inner
                    .catalog
                    .set_frame_count(video, outcome.frame_count as i64)
                    .await
                {
                    tracing::warn!(video, error = %err, "failed to update catalog frame count");
                }
                self.inner
                    .catalog
                    .note(Some(video), "frames_saved", json!({ "frames": outcome.frame_count }))
                    .await;
                tracing::info!(video, frames = outcome.frame_count, "annotation run persisted");
            }
            Err(err) => {
                tracing::warn!(video, error = %err, "failed to persist annotated frames");
                run.state.write().await.save_error = Some(err.to_string());
            }
        }
    }

    pub async fn snapshot(&self, video: &str, offset: usize, limit: usize) -> Result<AnnotationSnapshot, AnnotateError> {
        let run = self.run(video)?;
        let state = run.state.read().await;
        Ok(state.snapshot(video, offset, limit))
    }

    pub async fn seek(&self, video: &str, index: u64) -> Result<AnnotationSnapshot, AnnotateError> {
        let run = self.run(video)?;
        let mut state = run.state.write().await;
        state.seek(index)?;
        Ok(state.snapshot(video, 0, 0))
    }

    pub async fn resync(&self, video: &str) -> Result<AnnotationSnapshot, AnnotateError> {
        let run = self.run(video)?;
        let mut state = run.state.write().await;
        state.resync();
        Ok(state.snapshot(video, 0, 0))
    }

    /// Safe in any state. Returns false when the video never had a run.
    pub async fn abort(&self, video: &str) -> Result<bool, AnnotateError> {
        match self.run(video) {
            Ok(run) => {
                abort_run(&run).await;
                Ok(true)
            }
            Err(AnnotateError::NoRun(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Drops the run of a video that was deleted or renamed.
    pub async fn forget(&self, video: &str) {
        if let Some((_, run)) = self.inner.runs.remove(video) {
            abort_run(&run).await;
        }
    }
}

async fn abort_run(run: &Run) {
    run.cancel.cancel();
    let mut state = run.state.write().await;
    if state.phase == Phase::Streaming {
        state.phase = Phase::Idle;
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path).await.map(|m| m.is_file()).unwrap_or(false)
}
