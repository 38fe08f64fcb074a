//! Preview thumbnails derived from stored videos.
//!
//! Lookups go existence cache → disk → in-flight generation → new generation.
//! Generation shells out to ffprobe/ffmpeg under a fair global semaphore, so
//! excess requests queue in arrival order. Any tool failure just means "no
//! thumbnail"; callers substitute a placeholder.

use async_trait::async_trait;
use base64::Engine as _;
use dashmap::DashSet;
use serde::Serialize;
use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};
use tokio::{process::Command, sync::Semaphore};

use crate::{naming::validate_name, singleflight::SingleFlight};

const THUMB_SUFFIX: &str = ".thumb.jpg";

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("failed to launch {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{tool} timed out after {after:?}")]
    Timeout { tool: String, after: Duration },
    #[error("{tool} exited with {status}: {stderr}")]
    Failed {
        tool: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("could not read a duration from {0:?}")]
    Unparseable(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ThumbError {
    #[error(transparent)]
    InvalidName(#[from] crate::naming::InvalidName),
    #[error("thumbnail payload is not valid base64")]
    InvalidImage,
    #[error("thumbnail i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

/// The external media tools, kept behind a trait so they can be swapped out.
#[async_trait]
pub trait FrameExtractor: Send + Sync {
    async fn probe_duration(&self, video: &Path) -> Result<f64, ToolError>;

    /// Writes a single scaled JPEG frame captured at `at_secs` to `out`.
    async fn extract_frame(&self, video: &Path, at_secs: f64, out: &Path) -> Result<(), ToolError>;
}

#[derive(Debug, Clone)]
pub struct Ffmpeg {
    ffmpeg_bin: String,
    ffprobe_bin: String,
    timeout: Duration,
}

impl Ffmpeg {
    pub fn new(ffmpeg_bin: impl Into<String>, ffprobe_bin: impl Into<String>, timeout: Duration) -> Self {
        Self {
            ffmpeg_bin: ffmpeg_bin.into(),
            ffprobe_bin: ffprobe_bin.into(),
            timeout,
        }
    }

    async fn run(&self, tool: &str, args: &[&str]) -> Result<String, ToolError> {
        let mut cmd = Command::new(tool);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| ToolError::Timeout {
                tool: tool.to_string(),
                after: self.timeout,
            })?
            .map_err(|source| ToolError::Spawn {
                tool: tool.to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(ToolError::Failed {
                tool: tool.to_string(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl FrameExtractor for Ffmpeg {
    async fn probe_duration(&self, video: &Path) -> Result<f64, ToolError> {
        let video = video.to_string_lossy();
        let stdout = self
            .run(
                &self.ffprobe_bin,
                &[
                    "-v",
                    "error",
                    "-show_entries",
                    "format=duration",
                    "-of",
                    "default=noprint_wrappers=1:nokey=1",
                    &video,
                ],
            )
            .await?;
        let trimmed = stdout.trim();
        trimmed
            .parse::<f64>()
            .ok()
            .filter(|d| d.is_finite() && *d >= 0.0)
            .ok_or_else(|| ToolError::Unparseable(trimmed.to_string()))
    }

    async fn extract_frame(&self, video: &Path, at_secs: f64, out: &Path) -> Result<(), ToolError> {
        let at = format!("{at_secs:.3}");
        let video = video.to_string_lossy();
        let out = out.to_string_lossy();
        self.run(
            &self.ffmpeg_bin,
            &[
                "-hide_banner",
                "-loglevel",
                "error",
                "-ss",
                &at,
                "-i",
                &video,
                "-frames:v",
                "1",
                "-vf",
                "scale=320:-1",
                "-q:v",
                "3",
                "-y",
                &out,
            ],
        )
        .await
        .map(|_| ())
    }
}

/// Capture point for a clip of the given duration: mid-clip, kept half a
/// second away from either end when the clip is long enough.
pub fn capture_timestamp(duration: Option<f64>) -> f64 {
    match duration {
        Some(d) if d > 2.0 => (d / 2.0).clamp(0.5, d - 0.5),
        Some(d) if d > 0.0 => d / 2.0,
        _ => 1.0,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThumbnailRef {
    pub name: String,
}

impl ThumbnailRef {
    pub fn for_video(video_id: &str) -> Self {
        Self {
            name: format!("{video_id}{THUMB_SUFFIX}"),
        }
    }

    pub fn url(&self) -> String {
        format!("/api/videos/thumb/{}", urlencoding::encode(&self.name))
    }

    /// The video a thumbnail name was derived from.
    pub fn video_of(thumb_name: &str) -> Option<&str> {
        thumb_name.strip_suffix(THUMB_SUFFIX).filter(|v| !v.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ThumbnailState {
    Missing,
    Generating,
    Ready,
}

#[derive(Clone)]
pub struct ThumbnailService {
    inner: Arc<ThumbInner>,
}

struct ThumbInner {
    uploads_dir: PathBuf,
    thumbs_dir: PathBuf,
    ready: DashSet<String>,
    flights: SingleFlight<String, Option<ThumbnailRef>>,
    permits: Semaphore,
    extractor: Arc<dyn FrameExtractor>,
}

impl std::fmt::Debug for ThumbnailService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThumbnailService")
            .field("thumbs_dir", &self.inner.thumbs_dir)
            .field("cached", &self.inner.ready.len())
            .field("flights", &self.inner.flights)
            .field("permits_available", &self.inner.permits.available_permits())
            .finish()
    }
}

impl ThumbnailService {
    pub fn new(
        uploads_dir: PathBuf,
        thumbs_dir: PathBuf,
        concurrency: usize,
        extractor: Arc<dyn FrameExtractor>,
    ) -> Self {
        Self {
            inner: Arc::new(ThumbInner {
                uploads_dir,
                thumbs_dir,
                ready: DashSet::new(),
                flights: SingleFlight::new(),
                permits: Semaphore::new(concurrency.max(1)),
                extractor,
            }),
        }
    }

    pub fn path_of(&self, thumb: &ThumbnailRef) -> PathBuf {
        self.inner.thumbs_dir.join(&thumb.name)
    }

    pub fn thumbs_dir(&self) -> &Path {
        &self.inner.thumbs_dir
    }

    /// Returns the video's thumbnail, generating it if needed. `None` means
    /// the video is unknown or generation failed.
    pub async fn ensure(&self, video_id: &str) -> Option<ThumbnailRef> {
        let video_id = validate_name(video_id).ok()?;
        let thumb = ThumbnailRef::for_video(video_id);

        if self.inner.ready.contains(&thumb.name) {
            return Some(thumb);
        }
        if is_file(&self.path_of(&thumb)).await {
            self.inner.ready.insert(thumb.name.clone());
            return Some(thumb);
        }

        let video = self.inner.uploads_dir.join(video_id);
        if !is_file(&video).await {
            return None;
        }

        let this = self.clone();
        let key = thumb.name.clone();
        self.inner
            .flights
            .run(key, async move { this.generate(video, thumb).await })
            .await
            .unwrap_or(None)
    }

    /// Fire-and-forget generation, used right after an artifact lands.
    pub fn spawn_ensure(&self, video_id: &str) {
        let this = self.clone();
        let video_id = video_id.to_string();
        tokio::spawn(async move {
            if this.ensure(&video_id).await.is_none() {
                tracing::debug!(video = %video_id, "no thumbnail produced");
            }
        });
    }

    /// Looks only at the cache and disk; never starts generation.
    pub async fn existing(&self, video_id: &str) -> Option<ThumbnailRef> {
        let video_id = validate_name(video_id).ok()?;
        let thumb = ThumbnailRef::for_video(video_id);
        if self.inner.ready.contains(&thumb.name) || is_file(&self.path_of(&thumb)).await {
            return Some(thumb);
        }
        None
    }

    pub async fn state(&self, video_id: &str) -> ThumbnailState {
        let thumb = ThumbnailRef::for_video(video_id);
        if self.inner.flights.is_in_flight(&thumb.name) {
            ThumbnailState::Generating
        } else if self.existing(video_id).await.is_some() {
            ThumbnailState::Ready
        } else {
            ThumbnailState::Missing
        }
    }

    async fn generate(&self, video: PathBuf, thumb: ThumbnailRef) -> Option<ThumbnailRef> {
        let _permit = self.inner.permits.acquire().await.ok()?;

        // Another flight may have landed between our disk check and the permit.
        let out = self.path_of(&thumb);
        if is_file(&out).await {
            self.inner.ready.insert(thumb.name.clone());
            return Some(thumb);
        }
        if let Err(err) = tokio::fs::create_dir_all(&self.inner.thumbs_dir).await {
            tracing::warn!(error = %err, "cannot create thumbnail directory");
            return None;
        }

        let duration = match self.inner.extractor.probe_duration(&video).await {
            Ok(d) => Some(d),
            Err(err) => {
                tracing::debug!(video = %video.display(), error = %err, "duration probe failed");
                None
            }
        };
        let at = capture_timestamp(duration);

        let tmp = self.inner.thumbs_dir.join(format!("{}.tmp.jpg", thumb.name));
        if let Err(err) = self.inner.extractor.extract_frame(&video, at, &tmp).await {
            tracing::warn!(video = %video.display(), error = %err, "thumbnail extraction failed");
            let _ = tokio::fs::remove_file(&tmp).await;
            return None;
        }
        if !is_file(&tmp).await {
            tracing::warn!(video = %video.display(), "extractor reported success but wrote nothing");
            return None;
        }
        if let Err(err) = tokio::fs::rename(&tmp, &out).await {
            tracing::warn!(error = %err, "failed to move thumbnail into place");
            let _ = tokio::fs::remove_file(&tmp).await;
            return None;
        }

        self.inner.ready.insert(thumb.name.clone());
        tracing::info!(thumbnail = %thumb.name, at_secs = at, "thumbnail generated");
        Some(thumb)
    }

    /// Drops a video's thumbnail from disk and cache.
    pub async fn forget(&self, video_id: &str) {
        let thumb = ThumbnailRef::for_video(video_id);
        self.inner.ready.remove(&thumb.name);
        if let Err(err) = tokio::fs::remove_file(self.path_of(&thumb)).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(thumbnail = %thumb.name, error = %err, "failed to remove thumbnail");
            }
        }
    }

    /// Moves a thumbnail along with its renamed video. Missing thumbnails are fine.
    pub async fn rename(&self, old_video: &str, new_video: &str) {
        let old = ThumbnailRef::for_video(old_video);
        let new = ThumbnailRef::for_video(new_video);
        self.inner.ready.remove(&old.name);
        match tokio::fs::rename(self.path_of(&old), self.path_of(&new)).await {
            Ok(()) => {
                self.inner.ready.insert(new.name);
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => tracing::warn!(error = %err, "failed to rename thumbnail"),
        }
    }

    /// Stores a client-captured thumbnail. Returns the ref and whether an
    /// existing thumbnail was kept instead.
    pub async fn store_uploaded(
        &self,
        video_id: &str,
        image_base64: &str,
        overwrite: bool,
    ) -> Result<(ThumbnailRef, bool), ThumbError> {
        let video_id = validate_name(video_id)?;
        let thumb = ThumbnailRef::for_video(video_id);
        let dest = self.path_of(&thumb);

        if !overwrite && is_file(&dest).await {
            return Ok((thumb, true));
        }

        let raw = match image_base64.split_once(',') {
            Some((prefix, data)) if prefix.starts_with("data:image/") && prefix.ends_with(";base64") => data,
            _ => image_base64,
        };
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(raw.trim())
            .map_err(|_| ThumbError::InvalidImage)?;
        if bytes.is_empty() {
            return Err(ThumbError::InvalidImage);
        }

        tokio::fs::create_dir_all(&self.inner.thumbs_dir).await?;
        let tmp = self.inner.thumbs_dir.join(format!("{}.upload.tmp", thumb.name));
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &dest).await?;
        self.inner.ready.insert(thumb.name.clone());
        Ok((thumb, false))
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Writes a fake JPEG after a short delay and counts invocations.
    #[derive(Default)]
    struct CountingExtractor {
        probes: AtomicUsize,
        extractions: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl FrameExtractor for CountingExtractor {
        async fn probe_duration(&self, _video: &Path) -> Result<f64, ToolError> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            Ok(10.0)
        }

        async fn extract_frame(&self, _video: &Path, at_secs: f64, out: &Path) -> Result<(), ToolError> {
            assert_eq!(at_secs, 5.0);
            self.extractions.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            if self.fail {
                return Err(ToolError::Unparseable("forced".into()));
            }
            tokio::fs::write(out, b"\xFF\xD8jpeg").await.unwrap();
            Ok(())
        }
    }

    fn service(dir: &tempfile::TempDir, extractor: Arc<CountingExtractor>) -> ThumbnailService {
        let uploads = dir.path().join("uploads");
        std::fs::create_dir_all(&uploads).unwrap();
        std::fs::write(uploads.join("drive.mp4"), b"video").unwrap();
        ThumbnailService::new(uploads.clone(), uploads.join(".thumbs"), 2, extractor)
    }

    #[test]
    fn capture_point_prefers_middle() {
        assert_eq!(capture_timestamp(None), 1.0);
        assert_eq!(capture_timestamp(Some(10.0)), 5.0);
        assert_eq!(capture_timestamp(Some(1.5)), 0.75);
        assert_eq!(capture_timestamp(Some(2.5)), 1.25);
        assert_eq!(capture_timestamp(Some(0.0)), 1.0);
    }

    #[test]
    fn thumbnail_urls_are_encoded() {
        let thumb = ThumbnailRef::for_video("my drive (1).mp4");
        assert_eq!(thumb.url(), "/api/videos/thumb/my%20drive%20%281%29.mp4.thumb.jpg");
        assert_eq!(ThumbnailRef::video_of(&thumb.name), Some("my drive (1).mp4"));
        assert_eq!(ThumbnailRef::video_of(".thumb.jpg"), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_ensure_runs_one_extraction() {
        let dir = tempfile::tempdir().unwrap();
        let extractor = Arc::new(CountingExtractor::default());
        let thumbs = service(&dir, Arc::clone(&extractor));

        let calls: Vec<_> = (0..5)
            .map(|_| {
                let thumbs = thumbs.clone();
                tokio::spawn(async move { thumbs.ensure("drive.mp4").await })
            })
            .collect();
        for call in calls {
            let thumb = call.await.unwrap().expect("thumbnail");
            assert_eq!(thumb.name, "drive.mp4.thumb.jpg");
        }

        assert_eq!(extractor.extractions.load(Ordering::SeqCst), 1);
        assert_eq!(thumbs.state("drive.mp4").await, ThumbnailState::Ready);

        thumbs.ensure("drive.mp4").await.unwrap();
        assert_eq!(extractor.extractions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failures_degrade_to_none() {
        let dir = tempfile::tempdir().unwrap();
        let extractor = Arc::new(CountingExtractor {
            fail: true,
            ..Default::default()
        });
        let thumbs = service(&dir, Arc::clone(&extractor));

        assert_eq!(thumbs.ensure("drive.mp4").await, None);
        assert_eq!(thumbs.ensure("missing.mp4").await, None);
        assert_eq!(thumbs.ensure("../etc").await, None);
        assert_eq!(thumbs.state("drive.mp4").await, ThumbnailState::Missing);
        assert!(!dir.path().join("uploads/.thumbs/drive.mp4.thumb.jpg.tmp.jpg").exists());
    }

    #[tokio::test]
    async fn uploaded_thumbnail_respects_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let thumbs = service(&dir, Arc::new(CountingExtractor::default()));

        let (thumb, existed) = thumbs
            .store_uploaded("drive.mp4", "data:image/jpeg;base64,AQID", false)
            .await
            .unwrap();
        assert!(!existed);
        assert_eq!(std::fs::read(thumbs.path_of(&thumb)).unwrap(), [1, 2, 3]);

        let (_, existed) = thumbs.store_uploaded("drive.mp4", "BAUG", false).await.unwrap();
        assert!(existed);
        assert_eq!(std::fs::read(thumbs.path_of(&thumb)).unwrap(), [1, 2, 3]);

        thumbs.store_uploaded("drive.mp4", "BAUG", true).await.unwrap();
        assert_eq!(std::fs::read(thumbs.path_of(&thumb)).unwrap(), [4, 5, 6]);

        assert!(matches!(
            thumbs.store_uploaded("drive.mp4", "@@@", true).await,
            Err(ThumbError::InvalidImage)
        ));
    }

    #[tokio::test]
    async fn rename_and_forget_follow_the_video() {
        let dir = tempfile::tempdir().unwrap();
        let thumbs = service(&dir, Arc::new(CountingExtractor::default()));
        thumbs.ensure("drive.mp4").await.unwrap();

        thumbs.rename("drive.mp4", "renamed.mp4").await;
        assert!(thumbs.existing("renamed.mp4").await.is_some());
        assert!(thumbs.existing("drive.mp4").await.is_none());

        thumbs.forget("renamed.mp4").await;
        assert!(thumbs.existing("renamed.mp4").await.is_none());
    }
}
