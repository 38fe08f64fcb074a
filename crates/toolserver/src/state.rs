use anyhow::Context;
use serde_json::json;
use std::sync::Arc;

use crate::{
    annotate::{AnnotationService, DetectionSource, InferenceClient},
    catalog::{Catalog, VideoRecord},
    config::Config,
    frames::FrameStore,
    thumbs::{Ffmpeg, FrameExtractor, ThumbnailService},
    upload::{ArtifactStore, ChunkSessionManager},
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub ffmpeg: bool,
    pub catalog: Catalog,
    pub uploads: ChunkSessionManager,
    pub thumbs: ThumbnailService,
    pub frames: FrameStore,
    pub annotations: AnnotationService,
    pub inference: InferenceClient,
}

impl AppState {
    /// Wires the production collaborators: ffmpeg/ffprobe and the remote inference service.
    pub fn new(config: Config, ffmpeg: bool) -> anyhow::Result<Self> {
        let extractor = Arc::new(Ffmpeg::new(
            config.ffmpeg_bin.clone(),
            config.ffprobe_bin.clone(),
            config.tool_timeout,
        ));
        let inference = inference_client(&config)?;
        let source: Arc<dyn DetectionSource> = Arc::new(inference.clone());
        Self::with_collaborators(config, ffmpeg, extractor, source)
    }

    pub fn with_collaborators(
        config: Config,
        ffmpeg: bool,
        extractor: Arc<dyn FrameExtractor>,
        source: Arc<dyn DetectionSource>,
    ) -> anyhow::Result<Self> {
        config.ensure_dirs()?;
        let catalog = Catalog::open(&config.db_path()).context("failed to init sqlite schema")?;
        let inference = inference_client(&config)?;

        let store = ArtifactStore::new(config.uploads_dir(), config.tmp_dir());
        let uploads = ChunkSessionManager::new(config.chunks_dir(), store);
        let thumbs = ThumbnailService::new(
            config.uploads_dir(),
            config.thumbs_dir(),
            config.thumb_concurrency,
            extractor,
        );
        let frames = FrameStore::new(config.saved_frames_dir(), config.scratch_frames_dir());
        let annotations = AnnotationService::new(
            config.uploads_dir(),
            source,
            frames.clone(),
            catalog.clone(),
            config.batch,
        );

        Ok(Self {
            config: Arc::new(config),
            ffmpeg,
            catalog,
            uploads,
            thumbs,
            frames,
            annotations,
            inference,
        })
    }

    /// Bookkeeping shared by every path that lands a new video.
    pub async fn artifact_created(&self, name: &str, size: u64, via: &'static str) {
        let record = VideoRecord {
            id: name.to_string(),
            size_bytes: size as i64,
            uploaded_at_ms: crate::now_ms(),
            thumbnail: None,
            frame_count: 0,
        };
        if let Err(err) = self.catalog.record_artifact(record).await {
            tracing::warn!(video = name, error = %err, "failed to record artifact in catalog");
        }
        self.catalog
            .note(Some(name), "artifact_created", json!({ "size": size, "via": via }))
            .await;
        tracing::info!(video = name, size, via, "artifact created");
        self.thumbs.spawn_ensure(name);
    }
}

fn inference_client(config: &Config) -> anyhow::Result<InferenceClient> {
    InferenceClient::new(
        config.annotate_url.clone(),
        config.upstream_connect_timeout,
        config.upstream_retries,
        config.upstream_backoff,
    )
    .context("failed to build inference client")
}
