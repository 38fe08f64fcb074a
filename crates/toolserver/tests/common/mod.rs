#![allow(dead_code)]

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    body::{Body, Bytes},
    http::{header::CONTENT_TYPE, Method, Request, Response},
    Router,
};
use futures::{stream, StreamExt};
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use dashcam_toolserver::{
    annotate::{AnnotateError, ByteStream, DetectionSource},
    build_router,
    thumbs::{FrameExtractor, ToolError},
    AppState, Config,
};

/// Stands in for ffprobe/ffmpeg: every video is ten seconds long and every
/// extraction writes a tiny JPEG.
#[derive(Default)]
pub struct FakeExtractor {
    pub extractions: AtomicUsize,
}

#[async_trait]
impl FrameExtractor for FakeExtractor {
    async fn probe_duration(&self, _video: &Path) -> Result<f64, ToolError> {
        Ok(10.0)
    }

    async fn extract_frame(&self, _video: &Path, _at_secs: f64, out: &Path) -> Result<(), ToolError> {
        self.extractions.fetch_add(1, Ordering::SeqCst);
        tokio::fs::write(out, [0xff, 0xd8, 0xff, 0xd9])
            .await
            .map_err(|source| ToolError::Spawn {
                tool: "fake".to_string(),
                source,
            })
    }
}

/// Replays a fixed NDJSON script as the detection stream.
pub struct ScriptedSource {
    pub lines: Vec<String>,
}

#[async_trait]
impl DetectionSource for ScriptedSource {
    async fn open(&self, _video_path: &Path, _file_name: &str) -> Result<ByteStream, AnnotateError> {
        let chunks: Vec<Result<Bytes, AnnotateError>> =
            self.lines.iter().map(|l| Ok(Bytes::from(l.clone()))).collect();
        Ok(stream::iter(chunks).boxed())
    }
}

pub struct TestApp {
    pub dir: TempDir,
    pub state: AppState,
    pub extractor: Arc<FakeExtractor>,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_script(Vec::new())
    }

    /// The inference URL points at the discard port, so the proxy route fails fast.
    pub fn with_script(lines: Vec<String>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::with_data_dir(dir.path().join("data"));
        config.annotate_url = "http://127.0.0.1:9/process-video".to_string();
        config.upstream_retries = 0;
        config.upstream_connect_timeout = Duration::from_secs(1);

        let extractor = Arc::new(FakeExtractor::default());
        let state = AppState::with_collaborators(
            config,
            false,
            extractor.clone(),
            Arc::new(ScriptedSource { lines }),
        )
        .unwrap();
        Self { dir, state, extractor }
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.state.config.uploads_dir()
    }

    /// Drops a video straight into the uploads dir, bypassing the upload routes.
    pub async fn seed_video(&self, name: &str, bytes: &[u8]) {
        tokio::fs::write(self.uploads_dir().join(name), bytes).await.unwrap();
    }
}

pub async fn send(app: Router, request: Request<Body>) -> Response<Body> {
    app.oneshot(request).await.unwrap()
}

pub async fn get(app: Router, uri: &str) -> Response<Body> {
    send(app, Request::get(uri).body(Body::empty()).unwrap()).await
}

pub async fn json_request(app: Router, method: Method, uri: &str, body: Value) -> Response<Body> {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    send(app, request).await
}

pub async fn put_bytes(app: Router, uri: &str, bytes: &'static [u8]) -> Response<Body> {
    send(app, Request::put(uri).body(Body::from(bytes)).unwrap()).await
}

pub async fn body_bytes(response: Response<Body>) -> Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

pub async fn body_json(response: Response<Body>) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}
