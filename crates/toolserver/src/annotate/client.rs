use async_trait::async_trait;
use axum::body::Bytes;
use futures::{stream::BoxStream, StreamExt, TryStreamExt};
use reqwest::multipart::{Form, Part};
use std::{path::Path, time::Duration};
use tokio_util::io::ReaderStream;

use super::AnnotateError;

pub type ByteStream = BoxStream<'static, Result<Bytes, AnnotateError>>;

/// Opens the detection stream for a stored video.
#[async_trait]
pub trait DetectionSource: Send + Sync {
    async fn open(&self, video_path: &Path, file_name: &str) -> Result<ByteStream, AnnotateError>;
}

/// Fixed processing parameters sent alongside every video.
const PROCESS_FIELDS: [(&str, &str); 5] = [
    ("stream", "true"),
    ("include_frames", "true"),
    ("downscale_to", "720"),
    ("encode_ext", ".jpg"),
    ("encode_quality", "80"),
];

#[derive(Debug, Clone)]
pub struct InferenceClient {
    http: reqwest::Client,
    url: String,
    retries: u32,
    backoff: Duration,
}

impl InferenceClient {
    /// Only the connect phase is bounded; the response body may run for as long as the video takes.
    pub fn new(
        url: impl Into<String>,
        connect_timeout: Duration,
        retries: u32,
        backoff: Duration,
    ) -> Result<Self, AnnotateError> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| AnnotateError::Upstream(format!("failed to build http client: {e}")))?;
        Ok(Self {
            http,
            url: url.into(),
            retries,
            backoff,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn form(video_path: &Path, file_name: &str) -> Result<Form, AnnotateError> {
        let file = match tokio::fs::File::open(video_path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(AnnotateError::VideoNotFound(file_name.to_string()))
            }
            Err(err) => return Err(err.into()),
        };
        let len = file.metadata().await?.len();
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        let part = Part::stream_with_length(body, len)
            .file_name(file_name.to_string())
            .mime_str("application/octet-stream")
            .map_err(|e| AnnotateError::Upstream(e.to_string()))?;

        Ok(PROCESS_FIELDS
            .iter()
            .fold(Form::new().part("file", part), |form, (k, v)| form.text(*k, *v)))
    }

    /// Posts the video and returns the response once its status is known.
    /// Connection failures and 5xx responses are retried with exponential
    /// backoff; nothing is retried after a successful status.
    pub async fn send(&self, video_path: &Path, file_name: &str) -> Result<reqwest::Response, AnnotateError> {
        let mut delay = self.backoff;
        let mut attempt = 0u32;

        loop {
            let form = Self::form(video_path, file_name).await?;
            let failure = match self.http.post(&self.url).multipart(form).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) => {
                    let status = resp.status();
                    let message = format!("inference service returned {status}");
                    if !status.is_server_error() {
                        return Err(AnnotateError::Upstream(message));
                    }
                    message
                }
                Err(err) if err.is_connect() || err.is_timeout() => {
                    format!("inference service unreachable: {err}")
                }
                Err(err) => return Err(AnnotateError::Upstream(err.to_string())),
            };

            if attempt >= self.retries {
                return Err(AnnotateError::Upstream(failure));
            }
            attempt += 1;
            tracing::warn!(
                url = %self.url,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "retrying inference request",
            );
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
    }
}

#[async_trait]
impl DetectionSource for InferenceClient {
    async fn open(&self, video_path: &Path, file_name: &str) -> Result<ByteStream, AnnotateError> {
        let resp = self.send(video_path, file_name).await?;
        Ok(resp
            .bytes_stream()
            .map_err(|e| AnnotateError::Stream(e.to_string()))
            .boxed())
    }
}
