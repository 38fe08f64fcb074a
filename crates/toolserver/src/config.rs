use anyhow::Context;
use std::{
    net::{IpAddr, Ipv4Addr},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use crate::annotate::BatchPolicy;

/// Runtime configuration, read from the environment (optionally seeded from `.env`).
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub host: IpAddr,
    pub port: u16,
    pub annotate_url: String,
    pub thumb_concurrency: usize,
    pub ffmpeg_bin: String,
    pub ffprobe_bin: String,
    pub tool_timeout: Duration,
    pub upstream_connect_timeout: Duration,
    pub upstream_retries: u32,
    pub upstream_backoff: Duration,
    pub batch: BatchPolicy,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::with_data_dir(PathBuf::from("data"));

        Ok(Self {
            data_dir: PathBuf::from(std::env::var("DATA_DIR").unwrap_or_else(|_| "data".to_string())),
            host: env_or("TOOLSERVER_HOST", defaults.host)?,
            port: env_or("TOOLSERVER_PORT", defaults.port)?,
            annotate_url: std::env::var("ANNOTATE_URL").unwrap_or(defaults.annotate_url),
            thumb_concurrency: env_or("THUMB_CONCURRENCY", defaults.thumb_concurrency)?.max(1),
            ffmpeg_bin: std::env::var("FFMPEG_BIN").unwrap_or(defaults.ffmpeg_bin),
            ffprobe_bin: std::env::var("FFPROBE_BIN").unwrap_or(defaults.ffprobe_bin),
            tool_timeout: Duration::from_secs(env_or("TOOL_TIMEOUT_SECS", 60u64)?),
            upstream_connect_timeout: Duration::from_secs(env_or("UPSTREAM_CONNECT_TIMEOUT_SECS", 10u64)?),
            upstream_retries: env_or("UPSTREAM_RETRIES", defaults.upstream_retries)?,
            upstream_backoff: defaults.upstream_backoff,
            batch: BatchPolicy {
                max_frames: env_or("STREAM_BATCH_MAX", defaults.batch.max_frames)?.max(1),
                flush_interval: Duration::from_millis(env_or("STREAM_FLUSH_MS", 80u64)?),
            },
        })
    }

    /// Defaults rooted at `data_dir`; used by `from_env` and by tests.
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 6791,
            annotate_url: "http://localhost:26000/process-video".to_string(),
            thumb_concurrency: 2,
            ffmpeg_bin: "ffmpeg".to_string(),
            ffprobe_bin: "ffprobe".to_string(),
            tool_timeout: Duration::from_secs(60),
            upstream_connect_timeout: Duration::from_secs(10),
            upstream_retries: 2,
            upstream_backoff: Duration::from_millis(250),
            batch: BatchPolicy::default(),
        }
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.data_dir.join("uploads")
    }

    pub fn chunks_dir(&self) -> PathBuf {
        self.uploads_dir().join(".chunks")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.uploads_dir().join(".tmp")
    }

    pub fn thumbs_dir(&self) -> PathBuf {
        self.uploads_dir().join(".thumbs")
    }

    pub fn scratch_frames_dir(&self) -> PathBuf {
        self.uploads_dir().join(".frames")
    }

    pub fn saved_frames_dir(&self) -> PathBuf {
        self.uploads_dir().join(".saved_frames")
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("toolserver.sqlite3")
    }

    /// Creates every directory the service writes into.
    pub fn ensure_dirs(&self) -> anyhow::Result<()> {
        for dir in [
            self.uploads_dir(),
            self.chunks_dir(),
            self.tmp_dir(),
            self.thumbs_dir(),
            self.saved_frames_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

fn env_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid value for {key}: {raw:?} ({e})")),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_hangs_off_data_dir() {
        let config = Config::with_data_dir(PathBuf::from("/srv/dash"));
        assert_eq!(config.uploads_dir(), PathBuf::from("/srv/dash/uploads"));
        assert_eq!(config.chunks_dir(), PathBuf::from("/srv/dash/uploads/.chunks"));
        assert_eq!(
            config.saved_frames_dir(),
            PathBuf::from("/srv/dash/uploads/.saved_frames")
        );
        assert_eq!(config.db_path(), PathBuf::from("/srv/dash/toolserver.sqlite3"));
    }

    #[test]
    fn env_or_reports_the_variable_name() {
        std::env::set_var("DASHCAM_TEST_BAD_PORT", "not-a-port");
        let err = env_or::<u16>("DASHCAM_TEST_BAD_PORT", 1).unwrap_err();
        assert!(err.to_string().contains("DASHCAM_TEST_BAD_PORT"));
        std::env::remove_var("DASHCAM_TEST_BAD_PORT");

        assert_eq!(env_or::<u16>("DASHCAM_TEST_UNSET_PORT", 7).unwrap(), 7);
    }
}
