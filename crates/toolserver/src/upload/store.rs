use dashmap::DashSet;
use serde::Serialize;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::io::{AsyncRead, AsyncWriteExt, BufWriter};
use uuid::Uuid;

use super::UploadError;
use crate::naming::{numbered_variant, sanitize_filename};

/// Upper bound on `name (n).ext` probing before giving up on a name.
const MAX_COLLISION_SUFFIX: u32 = 10_000;

/// The directory of assembled videos plus the names currently promised to
/// uploads that have not landed yet.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    inner: Arc<StoreInner>,
}

#[derive(Debug)]
struct StoreInner {
    uploads_dir: PathBuf,
    tmp_dir: PathBuf,
    reserved: DashSet<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StoredArtifact {
    pub original: String,
    pub stored: String,
    pub size: u64,
}

impl ArtifactStore {
    pub fn new(uploads_dir: PathBuf, tmp_dir: PathBuf) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                uploads_dir,
                tmp_dir,
                reserved: DashSet::new(),
            }),
        }
    }

    pub fn uploads_dir(&self) -> &Path {
        &self.inner.uploads_dir
    }

    pub fn path_of(&self, name: &str) -> PathBuf {
        self.inner.uploads_dir.join(name)
    }

    /// Sanitizes `original` and reserves the first free variant of it.
    ///
    /// A name is free when no file has it and no open upload holds it. The
    /// reservation is held until [`ArtifactStore::release`].
    pub async fn claim_name(&self, original: &str) -> Result<String, UploadError> {
        let clean = sanitize_filename(original);
        for n in 0..=MAX_COLLISION_SUFFIX {
            let candidate = if n == 0 { clean.clone() } else { numbered_variant(&clean, n) };
            if tokio::fs::try_exists(self.path_of(&candidate)).await? {
                continue;
            }
            if self.inner.reserved.insert(candidate.clone()) {
                return Ok(candidate);
            }
        }
        Err(UploadError::NameExhausted(clean))
    }

    pub fn release(&self, name: &str) {
        self.inner.reserved.remove(name);
    }

    pub async fn temp_path(&self) -> Result<PathBuf, UploadError> {
        tokio::fs::create_dir_all(&self.inner.tmp_dir).await?;
        Ok(self.inner.tmp_dir.join(format!("{}.partial", Uuid::new_v4())))
    }

    /// Moves a fully written temp file to its final name in one rename.
    pub async fn commit(&self, temp: &Path, name: &str) -> Result<u64, UploadError> {
        let target = self.path_of(name);
        tokio::fs::rename(temp, &target).await?;
        Ok(tokio::fs::metadata(&target).await?.len())
    }

    /// Legacy single-request path: stream `reader` straight into a new artifact.
    pub async fn store_stream<R>(&self, original: &str, reader: R) -> Result<StoredArtifact, UploadError>
    where
        R: AsyncRead + Unpin,
    {
        let stored = self.claim_name(original).await?;
        let outcome = self.write_and_commit(&stored, reader).await;
        self.release(&stored);
        let size = outcome?;

        tracing::info!(original, stored = %stored, size, "artifact stored");
        Ok(StoredArtifact {
            original: original.to_string(),
            stored,
            size,
        })
    }

    /// Writes `reader` to a fresh temp file, returning its path and size.
    pub async fn spool<R>(&self, mut reader: R) -> Result<(PathBuf, u64), UploadError>
    where
        R: AsyncRead + Unpin,
    {
        let temp = self.temp_path().await?;
        let written = async {
            let file = tokio::fs::File::create(&temp).await?;
            let mut out = BufWriter::new(file);
            let size = tokio::io::copy(&mut reader, &mut out).await?;
            out.flush().await?;
            out.into_inner().sync_all().await?;
            Ok::<_, std::io::Error>(size)
        }
        .await;

        match written {
            Ok(size) => Ok((temp, size)),
            Err(err) => {
                let _ = tokio::fs::remove_file(&temp).await;
                Err(err.into())
            }
        }
    }

    /// Promotes an already spooled temp file to a new artifact named after `original`.
    pub async fn adopt(&self, original: &str, temp: &Path) -> Result<StoredArtifact, UploadError> {
        let stored = self.claim_name(original).await?;
        let outcome = self.commit(temp, &stored).await;
        self.release(&stored);
        let size = match outcome {
            Ok(size) => size,
            Err(err) => {
                let _ = tokio::fs::remove_file(temp).await;
                return Err(err);
            }
        };

        tracing::info!(original, stored = %stored, size, "artifact stored");
        Ok(StoredArtifact {
            original: original.to_string(),
            stored,
            size,
        })
    }

    async fn write_and_commit<R>(&self, name: &str, reader: R) -> Result<u64, UploadError>
    where
        R: AsyncRead + Unpin,
    {
        let (temp, _) = self.spool(reader).await?;
        match self.commit(&temp, name).await {
            Ok(size) => Ok(size),
            Err(err) => {
                let _ = tokio::fs::remove_file(&temp).await;
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &tempfile::TempDir) -> ArtifactStore {
        let uploads = dir.path().join("uploads");
        std::fs::create_dir_all(&uploads).unwrap();
        ArtifactStore::new(uploads.clone(), uploads.join(".tmp"))
    }

    #[tokio::test]
    async fn claims_skip_existing_files_and_reservations() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        std::fs::write(store.path_of("run.mp4"), b"x").unwrap();

        let first = store.claim_name("run.mp4").await.unwrap();
        let second = store.claim_name("run.mp4").await.unwrap();
        assert_eq!(first, "run (1).mp4");
        assert_eq!(second, "run (2).mp4");

        store.release(&first);
        assert_eq!(store.claim_name("run.mp4").await.unwrap(), "run (1).mp4");
    }

    #[tokio::test]
    async fn store_stream_writes_whole_body() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);

        let body: &[u8] = b"dashcam bytes";
        let stored = store.store_stream("road.mov", body).await.unwrap();
        assert_eq!(stored.stored, "road.mov");
        assert_eq!(stored.size, 13);
        assert_eq!(std::fs::read(store.path_of("road.mov")).unwrap(), body);

        let again = store.store_stream("road.mov", body).await.unwrap();
        assert_eq!(again.stored, "road (1).mov");
    }

    #[tokio::test]
    async fn spooled_file_is_adopted_under_a_free_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        std::fs::write(store.path_of("cam.mp4"), b"old").unwrap();

        let body: &[u8] = b"fresh";
        let (temp, size) = store.spool(body).await.unwrap();
        assert_eq!(size, 5);

        let stored = store.adopt("cam.mp4", &temp).await.unwrap();
        assert_eq!(stored.stored, "cam (1).mp4");
        assert!(!temp.exists());
        assert_eq!(std::fs::read(store.path_of("cam.mp4")).unwrap(), b"old");
        assert_eq!(std::fs::read(store.path_of("cam (1).mp4")).unwrap(), b"fresh");
    }
}
