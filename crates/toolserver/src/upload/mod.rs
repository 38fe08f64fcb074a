//! Resumable chunked uploads and their assembly into artifacts.

pub mod assemble;
mod store;

pub use store::{ArtifactStore, StoredArtifact};

use dashmap::{mapref::entry::Entry, DashMap};
use serde::Serialize;
use std::{
    collections::BTreeSet,
    future::Future,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::io::{AsyncRead, AsyncWriteExt, BufWriter};
use uuid::Uuid;

use crate::{
    naming::{validate_name, InvalidName},
    singleflight::SingleFlight,
};

#[derive(Debug, Clone, thiserror::Error)]
pub enum UploadError {
    #[error("totalChunks must be a positive integer")]
    InvalidTotalChunks,
    #[error(transparent)]
    InvalidName(#[from] InvalidName),
    #[error("unknown upload session {0}")]
    InvalidSession(String),
    #[error("chunk index {index} out of range (totalChunks={total})")]
    OutOfRange { index: u64, total: u32 },
    #[error("chunk {index} is {size} bytes, above the declared part size {part_size}")]
    PartTooLarge { index: u32, size: u64, part_size: u64 },
    #[error("upload session {session} declared {declared} chunks, request says {requested}")]
    ChunkCountMismatch {
        session: String,
        declared: u32,
        requested: u64,
    },
    #[error("upload session {0} is already complete")]
    SessionClosed(String),
    #[error("missing chunk {0}")]
    MissingPart(u32),
    #[error("assembled size {actual} does not match declared size {expected}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("no free variant of {0:?} is available")]
    NameExhausted(String),
    #[error("finalize task ended without a result")]
    Aborted,
    #[error("upload i/o failed: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for UploadError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl UploadError {
    /// Missing or short data; the session stays open so the client can resend parts.
    pub fn is_partial_data(&self) -> bool {
        matches!(self, Self::MissingPart(_) | Self::SizeMismatch { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Collecting,
    Finalizing,
    Complete,
    Failed,
}

#[derive(Debug, Clone)]
pub struct UploadSession {
    pub id: String,
    pub original_name: String,
    pub final_name: String,
    pub total_chunks: u32,
    pub total_size: Option<u64>,
    pub part_size: Option<u64>,
    pub created_at_ms: i64,
    pub received: BTreeSet<u32>,
    pub status: SessionStatus,
    assembled_size: Option<u64>,
    completed_at_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionInit {
    pub session_id: String,
    pub final_name: String,
    pub total_chunks: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub session_id: String,
    pub final_name: String,
    pub total_chunks: u32,
    pub received: Vec<u32>,
    pub missing: Vec<u32>,
    pub status: SessionStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "outcome")]
pub enum PartOutcome {
    Stored { size: u64 },
    Duplicate { size: u64 },
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Finalized {
    pub final_name: String,
    pub size: u64,
}

/// Parses a client-declared chunk count, accepting integers or integer strings.
pub fn chunk_count(raw: &serde_json::Value) -> Result<u64, UploadError> {
    let parsed = match raw {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    parsed.filter(|n| *n > 0).ok_or(UploadError::InvalidTotalChunks)
}

/// How long a completed session stays around to answer repeated finalizes.
const COMPLETED_RETENTION_MS: i64 = 60 * 60 * 1000;

pub(crate) fn part_path(chunk_dir: &Path, index: u32) -> PathBuf {
    chunk_dir.join(format!("{index}.part"))
}

/// Tracks open upload sessions for the life of the process.
#[derive(Debug, Clone)]
pub struct ChunkSessionManager {
    inner: Arc<ManagerInner>,
}

#[derive(Debug)]
struct ManagerInner {
    chunks_dir: PathBuf,
    store: ArtifactStore,
    sessions: DashMap<String, UploadSession>,
    finalizing: SingleFlight<String, Result<Finalized, UploadError>>,
}

impl ChunkSessionManager {
    pub fn new(chunks_dir: PathBuf, store: ArtifactStore) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                chunks_dir,
                store,
                sessions: DashMap::new(),
                finalizing: SingleFlight::new(),
            }),
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.inner.store
    }

    fn chunk_dir(&self, id: &str) -> PathBuf {
        self.inner.chunks_dir.join(id)
    }

    pub async fn init(
        &self,
        filename: &str,
        total_chunks: u64,
        total_size: Option<u64>,
        part_size: Option<u64>,
    ) -> Result<SessionInit, UploadError> {
        let id = Uuid::new_v4().to_string();
        self.open_session(id, filename, total_chunks, total_size, part_size)
            .await
    }

    /// Opens (or rejoins) a session keyed by a client-chosen id, for the
    /// multipart chunk protocol that predates `init`.
    pub async fn open_legacy(
        &self,
        file_id: &str,
        filename: &str,
        total_chunks: u64,
    ) -> Result<SessionInit, UploadError> {
        validate_name(file_id)?;
        if let Some(existing) = self.inner.sessions.get(file_id) {
            return existing_init(&existing, total_chunks);
        }
        self.open_session(file_id.to_string(), filename, total_chunks, None, None)
            .await
    }

    async fn open_session(
        &self,
        id: String,
        filename: &str,
        total_chunks: u64,
        total_size: Option<u64>,
        part_size: Option<u64>,
    ) -> Result<SessionInit, UploadError> {
        let total = u32::try_from(total_chunks)
            .ok()
            .filter(|n| *n > 0)
            .ok_or(UploadError::InvalidTotalChunks)?;

        self.prune_completed(crate::now_ms());
        let final_name = self.inner.store.claim_name(filename).await?;
        if let Err(err) = tokio::fs::create_dir_all(self.chunk_dir(&id)).await {
            self.inner.store.release(&final_name);
            return Err(err.into());
        }

        match self.inner.sessions.entry(id.clone()) {
            Entry::Occupied(existing) => {
                self.inner.store.release(&final_name);
                existing_init(existing.get(), total_chunks)
            }
            Entry::Vacant(slot) => {
                slot.insert(UploadSession {
                    id: id.clone(),
                    original_name: filename.to_string(),
                    final_name: final_name.clone(),
                    total_chunks: total,
                    total_size,
                    part_size: part_size.filter(|p| *p > 0),
                    created_at_ms: crate::now_ms(),
                    received: BTreeSet::new(),
                    status: SessionStatus::Collecting,
                    assembled_size: None,
                    completed_at_ms: None,
                });
                tracing::info!(session = %id, filename, final_name = %final_name, total_chunks = total, "upload session opened");
                Ok(SessionInit {
                    session_id: id,
                    final_name,
                    total_chunks: total,
                })
            }
        }
    }

    /// Drops completed sessions that finished before the retention window.
    pub(crate) fn prune_completed(&self, now_ms: i64) -> usize {
        let before = self.inner.sessions.len();
        self.inner.sessions.retain(|_, session| {
            session
                .completed_at_ms
                .map_or(true, |done| now_ms - done < COMPLETED_RETENTION_MS)
        });
        let pruned = before.saturating_sub(self.inner.sessions.len());
        if pruned > 0 {
            tracing::debug!(pruned, "expired completed upload sessions");
        }
        pruned
    }

    /// Writes one part. Parts for distinct indices never contend with each other.
    pub async fn accept_part<R>(&self, id: &str, index: u64, mut reader: R) -> Result<PartOutcome, UploadError>
    where
        R: AsyncRead + Unpin,
    {
        let (total, part_size) = {
            let session = self
                .inner
                .sessions
                .get(id)
                .ok_or_else(|| UploadError::InvalidSession(id.to_string()))?;
            if session.status == SessionStatus::Complete {
                return Err(UploadError::SessionClosed(id.to_string()));
            }
            (session.total_chunks, session.part_size)
        };
        if index >= u64::from(total) {
            return Err(UploadError::OutOfRange { index, total });
        }
        let index = index as u32;

        let dir = self.chunk_dir(id);
        let temp = dir.join(format!("{index}.part.{}.tmp", Uuid::new_v4()));
        let written = async {
            let mut out = BufWriter::new(tokio::fs::File::create(&temp).await?);
            let size = tokio::io::copy(&mut reader, &mut out).await?;
            out.flush().await?;
            Ok::<_, std::io::Error>(size)
        }
        .await;
        let size = match written {
            Ok(size) => size,
            Err(err) => {
                let _ = tokio::fs::remove_file(&temp).await;
                return Err(err.into());
            }
        };

        if let Some(limit) = part_size {
            if index + 1 < total && size > limit {
                let _ = tokio::fs::remove_file(&temp).await;
                return Err(UploadError::PartTooLarge {
                    index,
                    size,
                    part_size: limit,
                });
            }
        }

        let target = part_path(&dir, index);
        let outcome = match tokio::fs::metadata(&target).await {
            Ok(existing) if existing.len() == size => {
                tokio::fs::remove_file(&temp).await?;
                tracing::debug!(session = %id, index, size, "duplicate chunk ignored");
                PartOutcome::Duplicate { size }
            }
            _ => {
                tokio::fs::rename(&temp, &target).await?;
                tracing::debug!(session = %id, index, size, "chunk stored");
                PartOutcome::Stored { size }
            }
        };

        if let Some(mut session) = self.inner.sessions.get_mut(id) {
            session.received.insert(index);
        }
        Ok(outcome)
    }

    pub fn status(&self, id: &str) -> Result<SessionView, UploadError> {
        let session = self
            .inner
            .sessions
            .get(id)
            .ok_or_else(|| UploadError::InvalidSession(id.to_string()))?;
        Ok(SessionView {
            session_id: session.id.clone(),
            final_name: session.final_name.clone(),
            total_chunks: session.total_chunks,
            received: session.received.iter().copied().collect(),
            missing: (0..session.total_chunks)
                .filter(|i| !session.received.contains(i))
                .collect(),
            status: session.status,
        })
    }

    /// True once every index has been received at least once.
    pub fn all_parts_received(&self, id: &str) -> bool {
        self.inner
            .sessions
            .get(id)
            .map(|s| s.received.len() as u64 == u64::from(s.total_chunks))
            .unwrap_or(false)
    }

    /// Assembles the session exactly once; concurrent callers share the result
    /// and later callers get the recorded outcome.
    pub async fn finalize(&self, id: &str) -> Result<Finalized, UploadError> {
        self.finalize_then(id, |_| async {}).await
    }

    /// Like [`finalize`](Self::finalize), running `on_assembled` once, inside
    /// the flight, for the call that actually produces the artifact.
    pub async fn finalize_then<H, Fut>(&self, id: &str, on_assembled: H) -> Result<Finalized, UploadError>
    where
        H: FnOnce(Finalized) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        {
            let session = self
                .inner
                .sessions
                .get(id)
                .ok_or_else(|| UploadError::InvalidSession(id.to_string()))?;
            if let Some(done) = completed(&session) {
                return Ok(done);
            }
        }

        let this = self.clone();
        let key = id.to_string();
        self.inner
            .finalizing
            .run(key.clone(), async move {
                let (done, fresh) = this.assemble(&key).await?;
                if fresh {
                    on_assembled(done.clone()).await;
                }
                Ok::<_, UploadError>(done)
            })
            .await
            .unwrap_or(Err(UploadError::Aborted))
    }

    /// Returns the artifact and whether this call assembled it.
    async fn assemble(&self, id: &str) -> Result<(Finalized, bool), UploadError> {
        let (total, total_size, final_name) = {
            let mut session = self
                .inner
                .sessions
                .get_mut(id)
                .ok_or_else(|| UploadError::InvalidSession(id.to_string()))?;
            if let Some(done) = completed(&session) {
                return Ok((done, false));
            }
            session.status = SessionStatus::Finalizing;
            (session.total_chunks, session.total_size, session.final_name.clone())
        };
        let dir = self.chunk_dir(id);

        let outcome = async {
            assemble::verify_parts(&dir, total).await?;
            let temp = self.inner.store.temp_path().await?;
            let size = assemble::concat_parts(&dir, total, total_size, temp.clone()).await?;
            if let Err(err) = self.inner.store.commit(&temp, &final_name).await {
                let _ = tokio::fs::remove_file(&temp).await;
                return Err(err);
            }
            Ok(size)
        }
        .await;

        match outcome {
            Ok(size) => {
                if let Some(mut session) = self.inner.sessions.get_mut(id) {
                    session.status = SessionStatus::Complete;
                    session.assembled_size = Some(size);
                    session.completed_at_ms = Some(crate::now_ms());
                }
                self.inner.store.release(&final_name);
                if let Err(err) = tokio::fs::remove_dir_all(&dir).await {
                    tracing::warn!(session = %id, error = %err, "failed to remove chunk directory");
                }
                tracing::info!(session = %id, final_name = %final_name, size, "upload assembled");
                Ok((Finalized { final_name, size }, true))
            }
            Err(err) => {
                if let Some(mut session) = self.inner.sessions.get_mut(id) {
                    session.status = if err.is_partial_data() {
                        SessionStatus::Collecting
                    } else {
                        SessionStatus::Failed
                    };
                }
                tracing::warn!(session = %id, error = %err, "finalize failed");
                Err(err)
            }
        }
    }
}

fn completed(session: &UploadSession) -> Option<Finalized> {
    match (session.status, session.assembled_size) {
        (SessionStatus::Complete, Some(size)) => Some(Finalized {
            final_name: session.final_name.clone(),
            size,
        }),
        _ => None,
    }
}

fn existing_init(session: &UploadSession, requested: u64) -> Result<SessionInit, UploadError> {
    if u64::from(session.total_chunks) != requested {
        return Err(UploadError::ChunkCountMismatch {
            session: session.id.clone(),
            declared: session.total_chunks,
            requested,
        });
    }
    Ok(SessionInit {
        session_id: session.id.clone(),
        final_name: session.final_name.clone(),
        total_chunks: session.total_chunks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager(dir: &tempfile::TempDir) -> ChunkSessionManager {
        let uploads = dir.path().join("uploads");
        std::fs::create_dir_all(&uploads).unwrap();
        let store = ArtifactStore::new(uploads.clone(), uploads.join(".tmp"));
        ChunkSessionManager::new(uploads.join(".chunks"), store)
    }

    #[test]
    fn chunk_count_accepts_positive_integers_only() {
        assert_eq!(chunk_count(&json!(3)).unwrap(), 3);
        assert_eq!(chunk_count(&json!("4")).unwrap(), 4);
        for bad in [json!(0), json!(-1), json!(2.5), json!("x"), json!(null)] {
            assert!(matches!(chunk_count(&bad), Err(UploadError::InvalidTotalChunks)));
        }
    }

    #[tokio::test]
    async fn out_of_order_parts_assemble_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let uploads = manager(&dir);
        let init = uploads.init("trip.mp4", 3, Some(9), None).await.unwrap();
        assert_eq!(init.final_name, "trip.mp4");

        for (index, body) in [(2u64, "ccc"), (0, "aaa"), (1, "bbb")] {
            uploads.accept_part(&init.session_id, index, body.as_bytes()).await.unwrap();
        }
        assert!(uploads.all_parts_received(&init.session_id));

        let done = uploads.finalize(&init.session_id).await.unwrap();
        assert_eq!(done, Finalized { final_name: "trip.mp4".into(), size: 9 });
        let bytes = std::fs::read(dir.path().join("uploads/trip.mp4")).unwrap();
        assert_eq!(bytes, b"aaabbbccc");
        assert!(!dir.path().join("uploads/.chunks").join(&init.session_id).exists());
    }

    #[tokio::test]
    async fn resubmitting_same_length_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let uploads = manager(&dir);
        let init = uploads.init("a.mp4", 2, None, None).await.unwrap();

        let first = uploads.accept_part(&init.session_id, 0, &b"abcd"[..]).await.unwrap();
        let again = uploads.accept_part(&init.session_id, 0, &b"wxyz"[..]).await.unwrap();
        assert_eq!(first, PartOutcome::Stored { size: 4 });
        assert_eq!(again, PartOutcome::Duplicate { size: 4 });

        let part = dir.path().join("uploads/.chunks").join(&init.session_id).join("0.part");
        assert_eq!(std::fs::read(part).unwrap(), b"abcd");
    }

    #[tokio::test]
    async fn rejects_unknown_session_and_out_of_range_index() {
        let dir = tempfile::tempdir().unwrap();
        let uploads = manager(&dir);
        let init = uploads.init("a.mp4", 2, None, None).await.unwrap();

        let err = uploads.accept_part("nope", 0, &b"x"[..]).await.unwrap_err();
        assert!(matches!(err, UploadError::InvalidSession(_)));

        let err = uploads.accept_part(&init.session_id, 2, &b"x"[..]).await.unwrap_err();
        assert!(matches!(err, UploadError::OutOfRange { index: 2, total: 2 }));

        assert!(matches!(
            uploads.init("a.mp4", 0, None, None).await,
            Err(UploadError::InvalidTotalChunks)
        ));
    }

    #[tokio::test]
    async fn missing_part_keeps_session_open_for_retry() {
        let dir = tempfile::tempdir().unwrap();
        let uploads = manager(&dir);
        let init = uploads.init("a.mp4", 2, None, None).await.unwrap();
        uploads.accept_part(&init.session_id, 0, &b"x"[..]).await.unwrap();

        let err = uploads.finalize(&init.session_id).await.unwrap_err();
        assert!(matches!(err, UploadError::MissingPart(1)));
        let view = uploads.status(&init.session_id).unwrap();
        assert_eq!(view.status, SessionStatus::Collecting);
        assert_eq!(view.missing, vec![1]);

        uploads.accept_part(&init.session_id, 1, &b"y"[..]).await.unwrap();
        assert_eq!(uploads.finalize(&init.session_id).await.unwrap().size, 2);
    }

    #[tokio::test]
    async fn declared_part_size_bounds_all_but_last_part() {
        let dir = tempfile::tempdir().unwrap();
        let uploads = manager(&dir);
        let init = uploads.init("a.mp4", 2, None, Some(2)).await.unwrap();

        let err = uploads.accept_part(&init.session_id, 0, &b"abc"[..]).await.unwrap_err();
        assert!(matches!(err, UploadError::PartTooLarge { index: 0, .. }));
        uploads.accept_part(&init.session_id, 1, &b"abc"[..]).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_finalize_is_coalesced() {
        let dir = tempfile::tempdir().unwrap();
        let uploads = manager(&dir);
        let init = uploads.init("same.mp4", 2, None, None).await.unwrap();
        uploads.accept_part(&init.session_id, 0, &b"12"[..]).await.unwrap();
        uploads.accept_part(&init.session_id, 1, &b"34"[..]).await.unwrap();

        let calls: Vec<_> = (0..6)
            .map(|_| {
                let uploads = uploads.clone();
                let id = init.session_id.clone();
                tokio::spawn(async move { uploads.finalize(&id).await })
            })
            .collect();
        for call in calls {
            let done = call.await.unwrap().unwrap();
            assert_eq!(done.final_name, "same.mp4");
        }

        let listing: Vec<_> = std::fs::read_dir(dir.path().join("uploads"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file())
            .collect();
        assert_eq!(listing.len(), 1);
        assert_eq!(uploads.finalize(&init.session_id).await.unwrap().size, 4);
    }

    #[tokio::test]
    async fn completed_sessions_expire_after_retention() {
        let dir = tempfile::tempdir().unwrap();
        let uploads = manager(&dir);
        let done = uploads.init("old.mp4", 1, None, None).await.unwrap();
        uploads.accept_part(&done.session_id, 0, &b"x"[..]).await.unwrap();
        uploads.finalize(&done.session_id).await.unwrap();
        let open = uploads.init("open.mp4", 2, None, None).await.unwrap();

        assert_eq!(uploads.prune_completed(crate::now_ms()), 0);
        assert_eq!(uploads.status(&done.session_id).unwrap().status, SessionStatus::Complete);

        assert_eq!(uploads.prune_completed(crate::now_ms() + COMPLETED_RETENTION_MS), 1);
        assert!(matches!(uploads.status(&done.session_id), Err(UploadError::InvalidSession(_))));
        assert!(uploads.status(&open.session_id).is_ok());
    }

    #[tokio::test]
    async fn legacy_sessions_rejoin_by_file_id() {
        let dir = tempfile::tempdir().unwrap();
        let uploads = manager(&dir);
        let first = uploads.open_legacy("abc123", "clip.mp4", 2).await.unwrap();
        let again = uploads.open_legacy("abc123", "clip.mp4", 2).await.unwrap();
        assert_eq!(first, again);

        assert!(matches!(
            uploads.open_legacy("abc123", "clip.mp4", 5).await,
            Err(UploadError::ChunkCountMismatch { declared: 2, .. })
        ));
        assert!(matches!(
            uploads.open_legacy("../x", "clip.mp4", 2).await,
            Err(UploadError::InvalidName(_))
        ));
    }
}
