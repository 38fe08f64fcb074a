use futures::StreamExt;
use serde::Serialize;
use tokio::{sync::RwLock, time::Instant};
use tokio_util::sync::CancellationToken;

use super::{
    batch::{BatchPolicy, Batcher, Playhead, SyncMode},
    client::ByteStream,
    wire::{FrameBuilder, LineDecoder, StreamMeta, WireRecord},
    AnnotateError,
};
use crate::model::FrameRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Not streaming: aborted before the stream finished.
    Idle,
    Streaming,
    Completed,
    Failed,
}

#[derive(Debug)]
pub struct AnnotationState {
    pub phase: Phase,
    pub meta: Option<StreamMeta>,
    pub expected_total: Option<u64>,
    pub frames: Vec<FrameRecord>,
    pub playhead: Playhead,
    pub error: Option<String>,
    pub persisted: bool,
    pub save_error: Option<String>,
}

impl Default for AnnotationState {
    fn default() -> Self {
        Self {
            phase: Phase::Streaming,
            meta: None,
            expected_total: None,
            frames: Vec::new(),
            playhead: Playhead::default(),
            error: None,
            persisted: false,
            save_error: None,
        }
    }
}

impl AnnotationState {
    pub fn committed(&self) -> u64 {
        self.frames.len() as u64
    }

    pub fn set_meta(&mut self, meta: StreamMeta) {
        if meta.total_frames_to_process > 0 {
            self.expected_total = Some(meta.total_frames_to_process);
        }
        self.meta = Some(meta);
    }

    pub fn commit(&mut self, batch: Vec<FrameRecord>) {
        self.frames.extend(batch);
        self.playhead.on_commit(self.committed());
    }

    /// True once the declared total has been committed or exceeded.
    pub fn count_reached(&self, pending: usize) -> bool {
        self.expected_total
            .is_some_and(|expected| self.committed() + pending as u64 >= expected)
    }

    /// Settles the run once the stream ends or the declared count is reached.
    /// Returns true when the run completed and should be persisted.
    ///
    /// A stream that stops short of the declared total completes with the
    /// total lowered to what arrived. Overshooting the total, or never
    /// declaring one, fails the run.
    pub fn finish(&mut self) -> bool {
        let committed = self.committed();
        if committed == 0 {
            self.fail("stream ended before any frame arrived".to_string());
            return false;
        }
        match self.expected_total {
            Some(expected) if expected == committed => {}
            Some(expected) if committed < expected => {
                tracing::info!(expected, committed, "stream ended short of the declared total, adopting committed count");
                self.expected_total = Some(committed);
            }
            Some(expected) => {
                self.fail(format!("stream sent {committed} frames, {expected} were declared"));
                return false;
            }
            None => {
                self.fail("stream ended without declaring a frame total".to_string());
                return false;
            }
        }
        self.phase = Phase::Completed;
        true
    }

    pub fn fail(&mut self, error: String) {
        self.phase = Phase::Failed;
        self.error = Some(error);
    }

    pub fn seek(&mut self, index: u64) -> Result<(), AnnotateError> {
        let committed = self.committed();
        if self.playhead.seek(index, committed) {
            Ok(())
        } else {
            Err(AnnotateError::SeekOutOfRange { index, committed })
        }
    }

    pub fn resync(&mut self) {
        let committed = self.committed();
        self.playhead.resync(committed);
    }

    pub fn snapshot(&self, video: &str, offset: usize, limit: usize) -> AnnotationSnapshot {
        let frames = self.frames.iter().skip(offset).take(limit).cloned().collect();
        AnnotationSnapshot {
            video: video.to_string(),
            phase: self.phase,
            meta: self.meta.clone(),
            expected_total: self.expected_total,
            committed: self.committed(),
            playhead: self.playhead.index(),
            sync_mode: self.playhead.mode(),
            error: self.error.clone(),
            persisted: self.persisted,
            save_error: self.save_error.clone(),
            offset,
            frames,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationSnapshot {
    pub video: String,
    pub phase: Phase,
    pub meta: Option<StreamMeta>,
    pub expected_total: Option<u64>,
    pub committed: u64,
    pub playhead: Option<u64>,
    pub sync_mode: SyncMode,
    pub error: Option<String>,
    pub persisted: bool,
    pub save_error: Option<String>,
    pub offset: usize,
    pub frames: Vec<FrameRecord>,
}

/// One consumer run for one video.
#[derive(Debug, Default)]
pub struct Run {
    pub cancel: CancellationToken,
    pub state: RwLock<AnnotationState>,
}

#[derive(Debug)]
pub enum StreamEnd {
    Finished,
    Cancelled,
    Failed(AnnotateError),
}

/// Reads the stream until it ends or the declared frame total is in,
/// committing batches into `run` as they fill. Reaching the total flushes the
/// pending batch and drops the stream. On cancellation or error the
/// uncommitted batch is dropped.
pub async fn consume(mut stream: ByteStream, run: &Run, policy: BatchPolicy) -> StreamEnd {
    let mut decoder = LineDecoder::new();
    let mut builder = FrameBuilder::new();
    let mut batcher = Batcher::new(policy, Instant::now());

    loop {
        let deadline = batcher.deadline();
        tokio::select! {
            biased;
            _ = run.cancel.cancelled() => {
                let dropped = batcher.discard();
                tracing::debug!(dropped, "annotation stream cancelled");
                return StreamEnd::Cancelled;
            }
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                if let Some(batch) = batcher.drain(Instant::now()) {
                    commit(run, batch).await;
                }
                if run.state.read().await.count_reached(0) {
                    return StreamEnd::Finished;
                }
            }
            chunk = stream.next() => match chunk {
                Some(Ok(bytes)) => {
                    for record in decoder.push(&bytes) {
                        apply(record, run, &mut builder, &mut batcher).await;
                    }
                    if run.state.read().await.count_reached(batcher.pending()) {
                        if let Some(batch) = batcher.drain(Instant::now()) {
                            commit(run, batch).await;
                        }
                        tracing::debug!("declared frame total reached, releasing stream");
                        return StreamEnd::Finished;
                    }
                }
                Some(Err(err)) => {
                    batcher.discard();
                    return StreamEnd::Failed(err);
                }
                None => {
                    if let Some(record) = decoder.finish() {
                        apply(record, run, &mut builder, &mut batcher).await;
                    }
                    if let Some(batch) = batcher.drain(Instant::now()) {
                        commit(run, batch).await;
                    }
                    return StreamEnd::Finished;
                }
            }
        }
    }
}

/// A batch that loses the race with an abort is dropped.
async fn commit(run: &Run, batch: Vec<FrameRecord>) {
    let mut state = run.state.write().await;
    if !run.cancel.is_cancelled() {
        state.commit(batch);
    }
}

async fn apply(record: WireRecord, run: &Run, builder: &mut FrameBuilder, batcher: &mut Batcher) {
    match record {
        WireRecord::Meta { meta } => run.state.write().await.set_meta(meta),
        WireRecord::Detection {
            grouped_vehicles,
            combined_frame_b64,
        } => {
            let frame = builder.build(grouped_vehicles, combined_frame_b64);
            if let Some(batch) = batcher.push(frame, Instant::now()) {
                commit(run, batch).await;
            }
        }
    }
}
