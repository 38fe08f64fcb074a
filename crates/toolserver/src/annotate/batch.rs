use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

use crate::model::FrameRecord;

/// When pending frames are committed: after `max_frames` frames or once
/// `flush_interval` has passed since the last commit, whichever comes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPolicy {
    pub max_frames: usize,
    pub flush_interval: Duration,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            max_frames: 5,
            flush_interval: Duration::from_millis(80),
        }
    }
}

#[derive(Debug)]
pub struct Batcher {
    policy: BatchPolicy,
    pending: Vec<FrameRecord>,
    last_flush: Instant,
}

impl Batcher {
    pub fn new(policy: BatchPolicy, now: Instant) -> Self {
        Self {
            policy,
            pending: Vec::with_capacity(policy.max_frames),
            last_flush: now,
        }
    }

    /// Queues a frame and returns the batch to commit if a threshold was reached.
    pub fn push(&mut self, frame: FrameRecord, now: Instant) -> Option<Vec<FrameRecord>> {
        self.pending.push(frame);
        let full = self.pending.len() >= self.policy.max_frames;
        let stale = now.duration_since(self.last_flush) >= self.policy.flush_interval;
        if full || stale {
            self.drain(now)
        } else {
            None
        }
    }

    pub fn drain(&mut self, now: Instant) -> Option<Vec<FrameRecord>> {
        if self.pending.is_empty() {
            return None;
        }
        self.last_flush = now;
        Some(std::mem::take(&mut self.pending))
    }

    /// Drops everything not yet committed, returning how many frames were lost.
    pub fn discard(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// When the pending batch goes stale; `None` while nothing is pending.
    pub fn deadline(&self) -> Option<Instant> {
        (!self.pending.is_empty()).then(|| self.last_flush + self.policy.flush_interval)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncMode {
    Synced,
    Scrubbing,
}

/// The visible frame. Follows the newest commit while synced; frozen while scrubbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Playhead {
    mode: SyncMode,
    index: Option<u64>,
}

impl Default for Playhead {
    fn default() -> Self {
        Self {
            mode: SyncMode::Synced,
            index: None,
        }
    }
}

impl Playhead {
    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    pub fn index(&self) -> Option<u64> {
        self.index
    }

    pub fn on_commit(&mut self, committed: u64) {
        if self.mode == SyncMode::Synced && committed > 0 {
            self.index = Some(committed - 1);
        }
    }

    /// Returns false (and changes nothing) when `index` is not committed yet.
    pub fn seek(&mut self, index: u64, committed: u64) -> bool {
        if index >= committed {
            return false;
        }
        self.mode = SyncMode::Scrubbing;
        self.index = Some(index);
        true
    }

    pub fn resync(&mut self, committed: u64) {
        self.mode = SyncMode::Synced;
        self.index = committed.checked_sub(1);
    }
}
