//! Fetch tasks and queue ordering
//!
//! At most one task exists per key; concurrent requests attach as waiters.
//! State transitions happen in one place (the scheduler's bookkeeping),
//! never from scattered callbacks.

use bytes::BytesMut;
use std::cmp::Ordering;
use std::time::Instant;
use tokio::sync::oneshot;

use crate::store::ImageVariant;
use crate::types::LoadResult;

/// Task lifecycle. Terminal outcomes have no state: a task that succeeds
/// or fails leaves the scheduler's bookkeeping entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskState {
    Pending,
    Downloading,
    Suspended,
}

/// One queued or in-flight fetch
pub(crate) struct FetchTask {
    pub key: String,
    pub url: String,
    pub variant: ImageVariant,
    pub priority: i32,
    pub created_at: Instant,
    pub state: TaskState,
    pub retry_count: u32,
    /// Partial body carried across retries and suspension (resume record)
    pub received: BytesMut,
    pub total_bytes: Option<u64>,
    /// Callers awaiting this task's result
    pub waiters: Vec<oneshot::Sender<LoadResult>>,
    pub suspended_at: Option<Instant>,
}

impl FetchTask {
    pub fn new(key: String, url: String, variant: ImageVariant, priority: i32) -> Self {
        Self {
            key,
            url,
            variant,
            priority,
            created_at: Instant::now(),
            state: TaskState::Pending,
            retry_count: 0,
            received: BytesMut::new(),
            total_bytes: None,
            waiters: Vec::new(),
            suspended_at: None,
        }
    }

    /// Hand the resume record to a runner; the task keeps its bookkeeping
    pub fn take_progress(&mut self) -> (BytesMut, Option<u64>, u32) {
        (
            std::mem::take(&mut self.received),
            self.total_bytes,
            self.retry_count,
        )
    }

    /// Store progress back after a suspension
    pub fn restore_progress(&mut self, received: BytesMut, total: Option<u64>, retries: u32) {
        self.received = received;
        self.total_bytes = total;
        self.retry_count = retries;
    }
}

/// Heap slot for the priority queue. Dispatch order: redispatch-boosted
/// tasks first, then priority descending, then FIFO by enqueue sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct QueueSlot {
    pub boosted: bool,
    pub priority: i32,
    pub seq: u64,
    pub key: String,
}

impl Ord for QueueSlot {
    fn cmp(&self, other: &Self) -> Ordering {
        self.boosted
            .cmp(&other.boosted)
            .then(self.priority.cmp(&other.priority))
            .then(other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueSlot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
