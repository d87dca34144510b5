//! Bounded-concurrency, retrying segment uploader.
//!
//! Each job runs a three-step protocol: request a one-time destination from
//! the [`ChunkUrlIssuer`], transfer the bytes through the [`SegmentStore`],
//! then upsert the chunk row and advance the checkpoint in the
//! [`RecordingLedger`]. Re-running the protocol for a sequence is safe because
//! the ledger row is keyed by `(recording_id, seq)`.
//!
//! Completion order across jobs is unordered. Dispatch is gated by an
//! explicit pause flag and a connectivity flag, on top of the per-job retry
//! policy.

use chrono::Utc;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backend::{ChunkUrlIssuer, RecordingLedger, SegmentStore};
use crate::config::UploadConfig;
use crate::constants::retry_delay;
use crate::error::{PipelineError, Result};
use crate::model::{ChunkRecord, ChunkStatus, JobStatus, QueueStats, SegmentJob, UploadUrlRequest};

const EVENT_CAPACITY: usize = 256;

/// Progress notifications emitted by the queue
#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    Uploaded {
        recording_id: String,
        seq: u64,
        object_key: String,
        checkpoint: u64,
    },
    Retrying {
        recording_id: String,
        seq: u64,
        attempt: u32,
        delay: Duration,
        error: String,
    },
    /// Emitted exactly once per permanently failed job
    Failed {
        recording_id: String,
        seq: u64,
        error: String,
    },
}

impl UploadEvent {
    pub fn recording_id(&self) -> &str {
        match self {
            UploadEvent::Uploaded { recording_id, .. }
            | UploadEvent::Retrying { recording_id, .. }
            | UploadEvent::Failed { recording_id, .. } => recording_id,
        }
    }

    pub fn seq(&self) -> u64 {
        match self {
            UploadEvent::Uploaded { seq, .. }
            | UploadEvent::Retrying { seq, .. }
            | UploadEvent::Failed { seq, .. } => *seq,
        }
    }

    /// Status of the job once this event has been published
    pub fn job_status(&self) -> JobStatus {
        match self {
            UploadEvent::Uploaded { .. } => JobStatus::Uploaded,
            UploadEvent::Retrying { .. } => JobStatus::Queued,
            UploadEvent::Failed { .. } => JobStatus::Failed,
        }
    }
}

struct QueueState {
    /// Jobs that are queued (possibly waiting out a backoff) or uploading
    jobs: Vec<SegmentJob>,
    active: usize,
    paused: bool,
    online: bool,
    enqueued_total: u64,
    uploaded_total: u64,
    failed_total: u64,
    failed_by_recording: HashMap<String, u64>,
}

impl Default for QueueState {
    fn default() -> Self {
        Self {
            jobs: Vec::new(),
            active: 0,
            paused: false,
            online: true,
            enqueued_total: 0,
            uploaded_total: 0,
            failed_total: 0,
            failed_by_recording: HashMap::new(),
        }
    }
}

struct Inner {
    issuer: Arc<dyn ChunkUrlIssuer>,
    store: Arc<dyn SegmentStore>,
    ledger: Arc<dyn RecordingLedger>,
    config: UploadConfig,
    state: Mutex<QueueState>,
    /// Signalled whenever the queue drains to no queued/uploading jobs
    settled: Notify,
    events: broadcast::Sender<UploadEvent>,
    cancel: CancellationToken,
}

/// Handle to an upload queue; clones share the same queue
#[derive(Clone)]
pub struct UploadQueue {
    inner: Arc<Inner>,
}

impl UploadQueue {
    pub fn new(
        issuer: Arc<dyn ChunkUrlIssuer>,
        store: Arc<dyn SegmentStore>,
        ledger: Arc<dyn RecordingLedger>,
        config: UploadConfig,
    ) -> Self {
        Self::with_cancellation(issuer, store, ledger, config, CancellationToken::new())
    }

    /// Build a queue that stops scheduling new work once `cancel` fires
    pub fn with_cancellation(
        issuer: Arc<dyn ChunkUrlIssuer>,
        store: Arc<dyn SegmentStore>,
        ledger: Arc<dyn RecordingLedger>,
        config: UploadConfig,
        cancel: CancellationToken,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                issuer,
                store,
                ledger,
                config,
                state: Mutex::new(QueueState::default()),
                settled: Notify::new(),
                events,
                cancel,
            }),
        }
    }

    /// Append a job in `queued` state and trigger dispatch.
    ///
    /// Returns false if the queue is cancelled or the same
    /// `(recording_id, seq)` is already pending.
    pub fn enqueue(&self, mut job: SegmentJob) -> bool {
        {
            let mut state = self.inner.state.lock();
            if self.inner.cancel.is_cancelled() {
                warn!(
                    "Dropping segment {} of {}: upload queue is cancelled",
                    job.seq, job.recording_id
                );
                return false;
            }
            let duplicate = state
                .jobs
                .iter()
                .any(|j| j.recording_id == job.recording_id && j.seq == job.seq);
            if duplicate {
                debug!(
                    "Segment {} of {} is already queued",
                    job.seq, job.recording_id
                );
                return false;
            }
            job.status = JobStatus::Queued;
            job.not_before = None;
            debug!(
                "Queued segment {} of {} ({} bytes)",
                job.seq,
                job.recording_id,
                job.size()
            );
            state.jobs.push(job);
            state.enqueued_total += 1;
        }
        Inner::dispatch(&self.inner);
        true
    }

    /// Consume segment jobs from a bounded channel until it closes or the
    /// queue is cancelled
    pub fn spawn_intake(&self, mut receiver: mpsc::Receiver<SegmentJob>) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    job = receiver.recv() => match job {
                        Some(job) => {
                            queue.enqueue(job);
                        }
                        None => break,
                    },
                    _ = queue.inner.cancel.cancelled() => break,
                }
            }
            debug!("Upload intake closed");
        })
    }

    /// Connectivity signal: offline suspends dispatch, online resumes it
    pub fn set_online(&self, online: bool) {
        {
            let mut state = self.inner.state.lock();
            if state.online == online {
                return;
            }
            state.online = online;
        }
        if online {
            info!("Connectivity restored, resuming uploads");
            Inner::dispatch(&self.inner);
        } else {
            info!("Connectivity lost, suspending upload dispatch");
        }
    }

    /// Foreground-visibility signal: opportunistically re-run dispatch
    pub fn notify_visible(&self) {
        debug!("Client visible, re-running dispatch");
        Inner::dispatch(&self.inner);
    }

    pub fn pause(&self) {
        self.inner.state.lock().paused = true;
        info!("Upload queue paused");
    }

    pub fn resume(&self) {
        self.inner.state.lock().paused = false;
        info!("Upload queue resumed");
        Inner::dispatch(&self.inner);
    }

    /// Resolve once no job remains queued or uploading
    pub async fn flush(&self) -> Result<()> {
        loop {
            let settled = self.inner.settled.notified();
            if self.inner.state.lock().jobs.is_empty() {
                return Ok(());
            }
            tokio::select! {
                _ = settled => {}
                _ = self.inner.cancel.cancelled() => return Err(PipelineError::Cancelled),
            }
        }
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.inner.state.lock();
        let uploading = state
            .jobs
            .iter()
            .filter(|j| j.status == JobStatus::Uploading)
            .count();
        QueueStats {
            queued: state.jobs.len() - uploading,
            uploading,
            uploaded: state.uploaded_total,
            failed: state.failed_total,
            active: state.active,
            enqueued_total: state.enqueued_total,
            paused: state.paused,
            online: state.online,
        }
    }

    /// Permanently failed jobs belonging to one recording
    pub fn failed_count(&self, recording_id: &str) -> u64 {
        self.inner
            .state
            .lock()
            .failed_by_recording
            .get(recording_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.inner.events.subscribe()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Stop scheduling and reset the queue state. Uploads already in flight
    /// are left to finish; their rows remain safe to re-upload later.
    pub fn destroy(&self) {
        self.inner.cancel.cancel();
        let dropped = {
            let mut state = self.inner.state.lock();
            let dropped = state.jobs.len();
            *state = QueueState::default();
            dropped
        };
        if dropped > 0 {
            warn!("Upload queue destroyed with {} pending segment(s)", dropped);
        }
        self.inner.settled.notify_waiters();
    }
}

impl Inner {
    fn dispatch(self: &Arc<Self>) {
        let started = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.paused || !state.online || self.cancel.is_cancelled() {
                return;
            }
            let now = Instant::now();
            let mut started = Vec::new();
            while state.active < self.config.max_concurrent {
                let next = state.jobs.iter_mut().find(|j| {
                    j.status == JobStatus::Queued && j.not_before.map_or(true, |t| t <= now)
                });
                let Some(job) = next else { break };
                job.status = JobStatus::Uploading;
                job.not_before = None;
                started.push(job.clone());
                state.active += 1;
            }
            started
        };

        for job in started {
            let inner = Arc::clone(self);
            tokio::spawn(async move { inner.run_job(job).await });
        }
    }

    async fn run_job(self: Arc<Self>, job: SegmentJob) {
        let mut object_key = job.object_key.clone();
        let outcome = self.upload_segment(&job, &mut object_key).await;

        let mut retry_after = None;
        let (event, settled) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.active = state.active.saturating_sub(1);
            let idx = state
                .jobs
                .iter()
                .position(|j| j.recording_id == job.recording_id && j.seq == job.seq);

            let event = match outcome {
                Ok((checkpoint, persisted_key)) => {
                    if let Some(i) = idx {
                        state.jobs.remove(i);
                    }
                    state.uploaded_total += 1;
                    UploadEvent::Uploaded {
                        recording_id: job.recording_id.clone(),
                        seq: job.seq,
                        object_key: persisted_key,
                        checkpoint,
                    }
                }
                Err(e) => {
                    let attempt = job.retries + 1;
                    if e.is_retryable() && attempt <= self.config.max_retries {
                        let delay = retry_delay(&self.config.retry_delays_ms, attempt);
                        if let Some(i) = idx {
                            let pending = &mut state.jobs[i];
                            pending.retries = attempt;
                            pending.status = JobStatus::Queued;
                            pending.not_before = Some(Instant::now() + delay);
                            pending.object_key = object_key;
                        }
                        retry_after = Some(delay);
                        UploadEvent::Retrying {
                            recording_id: job.recording_id.clone(),
                            seq: job.seq,
                            attempt,
                            delay,
                            error: e.to_string(),
                        }
                    } else {
                        if let Some(i) = idx {
                            state.jobs.remove(i);
                        }
                        state.failed_total += 1;
                        *state
                            .failed_by_recording
                            .entry(job.recording_id.clone())
                            .or_insert(0) += 1;
                        UploadEvent::Failed {
                            recording_id: job.recording_id.clone(),
                            seq: job.seq,
                            error: e.to_string(),
                        }
                    }
                }
            };
            // Published under the lock so a flush never observes the settled
            // state before the event
            let _ = self.events.send(event.clone());
            (event, state.jobs.is_empty())
        };

        match &event {
            UploadEvent::Uploaded { seq, checkpoint, .. } => {
                debug!(
                    "Uploaded segment {} of {} (checkpoint {})",
                    seq, job.recording_id, checkpoint
                );
            }
            UploadEvent::Retrying {
                seq,
                attempt,
                delay,
                error,
                ..
            } => {
                warn!(
                    "Segment {} of {} failed ({}), retry {} in {:?}",
                    seq, job.recording_id, error, attempt, delay
                );
            }
            UploadEvent::Failed { seq, error, .. } => {
                warn!(
                    "Segment {} of {} permanently failed: {}",
                    seq, job.recording_id, error
                );
            }
        }
        if settled {
            self.settled.notify_waiters();
        }

        if let Some(delay) = retry_after {
            let inner = Arc::clone(&self);
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => Inner::dispatch(&inner),
                    _ = inner.cancel.cancelled() => {}
                }
            });
        }

        Inner::dispatch(&self);
    }

    /// One attempt of the three-step protocol. Returns the checkpoint after
    /// the ledger update and the object key recorded in the chunk row.
    async fn upload_segment(
        &self,
        job: &SegmentJob,
        object_key: &mut Option<String>,
    ) -> Result<(u64, String)> {
        let request = UploadUrlRequest {
            recording_id: job.recording_id.clone(),
            seq: job.seq,
            content_type: job.content_type.clone(),
            file_size: job.size(),
        };
        let issued = self
            .attempt("upload url issuance", self.issuer.issue_upload_url(&request))
            .await?;
        if object_key.is_none() {
            *object_key = Some(issued.object_key.clone());
        }

        self.attempt(
            "segment transfer",
            self.store
                .put_segment(&issued.upload_url, &job.content_type, job.bytes.clone()),
        )
        .await?;

        let row = ChunkRecord {
            recording_id: job.recording_id.clone(),
            seq: job.seq,
            object_key: issued.object_key,
            bytes: job.size(),
            duration_ms: job.duration_ms,
            status: ChunkStatus::Uploaded,
            uploaded_at: Utc::now(),
        };
        self.attempt("chunk upsert", self.ledger.upsert_chunk(&row))
            .await?;
        let checkpoint = self
            .attempt(
                "checkpoint update",
                self.ledger.advance_checkpoint(&job.recording_id, job.seq),
            )
            .await?;
        Ok((checkpoint, row.object_key))
    }

    async fn attempt<T>(
        &self,
        step: &'static str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.config.attempt_timeout(), fut).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::Timeout(step)),
        }
    }
}
