//! Recording lifecycle: capture -> upload -> finalize.
//!
//! The recorder owns one recording at a time. Capture feeds a bounded channel
//! that a pump task drains, stamping each segment with the next sequence
//! number and handing it to the [`UploadQueue`]. Capture never waits on
//! uploads; the only synchronisation point is [`UploadQueue::flush`] in
//! [`Recorder::stop`].

use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::backend::{Finalizer, RecordingLedger, ResumeStore};
use crate::capture::{CapturedSegment, Capturer};
use crate::config::{CodecPreference, RecorderConfig};
use crate::constants::{generate_recording_id, PENDING_RECORDING_KEY, PENDING_SESSION_KEY};
use crate::error::{PipelineError, Result};
use crate::model::{
    FinalizeRequest, FinalizeResponse, QueueStats, Recording, RecordingPatch, RecordingStatus,
    SegmentJob,
};
use crate::upload::{UploadEvent, UploadQueue};

/// Upload progress of the active recording, folded in from queue events
#[derive(Default)]
struct UploadProgress {
    events: Option<broadcast::Receiver<UploadEvent>>,
    last_seq_uploaded: Option<u64>,
    failed: u64,
    lagged: bool,
}

impl UploadProgress {
    fn watch(events: broadcast::Receiver<UploadEvent>, last_seq_uploaded: Option<u64>) -> Self {
        Self {
            events: Some(events),
            last_seq_uploaded,
            ..Self::default()
        }
    }

    /// Apply every event published so far for `recording_id`
    fn absorb(&mut self, recording_id: &str) {
        let Some(events) = self.events.as_mut() else {
            return;
        };
        loop {
            match events.try_recv() {
                Ok(event) if event.recording_id() != recording_id => {}
                Ok(UploadEvent::Uploaded { checkpoint, .. }) => {
                    self.last_seq_uploaded = Some(
                        self.last_seq_uploaded
                            .map_or(checkpoint, |seq| seq.max(checkpoint)),
                    );
                }
                Ok(UploadEvent::Failed { .. }) => self.failed += 1,
                Ok(UploadEvent::Retrying { .. }) => {}
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!("Missed {} upload event(s) for {}", skipped, recording_id);
                    self.lagged = true;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
    }
}

pub struct Recorder {
    ledger: Arc<dyn RecordingLedger>,
    finalizer: Arc<dyn Finalizer>,
    queue: UploadQueue,
    resume_store: Arc<dyn ResumeStore>,
    config: RecorderConfig,
    status: watch::Sender<RecordingStatus>,
    recording: Option<Recording>,
    session_id: Option<String>,
    capturer: Option<Box<dyn Capturer>>,
    pump: Option<JoinHandle<u64>>,
    intake: Option<JoinHandle<()>>,
    next_seq: Arc<AtomicU64>,
    progress: Mutex<UploadProgress>,
}

impl Recorder {
    pub fn new(
        ledger: Arc<dyn RecordingLedger>,
        finalizer: Arc<dyn Finalizer>,
        queue: UploadQueue,
        resume_store: Arc<dyn ResumeStore>,
        config: RecorderConfig,
    ) -> Self {
        let (status, _) = watch::channel(RecordingStatus::Idle);
        Self {
            ledger,
            finalizer,
            queue,
            resume_store,
            config,
            status,
            recording: None,
            session_id: None,
            capturer: None,
            pump: None,
            intake: None,
            next_seq: Arc::new(AtomicU64::new(0)),
            progress: Mutex::new(UploadProgress::default()),
        }
    }

    pub fn status(&self) -> RecordingStatus {
        *self.status.borrow()
    }

    /// Observe coarse status transitions
    pub fn subscribe_status(&self) -> watch::Receiver<RecordingStatus> {
        self.status.subscribe()
    }

    /// Snapshot of the current recording, including upload progress
    pub fn recording(&self) -> Option<Recording> {
        let mut recording = self.recording.clone()?;
        let mut progress = self.progress.lock();
        progress.absorb(&recording.id);
        recording.last_seq_uploaded = progress.last_seq_uploaded;
        Some(recording)
    }

    /// Terminal error message of the current recording, if it failed
    pub fn error_message(&self) -> Option<&str> {
        self.recording
            .as_ref()
            .and_then(|r| r.error_message.as_deref())
    }

    /// Segments stamped with a sequence number so far
    pub fn segments_captured(&self) -> u64 {
        self.next_seq.load(Ordering::SeqCst)
    }

    pub fn upload_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub fn queue(&self) -> &UploadQueue {
        &self.queue
    }

    /// Recording left behind by an interrupted run, if any
    pub fn pending_recording(&self) -> Option<String> {
        self.resume_store.get(PENDING_RECORDING_KEY)
    }

    /// Pick the first preferred codec the source can produce
    pub fn select_codec(&self, source: &dyn Capturer) -> Result<CodecPreference> {
        self.config
            .codec_preferences
            .iter()
            .find(|pref| source.is_type_supported(&pref.mime_type))
            .cloned()
            .ok_or_else(|| PipelineError::UnsupportedCodec {
                tried: self
                    .config
                    .codec_preferences
                    .iter()
                    .map(|p| p.mime_type.clone())
                    .collect(),
            })
    }

    pub async fn start(
        &mut self,
        mut source: Box<dyn Capturer>,
        session_id: &str,
    ) -> Result<Recording> {
        self.require(&[RecordingStatus::Idle], "start")?;

        let codec = self.select_codec(source.as_ref())?;
        let segment_duration = self.config.segment_duration();
        let recording = Recording {
            id: generate_recording_id(),
            owner: self.config.owner.clone(),
            status: RecordingStatus::Recording,
            codec: codec.codec.clone(),
            mime_type: codec.mime_type.clone(),
            segment_duration_ms: segment_duration.as_millis() as u64,
            total_chunks: None,
            last_seq_uploaded: None,
            error_message: None,
        };
        self.ledger.create_recording(&recording).await?;

        info!(
            "Recording {} started: codec={} mime={} segment={}ms",
            recording.id, recording.codec, recording.mime_type, recording.segment_duration_ms
        );
        if let Err(e) = self.resume_store.set(PENDING_RECORDING_KEY, &recording.id) {
            warn!("Failed to persist resume marker: {}", e);
        }
        if let Err(e) = self.resume_store.set(PENDING_SESSION_KEY, session_id) {
            warn!("Failed to persist session marker: {}", e);
        }

        self.next_seq.store(0, Ordering::SeqCst);
        *self.progress.lock() = UploadProgress::watch(self.queue.subscribe(), None);
        self.recording = Some(recording.clone());
        self.session_id = Some(session_id.to_string());
        self.set_status(RecordingStatus::Recording);

        let capacity = self.config.channel_capacity.max(1);
        let (segment_tx, segment_rx) = mpsc::channel(capacity);
        let (job_tx, job_rx) = mpsc::channel(capacity);
        self.intake = Some(self.queue.spawn_intake(job_rx));
        self.pump = Some(tokio::spawn(pump_segments(
            segment_rx,
            job_tx,
            recording.id.clone(),
            recording.mime_type.clone(),
            Arc::clone(&self.next_seq),
        )));

        if let Err(e) = source
            .start(&recording.mime_type, segment_duration, segment_tx)
            .await
        {
            self.drain_pipeline().await;
            self.fail(&e.to_string()).await;
            return Err(e);
        }
        self.capturer = Some(source);
        Ok(recording)
    }

    /// Stop capture, wait for every segment to settle, then finalize
    pub async fn stop(&mut self) -> Result<FinalizeResponse> {
        let from = self.require(
            &[RecordingStatus::Recording, RecordingStatus::Uploading],
            "stop",
        )?;

        if let Some(mut capturer) = self.capturer.take() {
            if let Err(e) = capturer.stop().await {
                warn!("Capture ended with error: {}", e);
            }
        }
        self.drain_pipeline().await;

        if from == RecordingStatus::Recording {
            self.transition(RecordingStatus::Uploading).await?;
        }

        if let Err(e) = self.queue.flush().await {
            self.fail(&e.to_string()).await;
            return Err(e);
        }

        let recording_id = self.recording_id()?;
        let total = self.next_seq.load(Ordering::SeqCst);
        self.persist(RecordingPatch {
            total_chunks: Some(total),
            ..RecordingPatch::default()
        })
        .await;
        if let Some(recording) = self.recording.as_mut() {
            recording.total_chunks = Some(total);
        }
        info!(
            "Recording {}: {} segment(s) settled ({:?})",
            recording_id,
            total,
            self.queue.stats()
        );

        let failed = self.absorb_progress(&recording_id);
        if failed > 0 {
            let message = format!(
                "{} of {} segment(s) failed to upload; uploaded segments kept for recovery",
                failed, total
            );
            self.fail(&message).await;
            return Err(PipelineError::Finalize(message));
        }
        if total == 0 {
            let message = "no segments were captured".to_string();
            self.fail(&message).await;
            return Err(PipelineError::Finalize(message));
        }

        self.transition(RecordingStatus::Finalizing).await?;
        let request = FinalizeRequest {
            recording_id: recording_id.clone(),
            live_session_id: self.session_id.clone().unwrap_or_default(),
        };
        match self.finalizer.finalize(&request).await {
            Ok(response) => {
                self.transition(RecordingStatus::Done).await?;
                self.clear_markers(&recording_id);
                info!(
                    "Recording {} finalized: {}",
                    recording_id, response.manifest_url
                );
                Ok(response)
            }
            Err(e) => {
                let message = e.to_string();
                self.fail(&message).await;
                Err(match e {
                    PipelineError::Finalize(_) | PipelineError::AuthenticationRequired => e,
                    other => PipelineError::Finalize(other.to_string()),
                })
            }
        }
    }

    /// Re-attach to an interrupted recording. Capture cannot resume; only
    /// segments already in the upload queue are flushed before finalizing.
    ///
    /// Without an explicit `session_id`, the live session is taken from the
    /// resume markers, which must name this recording.
    pub async fn resume(
        &mut self,
        recording_id: &str,
        session_id: Option<&str>,
    ) -> Result<Recording> {
        self.require(&[RecordingStatus::Idle], "resume")?;

        let recording = self
            .ledger
            .get_recording(recording_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("recording '{}'", recording_id)))?;
        if recording.status.is_terminal() {
            return Err(PipelineError::InvalidState {
                operation: "resume",
                state: recording.status.to_string(),
            });
        }

        let session_id = match session_id {
            Some(session) => session.to_string(),
            None => self.marked_session(recording_id)?,
        };

        let next_seq = recording
            .total_chunks
            .or_else(|| recording.last_seq_uploaded.map(|seq| seq + 1))
            .unwrap_or(0);
        self.next_seq.store(next_seq, Ordering::SeqCst);
        self.session_id = Some(session_id);
        *self.progress.lock() =
            UploadProgress::watch(self.queue.subscribe(), recording.last_seq_uploaded);
        info!(
            "Resuming recording {} from checkpoint {:?} ({} segment(s) known)",
            recording.id, recording.last_seq_uploaded, next_seq
        );

        self.recording = Some(recording);
        self.transition(RecordingStatus::Uploading).await?;
        self.recording.clone().ok_or_else(|| PipelineError::InvalidState {
            operation: "resume",
            state: self.status().to_string(),
        })
    }

    /// Live session recorded alongside `recording_id` in the resume markers
    fn marked_session(&self, recording_id: &str) -> Result<String> {
        let pending = self.resume_store.get(PENDING_RECORDING_KEY);
        if pending.as_deref() != Some(recording_id) {
            return Err(PipelineError::NotFound(format!(
                "live session for recording '{}' (pending marker: {})",
                recording_id,
                pending.as_deref().unwrap_or("none")
            )));
        }
        self.resume_store
            .get(PENDING_SESSION_KEY)
            .ok_or_else(|| {
                PipelineError::NotFound(format!("live session for recording '{}'", recording_id))
            })
    }

    /// Clear the resume markers if they point at `recording_id`
    fn clear_markers(&self, recording_id: &str) {
        if self.resume_store.get(PENDING_RECORDING_KEY).as_deref() != Some(recording_id) {
            debug!("Resume markers belong to another recording, leaving them");
            return;
        }
        for key in [PENDING_RECORDING_KEY, PENDING_SESSION_KEY] {
            if let Err(e) = self.resume_store.clear(key) {
                warn!("Failed to clear resume marker '{}': {}", key, e);
            }
        }
    }

    /// Fold queue events into the recording and return its failed segment
    /// count
    fn absorb_progress(&mut self, recording_id: &str) -> u64 {
        let mut progress = self.progress.lock();
        progress.absorb(recording_id);
        if let Some(recording) = self.recording.as_mut() {
            recording.last_seq_uploaded = progress.last_seq_uploaded;
        }
        if progress.lagged {
            progress.failed.max(self.queue.failed_count(recording_id))
        } else {
            progress.failed
        }
    }

    fn require(&self, allowed: &[RecordingStatus], operation: &'static str) -> Result<RecordingStatus> {
        let current = self.status();
        if allowed.contains(&current) {
            Ok(current)
        } else {
            Err(PipelineError::InvalidState {
                operation,
                state: current.to_string(),
            })
        }
    }

    fn recording_id(&self) -> Result<String> {
        self.recording
            .as_ref()
            .map(|r| r.id.clone())
            .ok_or_else(|| PipelineError::InvalidState {
                operation: "stop",
                state: self.status().to_string(),
            })
    }

    fn set_status(&mut self, next: RecordingStatus) {
        if let Some(recording) = self.recording.as_mut() {
            recording.status = next;
        }
        self.status.send_replace(next);
    }

    async fn transition(&mut self, next: RecordingStatus) -> Result<()> {
        let current = self.status();
        if !current.can_transition_to(next) {
            return Err(PipelineError::InvalidState {
                operation: "transition",
                state: format!("{} -> {}", current, next),
            });
        }
        self.set_status(next);
        self.persist(RecordingPatch::status(next)).await;
        info!("Recording status: {} -> {}", current, next);
        Ok(())
    }

    /// Ledger writes after creation are best effort
    async fn persist(&mut self, patch: RecordingPatch) {
        let Some(recording) = self.recording.as_ref() else {
            return;
        };
        if let Err(e) = self.ledger.update_recording(&recording.id, &patch).await {
            warn!("Failed to update recording {}: {}", recording.id, e);
        }
    }

    async fn fail(&mut self, message: &str) {
        if self.status().is_terminal() {
            return;
        }
        warn!("Recording failed: {}", message);
        if let Some(recording) = self.recording.as_mut() {
            recording.error_message = Some(message.to_string());
        }
        self.set_status(RecordingStatus::Failed);
        self.persist(RecordingPatch::failed(message)).await;
    }

    /// Wait for the pump to forward every captured segment and for the
    /// intake to hand them all to the queue
    async fn drain_pipeline(&mut self) {
        if let Some(pump) = self.pump.take() {
            match pump.await {
                Ok(count) => debug!("Segment pump forwarded {} segment(s)", count),
                Err(e) => warn!("Segment pump task failed: {}", e),
            }
        }
        if let Some(intake) = self.intake.take() {
            if let Err(e) = intake.await {
                warn!("Upload intake task failed: {}", e);
            }
        }
    }
}

/// Stamp captured segments with sequence numbers and forward them as upload
/// jobs. Ends when the capturer drops its sender.
async fn pump_segments(
    mut segments: mpsc::Receiver<CapturedSegment>,
    jobs: mpsc::Sender<SegmentJob>,
    recording_id: String,
    content_type: String,
    next_seq: Arc<AtomicU64>,
) -> u64 {
    let mut forwarded = 0;
    while let Some(segment) = segments.recv().await {
        let seq = next_seq.fetch_add(1, Ordering::SeqCst);
        debug!(
            "Segment {} ready ({} bytes, {}ms)",
            seq,
            segment.bytes.len(),
            segment.duration_ms
        );
        let job = SegmentJob::new(
            recording_id.as_str(),
            seq,
            segment.bytes,
            content_type.as_str(),
            segment.duration_ms,
        );
        if jobs.send(job).await.is_err() {
            warn!("Upload intake closed, dropping segment {}", seq);
            break;
        }
        forwarded += 1;
    }
    forwarded
}
