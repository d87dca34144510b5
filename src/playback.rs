//! Ordered progressive playback with a whole-stream fallback.
//!
//! Segments are fetched concurrently and may arrive in any order, but the
//! progressive sink only ever sees `append(seq)` for `seq == next_append`.
//! Arrivals ahead of that are parked in a pending map until the gap closes.
//! The sink is borrowed mutably by the engine loop, so at most one append or
//! evict is outstanding at any time.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::backend::SegmentSource;
use crate::config::PlaybackConfig;
use crate::constants::retry_delay;
use crate::error::{PipelineError, Result};
use crate::manifest::{start_offsets, Manifest, ManifestChunk, ManifestError};

/// Playback buffer that accepts ordered byte ranges
#[async_trait]
pub trait ProgressiveSink: Send {
    /// Whether incremental append works for this content type
    fn supports(&self, mime_type: &str) -> bool;

    /// Append one segment. Fails with [`PipelineError::QuotaExceeded`] when the
    /// buffer is full, or [`PipelineError::PlaybackBuffer`] on any other error.
    async fn append(&mut self, seq: u64, data: Bytes) -> Result<()>;

    /// Drop buffered media in `[start_ms, end_ms)`
    async fn evict(&mut self, start_ms: u64, end_ms: u64) -> Result<()>;

    async fn end_of_stream(&mut self) -> Result<()>;

    /// Current playback position
    fn position_ms(&self) -> u64;
}

/// Player that takes one complete ordered byte stream
#[async_trait]
pub trait MonolithicSink: Send {
    async fn play(&mut self, mime_type: &str, data: Bytes) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackStatus {
    Idle,
    Loading,
    Buffering,
    Playing,
    Ended,
    /// Unrecoverable failure (bad manifest, empty segment list, fatal fetch)
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Progressive,
    Fallback,
}

/// Caller-side controls for a running engine
#[derive(Clone)]
pub struct PlaybackHandle {
    seek: Arc<watch::Sender<Option<u64>>>,
    cancel: CancellationToken,
    status: watch::Receiver<PlaybackStatus>,
}

impl PlaybackHandle {
    pub fn seek(&self, position_ms: u64) {
        self.seek.send_replace(Some(position_ms));
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn status(&self) -> PlaybackStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PlaybackStatus> {
        self.status.clone()
    }
}

#[derive(Clone)]
struct FetchPolicy {
    retries: u32,
    timeout: Duration,
    delays_ms: Arc<[u64]>,
}

pub struct PlaybackEngine {
    source: Arc<dyn SegmentSource>,
    config: PlaybackConfig,
    policy: FetchPolicy,
    status: watch::Sender<PlaybackStatus>,
    seek: watch::Receiver<Option<u64>>,
    cancel: CancellationToken,
}

enum ProgressiveEnd {
    Completed,
    Escalated(String),
}

/// Per-run state of the progressive path
struct Progressive {
    chunks: Vec<ManifestChunk>,
    starts: Vec<u64>,
    next_append: u64,
    pending: BTreeMap<u64, Bytes>,
    in_flight: HashSet<u64>,
    /// Everything before this offset has been evicted from the sink
    evicted_until_ms: u64,
    append_failures: u32,
}

impl Progressive {
    fn new(chunks: Vec<ManifestChunk>) -> Self {
        let starts = start_offsets(&chunks);
        Self {
            chunks,
            starts,
            next_append: 0,
            pending: BTreeMap::new(),
            in_flight: HashSet::new(),
            evicted_until_ms: 0,
            append_failures: 0,
        }
    }

    fn total(&self) -> u64 {
        self.chunks.len() as u64
    }

    fn start_ms(&self, seq: u64) -> u64 {
        self.starts.get(seq as usize).copied().unwrap_or(u64::MAX)
    }

    /// Sequence whose time range contains `position_ms`
    fn seq_at(&self, position_ms: u64) -> u64 {
        match self.starts.binary_search(&position_ms) {
            Ok(idx) => idx as u64,
            Err(idx) => idx.saturating_sub(1) as u64,
        }
    }

    fn needs_fetch(&self, seq: u64) -> bool {
        seq >= self.next_append && !self.pending.contains_key(&seq) && !self.in_flight.contains(&seq)
    }

    /// Sequences to request now: the next one to append, then everything
    /// starting inside the forward window
    fn wanted(&self, position_ms: u64, forward_window_ms: u64, budget: usize) -> Vec<u64> {
        let horizon = position_ms.saturating_add(forward_window_ms);
        (self.next_append..self.total())
            .take_while(|&seq| seq == self.next_append || self.start_ms(seq) < horizon)
            .filter(|&seq| self.needs_fetch(seq))
            .take(budget)
            .collect()
    }

    fn finished(&self) -> bool {
        self.next_append >= self.total()
    }

    /// The playhead has reached the end of the appended content
    fn starved(&self, position_ms: u64) -> bool {
        position_ms >= self.start_ms(self.next_append)
    }
}

impl PlaybackEngine {
    pub fn new(source: Arc<dyn SegmentSource>, config: PlaybackConfig) -> (Self, PlaybackHandle) {
        let (status_tx, status_rx) = watch::channel(PlaybackStatus::Idle);
        let (seek_tx, seek_rx) = watch::channel(None);
        let cancel = CancellationToken::new();
        let policy = FetchPolicy {
            retries: config.segment_fetch_retries,
            timeout: config.attempt_timeout(),
            delays_ms: config.retry_delays_ms.clone().into(),
        };
        let engine = Self {
            source,
            config,
            policy,
            status: status_tx,
            seek: seek_rx,
            cancel: cancel.clone(),
        };
        let handle = PlaybackHandle {
            seek: Arc::new(seek_tx),
            cancel,
            status: status_rx,
        };
        (engine, handle)
    }

    /// Play the recording behind `manifest_url`.
    ///
    /// Uses `progressive` when given and it supports the manifest's content
    /// type, and silently switches to `fallback` if the progressive path
    /// becomes unreliable.
    pub async fn play(
        &mut self,
        manifest_url: &str,
        progressive: Option<&mut dyn ProgressiveSink>,
        fallback: &mut dyn MonolithicSink,
    ) -> Result<PlaybackOutcome> {
        let result = self.run(manifest_url, progressive, fallback).await;
        match &result {
            Ok(outcome) => {
                info!("[Playback] Finished via {:?} path", outcome);
                self.set_status(PlaybackStatus::Ended);
            }
            Err(PipelineError::Cancelled) => {
                info!("[Playback] Cancelled");
                self.set_status(PlaybackStatus::Idle);
            }
            Err(e) => {
                warn!("[Playback] Failed: {}", e);
                self.set_status(PlaybackStatus::Error(e.to_string()));
            }
        }
        result
    }

    async fn run(
        &mut self,
        manifest_url: &str,
        progressive: Option<&mut dyn ProgressiveSink>,
        fallback: &mut dyn MonolithicSink,
    ) -> Result<PlaybackOutcome> {
        self.set_status(PlaybackStatus::Loading);
        let manifest = self.load_manifest(manifest_url).await?;
        let chunks = manifest.sorted_chunks();
        info!(
            "[Playback] Manifest {}: {} segment(s), {}ms, {}",
            manifest.recording_id,
            chunks.len(),
            manifest.total_duration_ms,
            manifest.mime_type
        );

        match progressive {
            Some(sink) if sink.supports(&manifest.mime_type) => {
                match self.play_progressive(chunks.clone(), sink).await? {
                    ProgressiveEnd::Completed => return Ok(PlaybackOutcome::Progressive),
                    ProgressiveEnd::Escalated(reason) => {
                        warn!("[Playback] Switching to fallback path: {}", reason);
                    }
                }
            }
            Some(_) => info!(
                "[Playback] Progressive append unsupported for {}, using fallback",
                manifest.mime_type
            ),
            None => debug!("[Playback] No progressive sink, using fallback"),
        }

        self.play_fallback(&manifest.mime_type, &chunks, fallback)
            .await?;
        Ok(PlaybackOutcome::Fallback)
    }

    async fn load_manifest(&self, manifest_url: &str) -> Result<Manifest> {
        let fetched = tokio::select! {
            _ = self.cancel.cancelled() => return Err(PipelineError::Cancelled),
            r = tokio::time::timeout(self.policy.timeout, self.source.fetch_manifest(manifest_url)) => r,
        };
        let manifest = match fetched {
            Ok(Ok(manifest)) => manifest,
            Ok(Err(PipelineError::InvalidManifest(ManifestError::Empty))) => {
                return Err(PipelineError::EmptyManifest)
            }
            Ok(Err(
                e @ (PipelineError::InvalidManifest(_)
                | PipelineError::ManifestFetch(_)
                | PipelineError::AuthenticationRequired),
            )) => return Err(e),
            Ok(Err(e)) => return Err(PipelineError::ManifestFetch(e.to_string())),
            Err(_) => {
                return Err(PipelineError::ManifestFetch(format!(
                    "timed out after {:?}",
                    self.policy.timeout
                )))
            }
        };
        match manifest.validate() {
            Ok(()) => Ok(manifest),
            Err(ManifestError::Empty) => Err(PipelineError::EmptyManifest),
            Err(e) => Err(e.into()),
        }
    }

    async fn play_progressive(
        &mut self,
        chunks: Vec<ManifestChunk>,
        sink: &mut dyn ProgressiveSink,
    ) -> Result<ProgressiveEnd> {
        self.set_status(PlaybackStatus::Buffering);
        let mut state = Progressive::new(chunks);
        let mut fetches: JoinSet<(u64, Result<Bytes>)> = JoinSet::new();
        let mut ticker = tokio::time::interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut seek_open = true;

        loop {
            self.schedule_fetches(&mut state, &mut fetches, sink.position_ms());

            if let Some(reason) = self.drain(&mut state, sink).await? {
                return Ok(ProgressiveEnd::Escalated(reason));
            }

            if state.finished() {
                sink.end_of_stream().await.map_err(|e| {
                    PipelineError::PlaybackBuffer(format!("end of stream: {}", e))
                })?;
                info!("[Playback] End of stream after {} segment(s)", state.total());
                return Ok(ProgressiveEnd::Completed);
            }
            self.set_status(if state.starved(sink.position_ms()) {
                PlaybackStatus::Buffering
            } else {
                PlaybackStatus::Playing
            });

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(PipelineError::Cancelled),
                Some(joined) = fetches.join_next(), if !fetches.is_empty() => {
                    let (seq, result) = match joined {
                        Ok(done) => done,
                        Err(e) => return Ok(ProgressiveEnd::Escalated(format!("fetch task failed: {}", e))),
                    };
                    state.in_flight.remove(&seq);
                    match result {
                        Ok(data) if seq >= state.next_append => {
                            debug!("[Playback] Segment {} arrived ({} bytes)", seq, data.len());
                            state.pending.insert(seq, data);
                        }
                        Ok(_) => debug!("[Playback] Discarding stale segment {}", seq),
                        Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
                        Err(e) if seq >= state.next_append => {
                            return Ok(ProgressiveEnd::Escalated(e.to_string()));
                        }
                        Err(e) => debug!("[Playback] Ignoring failure of stale segment {}: {}", seq, e),
                    }
                }
                changed = self.seek.changed(), if seek_open => {
                    if changed.is_err() {
                        seek_open = false;
                        continue;
                    }
                    let target = *self.seek.borrow_and_update();
                    if let Some(position_ms) = target {
                        self.apply_seek(&mut state, position_ms);
                    }
                }
                _ = ticker.tick() => {
                    self.evict_retained(&mut state, sink).await?;
                }
            }
        }
    }

    fn schedule_fetches(
        &self,
        state: &mut Progressive,
        fetches: &mut JoinSet<(u64, Result<Bytes>)>,
        position_ms: u64,
    ) {
        let budget = self
            .config
            .max_concurrent_fetches
            .saturating_sub(state.in_flight.len());
        if budget == 0 {
            return;
        }
        for seq in state.wanted(position_ms, self.config.forward_window_ms, budget) {
            let Some(chunk) = state.chunks.get(seq as usize).cloned() else {
                continue;
            };
            state.in_flight.insert(seq);
            let source = Arc::clone(&self.source);
            let policy = self.policy.clone();
            let cancel = self.cancel.clone();
            fetches.spawn(async move {
                let result = fetch_with_retry(source.as_ref(), &chunk, &policy, &cancel).await;
                (chunk.seq, result)
            });
        }
    }

    /// Append every contiguous pending segment. Returns a reason when the
    /// append failures cross the escalation threshold.
    async fn drain(
        &self,
        state: &mut Progressive,
        sink: &mut dyn ProgressiveSink,
    ) -> Result<Option<String>> {
        while let Some(data) = state.pending.remove(&state.next_append) {
            let seq = state.next_append;
            match self.append_with_eviction(state, sink, seq, data.clone()).await {
                Ok(()) => {
                    debug!("[Playback] Appended segment {}", seq);
                    state.next_append += 1;
                }
                Err(e) => {
                    state.append_failures += 1;
                    warn!(
                        "[Playback] Append of segment {} failed ({}/{}): {}",
                        seq, state.append_failures, self.config.max_append_failures, e
                    );
                    if state.append_failures > self.config.max_append_failures {
                        return Ok(Some(format!(
                            "{} append failures, last: {}",
                            state.append_failures, e
                        )));
                    }
                    // retried on the next wake-up
                    state.pending.insert(seq, data);
                    return Ok(None);
                }
            }
        }
        Ok(None)
    }

    /// Append, and on a full buffer evict everything before the playback
    /// position and try once more
    async fn append_with_eviction(
        &self,
        state: &mut Progressive,
        sink: &mut dyn ProgressiveSink,
        seq: u64,
        data: Bytes,
    ) -> Result<()> {
        match sink.append(seq, data.clone()).await {
            Err(PipelineError::QuotaExceeded) => {
                let position = sink.position_ms();
                if position <= state.evicted_until_ms {
                    return Err(PipelineError::QuotaExceeded);
                }
                info!(
                    "[Playback] Buffer full at segment {}, evicting {}..{}ms",
                    seq, state.evicted_until_ms, position
                );
                sink.evict(state.evicted_until_ms, position).await?;
                state.evicted_until_ms = position;
                sink.append(seq, data).await
            }
            other => other,
        }
    }

    /// Trim played content older than the retention window
    async fn evict_retained(
        &self,
        state: &mut Progressive,
        sink: &mut dyn ProgressiveSink,
    ) -> Result<()> {
        let cutoff = sink
            .position_ms()
            .saturating_sub(self.config.retention_window_ms);
        if cutoff <= state.evicted_until_ms {
            return Ok(());
        }
        match sink.evict(state.evicted_until_ms, cutoff).await {
            Ok(()) => {
                debug!(
                    "[Playback] Evicted {}..{}ms",
                    state.evicted_until_ms, cutoff
                );
                state.evicted_until_ms = cutoff;
            }
            Err(e) => warn!("[Playback] Eviction failed: {}", e),
        }
        Ok(())
    }

    /// Move `next_append` to the segment under the new position unless that
    /// content is still buffered
    fn apply_seek(&self, state: &mut Progressive, position_ms: u64) {
        let target = state.seq_at(position_ms).min(state.total().saturating_sub(1));
        let buffered = target < state.next_append && state.start_ms(target) >= state.evicted_until_ms;
        info!(
            "[Playback] Seek to {}ms (segment {}, next append {})",
            position_ms, target, state.next_append
        );
        if buffered {
            return;
        }
        state.next_append = target;
        state.pending.retain(|&seq, _| seq >= target);
        // re-appended content is retained again
        state.evicted_until_ms = state.evicted_until_ms.min(state.start_ms(target));
    }

    /// Sequentially download every segment and hand the ordered
    /// concatenation to the monolithic sink
    async fn play_fallback(
        &self,
        mime_type: &str,
        chunks: &[ManifestChunk],
        sink: &mut dyn MonolithicSink,
    ) -> Result<()> {
        self.set_status(PlaybackStatus::Buffering);
        let mut stream = BytesMut::with_capacity(chunks.iter().map(|c| c.bytes as usize).sum());
        for chunk in chunks {
            if self.cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            let data = fetch_with_retry(self.source.as_ref(), chunk, &self.policy, &self.cancel).await?;
            debug!("[Playback] Fallback fetched segment {} ({} bytes)", chunk.seq, data.len());
            stream.extend_from_slice(&data);
        }
        info!(
            "[Playback] Fallback assembled {} bytes from {} segment(s)",
            stream.len(),
            chunks.len()
        );
        sink.play(mime_type, stream.freeze()).await?;
        self.set_status(PlaybackStatus::Playing);
        Ok(())
    }

    fn set_status(&self, status: PlaybackStatus) {
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

/// Fetch one segment with bounded retry, a per-attempt timeout, and a size
/// check against the manifest
async fn fetch_with_retry(
    source: &dyn SegmentSource,
    chunk: &ManifestChunk,
    policy: &FetchPolicy,
    cancel: &CancellationToken,
) -> Result<Bytes> {
    let mut attempt = 0u32;
    loop {
        let result = match tokio::time::timeout(policy.timeout, source.fetch_segment(&chunk.url)).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::Timeout("segment fetch")),
        };
        let result = result.and_then(|data| {
            if chunk.bytes != 0 && data.len() as u64 != chunk.bytes {
                Err(PipelineError::SegmentFetch {
                    seq: chunk.seq,
                    message: format!("expected {} bytes, got {}", chunk.bytes, data.len()),
                })
            } else {
                Ok(data)
            }
        });

        match result {
            Ok(data) => return Ok(data),
            Err(e) if e.is_retryable() && attempt < policy.retries => {
                attempt += 1;
                let delay = retry_delay(&policy.delays_ms, attempt);
                warn!(
                    "[Playback] Segment {} fetch failed ({}), retry {} in {:?}",
                    chunk.seq, e, attempt, delay
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                }
            }
            Err(e @ PipelineError::SegmentFetch { .. }) => return Err(e),
            Err(e) => {
                return Err(PipelineError::SegmentFetch {
                    seq: chunk.seq,
                    message: e.to_string(),
                })
            }
        }
    }
}
