#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use relay_media_stream::backend::{ChunkUrlIssuer, Finalizer, SegmentSource, SegmentStore};
use relay_media_stream::capture::{CapturedSegment, Capturer};
use relay_media_stream::config::UploadConfig;
use relay_media_stream::manifest::{Manifest, ManifestChunk};
use relay_media_stream::memory::MemoryLedger;
use relay_media_stream::model::{
    FinalizeRequest, FinalizeResponse, Recording, RecordingStatus, UploadUrlRequest,
    UploadUrlResponse,
};
use relay_media_stream::playback::{MonolithicSink, ProgressiveSink};
use relay_media_stream::upload::UploadQueue;
use relay_media_stream::{PipelineError, Result};

/// Upload config with short delays for tests
pub fn fast_upload_config(max_concurrent: usize, max_retries: u32) -> UploadConfig {
    UploadConfig {
        max_concurrent,
        max_retries,
        retry_delays_ms: vec![10, 20, 40],
        attempt_timeout_ms: 1_000,
    }
}

pub fn recording(id: &str) -> Recording {
    Recording {
        id: id.to_string(),
        owner: "tester".to_string(),
        status: RecordingStatus::Recording,
        codec: "vp9".to_string(),
        mime_type: "video/webm".to_string(),
        segment_duration_ms: 2000,
        total_chunks: None,
        last_seq_uploaded: None,
        error_message: None,
    }
}

fn seq_from_url(url: &str) -> u64 {
    url.rsplit('/')
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(u64::MAX)
}

/// Issues `mem://{recording}/{seq}` destinations
#[derive(Default)]
pub struct FakeIssuer {
    pub issued: AtomicUsize,
    pub deny: bool,
}

#[async_trait]
impl ChunkUrlIssuer for FakeIssuer {
    async fn issue_upload_url(&self, request: &UploadUrlRequest) -> Result<UploadUrlResponse> {
        if self.deny {
            return Err(PipelineError::AuthenticationRequired);
        }
        self.issued.fetch_add(1, Ordering::SeqCst);
        Ok(UploadUrlResponse {
            upload_url: format!("mem://{}/{}", request.recording_id, request.seq),
            object_key: format!("{}/{}", request.recording_id, request.seq),
        })
    }
}

/// Object store with scripted failures and concurrency tracking
#[derive(Default)]
pub struct FakeStore {
    pub objects: Mutex<HashMap<u64, Bytes>>,
    pub attempts: Mutex<HashMap<u64, u32>>,
    /// seq -> number of attempts that should fail before succeeding
    pub failures: Mutex<HashMap<u64, u32>>,
    /// seq -> number of attempts that should hang
    pub hangs: Mutex<HashMap<u64, u32>>,
    pub delay: Duration,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl FakeStore {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn fail(&self, seq: u64, times: u32) {
        self.failures.lock().insert(seq, times);
    }

    pub fn hang(&self, seq: u64, times: u32) {
        self.hangs.lock().insert(seq, times);
    }

    pub fn attempts(&self, seq: u64) -> u32 {
        self.attempts.lock().get(&seq).copied().unwrap_or(0)
    }

    pub fn total_attempts(&self) -> u32 {
        self.attempts.lock().values().sum()
    }

    pub fn stored(&self) -> usize {
        self.objects.lock().len()
    }
}

#[async_trait]
impl SegmentStore for FakeStore {
    async fn put_segment(&self, upload_url: &str, _content_type: &str, data: Bytes) -> Result<()> {
        let seq = seq_from_url(upload_url);
        *self.attempts.lock().entry(seq).or_insert(0) += 1;

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let hang = {
            let mut hangs = self.hangs.lock();
            match hangs.get_mut(&seq) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    true
                }
                _ => false,
            }
        };
        if hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let fail = {
            let mut failures = self.failures.lock();
            match failures.get_mut(&seq) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    true
                }
                _ => false,
            }
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if fail {
            return Err(PipelineError::Transfer(format!("injected failure for {}", seq)));
        }
        self.objects.lock().insert(seq, data);
        Ok(())
    }
}

pub fn build_queue(
    issuer: Arc<FakeIssuer>,
    store: Arc<FakeStore>,
    ledger: Arc<MemoryLedger>,
    config: UploadConfig,
) -> UploadQueue {
    UploadQueue::new(issuer, store, ledger, config)
}

/// Assembles a manifest from the ledger, or fails on demand
pub struct FakeFinalizer {
    pub ledger: Arc<MemoryLedger>,
    pub fail: bool,
    pub calls: AtomicUsize,
    pub requests: Mutex<Vec<FinalizeRequest>>,
    pub manifests: Mutex<HashMap<String, Manifest>>,
}

impl FakeFinalizer {
    pub fn new(ledger: Arc<MemoryLedger>) -> Self {
        Self {
            ledger,
            fail: false,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            manifests: Mutex::new(HashMap::new()),
        }
    }

    pub fn failing(ledger: Arc<MemoryLedger>) -> Self {
        Self {
            fail: true,
            ..Self::new(ledger)
        }
    }
}

#[async_trait]
impl Finalizer for FakeFinalizer {
    async fn finalize(&self, request: &FinalizeRequest) -> Result<FinalizeResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());
        if self.fail {
            return Err(PipelineError::Finalize("backend unavailable".to_string()));
        }
        let recording = self
            .ledger
            .recording(&request.recording_id)
            .ok_or_else(|| PipelineError::NotFound(request.recording_id.clone()))?;
        let total = recording
            .total_chunks
            .ok_or_else(|| PipelineError::Finalize("total unknown".to_string()))?;
        let rows = self.ledger.chunks(&recording.id);
        let manifest = Manifest::assemble(&recording, &rows, total, |key| format!("mem://{key}"))
            .map_err(|e| PipelineError::Finalize(e.to_string()))?;
        self.manifests
            .lock()
            .insert(recording.id.clone(), manifest);
        Ok(FinalizeResponse {
            manifest_url: format!("mem://manifests/{}", recording.id),
        })
    }
}

/// Capturer that emits a fixed list of segments once started
pub struct ScriptedCapturer {
    supported: Vec<String>,
    segments: Vec<Bytes>,
    task: Option<JoinHandle<()>>,
    pub fail_start: bool,
}

impl ScriptedCapturer {
    pub fn new(supported: &[&str], segments: Vec<Bytes>) -> Self {
        Self {
            supported: supported.iter().map(|s| s.to_string()).collect(),
            segments,
            task: None,
            fail_start: false,
        }
    }
}

#[async_trait]
impl Capturer for ScriptedCapturer {
    fn is_type_supported(&self, mime_type: &str) -> bool {
        self.supported.iter().any(|s| s == mime_type)
    }

    async fn start(
        &mut self,
        _mime_type: &str,
        segment_duration: Duration,
        segments: mpsc::Sender<CapturedSegment>,
    ) -> Result<()> {
        if self.fail_start {
            return Err(PipelineError::Capture("device busy".to_string()));
        }
        let data = std::mem::take(&mut self.segments);
        let duration_ms = segment_duration.as_millis() as u64;
        self.task = Some(tokio::spawn(async move {
            for bytes in data {
                if segments
                    .send(CapturedSegment { bytes, duration_ms })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }));
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| PipelineError::Capture(e.to_string()))?;
        }
        Ok(())
    }
}

pub fn segment_bytes(seq: u64) -> Bytes {
    Bytes::from(format!("segment-{seq:03};"))
}

/// Manifest over `count` segments whose chunk array is laid out in `order`
pub fn manifest_in_order(order: &[u64], duration_ms: u64) -> Manifest {
    Manifest {
        recording_id: "rec_test".to_string(),
        version: relay_media_stream::constants::MANIFEST_VERSION,
        codec: "vp9".to_string(),
        mime_type: "video/webm;codecs=vp9,opus".to_string(),
        total_duration_ms: duration_ms * order.len() as u64,
        chunks: order
            .iter()
            .map(|&seq| ManifestChunk {
                seq,
                key: format!("rec_test/{seq}"),
                url: format!("mem://rec_test/{seq}"),
                bytes: segment_bytes(seq).len() as u64,
                duration_ms,
            })
            .collect(),
    }
}

/// Segment source with per-segment latency and scripted failures
#[derive(Default)]
pub struct FakeSource {
    pub manifest: Mutex<Option<Manifest>>,
    pub segments: Mutex<HashMap<String, Bytes>>,
    pub latency: Mutex<HashMap<String, Duration>>,
    pub failures: Mutex<HashMap<String, u32>>,
    pub fetches: Mutex<Vec<String>>,
}

impl FakeSource {
    pub fn serving(manifest: Manifest) -> Self {
        let source = Self::default();
        for chunk in &manifest.chunks {
            source
                .segments
                .lock()
                .insert(chunk.url.clone(), segment_bytes(chunk.seq));
        }
        *source.manifest.lock() = Some(manifest);
        source
    }

    pub fn delay(&self, seq: u64, latency: Duration) {
        self.latency
            .lock()
            .insert(format!("mem://rec_test/{seq}"), latency);
    }

    pub fn fail(&self, seq: u64, times: u32) {
        self.failures
            .lock()
            .insert(format!("mem://rec_test/{seq}"), times);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.lock().len()
    }
}

#[async_trait]
impl SegmentSource for FakeSource {
    async fn fetch_manifest(&self, _manifest_url: &str) -> Result<Manifest> {
        self.manifest
            .lock()
            .clone()
            .ok_or_else(|| PipelineError::ManifestFetch("HTTP 404".to_string()))
    }

    async fn fetch_segment(&self, url: &str) -> Result<Bytes> {
        self.fetches.lock().push(url.to_string());
        let latency = self.latency.lock().get(url).copied();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        {
            let mut failures = self.failures.lock();
            if let Some(left) = failures.get_mut(url) {
                if *left > 0 {
                    *left -= 1;
                    return Err(PipelineError::Transfer(format!("injected failure for {url}")));
                }
            }
        }
        self.segments
            .lock()
            .get(url)
            .cloned()
            .ok_or_else(|| PipelineError::Transfer(format!("{url} not found")))
    }
}

/// Progressive sink that records every mutation
#[derive(Default)]
pub struct RecordingSink {
    pub appends: Vec<u64>,
    pub data: Vec<u8>,
    pub evictions: Vec<(u64, u64)>,
    pub ended: bool,
    pub unsupported: bool,
    /// Append calls (1-based) that report a full buffer
    pub quota_on_calls: Vec<usize>,
    pub always_fail: bool,
    pub position_ms: u64,
    /// Playhead moved by the test while the engine owns the sink
    pub playhead: Option<Arc<AtomicU64>>,
    pub calls: usize,
}

#[async_trait]
impl ProgressiveSink for RecordingSink {
    fn supports(&self, _mime_type: &str) -> bool {
        !self.unsupported
    }

    async fn append(&mut self, seq: u64, data: Bytes) -> Result<()> {
        self.calls += 1;
        if self.always_fail {
            return Err(PipelineError::PlaybackBuffer("decode error".to_string()));
        }
        if self.quota_on_calls.contains(&self.calls) {
            return Err(PipelineError::QuotaExceeded);
        }
        self.appends.push(seq);
        self.data.extend_from_slice(&data);
        Ok(())
    }

    async fn evict(&mut self, start_ms: u64, end_ms: u64) -> Result<()> {
        self.evictions.push((start_ms, end_ms));
        Ok(())
    }

    async fn end_of_stream(&mut self) -> Result<()> {
        self.ended = true;
        Ok(())
    }

    fn position_ms(&self) -> u64 {
        match &self.playhead {
            Some(playhead) => playhead.load(Ordering::SeqCst),
            None => self.position_ms,
        }
    }
}

/// Monolithic sink that keeps the stream it was handed
#[derive(Default)]
pub struct CollectingSink {
    pub played: Option<(String, Bytes)>,
}

#[async_trait]
impl MonolithicSink for CollectingSink {
    async fn play(&mut self, mime_type: &str, data: Bytes) -> Result<()> {
        self.played = Some((mime_type.to_string(), data));
        Ok(())
    }
}
