//! Collaborator interfaces the pipeline depends on.
//!
//! Any storage/auth backend can sit behind these: [`crate::http::HttpBackend`]
//! talks to a REST service, [`crate::memory::MemoryLedger`] keeps rows in
//! process.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::manifest::Manifest;
use crate::model::{
    ChunkRecord, FinalizeRequest, FinalizeResponse, Recording, RecordingPatch, UploadUrlRequest,
    UploadUrlResponse,
};

/// Hands out one-time upload destinations
#[async_trait]
pub trait ChunkUrlIssuer: Send + Sync {
    async fn issue_upload_url(&self, request: &UploadUrlRequest) -> Result<UploadUrlResponse>;
}

/// Byte transfer to an issued destination
#[async_trait]
pub trait SegmentStore: Send + Sync {
    async fn put_segment(&self, upload_url: &str, content_type: &str, data: Bytes) -> Result<()>;
}

/// Durable recording metadata and per-chunk status
#[async_trait]
pub trait RecordingLedger: Send + Sync {
    async fn create_recording(&self, recording: &Recording) -> Result<()>;

    async fn get_recording(&self, recording_id: &str) -> Result<Option<Recording>>;

    async fn update_recording(&self, recording_id: &str, patch: &RecordingPatch) -> Result<()>;

    /// Insert or replace the row keyed by (recording_id, seq)
    async fn upsert_chunk(&self, chunk: &ChunkRecord) -> Result<()>;

    /// Raise the checkpoint to `seq` unless it is already past it.
    /// Returns the checkpoint after the update.
    async fn advance_checkpoint(&self, recording_id: &str, seq: u64) -> Result<u64>;
}

/// Assembles the manifest once every segment is uploaded
#[async_trait]
pub trait Finalizer: Send + Sync {
    async fn finalize(&self, request: &FinalizeRequest) -> Result<FinalizeResponse>;
}

/// Read side used by playback
#[async_trait]
pub trait SegmentSource: Send + Sync {
    async fn fetch_manifest(&self, manifest_url: &str) -> Result<Manifest>;

    async fn fetch_segment(&self, url: &str) -> Result<Bytes>;
}

/// Small client-local key-value store (resume marker)
pub trait ResumeStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    fn clear(&self, key: &str) -> Result<()>;
}
