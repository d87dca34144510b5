use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::time::Instant;

/// Lifecycle of a recording: idle -> recording -> uploading -> finalizing -> done | failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RecordingStatus {
    #[default]
    Idle,
    Recording,
    Uploading,
    Finalizing,
    Done,
    Failed,
}

impl RecordingStatus {
    /// Done and failed are absorbing
    pub fn is_terminal(self) -> bool {
        matches!(self, RecordingStatus::Done | RecordingStatus::Failed)
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(self, next: RecordingStatus) -> bool {
        use RecordingStatus::*;
        match (self, next) {
            (Idle, Recording) => true,
            // resume() re-attaches straight to the upload side
            (Idle, Uploading) => true,
            (Recording, Uploading) => true,
            (Uploading, Finalizing) => true,
            (Finalizing, Done) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for RecordingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecordingStatus::Idle => "idle",
            RecordingStatus::Recording => "recording",
            RecordingStatus::Uploading => "uploading",
            RecordingStatus::Finalizing => "finalizing",
            RecordingStatus::Done => "done",
            RecordingStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Recording row as stored by the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recording {
    pub id: String,
    pub owner: String,
    pub status: RecordingStatus,
    pub codec: String,
    pub mime_type: String,
    pub segment_duration_ms: u64,
    /// Known once capture has stopped
    pub total_chunks: Option<u64>,
    /// Checkpoint: highest sequence durably uploaded
    pub last_seq_uploaded: Option<u64>,
    pub error_message: Option<String>,
}

/// Partial update of a recording row; `None` fields are left untouched
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordingPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RecordingStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl RecordingPatch {
    pub fn status(status: RecordingStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Some(RecordingStatus::Failed),
            error_message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn apply(&self, recording: &mut Recording) {
        if let Some(status) = self.status {
            recording.status = status;
        }
        if let Some(total) = self.total_chunks {
            recording.total_chunks = Some(total);
        }
        if let Some(message) = &self.error_message {
            recording.error_message = Some(message.clone());
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    Uploaded,
}

/// Chunk row, upserted by (recording_id, seq)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub recording_id: String,
    pub seq: u64,
    pub object_key: String,
    pub bytes: u64,
    pub duration_ms: u64,
    pub status: ChunkStatus,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Uploading,
    Uploaded,
    Failed,
}

/// One captured segment travelling through the upload queue
#[derive(Debug, Clone)]
pub struct SegmentJob {
    pub recording_id: String,
    /// Assigned once at capture time, never reused
    pub seq: u64,
    pub bytes: Bytes,
    pub content_type: String,
    pub duration_ms: u64,
    pub retries: u32,
    pub status: JobStatus,
    /// Set after the first successful URL issuance
    pub object_key: Option<String>,
    /// Backoff gate: the job is not dispatched before this instant
    pub(crate) not_before: Option<Instant>,
}

impl SegmentJob {
    pub fn new(
        recording_id: impl Into<String>,
        seq: u64,
        bytes: Bytes,
        content_type: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            recording_id: recording_id.into(),
            seq,
            bytes,
            content_type: content_type.into(),
            duration_ms,
            retries: 0,
            status: JobStatus::Queued,
            object_key: None,
            not_before: None,
        }
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// Snapshot of an upload queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub uploading: usize,
    pub uploaded: u64,
    pub failed: u64,
    pub active: usize,
    pub enqueued_total: u64,
    pub paused: bool,
    pub online: bool,
}

impl QueueStats {
    /// Jobs that have not reached a terminal state
    pub fn pending(&self) -> usize {
        self.queued + self.uploading
    }
}

/// Chunk URL issuer request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadUrlRequest {
    pub recording_id: String,
    pub seq: u64,
    #[serde(rename = "contentType")]
    pub content_type: String,
    #[serde(rename = "fileSize")]
    pub file_size: u64,
}

/// Chunk URL issuer response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadUrlResponse {
    #[serde(rename = "uploadUrl")]
    pub upload_url: String,
    #[serde(rename = "objectKey")]
    pub object_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalizeRequest {
    pub recording_id: String,
    pub live_session_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalizeResponse {
    pub manifest_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRequest {
    pub seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointResponse {
    pub last_seq_uploaded: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_absorbing() {
        use RecordingStatus::*;
        assert!(Idle.can_transition_to(Recording));
        assert!(Recording.can_transition_to(Uploading));
        assert!(Uploading.can_transition_to(Finalizing));
        assert!(Finalizing.can_transition_to(Done));
        assert!(Recording.can_transition_to(Failed));
        assert!(!Done.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Recording));
        assert!(!Recording.can_transition_to(Done));
    }

    #[test]
    fn upload_url_request_uses_wire_names() {
        let req = UploadUrlRequest {
            recording_id: "rec_1".into(),
            seq: 4,
            content_type: "video/webm".into(),
            file_size: 1024,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["recording_id"], "rec_1");
        assert_eq!(json["contentType"], "video/webm");
        assert_eq!(json["fileSize"], 1024);

        let resp: UploadUrlResponse =
            serde_json::from_str(r#"{"uploadUrl":"http://x/o?token=t","objectKey":"k"}"#)
                .unwrap();
        assert_eq!(resp.object_key, "k");
    }

    #[test]
    fn patch_only_touches_given_fields() {
        let mut rec = Recording {
            id: "rec_1".into(),
            owner: "alice".into(),
            status: RecordingStatus::Uploading,
            codec: "vp9".into(),
            mime_type: "video/webm".into(),
            segment_duration_ms: 4000,
            total_chunks: None,
            last_seq_uploaded: Some(3),
            error_message: None,
        };
        RecordingPatch::failed("boom").apply(&mut rec);
        assert_eq!(rec.status, RecordingStatus::Failed);
        assert_eq!(rec.error_message.as_deref(), Some("boom"));
        assert_eq!(rec.last_seq_uploaded, Some(3));
    }
}
