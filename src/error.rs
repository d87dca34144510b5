//! Error taxonomy shared by the recorder, upload queue and playback engine.

use thiserror::Error;

use crate::manifest::ManifestError;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// None of the preferred codec/content-type pairs is supported by the source
    #[error("No supported codec (tried: {})", tried.join(", "))]
    UnsupportedCodec { tried: Vec<String> },

    #[error("Authentication required")]
    AuthenticationRequired,

    #[error("Signed upload URL error: {0}")]
    SignedUrl(String),

    #[error("Transfer error: {0}")]
    Transfer(String),

    #[error("Recording ledger error: {0}")]
    Ledger(String),

    /// Playback buffer is full; handled by eviction, never surfaced to callers
    #[error("Playback buffer quota exceeded")]
    QuotaExceeded,

    #[error("Playback buffer error: {0}")]
    PlaybackBuffer(String),

    #[error("Manifest fetch error: {0}")]
    ManifestFetch(String),

    #[error("Invalid manifest: {0}")]
    InvalidManifest(#[from] ManifestError),

    #[error("Manifest has no segments")]
    EmptyManifest,

    #[error("Segment {seq} fetch error: {message}")]
    SegmentFetch { seq: u64, message: String },

    #[error("Finalize error: {0}")]
    Finalize(String),

    #[error("Capture error: {0}")]
    Capture(String),

    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Timed out during {0}")]
    Timeout(&'static str),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Whether the failed step may be attempted again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::SignedUrl(_)
                | PipelineError::Transfer(_)
                | PipelineError::Ledger(_)
                | PipelineError::Timeout(_)
                | PipelineError::SegmentFetch { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(PipelineError::Transfer("reset".into()).is_retryable());
        assert!(PipelineError::Timeout("upload").is_retryable());
        assert!(!PipelineError::AuthenticationRequired.is_retryable());
        assert!(!PipelineError::EmptyManifest.is_retryable());
        assert!(!PipelineError::Cancelled.is_retryable());
    }

    #[test]
    fn unsupported_codec_lists_candidates() {
        let err = PipelineError::UnsupportedCodec {
            tried: vec!["video/webm".into(), "video/mp4".into()],
        };
        assert_eq!(
            err.to_string(),
            "No supported codec (tried: video/webm, video/mp4)"
        );
    }
}
