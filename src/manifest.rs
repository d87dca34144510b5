//! Manifest wire format.
//!
//! ```text
//! { recording_id, version, codec, mime_type, total_duration_ms,
//!   chunks: [ { seq, key, url, bytes, duration_ms }, ... ] }
//! ```
//!
//! The array order on the wire is not trusted: [`Manifest::sorted_chunks`]
//! derives the order from `seq`, and [`Manifest::validate`] requires the
//! sequences to be exactly `0..N` with no gaps or duplicates.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::MANIFEST_VERSION;
use crate::model::{ChunkRecord, Recording};

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("manifest has no segments")]
    Empty,
    #[error("missing segment {expected} (next present is {found})")]
    Gap { expected: u64, found: u64 },
    #[error("duplicate segment {0}")]
    Duplicate(u64),
    #[error("expected {expected} segments, found {found}")]
    Incomplete { expected: u64, found: u64 },
    #[error("unsupported manifest version {0}")]
    UnsupportedVersion(u32),
    #[error("malformed manifest JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestChunk {
    pub seq: u64,
    pub key: String,
    pub url: String,
    pub bytes: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub recording_id: String,
    pub version: u32,
    pub codec: String,
    pub mime_type: String,
    pub total_duration_ms: u64,
    pub chunks: Vec<ManifestChunk>,
}

impl Manifest {
    pub fn from_json(data: &[u8]) -> Result<Self, ManifestError> {
        Ok(serde_json::from_slice(data)?)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, ManifestError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Chunks ordered by sequence number
    pub fn sorted_chunks(&self) -> Vec<ManifestChunk> {
        let mut chunks = self.chunks.clone();
        chunks.sort_by_key(|c| c.seq);
        chunks
    }

    /// Check the version and that sequences are contiguous from 0
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.version != MANIFEST_VERSION {
            return Err(ManifestError::UnsupportedVersion(self.version));
        }
        let mut seqs: Vec<u64> = self.chunks.iter().map(|c| c.seq).collect();
        seqs.sort_unstable();
        check_contiguous(&seqs)
    }

    /// Build a manifest from ledger rows. Fails unless rows 0..total_chunks all exist.
    pub fn assemble<F>(
        recording: &Recording,
        rows: &[ChunkRecord],
        total_chunks: u64,
        url_for_key: F,
    ) -> Result<Self, ManifestError>
    where
        F: Fn(&str) -> String,
    {
        let mut rows: Vec<&ChunkRecord> = rows.iter().collect();
        rows.sort_by_key(|r| r.seq);

        let seqs: Vec<u64> = rows.iter().map(|r| r.seq).collect();
        check_contiguous(&seqs)?;
        if seqs.len() as u64 != total_chunks {
            return Err(ManifestError::Incomplete {
                expected: total_chunks,
                found: seqs.len() as u64,
            });
        }

        let chunks: Vec<ManifestChunk> = rows
            .into_iter()
            .map(|r| ManifestChunk {
                seq: r.seq,
                key: r.object_key.clone(),
                url: url_for_key(&r.object_key),
                bytes: r.bytes,
                duration_ms: r.duration_ms,
            })
            .collect();

        Ok(Self {
            recording_id: recording.id.clone(),
            version: MANIFEST_VERSION,
            codec: recording.codec.clone(),
            mime_type: recording.mime_type.clone(),
            total_duration_ms: chunks.iter().map(|c| c.duration_ms).sum(),
            chunks,
        })
    }
}

/// `sorted` must already be in ascending order
fn check_contiguous(sorted: &[u64]) -> Result<(), ManifestError> {
    if sorted.is_empty() {
        return Err(ManifestError::Empty);
    }
    for (expected, &seq) in sorted.iter().enumerate() {
        let expected = expected as u64;
        if seq < expected {
            return Err(ManifestError::Duplicate(seq));
        }
        if seq > expected {
            return Err(ManifestError::Gap {
                expected,
                found: seq,
            });
        }
    }
    Ok(())
}

/// Start offset (ms) of each chunk in sequence order
pub fn start_offsets(sorted: &[ManifestChunk]) -> Vec<u64> {
    let mut offset = 0;
    sorted
        .iter()
        .map(|c| {
            let start = offset;
            offset += c.duration_ms;
            start
        })
        .collect()
}
