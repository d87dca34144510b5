//! In-process recording ledger.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

use crate::backend::RecordingLedger;
use crate::error::{PipelineError, Result};
use crate::model::{ChunkRecord, Recording, RecordingPatch};

#[derive(Default)]
struct LedgerState {
    recordings: HashMap<String, Recording>,
    chunks: BTreeMap<(String, u64), ChunkRecord>,
}

/// Ledger kept in memory, used by the dev backend and tests
#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Chunk rows of one recording, in sequence order
    pub fn chunks(&self, recording_id: &str) -> Vec<ChunkRecord> {
        let state = self.state.lock();
        state
            .chunks
            .range((recording_id.to_string(), 0)..=(recording_id.to_string(), u64::MAX))
            .map(|(_, row)| row.clone())
            .collect()
    }

    pub fn chunk_count(&self, recording_id: &str) -> usize {
        self.chunks(recording_id).len()
    }

    pub fn recording(&self, recording_id: &str) -> Option<Recording> {
        self.state.lock().recordings.get(recording_id).cloned()
    }
}

#[async_trait]
impl RecordingLedger for MemoryLedger {
    async fn create_recording(&self, recording: &Recording) -> Result<()> {
        let mut state = self.state.lock();
        if state.recordings.contains_key(&recording.id) {
            return Err(PipelineError::Ledger(format!(
                "recording '{}' already exists",
                recording.id
            )));
        }
        state
            .recordings
            .insert(recording.id.clone(), recording.clone());
        Ok(())
    }

    async fn get_recording(&self, recording_id: &str) -> Result<Option<Recording>> {
        Ok(self.recording(recording_id))
    }

    async fn update_recording(&self, recording_id: &str, patch: &RecordingPatch) -> Result<()> {
        let mut state = self.state.lock();
        let recording = state
            .recordings
            .get_mut(recording_id)
            .ok_or_else(|| PipelineError::NotFound(format!("recording '{}'", recording_id)))?;
        patch.apply(recording);
        Ok(())
    }

    async fn upsert_chunk(&self, chunk: &ChunkRecord) -> Result<()> {
        let mut state = self.state.lock();
        if !state.recordings.contains_key(&chunk.recording_id) {
            return Err(PipelineError::NotFound(format!(
                "recording '{}'",
                chunk.recording_id
            )));
        }
        state
            .chunks
            .insert((chunk.recording_id.clone(), chunk.seq), chunk.clone());
        Ok(())
    }

    async fn advance_checkpoint(&self, recording_id: &str, seq: u64) -> Result<u64> {
        let mut state = self.state.lock();
        let recording = state
            .recordings
            .get_mut(recording_id)
            .ok_or_else(|| PipelineError::NotFound(format!("recording '{}'", recording_id)))?;
        let next = recording.last_seq_uploaded.map_or(seq, |cur| cur.max(seq));
        recording.last_seq_uploaded = Some(next);
        Ok(next)
    }
}
