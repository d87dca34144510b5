//! File-backed playback sinks used by the CLI.

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::error::{PipelineError, Result};
use crate::playback::{MonolithicSink, ProgressiveSink};

/// Writes appended segments to a file in append order.
///
/// A file is "played" as soon as it is written, so the position advances by
/// a nominal segment duration per append. Eviction has nothing to release.
pub struct FileProgressiveSink {
    path: PathBuf,
    file: File,
    nominal_segment_ms: u64,
    position_ms: u64,
    appended: u64,
}

impl FileProgressiveSink {
    pub async fn create(path: impl AsRef<Path>, nominal_segment_ms: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).await?;
        Ok(Self {
            path,
            file,
            nominal_segment_ms,
            position_ms: 0,
            appended: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appended(&self) -> u64 {
        self.appended
    }
}

#[async_trait]
impl ProgressiveSink for FileProgressiveSink {
    fn supports(&self, _mime_type: &str) -> bool {
        true
    }

    async fn append(&mut self, seq: u64, data: Bytes) -> Result<()> {
        self.file
            .write_all(&data)
            .await
            .map_err(|e| PipelineError::PlaybackBuffer(format!("segment {}: {}", seq, e)))?;
        self.appended += 1;
        self.position_ms += self.nominal_segment_ms;
        Ok(())
    }

    async fn evict(&mut self, start_ms: u64, end_ms: u64) -> Result<()> {
        debug!("Evict {}..{}ms is a no-op for {}", start_ms, end_ms, self.path.display());
        Ok(())
    }

    async fn end_of_stream(&mut self) -> Result<()> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        info!(
            "Wrote {} segment(s) to {}",
            self.appended,
            self.path.display()
        );
        Ok(())
    }

    fn position_ms(&self) -> u64 {
        self.position_ms
    }
}

/// Writes the whole stream to a file in one go
pub struct FileMonolithicSink {
    path: PathBuf,
}

impl FileMonolithicSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl MonolithicSink for FileMonolithicSink {
    async fn play(&mut self, mime_type: &str, data: Bytes) -> Result<()> {
        tokio::fs::write(&self.path, &data).await?;
        info!(
            "Wrote {} bytes of {} to {}",
            data.len(),
            mime_type,
            self.path.display()
        );
        Ok(())
    }
}
