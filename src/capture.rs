//! Live capture sources.
//!
//! A [`Capturer`] turns a live source into ordered byte segments of roughly
//! the requested duration. It never waits on uploads: segments are pushed
//! into a bounded channel that the recorder drains.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use log::{debug, info, warn};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{PipelineError, Result};

/// A completed segment as emitted by a capturer
#[derive(Debug, Clone)]
pub struct CapturedSegment {
    pub bytes: Bytes,
    pub duration_ms: u64,
}

#[async_trait]
pub trait Capturer: Send {
    /// Whether this source can produce the given content type
    fn is_type_supported(&self, mime_type: &str) -> bool;

    /// Begin capture, emitting a segment every `segment_duration`
    async fn start(
        &mut self,
        mime_type: &str,
        segment_duration: Duration,
        segments: mpsc::Sender<CapturedSegment>,
    ) -> Result<()>;

    /// Stop capture. Returns after the final segment has been emitted and
    /// the segment sender dropped.
    async fn stop(&mut self) -> Result<()>;
}

/// `type/subtype` part of a content type, lowercased
pub fn base_mime_type(mime_type: &str) -> String {
    mime_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

/// Captures a live HTTP media stream (e.g. Icecast/Shoutcast or a chunked
/// camera feed), cutting it into wall-clock segments.
pub struct HttpStreamCapturer {
    url: String,
    content_type: String,
    response: Option<reqwest::Response>,
    stop: CancellationToken,
    download: Option<JoinHandle<()>>,
    segmenter: Option<JoinHandle<Result<u64>>>,
}

impl HttpStreamCapturer {
    /// Open the stream and read its content type
    pub async fn connect(client: &reqwest::Client, url: &str) -> Result<Self> {
        info!("Connecting to live source: {}", url);
        let response = client
            .get(url)
            .send()
            .await
            .map_err(|e| PipelineError::Capture(format!("Connection error: {}", e)))?;

        if !response.status().is_success() {
            return Err(PipelineError::Capture(format!(
                "HTTP error from live source: {}",
                response.status()
            )));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .ok_or_else(|| PipelineError::Capture("Missing Content-Type header".to_string()))?
            .to_str()
            .map_err(|_| PipelineError::Capture("Invalid Content-Type header encoding".to_string()))?
            .to_string();

        info!("Live source content type: {}", content_type);

        Ok(Self {
            url: url.to_string(),
            content_type,
            response: Some(response),
            stop: CancellationToken::new(),
            download: None,
            segmenter: None,
        })
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }
}

#[async_trait]
impl Capturer for HttpStreamCapturer {
    fn is_type_supported(&self, mime_type: &str) -> bool {
        base_mime_type(mime_type) == base_mime_type(&self.content_type)
    }

    async fn start(
        &mut self,
        mime_type: &str,
        segment_duration: Duration,
        segments: mpsc::Sender<CapturedSegment>,
    ) -> Result<()> {
        let mut response = self.response.take().ok_or_else(|| {
            PipelineError::Capture(format!("Stream '{}' was already started", self.url))
        })?;
        info!(
            "Capturing {} as {} in {:?} segments",
            self.url, mime_type, segment_duration
        );

        // Reader task: network chunks -> channel
        let (data_tx, data_rx) = mpsc::channel::<std::result::Result<Bytes, String>>(64);
        self.download = Some(tokio::spawn(async move {
            loop {
                match response.chunk().await {
                    Ok(Some(chunk)) => {
                        if data_tx.send(Ok(chunk)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        info!("Live source ended");
                        break;
                    }
                    Err(e) => {
                        let _ = data_tx.send(Err(e.to_string())).await;
                        break;
                    }
                }
            }
        }));

        self.segmenter = Some(tokio::spawn(cut_segments(
            data_rx,
            segments,
            segment_duration,
            self.stop.clone(),
        )));
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.stop.cancel();
        let emitted = match self.segmenter.take() {
            Some(handle) => handle
                .await
                .map_err(|e| PipelineError::Capture(format!("Segmenter task failed: {}", e)))??,
            None => 0,
        };
        if let Some(download) = self.download.take() {
            download.abort();
        }
        info!("Capture stopped after {} segment(s)", emitted);
        Ok(())
    }
}

/// Accumulate incoming bytes and emit a segment each time the wall-clock
/// deadline passes. The trailing partial segment is emitted on stop or end of
/// stream.
async fn cut_segments(
    mut data: mpsc::Receiver<std::result::Result<Bytes, String>>,
    segments: mpsc::Sender<CapturedSegment>,
    segment_duration: Duration,
    stop: CancellationToken,
) -> Result<u64> {
    let mut buffer = BytesMut::new();
    let mut segment_start = Instant::now();
    let mut emitted = 0u64;
    let mut source_error = None;

    loop {
        let deadline = segment_start + segment_duration;
        tokio::select! {
            biased;
            _ = stop.cancelled() => {
                // chunks already read off the wire belong to the recording
                while let Ok(chunk) = data.try_recv() {
                    match chunk {
                        Ok(bytes) => buffer.extend_from_slice(&bytes),
                        Err(e) => {
                            source_error = Some(e);
                            break;
                        }
                    }
                }
                break;
            }
            _ = tokio::time::sleep_until(deadline) => {
                let now = Instant::now();
                if !buffer.is_empty() {
                    let segment = CapturedSegment {
                        bytes: buffer.split().freeze(),
                        duration_ms: now.duration_since(segment_start).as_millis() as u64,
                    };
                    if segments.send(segment).await.is_err() {
                        warn!("Segment receiver dropped, stopping capture");
                        return Ok(emitted);
                    }
                    emitted += 1;
                }
                segment_start = now;
            }
            chunk = data.recv() => match chunk {
                Some(Ok(bytes)) => buffer.extend_from_slice(&bytes),
                Some(Err(e)) => {
                    source_error = Some(e);
                    break;
                }
                None => break,
            },
        }
    }

    if !buffer.is_empty() {
        let segment = CapturedSegment {
            bytes: buffer.split().freeze(),
            duration_ms: Instant::now().duration_since(segment_start).as_millis() as u64,
        };
        if segments.send(segment).await.is_ok() {
            emitted += 1;
        }
    }
    debug!("Segmenter finished with {} segment(s)", emitted);

    match source_error {
        Some(e) => Err(PipelineError::Capture(format!("Read error: {}", e))),
        None => Ok(emitted),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_mime_type_ignores_parameters() {
        assert_eq!(base_mime_type("video/webm;codecs=vp9,opus"), "video/webm");
        assert_eq!(base_mime_type(" Audio/MPEG "), "audio/mpeg");
    }

    #[tokio::test(start_paused = true)]
    async fn segments_are_cut_on_the_clock_and_flushed_on_stop() {
        let (data_tx, data_rx) = mpsc::channel(8);
        let (seg_tx, mut seg_rx) = mpsc::channel(8);
        let stop = CancellationToken::new();
        let task = tokio::spawn(cut_segments(
            data_rx,
            seg_tx,
            Duration::from_secs(2),
            stop.clone(),
        ));

        data_tx.send(Ok(Bytes::from_static(b"abc"))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2100)).await;
        data_tx.send(Ok(Bytes::from_static(b"def"))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        stop.cancel();

        assert_eq!(task.await.unwrap().unwrap(), 2);
        let first = seg_rx.recv().await.unwrap();
        assert_eq!(&first.bytes[..], b"abc");
        let last = seg_rx.recv().await.unwrap();
        assert_eq!(&last.bytes[..], b"def");
        assert!(seg_rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_keeps_chunks_already_received() {
        let (data_tx, data_rx) = mpsc::channel(8);
        let (seg_tx, mut seg_rx) = mpsc::channel(8);
        let stop = CancellationToken::new();

        data_tx.send(Ok(Bytes::from_static(b"abc"))).await.unwrap();
        data_tx.send(Ok(Bytes::from_static(b"def"))).await.unwrap();
        stop.cancel();

        let emitted = cut_segments(data_rx, seg_tx, Duration::from_secs(2), stop)
            .await
            .unwrap();
        assert_eq!(emitted, 1);
        let last = seg_rx.recv().await.unwrap();
        assert_eq!(&last.bytes[..], b"abcdef");
        assert!(seg_rx.recv().await.is_none());
    }
}
