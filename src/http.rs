//! REST client for the recording backend.

use async_trait::async_trait;
use bytes::Bytes;
use log::debug;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::time::Duration;

use crate::backend::{ChunkUrlIssuer, Finalizer, RecordingLedger, SegmentSource, SegmentStore};
use crate::constants::SEGMENT_CACHE_CONTROL;
use crate::error::{PipelineError, Result};
use crate::manifest::Manifest;
use crate::model::{
    CheckpointRequest, CheckpointResponse, ChunkRecord, FinalizeRequest, FinalizeResponse,
    Recording, RecordingPatch, UploadUrlRequest, UploadUrlResponse,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Implements every collaborator trait against one backend
#[derive(Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpBackend {
    /// `attempt_timeout` bounds each request end to end
    pub fn new(
        base_url: &str,
        auth_token: Option<String>,
        attempt_timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT.min(attempt_timeout))
            .timeout(attempt_timeout)
            .build()
            .map_err(|e| PipelineError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self::with_client(client, base_url, auth_token))
    }

    pub fn with_client(client: Client, base_url: &str, auth_token: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{}", self.base_url, path)
        }
    }

    fn recording_path(recording_id: &str) -> String {
        format!("/api/recordings/{}", urlencoding::encode(recording_id))
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

/// Send a request, mapping transport failures and non-success statuses
/// through `wrap`. 401/403 always become `AuthenticationRequired`.
async fn send<F>(request: RequestBuilder, step: &'static str, wrap: F) -> Result<Response>
where
    F: Fn(String) -> PipelineError,
{
    let response = request.send().await.map_err(|e| {
        if e.is_timeout() {
            PipelineError::Timeout(step)
        } else {
            wrap(format!("{} failed: {}", step, e))
        }
    })?;
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(PipelineError::AuthenticationRequired);
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(wrap(format!("{} returned HTTP {}: {}", step, status, body)));
    }
    Ok(response)
}

async fn read_json<T, F>(response: Response, step: &'static str, wrap: F) -> Result<T>
where
    T: serde::de::DeserializeOwned,
    F: Fn(String) -> PipelineError,
{
    response
        .json::<T>()
        .await
        .map_err(|e| wrap(format!("{} response was not valid JSON: {}", step, e)))
}

#[async_trait]
impl ChunkUrlIssuer for HttpBackend {
    async fn issue_upload_url(&self, request: &UploadUrlRequest) -> Result<UploadUrlResponse> {
        let builder = self
            .authorized(self.client.post(self.url("/api/chunk-url")))
            .json(request);
        let response = send(builder, "upload url issuance", PipelineError::SignedUrl).await?;
        read_json(response, "upload url issuance", PipelineError::SignedUrl).await
    }
}

#[async_trait]
impl SegmentStore for HttpBackend {
    async fn put_segment(&self, upload_url: &str, content_type: &str, data: Bytes) -> Result<()> {
        debug!("PUT {} bytes to {}", data.len(), upload_url);
        // Upload destinations carry their own one-time token
        let builder = self
            .client
            .put(self.url(upload_url))
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .header(reqwest::header::CACHE_CONTROL, SEGMENT_CACHE_CONTROL)
            .body(data);
        send(builder, "segment transfer", PipelineError::Transfer).await?;
        Ok(())
    }
}

#[async_trait]
impl RecordingLedger for HttpBackend {
    async fn create_recording(&self, recording: &Recording) -> Result<()> {
        let builder = self
            .authorized(self.client.post(self.url("/api/recordings")))
            .json(recording);
        send(builder, "recording create", PipelineError::Ledger).await?;
        Ok(())
    }

    async fn get_recording(&self, recording_id: &str) -> Result<Option<Recording>> {
        let builder = self.authorized(
            self.client
                .get(self.url(&Self::recording_path(recording_id))),
        );
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                PipelineError::Timeout("recording lookup")
            } else {
                PipelineError::Ledger(format!("recording lookup failed: {}", e))
            }
        })?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if response.status() == StatusCode::UNAUTHORIZED
            || response.status() == StatusCode::FORBIDDEN
        {
            return Err(PipelineError::AuthenticationRequired);
        }
        if !response.status().is_success() {
            return Err(PipelineError::Ledger(format!(
                "recording lookup returned HTTP {}",
                response.status()
            )));
        }
        read_json(response, "recording lookup", PipelineError::Ledger)
            .await
            .map(Some)
    }

    async fn update_recording(&self, recording_id: &str, patch: &RecordingPatch) -> Result<()> {
        let builder = self
            .authorized(
                self.client
                    .patch(self.url(&Self::recording_path(recording_id))),
            )
            .json(patch);
        send(builder, "recording update", PipelineError::Ledger).await?;
        Ok(())
    }

    async fn upsert_chunk(&self, chunk: &ChunkRecord) -> Result<()> {
        let path = format!(
            "{}/chunks/{}",
            Self::recording_path(&chunk.recording_id),
            chunk.seq
        );
        let builder = self
            .authorized(self.client.put(self.url(&path)))
            .json(chunk);
        send(builder, "chunk upsert", PipelineError::Ledger).await?;
        Ok(())
    }

    async fn advance_checkpoint(&self, recording_id: &str, seq: u64) -> Result<u64> {
        let path = format!("{}/checkpoint", Self::recording_path(recording_id));
        let builder = self
            .authorized(self.client.post(self.url(&path)))
            .json(&CheckpointRequest { seq });
        let response = send(builder, "checkpoint update", PipelineError::Ledger).await?;
        let body: CheckpointResponse =
            read_json(response, "checkpoint update", PipelineError::Ledger).await?;
        Ok(body.last_seq_uploaded)
    }
}

#[async_trait]
impl Finalizer for HttpBackend {
    async fn finalize(&self, request: &FinalizeRequest) -> Result<FinalizeResponse> {
        let builder = self
            .authorized(self.client.post(self.url("/api/finalize")))
            .json(request);
        let response = send(builder, "finalize", PipelineError::Finalize).await?;
        read_json(response, "finalize", PipelineError::Finalize).await
    }
}

#[async_trait]
impl SegmentSource for HttpBackend {
    async fn fetch_manifest(&self, manifest_url: &str) -> Result<Manifest> {
        let builder = self.authorized(self.client.get(self.url(manifest_url)));
        let response = send(builder, "manifest fetch", PipelineError::ManifestFetch).await?;
        let body = response
            .bytes()
            .await
            .map_err(|e| PipelineError::ManifestFetch(format!("manifest body: {}", e)))?;
        Ok(Manifest::from_json(&body)?)
    }

    async fn fetch_segment(&self, url: &str) -> Result<Bytes> {
        let response = send(
            self.client.get(self.url(url)),
            "segment fetch",
            PipelineError::Transfer,
        )
        .await?;
        response
            .bytes()
            .await
            .map_err(|e| PipelineError::Transfer(format!("segment body: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_join_base_and_absolute_urls_pass_through() {
        let backend = HttpBackend::with_client(Client::new(), "http://host:3000/", None);
        assert_eq!(backend.url("/api/finalize"), "http://host:3000/api/finalize");
        assert_eq!(
            backend.url("https://cdn.example/objects/a?token=t"),
            "https://cdn.example/objects/a?token=t"
        );
        assert_eq!(
            HttpBackend::recording_path("rec 1"),
            "/api/recordings/rec%201"
        );
    }
}
