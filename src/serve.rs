use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use dashmap::DashMap;
use log::{error, info, warn};
use serde::Deserialize;
use std::sync::Arc as StdArc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

use crate::backend::RecordingLedger;
use crate::constants::SEGMENT_CACHE_CONTROL;
use crate::error::PipelineError;
use crate::manifest::Manifest;
use crate::memory::MemoryLedger;
use crate::model::{
    CheckpointRequest, CheckpointResponse, ChunkRecord, FinalizeRequest, FinalizeResponse,
    Recording, RecordingPatch, UploadUrlRequest, UploadUrlResponse,
};

struct StoredObject {
    content_type: String,
    data: Bytes,
}

/// State for the development backend
pub struct BackendState {
    pub ledger: MemoryLedger,
    objects: DashMap<String, StoredObject>,
    /// One-time upload token -> object key
    upload_tokens: DashMap<String, String>,
    manifests: DashMap<String, Manifest>,
    base_url: String,
    auth_token: Option<String>,
}

impl BackendState {
    pub fn new(base_url: impl Into<String>, auth_token: Option<String>) -> Self {
        Self {
            ledger: MemoryLedger::new(),
            objects: DashMap::new(),
            upload_tokens: DashMap::new(),
            manifests: DashMap::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth_token,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.objects.get(key).map(|o| o.data.clone())
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn manifest(&self, recording_id: &str) -> Option<Manifest> {
        self.manifests.get(recording_id).map(|m| m.clone())
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/objects/{}", self.base_url, key)
    }

    fn authorize(&self, headers: &HeaderMap) -> Result<(), Response> {
        let Some(expected) = self.auth_token.as_deref() else {
            return Ok(());
        };
        let provided = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if provided == Some(expected) {
            Ok(())
        } else {
            Err((StatusCode::UNAUTHORIZED, "Missing or invalid bearer token").into_response())
        }
    }
}

/// Object keys are stable per (recording, seq) so a retried upload overwrites
/// the same object
pub fn object_key(recording_id: &str, seq: u64) -> String {
    format!("recordings/{}/{:06}", recording_id, seq)
}

fn error_response(e: PipelineError) -> Response {
    let status = match &e {
        PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
        PipelineError::Ledger(_) | PipelineError::InvalidManifest(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!("Backend error: {}", e);
    }
    (status, e.to_string()).into_response()
}

pub fn router(state: StdArc<BackendState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/recordings", post(create_recording_handler))
        .route(
            "/api/recordings/{id}",
            get(get_recording_handler).patch(update_recording_handler),
        )
        .route("/api/recordings/{id}/chunks/{seq}", put(upsert_chunk_handler))
        .route("/api/recordings/{id}/checkpoint", post(checkpoint_handler))
        .route("/api/chunk-url", post(chunk_url_handler))
        .route("/api/finalize", post(finalize_handler))
        .route("/manifests/{id}", get(manifest_handler))
        .route(
            "/objects/{*key}",
            put(put_object_handler).get(get_object_handler),
        )
        .layer(cors)
        .with_state(state)
}

/// Serve the development backend on an already-bound listener
pub async fn serve_backend(
    listener: TcpListener,
    auth_token: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let addr = listener.local_addr()?;
    let state = StdArc::new(BackendState::new(format!("http://{}", addr), auth_token));
    info!("Development backend listening on: http://{}", addr);
    axum::serve(listener, router(state))
        .await
        .map_err(|e| format!("Server error: {}", e))?;
    Ok(())
}

/// Bind `port` on localhost and serve the development backend
pub async fn run_backend(
    port: u16,
    auth_token: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(format!("127.0.0.1:{}", port))
        .await
        .map_err(|e| format!("Failed to bind to port {}: {}", port, e))?;
    println!("Endpoints:");
    println!("  POST /api/recordings  - Create recording");
    println!("  GET|PATCH /api/recordings/{{id}}  - Read / update recording");
    println!("  PUT /api/recordings/{{id}}/chunks/{{seq}}  - Upsert chunk row");
    println!("  POST /api/recordings/{{id}}/checkpoint  - Advance checkpoint");
    println!("  POST /api/chunk-url  - Issue one-time upload URL");
    println!("  POST /api/finalize  - Assemble manifest");
    println!("  GET /manifests/{{id}}  - Manifest JSON");
    println!("  PUT|GET /objects/{{key}}  - Segment objects");
    serve_backend(listener, auth_token).await
}

async fn create_recording_handler(
    State(state): State<StdArc<BackendState>>,
    headers: HeaderMap,
    Json(recording): Json<Recording>,
) -> Response {
    if let Err(r) = state.authorize(&headers) {
        return r;
    }
    match state.ledger.create_recording(&recording).await {
        Ok(()) => {
            info!("Created recording {} ({})", recording.id, recording.mime_type);
            (StatusCode::CREATED, Json(recording)).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn get_recording_handler(
    State(state): State<StdArc<BackendState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if let Err(r) = state.authorize(&headers) {
        return r;
    }
    match state.ledger.recording(&id) {
        Some(recording) => Json(recording).into_response(),
        None => (StatusCode::NOT_FOUND, format!("Recording '{}' not found", id)).into_response(),
    }
}

async fn update_recording_handler(
    State(state): State<StdArc<BackendState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(patch): Json<RecordingPatch>,
) -> Response {
    if let Err(r) = state.authorize(&headers) {
        return r;
    }
    match state.ledger.update_recording(&id, &patch).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

async fn upsert_chunk_handler(
    State(state): State<StdArc<BackendState>>,
    headers: HeaderMap,
    Path((id, seq)): Path<(String, u64)>,
    Json(chunk): Json<ChunkRecord>,
) -> Response {
    if let Err(r) = state.authorize(&headers) {
        return r;
    }
    if chunk.recording_id != id || chunk.seq != seq {
        return (
            StatusCode::BAD_REQUEST,
            "Chunk row does not match the request path",
        )
            .into_response();
    }
    match state.ledger.upsert_chunk(&chunk).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

async fn checkpoint_handler(
    State(state): State<StdArc<BackendState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(request): Json<CheckpointRequest>,
) -> Response {
    if let Err(r) = state.authorize(&headers) {
        return r;
    }
    match state.ledger.advance_checkpoint(&id, request.seq).await {
        Ok(last_seq_uploaded) => Json(CheckpointResponse { last_seq_uploaded }).into_response(),
        Err(e) => error_response(e),
    }
}

async fn chunk_url_handler(
    State(state): State<StdArc<BackendState>>,
    headers: HeaderMap,
    Json(request): Json<UploadUrlRequest>,
) -> Response {
    if let Err(r) = state.authorize(&headers) {
        return r;
    }
    if state.ledger.recording(&request.recording_id).is_none() {
        return (
            StatusCode::NOT_FOUND,
            format!("Recording '{}' not found", request.recording_id),
        )
            .into_response();
    }
    let key = object_key(&request.recording_id, request.seq);
    let token = uuid::Uuid::new_v4().simple().to_string();
    state.upload_tokens.insert(token.clone(), key.clone());
    Json(UploadUrlResponse {
        upload_url: format!("{}?token={}", state.object_url(&key), token),
        object_key: key,
    })
    .into_response()
}

#[derive(Deserialize)]
struct UploadQuery {
    token: Option<String>,
}

async fn put_object_handler(
    State(state): State<StdArc<BackendState>>,
    Path(key): Path<String>,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(token) = query.token else {
        return (StatusCode::FORBIDDEN, "Missing upload token").into_response();
    };
    // Tokens are single use, even when the upload is rejected
    match state.upload_tokens.remove(&token) {
        Some((_, issued_key)) if issued_key == key => {}
        Some(_) => {
            warn!("Upload token used for a different key: {}", key);
            return (StatusCode::FORBIDDEN, "Upload token does not match key").into_response();
        }
        None => return (StatusCode::FORBIDDEN, "Invalid or used upload token").into_response(),
    }
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    let size = body.len();
    state.objects.insert(
        key.clone(),
        StoredObject {
            content_type,
            data: body,
        },
    );
    info!("Stored object {} ({} bytes)", key, size);
    StatusCode::OK.into_response()
}

async fn get_object_handler(
    State(state): State<StdArc<BackendState>>,
    Path(key): Path<String>,
) -> Response {
    match state.objects.get(&key) {
        Some(object) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, object.content_type.clone()),
                (header::CACHE_CONTROL, SEGMENT_CACHE_CONTROL.to_string()),
            ],
            object.data.clone(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, format!("Object '{}' not found", key)).into_response(),
    }
}

async fn finalize_handler(
    State(state): State<StdArc<BackendState>>,
    headers: HeaderMap,
    Json(request): Json<FinalizeRequest>,
) -> Response {
    if let Err(r) = state.authorize(&headers) {
        return r;
    }
    let Some(recording) = state.ledger.recording(&request.recording_id) else {
        return (
            StatusCode::NOT_FOUND,
            format!("Recording '{}' not found", request.recording_id),
        )
            .into_response();
    };
    let manifest_url = format!("{}/manifests/{}", state.base_url, recording.id);
    if state.manifests.contains_key(&recording.id) {
        info!("Recording {} is already finalized", recording.id);
        return Json(FinalizeResponse { manifest_url }).into_response();
    }
    let Some(total_chunks) = recording.total_chunks else {
        return (StatusCode::CONFLICT, "Recording has no total chunk count yet").into_response();
    };

    let rows = state.ledger.chunks(&recording.id);
    let manifest = match Manifest::assemble(&recording, &rows, total_chunks, |key| {
        state.object_url(key)
    }) {
        Ok(manifest) => manifest,
        Err(e) => {
            warn!("Refusing to finalize {}: {}", recording.id, e);
            return (StatusCode::CONFLICT, format!("Cannot finalize: {}", e)).into_response();
        }
    };

    info!(
        "Finalized recording {} for session {}: {} chunk(s), {}ms",
        recording.id,
        request.live_session_id,
        manifest.chunks.len(),
        manifest.total_duration_ms
    );
    // manifests are written once
    state.manifests.entry(recording.id.clone()).or_insert(manifest);
    Json(FinalizeResponse { manifest_url }).into_response()
}

async fn manifest_handler(
    State(state): State<StdArc<BackendState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if let Err(r) = state.authorize(&headers) {
        return r;
    }
    match state.manifests.get(&id) {
        Some(manifest) => Json(manifest.clone()).into_response(),
        None => (StatusCode::NOT_FOUND, format!("Manifest '{}' not found", id)).into_response(),
    }
}
