mod common;

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use common::{fast_upload_config, recording, segment_bytes, CollectingSink, RecordingSink, ScriptedCapturer};
use relay_media_stream::backend::{ChunkUrlIssuer, Finalizer, RecordingLedger, SegmentStore};
use relay_media_stream::config::{PlaybackConfig, RecorderConfig};
use relay_media_stream::http::HttpBackend;
use relay_media_stream::model::{
    ChunkRecord, ChunkStatus, FinalizeRequest, RecordingPatch, RecordingStatus, UploadUrlRequest,
};
use relay_media_stream::playback::{PlaybackEngine, PlaybackOutcome, ProgressiveSink};
use relay_media_stream::record::Recorder;
use relay_media_stream::resume::MemoryResumeStore;
use relay_media_stream::serve::{object_key, router, BackendState};
use relay_media_stream::upload::UploadQueue;
use relay_media_stream::PipelineError;

const TOKEN: &str = "dev-secret";

async fn spawn_backend(auth_token: Option<&str>) -> Arc<BackendState> {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(BackendState::new(
        format!("http://{addr}"),
        auth_token.map(str::to_string),
    ));
    let app = router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    state
}

fn client(state: &BackendState, token: Option<&str>) -> Arc<HttpBackend> {
    Arc::new(
        HttpBackend::new(
            state.base_url(),
            token.map(str::to_string),
            Duration::from_secs(5),
        )
        .unwrap(),
    )
}

fn recorder_for(backend: &Arc<HttpBackend>) -> Recorder {
    let queue = UploadQueue::new(
        backend.clone(),
        backend.clone(),
        backend.clone(),
        fast_upload_config(2, 3),
    );
    Recorder::new(
        backend.clone(),
        backend.clone(),
        queue,
        Arc::new(MemoryResumeStore::new()),
        RecorderConfig {
            segment_duration_ms: 2_000,
            ..RecorderConfig::default()
        },
    )
}

#[tokio::test]
async fn test_record_finalize_and_play_over_http() {
    let state = spawn_backend(Some(TOKEN)).await;
    let backend = client(&state, Some(TOKEN));
    let mut recorder = recorder_for(&backend);

    let capturer = ScriptedCapturer::new(
        &["video/webm;codecs=vp9,opus"],
        (0..4).map(segment_bytes).collect(),
    );
    let recording = recorder.start(Box::new(capturer), "live_42").await.unwrap();
    let finalized = recorder.stop().await.unwrap();
    assert_eq!(recorder.status(), RecordingStatus::Done);
    assert_eq!(
        finalized.manifest_url,
        format!("{}/manifests/{}", state.base_url(), recording.id)
    );

    let row = state.ledger.recording(&recording.id).unwrap();
    assert_eq!(row.status, RecordingStatus::Done);
    assert_eq!(row.total_chunks, Some(4));
    assert_eq!(row.last_seq_uploaded, Some(3));
    assert_eq!(state.object_count(), 4);
    assert_eq!(
        state.object(&object_key(&recording.id, 2)),
        Some(segment_bytes(2))
    );

    let manifest = state.manifest(&recording.id).unwrap();
    assert_eq!(manifest.chunks.len(), 4);
    assert_eq!(manifest.total_duration_ms, 8_000);

    let (mut engine, _) = PlaybackEngine::new(backend.clone(), PlaybackConfig::default());
    let mut sink = RecordingSink::default();
    let mut fallback = CollectingSink::default();
    let outcome = engine
        .play(
            &finalized.manifest_url,
            Some(&mut sink as &mut dyn ProgressiveSink),
            &mut fallback,
        )
        .await
        .unwrap();
    assert_eq!(outcome, PlaybackOutcome::Progressive);
    assert_eq!(sink.appends, vec![0, 1, 2, 3]);
    let expected: Vec<u8> = (0..4).flat_map(|seq| segment_bytes(seq).to_vec()).collect();
    assert_eq!(sink.data, expected);

    let (mut engine, _) = PlaybackEngine::new(backend, PlaybackConfig::default());
    let mut fallback = CollectingSink::default();
    engine
        .play(&finalized.manifest_url, None, &mut fallback)
        .await
        .unwrap();
    assert_eq!(fallback.played.unwrap().1, Bytes::from(expected));
}

#[tokio::test]
async fn test_wrong_token_is_authentication_required() {
    let state = spawn_backend(Some(TOKEN)).await;
    let backend = client(&state, Some("not-the-token"));
    let mut recorder = recorder_for(&backend);

    let capturer = ScriptedCapturer::new(&["video/webm"], vec![segment_bytes(0)]);
    let err = recorder.start(Box::new(capturer), "live_1").await.unwrap_err();
    assert!(matches!(err, PipelineError::AuthenticationRequired));
    assert_eq!(recorder.status(), RecordingStatus::Idle);
    assert_eq!(state.object_count(), 0);
}

#[tokio::test]
async fn test_upload_urls_are_single_use() {
    let state = spawn_backend(None).await;
    let backend = client(&state, None);
    backend.create_recording(&recording("rec_once")).await.unwrap();

    let issued = backend
        .issue_upload_url(&UploadUrlRequest {
            recording_id: "rec_once".to_string(),
            seq: 0,
            content_type: "video/webm".to_string(),
            file_size: 4,
        })
        .await
        .unwrap();
    assert_eq!(issued.object_key, object_key("rec_once", 0));

    backend
        .put_segment(&issued.upload_url, "video/webm", Bytes::from_static(b"abcd"))
        .await
        .unwrap();
    let reused = backend
        .put_segment(&issued.upload_url, "video/webm", Bytes::from_static(b"efgh"))
        .await;
    assert!(matches!(reused, Err(PipelineError::AuthenticationRequired)));
    assert_eq!(
        state.object(&issued.object_key),
        Some(Bytes::from_static(b"abcd"))
    );
}

#[tokio::test]
async fn test_finalize_refuses_incomplete_recording() {
    let state = spawn_backend(None).await;
    let backend = client(&state, None);
    backend.create_recording(&recording("rec_gap")).await.unwrap();
    for seq in [0, 2] {
        backend
            .upsert_chunk(&ChunkRecord {
                recording_id: "rec_gap".to_string(),
                seq,
                object_key: object_key("rec_gap", seq),
                bytes: 4,
                duration_ms: 2_000,
                status: ChunkStatus::Uploaded,
                uploaded_at: chrono::Utc::now(),
            })
            .await
            .unwrap();
        backend.advance_checkpoint("rec_gap", seq).await.unwrap();
    }
    backend
        .update_recording(
            "rec_gap",
            &RecordingPatch {
                total_chunks: Some(3),
                ..RecordingPatch::default()
            },
        )
        .await
        .unwrap();

    let err = backend
        .finalize(&FinalizeRequest {
            recording_id: "rec_gap".to_string(),
            live_session_id: "live_1".to_string(),
        })
        .await
        .unwrap_err();
    match err {
        PipelineError::Finalize(message) => {
            assert!(message.contains("409"), "{message}");
            assert!(message.contains("missing segment 1"), "{message}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(state.manifest("rec_gap").is_none());
}

#[tokio::test]
async fn test_second_finalize_keeps_first_manifest() {
    let state = spawn_backend(None).await;
    let backend = client(&state, None);
    backend.create_recording(&recording("rec_twice")).await.unwrap();
    let chunk = |seq: u64, bytes: u64| ChunkRecord {
        recording_id: "rec_twice".to_string(),
        seq,
        object_key: object_key("rec_twice", seq),
        bytes,
        duration_ms: 2_000,
        status: ChunkStatus::Uploaded,
        uploaded_at: chrono::Utc::now(),
    };
    for seq in 0..2 {
        backend.upsert_chunk(&chunk(seq, 4)).await.unwrap();
    }
    backend
        .update_recording(
            "rec_twice",
            &RecordingPatch {
                total_chunks: Some(2),
                ..RecordingPatch::default()
            },
        )
        .await
        .unwrap();
    let request = FinalizeRequest {
        recording_id: "rec_twice".to_string(),
        live_session_id: "live_1".to_string(),
    };
    let first = backend.finalize(&request).await.unwrap();

    // a late re-upload changes the ledger, not the published manifest
    backend.upsert_chunk(&chunk(1, 9)).await.unwrap();
    let second = backend.finalize(&request).await.unwrap();

    assert_eq!(second.manifest_url, first.manifest_url);
    let manifest = state.manifest("rec_twice").unwrap();
    assert_eq!(manifest.chunks[1].bytes, 4);
}

#[tokio::test]
async fn test_ledger_round_trip() {
    let state = spawn_backend(Some(TOKEN)).await;
    let backend = client(&state, Some(TOKEN));

    assert!(backend.get_recording("rec_unknown").await.unwrap().is_none());

    backend.create_recording(&recording("rec_ledger")).await.unwrap();
    assert!(matches!(
        backend.create_recording(&recording("rec_ledger")).await,
        Err(PipelineError::Ledger(_))
    ));

    assert_eq!(backend.advance_checkpoint("rec_ledger", 5).await.unwrap(), 5);
    assert_eq!(backend.advance_checkpoint("rec_ledger", 2).await.unwrap(), 5);
    backend
        .update_recording("rec_ledger", &RecordingPatch::status(RecordingStatus::Uploading))
        .await
        .unwrap();

    let row = backend.get_recording("rec_ledger").await.unwrap().unwrap();
    assert_eq!(row.status, RecordingStatus::Uploading);
    assert_eq!(row.last_seq_uploaded, Some(5));
}
