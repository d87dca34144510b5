use std::time::Duration;

/// Manifest schema version produced by finalizers and accepted by playback
pub const MANIFEST_VERSION: u32 = 1;

/// Shortest segment the recorder will cut
pub const MIN_SEGMENT_DURATION_MS: u64 = 2_000;

/// Longest segment the recorder will cut
pub const MAX_SEGMENT_DURATION_MS: u64 = 6_000;

pub const DEFAULT_SEGMENT_DURATION_MS: u64 = 4_000;

/// Uploads in flight per queue
pub const DEFAULT_MAX_CONCURRENT_UPLOADS: usize = 2;

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Delay before retry N (1-based); the last entry caps every later retry
pub const DEFAULT_RETRY_DELAYS_MS: [u64; 5] = [1_000, 2_000, 4_000, 8_000, 15_000];

/// Per-attempt network timeout
pub const DEFAULT_ATTEMPT_TIMEOUT_MS: u64 = 30_000;

/// Capacity of the capture -> upload channel
pub const DEFAULT_CHANNEL_CAPACITY: usize = 16;

/// Upcoming content kept buffered ahead of the playback position
pub const DEFAULT_FORWARD_WINDOW_MS: u64 = 30_000;

/// Already-played content kept before the playback position
pub const DEFAULT_RETENTION_WINDOW_MS: u64 = 15_000;

/// Buffer append failures tolerated before switching to the fallback path
pub const DEFAULT_MAX_APPEND_FAILURES: u32 = 3;

pub const DEFAULT_SEGMENT_FETCH_RETRIES: u32 = 3;

pub const DEFAULT_MAX_CONCURRENT_FETCHES: usize = 3;

/// Window re-evaluation interval for the playback engine
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 1_000;

/// Key of the "pending recording id" resume marker
pub const PENDING_RECORDING_KEY: &str = "pending_recording_id";

/// Live session the pending recording belongs to, needed to finalize after a resume
pub const PENDING_SESSION_KEY: &str = "pending_session_id";

/// Cache directive sent with every segment transfer
pub const SEGMENT_CACHE_CONTROL: &str = "public, max-age=31536000, immutable";

/// Codec preference list, most preferred first: (codec identifier, content type)
pub const DEFAULT_CODEC_PREFERENCES: &[(&str, &str)] = &[
    ("vp9", "video/webm;codecs=vp9,opus"),
    ("vp8", "video/webm;codecs=vp8,opus"),
    ("webm", "video/webm"),
    ("h264", "video/mp4;codecs=avc1.42E01E,mp4a.40.2"),
    ("mp4", "video/mp4"),
    ("opus", "audio/webm;codecs=opus"),
    ("aac", "audio/aac"),
    ("mp3", "audio/mpeg"),
];

/// Clamp a requested segment duration into the supported range
pub fn clamp_segment_duration_ms(requested_ms: u64) -> u64 {
    requested_ms.clamp(MIN_SEGMENT_DURATION_MS, MAX_SEGMENT_DURATION_MS)
}

/// Look up the backoff delay for a retry attempt (1-based)
///
/// Attempts past the end of the table reuse the last entry. An empty table
/// means retry immediately.
pub fn retry_delay(delays_ms: &[u64], attempt: u32) -> Duration {
    let idx = (attempt.max(1) - 1) as usize;
    let ms = delays_ms
        .get(idx)
        .or_else(|| delays_ms.last())
        .copied()
        .unwrap_or(0);
    Duration::from_millis(ms)
}

/// Generate a unique recording id
pub fn generate_recording_id() -> String {
    format!("rec_{}", uuid::Uuid::new_v4().simple())
}
