use clap::ValueEnum;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;

#[derive(Debug, Clone, Copy, PartialEq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigType {
    /// Recording, upload and playback client configuration
    Pipeline,
}

/// A codec identifier paired with the content type handed to the capturer
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CodecPreference {
    pub codec: String,
    pub mime_type: String,
}

fn default_codec_preferences() -> Vec<CodecPreference> {
    DEFAULT_CODEC_PREFERENCES
        .iter()
        .map(|(codec, mime)| CodecPreference {
            codec: codec.to_string(),
            mime_type: mime.to_string(),
        })
        .collect()
}

fn default_owner() -> String {
    "anonymous".to_string()
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("tmp")
}

/// Recorder settings (maps to [recorder] section in TOML)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// URL of the live HTTP media stream to capture
    pub source_url: Option<String>,
    /// Owner recorded on the recording row
    pub owner: String,
    /// Requested segment duration, clamped to 2000..=6000 ms
    pub segment_duration_ms: u64,
    /// Capacity of the capture -> upload channel
    pub channel_capacity: usize,
    /// Ordered codec preferences, most preferred first
    pub codec_preferences: Vec<CodecPreference>,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            source_url: None,
            owner: default_owner(),
            segment_duration_ms: DEFAULT_SEGMENT_DURATION_MS,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            codec_preferences: default_codec_preferences(),
        }
    }
}

impl RecorderConfig {
    pub fn segment_duration(&self) -> Duration {
        Duration::from_millis(clamp_segment_duration_ms(self.segment_duration_ms))
    }
}

/// Upload queue settings (maps to [upload] section in TOML)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Uploads in flight at once
    pub max_concurrent: usize,
    /// Retries per segment before it is marked failed
    pub max_retries: u32,
    /// Backoff table; retry N waits entry N-1, the last entry caps the rest
    pub retry_delays_ms: Vec<u64>,
    /// Timeout applied to each network step of an attempt
    pub attempt_timeout_ms: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT_UPLOADS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delays_ms: DEFAULT_RETRY_DELAYS_MS.to_vec(),
            attempt_timeout_ms: DEFAULT_ATTEMPT_TIMEOUT_MS,
        }
    }
}

impl UploadConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

/// Playback engine settings (maps to [playback] section in TOML)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Content fetched ahead of the playback position
    pub forward_window_ms: u64,
    /// Played content kept before the playback position
    pub retention_window_ms: u64,
    /// Buffer append failures tolerated before switching to the fallback path
    pub max_append_failures: u32,
    /// Retries per segment fetch
    pub segment_fetch_retries: u32,
    /// Segment fetches in flight at once on the progressive path
    pub max_concurrent_fetches: usize,
    /// Window re-evaluation interval
    pub tick_interval_ms: u64,
    /// Timeout applied to each fetch attempt
    pub attempt_timeout_ms: u64,
    /// Backoff table between fetch retries
    pub retry_delays_ms: Vec<u64>,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            forward_window_ms: DEFAULT_FORWARD_WINDOW_MS,
            retention_window_ms: DEFAULT_RETENTION_WINDOW_MS,
            max_append_failures: DEFAULT_MAX_APPEND_FAILURES,
            segment_fetch_retries: DEFAULT_SEGMENT_FETCH_RETRIES,
            max_concurrent_fetches: DEFAULT_MAX_CONCURRENT_FETCHES,
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            attempt_timeout_ms: DEFAULT_ATTEMPT_TIMEOUT_MS,
            retry_delays_ms: DEFAULT_RETRY_DELAYS_MS.to_vec(),
        }
    }
}

impl PlaybackConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

/// Pipeline configuration file structure
#[derive(Debug, Deserialize)]
pub struct PipelineConfig {
    /// Configuration type (must be "pipeline")
    pub config_type: ConfigType,
    /// Base URL of the recording backend (e.g., http://localhost:3000)
    pub backend_url: String,
    /// Bearer token sent to the backend
    pub auth_token: Option<String>,
    /// Directory for the resume marker (default: tmp)
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default)]
    pub recorder: RecorderConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file '{}': {}", path.display(), e))?;
        let config: PipelineConfig = toml::from_str(&content)
            .map_err(|e| format!("Failed to parse config file '{}': {}", path.display(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would stall or disable the pipeline
    pub fn validate(&self) -> Result<(), String> {
        if self.upload.max_concurrent == 0 {
            return Err("upload.max_concurrent must be at least 1".to_string());
        }
        if self.upload.retry_delays_ms.is_empty() {
            return Err("upload.retry_delays_ms must not be empty".to_string());
        }
        if self.playback.max_concurrent_fetches == 0 {
            return Err("playback.max_concurrent_fetches must be at least 1".to_string());
        }
        if self.recorder.codec_preferences.is_empty() {
            return Err("recorder.codec_preferences must not be empty".to_string());
        }
        if self.recorder.channel_capacity == 0 {
            return Err("recorder.channel_capacity must be at least 1".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let config: PipelineConfig = toml::from_str(
            r#"
            config_type = "pipeline"
            backend_url = "http://localhost:3000"
            "#,
        )
        .unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.upload.max_concurrent, 2);
        assert_eq!(config.upload.max_retries, 3);
        assert_eq!(config.playback.forward_window_ms, 30_000);
        assert_eq!(config.state_dir, PathBuf::from("tmp"));
        assert_eq!(config.recorder.codec_preferences[0].codec, "vp9");
    }

    #[test]
    fn segment_duration_is_clamped_from_config() {
        let config: PipelineConfig = toml::from_str(
            r#"
            config_type = "pipeline"
            backend_url = "http://localhost:3000"

            [recorder]
            segment_duration_ms = 1000
            "#,
        )
        .unwrap();
        assert_eq!(config.recorder.segment_duration(), Duration::from_millis(2000));
    }

    #[test]
    fn rejects_zero_concurrency() {
        let config: PipelineConfig = toml::from_str(
            r#"
            config_type = "pipeline"
            backend_url = "http://localhost:3000"

            [upload]
            max_concurrent = 0
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn custom_codec_preferences() {
        let config: PipelineConfig = toml::from_str(
            r#"
            config_type = "pipeline"
            backend_url = "http://localhost:3000"

            [recorder]
            owner = "studio-a"
            codec_preferences = [
                { codec = "mp3", mime_type = "audio/mpeg" },
            ]
            "#,
        )
        .unwrap();
        assert_eq!(config.recorder.owner, "studio-a");
        assert_eq!(config.recorder.codec_preferences.len(), 1);
        assert_eq!(config.recorder.codec_preferences[0].mime_type, "audio/mpeg");
    }
}
