use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct FramepulseConfig {
    pub ingest: IngestConfig,
    pub activity: ActivityConfig,
    pub session: SessionConfig,
    pub queue: QueueConfig,
    pub upload: UploadConfig,
    pub system: SystemConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct IngestConfig {
    /// Sliding window horizon for frametime smoothing, in seconds
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,

    /// Minimum interval between smoothed FPS emissions, in milliseconds
    #[serde(default = "default_emit_interval_ms")]
    pub emit_interval_ms: u64,

    /// Frametime values at or above this are treated as stalls and discarded, in ms
    #[serde(default = "default_max_frametime_ms")]
    pub max_frametime_ms: f64,

    /// Capacity of the retained frametime history for graphing
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ActivityConfig {
    /// Activity poll cadence, in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Consecutive inactive ticks before the upload trigger fires
    #[serde(default = "default_inactivity_ticks")]
    pub inactivity_ticks: u32,

    /// Analog trigger delta (out of 255) that counts as controller input
    #[serde(default = "default_trigger_delta")]
    pub trigger_delta: u8,

    /// Thumbstick axis delta (out of 32767) that counts as controller input
    #[serde(default = "default_thumbstick_delta")]
    pub thumbstick_delta: i16,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SessionConfig {
    /// Minimum accumulated session seconds before an automatic upload
    #[serde(default = "default_min_upload_seconds")]
    pub min_upload_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct QueueConfig {
    /// Path of the JSON-lines write-ahead log
    #[serde(default = "default_wal_path")]
    pub wal_path: String,

    /// In-memory queue capacity; oldest records are dropped on overflow
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct UploadConfig {
    /// Upload endpoint URL
    #[serde(default = "default_upload_url")]
    pub url: String,

    /// Maximum records aggregated into one batch upload
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Worker flush interval, in seconds
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,

    /// Maximum delivery attempts per batch
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Per-request timeout, in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Path of the device pairing token file; uploads are skipped until the
    /// file exists
    #[serde(default = "default_token_path")]
    pub token_path: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SystemConfig {
    /// Event bus capacity
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,
}

fn default_window_seconds() -> u64 {
    2
}

fn default_emit_interval_ms() -> u64 {
    1000
}

fn default_max_frametime_ms() -> f64 {
    1000.0
}

fn default_history_capacity() -> usize {
    200
}

fn default_poll_interval_ms() -> u64 {
    1500
}

fn default_inactivity_ticks() -> u32 {
    10
}

fn default_trigger_delta() -> u8 {
    50
}

fn default_thumbstick_delta() -> i16 {
    5000
}

fn default_min_upload_seconds() -> u64 {
    30
}

fn default_wal_path() -> String {
    "telemetry_wal.jsonl".to_string()
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_upload_url() -> String {
    "https://framepulse.example/api/fps".to_string()
}

fn default_max_batch_size() -> usize {
    50
}

fn default_flush_interval_secs() -> u64 {
    5
}

fn default_max_attempts() -> u32 {
    6
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_token_path() -> String {
    "device_token.txt".to_string()
}

fn default_event_bus_capacity() -> usize {
    100
}

impl FramepulseConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("framepulse.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            // Start with default values
            .set_default("ingest.window_seconds", default_window_seconds())?
            .set_default("ingest.emit_interval_ms", default_emit_interval_ms())?
            .set_default("ingest.max_frametime_ms", default_max_frametime_ms())?
            .set_default("ingest.history_capacity", default_history_capacity() as i64)?
            .set_default("activity.poll_interval_ms", default_poll_interval_ms())?
            .set_default("activity.inactivity_ticks", default_inactivity_ticks())?
            .set_default("activity.trigger_delta", default_trigger_delta() as i64)?
            .set_default(
                "activity.thumbstick_delta",
                default_thumbstick_delta() as i64,
            )?
            .set_default("session.min_upload_seconds", default_min_upload_seconds())?
            .set_default("queue.wal_path", default_wal_path())?
            .set_default("queue.capacity", default_queue_capacity() as i64)?
            .set_default("upload.url", default_upload_url())?
            .set_default("upload.max_batch_size", default_max_batch_size() as i64)?
            .set_default("upload.flush_interval_secs", default_flush_interval_secs())?
            .set_default("upload.max_attempts", default_max_attempts())?
            .set_default(
                "upload.request_timeout_secs",
                default_request_timeout_secs(),
            )?
            .set_default("upload.token_path", default_token_path())?
            .set_default(
                "system.event_bus_capacity",
                default_event_bus_capacity() as i64,
            )?
            // Add configuration file (optional)
            .add_source(File::with_name(&path_str).required(false))
            // Add environment variables with FRAMEPULSE_ prefix
            .add_source(Environment::with_prefix("FRAMEPULSE").separator("_"))
            .build()?;

        let config: FramepulseConfig = settings.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ingest.window_seconds == 0 {
            return Err(ConfigError::Message(
                "Ingest window_seconds must be greater than 0".to_string(),
            ));
        }

        if self.ingest.max_frametime_ms <= 0.0 {
            return Err(ConfigError::Message(
                "Ingest max_frametime_ms must be greater than 0".to_string(),
            ));
        }

        if self.ingest.history_capacity == 0 {
            return Err(ConfigError::Message(
                "Ingest history_capacity must be greater than 0".to_string(),
            ));
        }

        if self.activity.poll_interval_ms == 0 {
            return Err(ConfigError::Message(
                "Activity poll_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.activity.inactivity_ticks == 0 {
            return Err(ConfigError::Message(
                "Activity inactivity_ticks must be greater than 0".to_string(),
            ));
        }

        if self.queue.capacity == 0 {
            return Err(ConfigError::Message(
                "Queue capacity must be greater than 0".to_string(),
            ));
        }

        if self.upload.url.is_empty() {
            return Err(ConfigError::Message(
                "Upload url must not be empty".to_string(),
            ));
        }

        if self.upload.max_batch_size == 0 {
            return Err(ConfigError::Message(
                "Upload max_batch_size must be greater than 0".to_string(),
            ));
        }

        if self.upload.max_attempts == 0 {
            return Err(ConfigError::Message(
                "Upload max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.system.event_bus_capacity == 0 {
            return Err(ConfigError::Message(
                "Event bus capacity must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for FramepulseConfig {
    fn default() -> Self {
        Self {
            ingest: IngestConfig {
                window_seconds: default_window_seconds(),
                emit_interval_ms: default_emit_interval_ms(),
                max_frametime_ms: default_max_frametime_ms(),
                history_capacity: default_history_capacity(),
            },
            activity: ActivityConfig {
                poll_interval_ms: default_poll_interval_ms(),
                inactivity_ticks: default_inactivity_ticks(),
                trigger_delta: default_trigger_delta(),
                thumbstick_delta: default_thumbstick_delta(),
            },
            session: SessionConfig {
                min_upload_seconds: default_min_upload_seconds(),
            },
            queue: QueueConfig {
                wal_path: default_wal_path(),
                capacity: default_queue_capacity(),
            },
            upload: UploadConfig {
                url: default_upload_url(),
                max_batch_size: default_max_batch_size(),
                flush_interval_secs: default_flush_interval_secs(),
                max_attempts: default_max_attempts(),
                request_timeout_secs: default_request_timeout_secs(),
                token_path: default_token_path(),
            },
            system: SystemConfig {
                event_bus_capacity: default_event_bus_capacity(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_behavioral_constants() {
        let config = FramepulseConfig::default();
        assert_eq!(config.ingest.window_seconds, 2);
        assert_eq!(config.activity.poll_interval_ms, 1500);
        assert_eq!(config.activity.inactivity_ticks, 10);
        assert_eq!(config.session.min_upload_seconds, 30);
        assert_eq!(config.queue.capacity, 10_000);
        assert_eq!(config.upload.max_batch_size, 50);
        assert_eq!(config.upload.max_attempts, 6);
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = FramepulseConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_ticks() {
        let mut config = FramepulseConfig::default();
        config.activity.inactivity_ticks = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = FramepulseConfig::default();
        let toml = toml::to_string(&config).unwrap();
        let back: FramepulseConfig = toml::from_str(&toml).unwrap();
        assert_eq!(back.upload.max_batch_size, config.upload.max_batch_size);
        assert_eq!(back.queue.wal_path, config.queue.wal_path);
    }
}
