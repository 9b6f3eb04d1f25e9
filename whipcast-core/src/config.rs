use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub media: MediaConfig,
    pub events: EventsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
    /// Upper bound for a single signaling frame
    pub max_ws_message_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 8090,
            max_ws_message_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Video codec accepted from publishers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodecPreference {
    #[default]
    Vp8,
    H264,
}

/// What to do when a media worker dies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerDeathPolicy {
    /// Replace the dead worker with a fresh one
    #[default]
    Restart,
    /// Shut the whole process down
    FailFast,
}

/// Media plane configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Number of media workers (0 = one per CPU core)
    pub num_workers: usize,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    /// Local address transports bind to
    pub listen_ip: String,
    /// Address advertised in ICE candidates (defaults to `listen_ip`)
    pub announced_ip: Option<String>,
    pub preferred_video_codec: VideoCodecPreference,
    /// Create consumers paused and wait for an explicit resume
    pub consumer_start_paused: bool,
    /// Transport stats logging period (0 = disabled)
    pub stats_interval_secs: u64,
    /// Periodic keyframe requests towards viewers (0 = disabled)
    pub keyframe_interval_secs: u64,
    pub on_worker_death: WorkerDeathPolicy,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            num_workers: 0,
            rtc_min_port: 10000,
            rtc_max_port: 10100,
            listen_ip: "0.0.0.0".to_string(),
            announced_ip: None,
            preferred_video_codec: VideoCodecPreference::Vp8,
            consumer_start_paused: true,
            stats_interval_secs: 10,
            keyframe_interval_secs: 0,
            on_worker_death: WorkerDeathPolicy::Restart,
        }
    }
}

impl MediaConfig {
    /// Worker count with the CPU-count default resolved
    #[must_use]
    pub fn worker_count(&self) -> usize {
        if self.num_workers > 0 {
            return self.num_workers;
        }
        std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
    }

    /// IP placed into ICE candidates
    #[must_use]
    pub fn candidate_ip(&self) -> &str {
        self.announced_ip.as_deref().unwrap_or(&self.listen_ip)
    }
}

/// Downstream event delivery (analytics / audit log service)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// POST events to `endpoint`; when false events only go to the log
    pub enabled: bool,
    pub endpoint: String,
    pub hmac_secret: String,
    pub queue_capacity: usize,
    pub timeout_secs: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: "http://localhost:3001/logs".to_string(),
            hmac_secret: String::new(),
            queue_capacity: 1024,
            timeout_secs: 5,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables (`WHIPCAST_MEDIA__NUM_WORKERS`, ...)
    /// 2. Config file (if provided)
    /// 3. Defaults
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("WHIPCAST")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Check for settings that would only fail later at runtime
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.media.rtc_min_port == 0 || self.media.rtc_min_port > self.media.rtc_max_port {
            errors.push(format!(
                "media.rtc_min_port ({}) must be non-zero and not above media.rtc_max_port ({})",
                self.media.rtc_min_port, self.media.rtc_max_port
            ));
        }
        if self.media.listen_ip.trim().is_empty() {
            errors.push("media.listen_ip must not be empty".to_string());
        }
        if self.server.max_ws_message_bytes < 1024 {
            errors.push("server.max_ws_message_bytes must be at least 1024".to_string());
        }
        if self.events.enabled {
            if self.events.endpoint.trim().is_empty() {
                errors.push("events.endpoint is required when events are enabled".to_string());
            }
            if self.events.hmac_secret.is_empty() {
                errors.push("events.hmac_secret is required when events are enabled".to_string());
            }
            if self.events.queue_capacity == 0 {
                errors.push("events.queue_capacity must be positive".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Get HTTP address
    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }
}
