use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::types::TrackPriority;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub session: SessionConfig,
    pub connect: ConnectOptions,
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

/// Per-session tuning that is not sent to the native engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long `connect` waits for the room to be confirmed (0 = no limit)
    pub connect_timeout_ms: u64,
    /// Capacity of the broadcast channel carrying applied events to consumers
    pub event_channel_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 30_000,
            event_channel_capacity: 256,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub const fn connect_timeout(&self) -> Option<Duration> {
        if self.connect_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.connect_timeout_ms))
        }
    }
}

/// Options handed to the native engine when connecting a room.
///
/// These are passed through untouched; bandwidth adaptation and codec
/// negotiation are the engine's business.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectOptions {
    pub access_token: String,
    pub room_name: Option<String>,
    pub network_quality: NetworkQualityOptions,
    pub dominant_speaker_enabled: bool,
    pub encoding: EncodingParameters,
    pub bandwidth_profile: Option<BandwidthProfile>,
    pub preferred_audio_codecs: Vec<String>,
    pub preferred_video_codecs: Vec<VideoCodecPreference>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkQualityVerbosity {
    None,
    #[default]
    Minimal,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkQualityOptions {
    pub enabled: bool,
    pub local: NetworkQualityVerbosity,
    pub remote: NetworkQualityVerbosity,
}

/// Maximum send bitrates in kbps (0 = engine decides)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodingParameters {
    pub audio_bitrate: u32,
    pub video_bitrate: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BandwidthProfileMode {
    Grid,
    #[default]
    Collaboration,
    Presentation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackSwitchOffMode {
    Disabled,
    #[default]
    Detected,
    Predicted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderDimensions {
    pub high: Option<Dimensions>,
    pub standard: Option<Dimensions>,
    pub low: Option<Dimensions>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BandwidthProfile {
    pub mode: BandwidthProfileMode,
    pub track_switch_off_mode: TrackSwitchOffMode,
    pub max_tracks: Option<u32>,
    pub dominant_speaker_priority: Option<TrackPriority>,
    pub render_dimensions: RenderDimensions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoCodecPreference {
    pub codec: String,
    #[serde(default)]
    pub simulcast: bool,
}

impl Config {
    /// Load configuration from an optional file, then `ROOMSYNC__*` environment
    /// variables (e.g. `ROOMSYNC__LOGGING__LEVEL=debug`)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("ROOMSYNC")
                .prefix_separator("__")
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

    /// Check the configuration for values the session layer cannot work with
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        match self.logging.format.as_str() {
            "json" | "pretty" => {}
            other => errors.push(format!("logging.format must be json or pretty, got {other}")),
        }

        if self.session.event_channel_capacity == 0 {
            errors.push("session.event_channel_capacity must be greater than zero".to_string());
        }

        if let Some(profile) = &self.connect.bandwidth_profile {
            if profile.max_tracks == Some(0) {
                errors.push("connect.bandwidth_profile.max_tracks must be greater than zero".to_string());
            }
        }

        if self
            .connect
            .preferred_video_codecs
            .iter()
            .any(|c| c.codec.trim().is_empty())
        {
            errors.push("connect.preferred_video_codecs contains an empty codec name".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
