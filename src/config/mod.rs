//! Configuration management for janus-videoroom

use crate::janus::{HandleOptions, PollSettings};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Video codec moved to the front of remote `m=video` lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
    VP8,
    VP9,
    AV1,
}

impl VideoCodec {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "h264",
            VideoCodec::VP8 => "vp8",
            VideoCodec::VP9 => "vp9",
            VideoCodec::AV1 => "av1",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Gateway connection
    pub server: ServerConfig,

    /// Room to join
    pub room: RoomConfig,

    /// Media settings
    #[serde(default)]
    pub media: MediaConfig,

    /// Transaction registry
    #[serde(default)]
    pub transactions: TransactionConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Gateway base URL without the `/janus` path, e.g. `http://localhost:8088`
    pub url: String,

    /// Timeout of ordinary requests in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Timeout of long-poll requests in seconds; the gateway holds polls for 30s
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,

    /// Events fetched per long poll
    #[serde(default = "default_max_events")]
    pub max_events: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomConfig {
    /// VideoRoom room number
    pub room_id: u64,

    /// Display name announced on join
    pub display: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Publish audio
    #[serde(default = "default_true")]
    pub audio: bool,

    /// Publish video
    #[serde(default = "default_true")]
    pub video: bool,

    /// Echo local descriptions and candidates back instead of sending them
    #[serde(default)]
    pub loopback: bool,

    /// Open a data channel on the publisher connection
    #[serde(default)]
    pub data_channel: bool,

    /// Reorder remote video codecs so this one is preferred
    #[serde(default)]
    pub preferred_video_codec: Option<VideoCodec>,

    /// STUN/TURN servers
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServerConfig>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
            loopback: false,
            data_channel: false,
            preferred_video_codec: None,
            ice_servers: default_ice_servers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionConfig {
    /// Unanswered transactions are dropped after this many seconds
    #[serde(default = "default_transaction_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_transaction_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                url: "http://localhost:8088".to_string(),
                request_timeout_secs: default_request_timeout_secs(),
                poll_timeout_secs: default_poll_timeout_secs(),
                max_events: default_max_events(),
            },
            room: RoomConfig {
                room_id: 1234,
                display: "janus-videoroom".to_string(),
            },
            media: MediaConfig::default(),
            transactions: TransactionConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        let url = self.server.url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err("Server url must be an http:// or https:// URL".into());
        }

        if self.server.request_timeout_secs == 0 {
            return Err("Server request timeout must be non-zero".into());
        }

        // Long polls are held open by the gateway for up to 30 seconds
        if self.server.poll_timeout_secs <= 30 {
            return Err("Server poll timeout must exceed 30 seconds".into());
        }

        if self.server.max_events == 0 {
            return Err("Server max_events must be non-zero".into());
        }

        if self.room.display.trim().is_empty() {
            return Err("Room display name must not be empty".into());
        }

        if !self.media.audio && !self.media.video {
            return Err("At least one of media audio or video must be enabled".into());
        }

        for server in &self.media.ice_servers {
            if server.urls.is_empty() {
                return Err("ICE server entries need at least one url".into());
            }
            let turn = server.urls.iter().any(|u| u.starts_with("turn:") || u.starts_with("turns:"));
            if turn && (server.username.is_none() || server.credential.is_none()) {
                return Err("TURN servers require username and credential".into());
            }
        }

        if self.transactions.ttl_secs == 0 {
            return Err("Transaction ttl must be non-zero".into());
        }

        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.server.poll_timeout_secs)
    }

    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            max_events: self.server.max_events,
            transaction_ttl: Duration::from_secs(self.transactions.ttl_secs),
        }
    }

    pub fn handle_options(&self) -> HandleOptions {
        HandleOptions {
            room_id: self.room.room_id,
            display: self.room.display.clone(),
            audio: self.media.audio,
            video: self.media.video,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn validate_rejects_short_poll_timeout() {
        let mut cfg = Config::default();
        cfg.server.poll_timeout_secs = 30;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_non_http_url() {
        let mut cfg = Config::default();
        cfg.server.url = "ws://localhost:8188".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_turn_requires_credentials() {
        let mut cfg = Config::default();
        cfg.media.ice_servers = vec![IceServerConfig {
            urls: vec!["turn:turn.example.org:3478".to_string()],
            username: Some("user".to_string()),
            credential: None,
        }];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn parses_minimal_file() {
        let cfg: Config = toml::from_str(
            r#"
            [server]
            url = "https://janus.example.org"

            [room]
            room_id = 42
            display = "cam"

            [media]
            loopback = true
            preferred_video_codec = "vp9"

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.server.poll_timeout_secs, 60);
        assert_eq!(cfg.server.max_events, 10);
        assert!(cfg.media.audio && cfg.media.video && cfg.media.loopback);
        assert_eq!(cfg.media.preferred_video_codec, Some(VideoCodec::VP9));
        assert_eq!(cfg.transactions.ttl_secs, 120);
        assert_eq!(cfg.handle_options().room_id, 42);
        assert_eq!(cfg.poll_settings().transaction_ttl, Duration::from_secs(120));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = Config::load(&PathBuf::from("/nonexistent/janus-videoroom.toml")).unwrap();
        assert_eq!(cfg.room.room_id, Config::default().room.room_id);
    }
}

fn default_true() -> bool {
    true
}

fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig {
        urls: vec!["stun:stun.l.google.com:19302".to_string()],
        username: None,
        credential: None,
    }]
}

fn default_request_timeout_secs() -> u64 { 10 }
fn default_poll_timeout_secs() -> u64 { 60 }
fn default_max_events() -> u32 { 10 }
fn default_transaction_ttl_secs() -> u64 { 120 }
