use anyhow::Result;
use serde::Deserialize;
use std::time::Duration;

use crate::audio::{CaptureConfig, DEFAULT_QUEUE_CAPACITY};
use crate::recognition::RecognitionConfig;
use crate::session::SessionConfig;

/// Environment variables with this prefix override file values,
/// e.g. `VOICE_SESSION__SERVICE__HTTP__PORT=9000`
const ENV_PREFIX: &str = "VOICE_SESSION";

#[derive(Debug, Deserialize)]
pub struct Config {
    pub service: ServiceConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub recognition: RecognitionSettings,
    #[serde(default)]
    pub transport: TransportConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub http: HttpConfig,
}

#[derive(Debug, Deserialize)]
pub struct HttpConfig {
    pub bind: String,
    pub port: u16,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub chunk_duration_ms: u64,
    pub queue_capacity: usize,
    /// Where assembled replies are written for playback
    pub output_dir: String,
    pub require_user_gesture: bool,
    /// Keep played WAV files instead of removing them
    pub retain_output: bool,
}

impl Default for AudioConfig {
    fn default() -> Self {
        let capture = CaptureConfig::default();
        Self {
            sample_rate: capture.sample_rate,
            channels: capture.channels,
            chunk_duration_ms: capture.chunk_duration_ms,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            output_dir: "./playback".to_string(),
            require_user_gesture: false,
            retain_output: false,
        }
    }
}

impl AudioConfig {
    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            sample_rate: self.sample_rate,
            channels: self.channels,
            chunk_duration_ms: self.chunk_duration_ms,
            ..CaptureConfig::default()
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RecognitionSettings {
    pub restart_delay_ms: u64,
    pub start_timeout_ms: u64,
}

impl Default for RecognitionSettings {
    fn default() -> Self {
        let defaults = RecognitionConfig::default();
        Self {
            restart_delay_ms: defaults.restart_delay.as_millis() as u64,
            start_timeout_ms: defaults.start_timeout.as_millis() as u64,
        }
    }
}

impl RecognitionSettings {
    /// Engine settings; the language comes from `session.language`
    pub fn recognition_config(&self, language: &str) -> RecognitionConfig {
        RecognitionConfig {
            language: language.to_string(),
            restart_delay: Duration::from_millis(self.restart_delay_ms),
            start_timeout: Duration::from_millis(self.start_timeout_ms.max(1)),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Fallback chain, tried in order. Empty means `session.transport_endpoint` alone.
    pub endpoints: Vec<EndpointConfig>,
    /// Environment variable holding the API key
    pub api_key_env: String,
    /// Override `session.connect_timeout_ms`
    pub connect_timeout_ms: Option<u64>,
    /// Override `session.send_timeout_ms`
    pub send_timeout_ms: Option<u64>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            api_key_env: "GEMINI_API_KEY".to_string(),
            connect_timeout_ms: None,
            send_timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    pub name: String,
    pub url: String,
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Session defaults with transport overrides applied
    pub fn session_config(&self) -> SessionConfig {
        let mut session = self.session.clone();
        if let Some(ms) = self.transport.connect_timeout_ms {
            session.connect_timeout_ms = ms;
        }
        if let Some(ms) = self.transport.send_timeout_ms {
            session.send_timeout_ms = ms;
        }
        session
    }

    /// Endpoints to try, in order
    pub fn endpoints(&self) -> Vec<EndpointConfig> {
        if self.transport.endpoints.is_empty() {
            vec![EndpointConfig {
                name: "primary".to_string(),
                url: self.session.transport_endpoint.clone(),
            }]
        } else {
            self.transport.endpoints.clone()
        }
    }
}
